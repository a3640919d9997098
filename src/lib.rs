//! Minecraft server deployment.
//!
//! Cloud requests run as a pipeline: the infra tool provisions machines,
//! then (for swarm mode) the configuration tool sets them up. Progress is
//! streamed as [`deploy::PipelineEvent`]s. Requests for the `local`
//! provider start a single container on the local engine instead.

pub mod config;
pub mod configuration;
pub mod container;
pub mod deploy;
pub mod error;
pub mod orchestrator;
pub mod provisioning;
pub mod runner;

pub use config::{ContainerSettings, DeployerConfig};
pub use error::{DeployError, DeployResult};
pub use orchestrator::{Deployment, DeploymentHandle, DeploymentOrchestrator};
