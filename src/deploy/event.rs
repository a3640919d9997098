use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::OrchestrationMode;
use crate::provisioning::ProvisioningOutputs;

/// Behaviour shared by per-stage status enums.
///
/// Statuses are totally ordered; within one run a stage only ever moves
/// forward through that order.
pub trait StageStatus: Copy + Ord + Send + Sync + 'static {
    const SUCCESS: Self;
    const ERROR: Self;

    fn is_terminal(&self) -> bool {
        *self == Self::SUCCESS || *self == Self::ERROR
    }
}

/// Provisioning tool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    Initializing,
    Planning,
    Applying,
    Destroying,
    Success,
    Error,
}

impl StageStatus for ProvisioningStatus {
    const SUCCESS: Self = Self::Success;
    const ERROR: Self = Self::Error;
}

/// Configuration tool lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigurationStatus {
    Preparing,
    Running,
    Success,
    Error,
}

impl StageStatus for ConfigurationStatus {
    const SUCCESS: Self = Self::Success;
    const ERROR: Self = Self::Error;
}

/// One progress update from an executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent<S> {
    pub status: S,
    pub message: String,
    /// Every line the current stage has produced so far
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<ProvisioningOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Open extension bag
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl<S: StageStatus> ProgressEvent<S> {
    pub fn new(status: S, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            logs: Vec::new(),
            outputs: None,
            error: None,
            extra: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Event for a single output line, carrying the stage log so far
    pub fn line(status: S, line: impl Into<String>, logs: &[String]) -> Self {
        Self {
            logs: logs.to_vec(),
            ..Self::new(status, line)
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>, logs: Vec<String>) -> Self {
        Self {
            error: Some(error.into()),
            logs,
            ..Self::new(S::ERROR, message)
        }
    }

    pub fn with_outputs(mut self, outputs: ProvisioningOutputs) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn is_error(&self) -> bool {
        self.status == S::ERROR
    }
}

pub type ProvisioningEvent = ProgressEvent<ProvisioningStatus>;
pub type ConfigurationEvent = ProgressEvent<ConfigurationStatus>;

/// Pipeline stage tag added by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Provisioning,
    Configuration,
    Complete,
    Error,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Configuration => "configuration",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Terminal failure of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Stage that was running when the run failed
    pub failed_stage: Stage,
    pub message: String,
    pub error: String,
    #[serde(default)]
    pub logs: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    pub fn new(failed_stage: Stage, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            failed_stage,
            message: message.into(),
            error: error.into(),
            logs: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Convert an executor's ERROR event
    pub fn from_progress<S>(failed_stage: Stage, event: ProgressEvent<S>) -> Self {
        Self {
            failed_stage,
            error: event.error.unwrap_or_else(|| event.message.clone()),
            message: event.message,
            logs: event.logs,
            timestamp: event.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    Local,
    Swarm,
    Kubernetes,
}

impl From<OrchestrationMode> for DeploymentType {
    fn from(mode: OrchestrationMode) -> Self {
        match mode {
            OrchestrationMode::Swarm => Self::Swarm,
            OrchestrationMode::Kubernetes => Self::Kubernetes,
        }
    }
}

/// Outcome of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub status: ResultStatus,
    pub message: String,
    /// Primary address players connect to
    pub ip_address: String,
    #[serde(default)]
    pub all_ips: BTreeMap<String, String>,
    pub port: u16,
    pub deployment_type: DeploymentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Placeholder when provisioning discovered no addresses
pub const UNKNOWN_ADDRESS: &str = "0.0.0.0";

impl DeploymentResult {
    /// Successful cloud result; the primary address is the first discovered one
    pub fn cloud(
        deployment_type: DeploymentType,
        all_ips: BTreeMap<String, String>,
        port: u16,
    ) -> Self {
        let ip_address = all_ips
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string());
        Self {
            status: ResultStatus::Success,
            message: "Deployment completed successfully".into(),
            ip_address,
            all_ips,
            port,
            deployment_type,
            container_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn local(container_id: impl Into<String>, ip_address: impl Into<String>, port: u16) -> Self {
        Self {
            status: ResultStatus::Success,
            message: "Container started".into(),
            ip_address: ip_address.into(),
            all_ips: BTreeMap::new(),
            port,
            deployment_type: DeploymentType::Local,
            container_id: Some(container_id.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// Event forwarded to the consumer of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum PipelineEvent {
    Provisioning(ProvisioningEvent),
    Configuration(ConfigurationEvent),
    Complete(DeploymentResult),
    Error(ErrorEvent),
}

impl PipelineEvent {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Provisioning(_) => Stage::Provisioning,
            Self::Configuration(_) => Stage::Configuration,
            Self::Complete(_) => Stage::Complete,
            Self::Error(_) => Stage::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Provisioning(e) => &e.message,
            Self::Configuration(e) => &e.message,
            Self::Complete(r) => &r.message,
            Self::Error(e) => &e.message,
        }
    }
}
