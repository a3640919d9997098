mod locks;
mod pipeline;

pub use locks::WorkdirLocks;
pub use pipeline::{Deployment, DeploymentHandle, DeploymentOrchestrator};
