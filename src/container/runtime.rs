use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::deploy::{DeploymentRequest, DeploymentResult};

/// Outcome of a local deployment. Failures are values, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum LocalOutcome {
    Running(DeploymentResult),
    /// The container engine could not be reached
    Unavailable { error: String },
    /// The engine answered but the server could not be started
    Failed { error: String },
}

impl LocalOutcome {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Running(_) => None,
            Self::Unavailable { error } | Self::Failed { error } => Some(error),
        }
    }
}

/// Starts single-host servers for the "local" provider
#[async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn create_server_container(&self, request: &DeploymentRequest) -> LocalOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let outcome = LocalOutcome::Unavailable {
            error: "engine down".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "unavailable");
        assert_eq!(json["error"], "engine down");
        assert_eq!(outcome.error(), Some("engine down"));

        let running = LocalOutcome::Running(DeploymentResult::local("abc", "127.0.0.1", 49153));
        let json = serde_json::to_value(&running).unwrap();
        assert_eq!(json["outcome"], "running");
        assert_eq!(json["port"], 49153);
        assert!(running.is_running());
    }
}
