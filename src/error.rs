use thiserror::Error;

/// Errors raised while driving a deployment
#[derive(Debug, Error)]
pub enum DeployError {
    /// A driven tool exited with a non-zero status
    #[error("command `{}` failed with exit code {code}", .argv.join(" "))]
    ExternalCommand { code: i32, argv: Vec<String> },

    /// Something an earlier stage should have produced is missing
    #[error("{0}")]
    MissingPrerequisite(String),

    /// The local container engine could not be reached
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Structured tool output could not be parsed
    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    /// The process could not be started at all
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine was reachable but rejected the call
    #[error("container operation failed: {0}")]
    Container(String),

    #[error("invalid deployment request: {0}")]
    InvalidRequest(String),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DeployError {
    pub fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Exit code of a failed external command
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExternalCommand { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_command_message_contains_argv_and_code() {
        let err = DeployError::ExternalCommand {
            code: 2,
            argv: vec!["terraform".into(), "plan".into(), "-no-color".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("terraform plan -no-color"));
        assert!(msg.contains("exit code 2"));
        assert_eq!(err.exit_code(), Some(2));
    }

    #[test]
    fn test_exit_code_none_for_other_errors() {
        assert_eq!(DeployError::Cancelled.exit_code(), None);
        assert_eq!(DeployError::parse("outputs", "eof").exit_code(), None);
    }
}
