//! Orchestrator-specific error types.
//!
//! The orchestrator is an external collaborator; these errors describe what
//! went wrong on its side so the pool and the rotator can decide whether an
//! attempt is worth repeating.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`super::Orchestrator`] implementations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Instance unknown to the orchestrator
    #[error("Instance not found: {id}")]
    NotFound { id: String },

    /// Instance exists but has no reachable address yet
    #[error("Instance {id} has no address: {message}")]
    NoAddress { id: String, message: String },

    /// Remote command ran but failed
    #[error("Command failed on {id} (exit {exit_code}): {stderr}")]
    CommandFailed {
        id: String,
        exit_code: i64,
        stderr: String,
    },

    /// Operation not offered by this orchestrator
    #[error("Operation not supported by {orchestrator}: {operation}")]
    NotSupported {
        orchestrator: String,
        operation: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {elapsed:?}: {operation}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Docker engine error
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Generic error for edge cases
    #[error("{message}")]
    Other { message: String },
}

impl OrchestratorError {
    /// Create a not found error
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Create a not supported error
    pub fn not_supported(orchestrator: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::NotSupported {
            orchestrator: orchestrator.into(),
            operation: operation.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::NoAddress { .. } | Self::Docker(_)
        )
    }
}

/// Result type alias for orchestrator operations
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = OrchestratorError::not_found("bot-7");
        assert_eq!(err.to_string(), "Instance not found: bot-7");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_command_failed_display() {
        let err = OrchestratorError::CommandFailed {
            id: "bot-1".to_string(),
            exit_code: 2,
            stderr: "permission denied".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command failed on bot-1 (exit 2): permission denied"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(OrchestratorError::timeout("exec", Duration::from_secs(1)).is_retryable());
        assert!(OrchestratorError::NoAddress {
            id: "bot-1".to_string(),
            message: "pending".to_string()
        }
        .is_retryable());
        assert!(!OrchestratorError::not_supported("static", "exec").is_retryable());
    }
}
