use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::OrchestratorError;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Rate limit exceeded for {instance}, retry after {retry_after:?}")]
    RateLimited {
        instance: String,
        retry_after: Duration,
    },

    #[error("Connection limit reached ({limit} connections)")]
    Capacity { limit: usize },

    #[error("No connection for instance {0}")]
    NotConnected(String),

    #[error("SSH connection error: {0}")]
    Ssh(String),

    #[error("Operation timed out after {elapsed:?}: {operation}")]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    #[error("Health check failed for {instance}: {message}")]
    HealthCheck { instance: String, message: String },

    #[error("Host key for {instance} changed: expected {expected}, got {actual}")]
    HostKeyMismatch {
        instance: String,
        expected: String,
        actual: String,
    },

    #[error("Reconnection to {instance} gave up after {attempts} attempts")]
    ReconnectExhausted { instance: String, attempts: u32 },

    #[error("Tunnel '{label}' already exists for {instance}")]
    TunnelExists { instance: String, label: String },

    #[error("Tunnel '{label}' not found for {instance}")]
    TunnelNotFound { instance: String, label: String },

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("A key rotation is already in progress")]
    RotationInProgress,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SSH protocol error: {0}")]
    SshProtocol(#[from] russh::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl LinkError {
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    pub fn health(instance: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HealthCheck {
            instance: instance.into(),
            message: message.into(),
        }
    }

    /// Transient connectivity failures feed the reconnection machinery;
    /// everything else goes straight back to the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Ssh(_)
                | Self::Timeout { .. }
                | Self::HealthCheck { .. }
                | Self::SshProtocol(_)
                | Self::Io(_)
        ) || matches!(self, Self::Orchestrator(e) if e.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
