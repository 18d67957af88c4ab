//! Orchestrator collaborator interface.
//!
//! The orchestrator owns the bot instances themselves: it knows where an
//! instance currently lives and how to run a command inside it without SSH.
//! The connectivity core only needs three things from it, captured by the
//! [`Orchestrator`] trait:
//!
//! ```text
//! ┌────────────────┐   get_address      ┌──────────────────┐
//! │ ConnectionPool │ ─────────────────▶ │                  │
//! │  (reconnect)   │   configure_access │  dyn Orchestrator│
//! └────────────────┘ ─────────────────▶ │                  │
//! ┌────────────────┐   exec             │  Docker / Static │
//! │   KeyRotator   │ ─────────────────▶ │                  │
//! └────────────────┘                    └──────────────────┘
//! ```

pub mod docker;
pub mod error;
pub mod fixed;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use docker::DockerOrchestrator;
pub use error::{OrchestratorError, OrchestratorResult};
pub use fixed::StaticOrchestrator;

use crate::config::{AppConfig, OrchestratorKind};

/// Current network location of an instance's SSH endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddress {
    pub host: String,
    pub port: u16,
}

impl InstanceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for InstanceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Output of a command run through the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Contract the connectivity core requires from the instance orchestrator.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Get the orchestrator name
    fn name(&self) -> &'static str;

    /// Resolve the current SSH address of an instance.
    async fn get_address(&self, instance_id: &str) -> OrchestratorResult<InstanceAddress>;

    /// Append `public_key` to the instance's authorized keys.
    ///
    /// Appending an already present key is a no-op.
    async fn configure_access(&self, instance_id: &str, public_key: &str)
        -> OrchestratorResult<()>;

    /// Run a shell command inside the instance.
    async fn exec(&self, instance_id: &str, command: &str) -> OrchestratorResult<ExecOutput>;
}

/// Create the orchestrator selected in the application configuration.
pub fn create_orchestrator(config: &AppConfig) -> crate::error::Result<Arc<dyn Orchestrator>> {
    match config.orchestrator.kind {
        OrchestratorKind::Docker => Ok(Arc::new(DockerOrchestrator::new(
            &config.ssh.user,
            config.orchestrator.ssh_port,
        )?)),
        OrchestratorKind::Static => Ok(Arc::new(StaticOrchestrator::new(
            config.orchestrator.instances.clone(),
        ))),
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Shell snippet appending a key to `~/.ssh/authorized_keys` unless present.
pub fn append_authorized_key_command(public_key: &str) -> String {
    let key = shell_quote(public_key.trim());
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch ~/.ssh/authorized_keys && \
         (grep -qxF {key} ~/.ssh/authorized_keys || printf '%s\\n' {key} >> ~/.ssh/authorized_keys) && \
         chmod 600 ~/.ssh/authorized_keys"
    )
}

/// Shell snippet replacing `~/.ssh/authorized_keys` with exactly one key.
pub fn replace_authorized_keys_command(public_key: &str) -> String {
    let key = shell_quote(public_key.trim());
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && \
         printf '%s\\n' {key} > ~/.ssh/authorized_keys.tmp && \
         chmod 600 ~/.ssh/authorized_keys.tmp && \
         mv ~/.ssh/authorized_keys.tmp ~/.ssh/authorized_keys"
    )
}
