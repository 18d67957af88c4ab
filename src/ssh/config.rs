//! SSH connection configuration.

use serde::{Deserialize, Serialize};

/// SSH connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// SSH username on the agent hosts.
    pub user: String,

    /// Host key verification policy.
    pub host_key_policy: HostKeyPolicy,
}

/// Host key verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key (matches OpenSSH StrictHostKeyChecking=no).
    AcceptAny,

    /// Remember the first key per instance; log a warning when it changes but
    /// keep connecting. Agent containers regenerate host keys on rebuild.
    #[default]
    TrustOnFirstUse,

    /// Remember the first key per instance and refuse any other.
    Strict,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "agent".to_string(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}
