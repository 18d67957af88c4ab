//! Remote command execution.
//!
//! Each command runs on its own session channel, so concurrent callers share
//! one connection without serializing on it.

use russh::client::Handle;
use russh::ChannelMsg;
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};
use crate::ssh::client::ClientHandler;

/// Output from a remote command execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,

    /// Standard error.
    pub stderr: String,

    pub exit_code: u32,
}

impl CommandOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: u32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    /// Whether the command succeeded (exit_code == 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Execute a command on the remote host (non-interactive).
pub async fn exec_command(session: &Handle<ClientHandler>, command: &str) -> Result<CommandOutput> {
    let mut channel = session
        .channel_open_session()
        .await
        .map_err(|e| LinkError::Ssh(format!("Failed to open channel: {}", e)))?;

    channel
        .exec(true, command.as_bytes())
        .await
        .map_err(|e| LinkError::Ssh(format!("Failed to execute command: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                stdout.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                if ext == 1 {
                    stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit_code = Some(exit_status);
            }
            Some(ChannelMsg::Eof) => {
                // exit-status may still follow EOF
                if exit_code.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) | None => {
                break;
            }
            _ => {}
        }
    }

    let exit_code = exit_code.ok_or_else(|| {
        LinkError::Ssh(format!("Channel closed before '{}' reported an exit status", command))
    })?;

    Ok(CommandOutput::new(
        String::from_utf8_lossy(&stdout),
        String::from_utf8_lossy(&stderr),
        exit_code,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        let output = CommandOutput::new("hello", "", 0);
        assert!(output.success());
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_command_output_failure() {
        let output = CommandOutput::new("", "error", 1);
        assert!(!output.success());
        assert_eq!(output.stderr, "error");
    }
}
