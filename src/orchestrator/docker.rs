//! Docker orchestrator implementation.
//!
//! Bot instances run as containers with an SSH daemon inside. Addresses come
//! from the container's network settings and commands run through the
//! Docker exec API via bollard, so key management works even when SSH is
//! not reachable.

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;

use super::error::{OrchestratorError, OrchestratorResult};
use super::{append_authorized_key_command, ExecOutput, InstanceAddress, Orchestrator};

/// Orchestrator backed by the local Docker daemon.
///
/// Communicates with Docker via Unix socket (`/var/run/docker.sock`).
pub struct DockerOrchestrator {
    client: Docker,
    user: String,
    ssh_port: u16,
}

impl DockerOrchestrator {
    /// Connect to the Docker socket. Commands run as `user`.
    pub fn new(user: &str, ssh_port: u16) -> OrchestratorResult<Self> {
        let client = Docker::connect_with_socket_defaults().map_err(|e| OrchestratorError::Other {
            message: format!("Failed to connect to Docker socket: {}", e),
        })?;

        Ok(Self {
            client,
            user: user.to_string(),
            ssh_port,
        })
    }

    fn map_inspect_error(id: &str, err: bollard::errors::Error) -> OrchestratorError {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => OrchestratorError::not_found(id),
            other => OrchestratorError::Docker(other),
        }
    }
}

/// An exec without a reported exit code cannot be trusted to have finished.
fn exit_status(instance_id: &str, exit_code: Option<i64>) -> OrchestratorResult<i64> {
    exit_code.ok_or_else(|| OrchestratorError::Other {
        message: format!("No exit status reported for exec on {}", instance_id),
    })
}

/// Pick the container IP: the legacy top-level address first, then the
/// first attached network that has one.
fn container_ip(settings: &bollard::models::NetworkSettings) -> Option<String> {
    if let Some(ip) = settings.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
        return Some(ip.to_string());
    }

    let networks = settings.networks.as_ref()?;
    let mut names: Vec<&String> = networks.keys().collect();
    names.sort();
    names.into_iter().find_map(|name| {
        networks[name]
            .ip_address
            .as_deref()
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
    })
}

#[async_trait]
impl Orchestrator for DockerOrchestrator {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn get_address(&self, instance_id: &str) -> OrchestratorResult<InstanceAddress> {
        let info = self
            .client
            .inspect_container(instance_id, None)
            .await
            .map_err(|e| Self::map_inspect_error(instance_id, e))?;

        let running = info.state.as_ref().and_then(|s| s.running).unwrap_or(false);
        if !running {
            return Err(OrchestratorError::NoAddress {
                id: instance_id.to_string(),
                message: "container is not running".to_string(),
            });
        }

        let ip = info
            .network_settings
            .as_ref()
            .and_then(container_ip)
            .ok_or_else(|| OrchestratorError::NoAddress {
                id: instance_id.to_string(),
                message: "container has no IP address".to_string(),
            })?;

        Ok(InstanceAddress::new(ip, self.ssh_port))
    }

    async fn configure_access(
        &self,
        instance_id: &str,
        public_key: &str,
    ) -> OrchestratorResult<()> {
        let output = self
            .exec(instance_id, &append_authorized_key_command(public_key))
            .await?;

        if !output.success() {
            return Err(OrchestratorError::CommandFailed {
                id: instance_id.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        tracing::debug!("Authorized key appended on {}", instance_id);
        Ok(())
    }

    async fn exec(&self, instance_id: &str, command: &str) -> OrchestratorResult<ExecOutput> {
        let exec = self
            .client
            .create_exec(
                instance_id,
                CreateExecOptions {
                    cmd: Some(vec!["sh", "-c", command]),
                    user: Some(self.user.as_str()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_inspect_error(instance_id, e))?;

        let output = self
            .client
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?;

        let (stdout, stderr) = match output {
            StartExecResults::Attached { mut output, .. } => {
                let mut stdout = Vec::new();
                let mut stderr = Vec::new();

                while let Some(chunk) = output.next().await {
                    match chunk {
                        Ok(bollard::container::LogOutput::StdOut { message }) => {
                            stdout.extend(message);
                        }
                        Ok(bollard::container::LogOutput::StdErr { message }) => {
                            stderr.extend(message);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Error reading exec output from {}: {}", instance_id, e);
                        }
                    }
                }

                (
                    String::from_utf8_lossy(&stdout).to_string(),
                    String::from_utf8_lossy(&stderr).to_string(),
                )
            }
            StartExecResults::Detached => {
                return Err(OrchestratorError::Other {
                    message: "Unexpected detached exec".to_string(),
                });
            }
        };

        let inspect = self.client.inspect_exec(&exec.id).await?;

        let exit_code = exit_status(instance_id, inspect.exit_code)?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }
}
