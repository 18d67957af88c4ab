//! SSH client implementation using russh.
//!
//! Provides connection management and authentication.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::Disconnect;

use crate::error::{LinkError, Result};
use crate::ssh::config::SshConfig;
use crate::ssh::exec::CommandOutput;
use crate::ssh::keys::{Identity, Signer};
use crate::transport::{Dialer, Session, TunnelStream};

/// SSH client wrapper over russh.
///
/// `Handle` methods take `&self`, so channels for exec, keepalive and
/// tunnels are opened concurrently without a lock around the handle.
pub struct SshClient {
    session: Handle<ClientHandler>,
    host: String,
    host_key: Arc<OnceLock<String>>,
}

impl SshClient {
    /// Connect to an SSH server and authenticate with `signer`.
    pub async fn connect(host: &str, port: u16, user: &str, signer: Signer) -> Result<Self> {
        let russh_config = Arc::new(client::Config {
            // liveness is driven by the pool's keepalive loop
            inactivity_timeout: None,
            keepalive_interval: None,
            ..Default::default()
        });

        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| LinkError::Ssh(format!("Failed to resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| LinkError::Ssh(format!("No address found for {}", host)))?;

        let host_key = Arc::new(OnceLock::new());
        let handler = ClientHandler {
            host_key: host_key.clone(),
        };

        let mut session = client::connect(russh_config, addr, handler)
            .await
            .map_err(|e| LinkError::Ssh(format!("Connection to {} failed: {}", addr, e)))?;

        let authenticated = session
            .authenticate_publickey(user, signer)
            .await
            .map_err(|e| LinkError::Ssh(format!("Authentication failed: {}", e)))?;

        if !authenticated {
            return Err(LinkError::Ssh(format!(
                "Server {} rejected the key for user {}",
                host, user
            )));
        }

        tracing::debug!("Authenticated to {}@{}:{}", user, host, port);

        Ok(Self {
            session,
            host: host.to_string(),
            host_key,
        })
    }
}

#[async_trait]
impl Session for SshClient {
    async fn keepalive(&self) -> Result<()> {
        if self.session.is_closed() {
            return Err(LinkError::Ssh(format!("Connection to {} is closed", self.host)));
        }
        // a session channel round trip proves the transport is alive
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(|e| LinkError::Ssh(format!("Keepalive to {} failed: {}", self.host, e)))?;
        if let Err(e) = channel.close().await {
            tracing::debug!("Closing keepalive channel to {} failed: {}", self.host, e);
        }
        Ok(())
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        crate::ssh::exec::exec_command(&self.session, command).await
    }

    async fn open_tunnel(&self, remote_port: u16) -> Result<TunnelStream> {
        let channel = self
            .session
            .channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                LinkError::Tunnel(format!(
                    "Failed to open channel to {}:{}: {}",
                    self.host, remote_port, e
                ))
            })?;

        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if let Err(e) = self
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Disconnect from {} failed: {}", self.host, e);
        }
    }

    fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    fn host_key_fingerprint(&self) -> Option<String> {
        self.host_key.get().cloned()
    }
}

/// Dials agent hosts as the configured user.
pub struct SshDialer {
    config: SshConfig,
}

impl SshDialer {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        identity: &Identity,
    ) -> Result<Arc<dyn Session>> {
        let client =
            SshClient::connect(host, port, &self.config.user, identity.signer.clone()).await?;
        Ok(Arc::new(client))
    }
}

/// Client handler for russh connection callbacks.
///
/// Accepts every server key and records its fingerprint; the pool applies
/// the host key policy once the session is established.
pub struct ClientHandler {
    host_key: Arc<OnceLock<String>>,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = LinkError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(Default::default()).to_string();
        let _ = self.host_key.set(fingerprint);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let signer = crate::ssh::KeyPair::generate().unwrap().signer().unwrap();
        let result = SshClient::connect("127.0.0.1", port, "agent", signer).await;
        assert!(matches!(result, Err(LinkError::Ssh(_))));
    }
}
