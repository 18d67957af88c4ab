//! Seams between the pool and the SSH library.
//!
//! The pool, tunnel manager and rotator only see [`Dialer`] and [`Session`].
//! The russh implementation lives in [`crate::ssh::client`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::ssh::{CommandOutput, Identity};

/// Byte stream relayed to a remote port.
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// One authenticated connection to an agent host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Protocol-level liveness probe.
    async fn keepalive(&self) -> Result<()>;

    /// Run a command on a fresh channel.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Open a `direct-tcpip` channel to `127.0.0.1:<remote_port>` on the host.
    async fn open_tunnel(&self, remote_port: u16) -> Result<TunnelStream>;

    async fn close(&self);

    fn is_closed(&self) -> bool;

    /// SHA256 fingerprint of the host key presented during the handshake.
    fn host_key_fingerprint(&self) -> Option<String>;
}

/// Establishes authenticated sessions.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16, identity: &Identity)
        -> Result<Arc<dyn Session>>;
}
