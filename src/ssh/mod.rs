//! SSH plumbing on top of russh.
//!
//! ## Modules
//!
//! - [`config`] - user and host key policy
//! - [`keys`] - the managed key pair and its on-disk store
//! - [`client`] - russh client implementing the transport traits
//! - [`exec`] - remote command execution
//! - [`hostkeys`] - trust-on-first-use host key registry

mod client;
pub mod config;
mod exec;
pub mod hostkeys;
pub mod keys;

pub use client::{SshClient, SshDialer};
pub use config::{HostKeyPolicy, SshConfig};
pub use exec::CommandOutput;
pub use hostkeys::HostKeyRegistry;
pub use keys::{key_fingerprint, load_key_file, Identity, KeyPair, KeyStore, Signer};
