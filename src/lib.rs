//! SSH connectivity core for bot-instance agents.
//!
//! A pool of long-lived SSH connections to agent hosts, local
//! port-forwarding tunnels multiplexed over them, and the health checking,
//! reconnection and key rotation machinery that keeps both alive through
//! agent restarts and network partitions. [`AgentLink`] wires it together.

pub mod app;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pool;
pub mod ratelimit;
pub mod rotation;
pub mod ssh;
pub mod state;
pub mod transport;
pub mod tunnel;

#[cfg(test)]
mod testutil;

pub use app::AgentLink;
pub use config::AppConfig;
pub use error::{LinkError, Result};
