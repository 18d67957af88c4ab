//! Accept loop and per-connection relays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;

use super::ListenerHandle;
use crate::pool::ConnectionPool;

/// Everything a relay needs to reach the remote side.
pub(super) struct Relay {
    pub pool: ConnectionPool,
    pub tasks: TaskTracker,
    pub instance_id: String,
    pub label: String,
    pub remote_port: u16,
    pub relayed: Arc<AtomicU64>,
}

pub(super) async fn accept_loop(listener: TcpListener, relay: Relay, handle: ListenerHandle) {
    let relay = Arc::new(relay);

    loop {
        let accepted = tokio::select! {
            _ = handle.token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                // EMFILE and friends; back off briefly instead of spinning
                tracing::debug!("Tunnel {}: accept error: {}", relay.label, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        tracing::debug!(
            "Tunnel {}/{}: accepted connection from {}",
            relay.instance_id,
            relay.label,
            peer_addr
        );
        relay.relayed.fetch_add(1, Ordering::Relaxed);

        let tasks = relay.tasks.clone();
        let relay = relay.clone();
        let token = handle.token.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = relay_connection(&relay, stream) => {}
            }
        });
    }

    // free the port before reporting the listener as gone
    drop(listener);
    handle.alive.store(false, Ordering::SeqCst);
    tracing::debug!("Tunnel {}/{}: listener stopped", relay.instance_id, relay.label);
}

async fn relay_connection(relay: &Relay, mut local: TcpStream) {
    // resolved per connection so a reconnect is picked up transparently
    let Some(session) = relay.pool.get_client(&relay.instance_id) else {
        tracing::debug!(
            "Tunnel {}/{}: no connection, dropping client",
            relay.instance_id,
            relay.label
        );
        return;
    };

    let mut remote = match session.open_tunnel(relay.remote_port).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(
                "Tunnel {}/{}: failed to open channel: {}",
                relay.instance_id,
                relay.label,
                e
            );
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
        Ok((to_remote, from_remote)) => tracing::debug!(
            "Tunnel {}/{}: connection closed. Sent {} bytes, received {} bytes",
            relay.instance_id,
            relay.label,
            to_remote,
            from_remote
        ),
        Err(e) => tracing::debug!("Tunnel {}/{}: copy error: {}", relay.instance_id, relay.label, e),
    }
}
