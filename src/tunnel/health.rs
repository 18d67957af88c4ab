//! Tunnel probes, reconciliation and reaction to connection lifecycle.

use std::sync::atomic::Ordering;

use chrono::Utc;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{TunnelManager, TunnelStatus};
use crate::error::{LinkError, Result};
use crate::state::{ConnectionState, StateTransition};

pub(super) async fn health_loop(manager: TunnelManager, token: CancellationToken) {
    let mut ticker = tokio::time::interval(manager.config().health_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let (healthy, unhealthy) = manager.check_all().await;
                if unhealthy > 0 {
                    tracing::info!("Tunnel health: {} healthy, {} unhealthy", healthy, unhealthy);
                }
                manager.reconcile().await;
            }
        }
    }
    tracing::debug!("Tunnel health loop stopped");
}

pub(super) async fn lifecycle_watcher(
    manager: TunnelManager,
    mut transitions: broadcast::Receiver<StateTransition>,
    token: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => break,
            received = transitions.recv() => received,
        };
        match received {
            Ok(transition) => manager.on_transition(&transition).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Tunnel watcher lagged, {} transitions dropped", skipped);
                manager.close_failed().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl TunnelManager {
    /// Close the tunnels of every instance currently `Failed`; used when
    /// transitions may have been missed.
    async fn close_failed(&self) {
        let failed: Vec<String> = self
            .inner
            .states
            .states()
            .into_iter()
            .filter(|(_, state)| *state == ConnectionState::Failed)
            .map(|(id, _)| id)
            .collect();
        for instance_id in failed {
            let closed = self.close_all(&instance_id).await;
            if closed > 0 {
                tracing::warn!("Instance {} failed, closed {} tunnels", instance_id, closed);
            }
        }
    }

    async fn on_transition(&self, transition: &StateTransition) {
        match (transition.from, transition.to) {
            (ConnectionState::Reconnecting, ConnectionState::Connected) => {
                *self
                    .inner
                    .reconnections
                    .lock()
                    .entry(transition.instance_id.clone())
                    .or_insert(0) += 1;
            }
            (_, ConnectionState::Failed) => {
                let closed = self.close_all(&transition.instance_id).await;
                if closed > 0 {
                    tracing::warn!(
                        "Instance {} failed, closed {} tunnels",
                        transition.instance_id,
                        closed
                    );
                }
            }
            _ => {}
        }
    }

    /// Probe one tunnel: listener alive, instance connected, local port
    /// accepting within the probe timeout. Updates status and metrics.
    pub async fn check_tunnel_health(&self, instance_id: &str, label: &str) -> Result<()> {
        let (local_port, alive) = self
            .inner
            .tunnels
            .lock()
            .get(instance_id)
            .and_then(|t| t.get(label))
            .map(|e| (e.info.local_port, e.listener.alive.load(Ordering::SeqCst)))
            .ok_or_else(|| LinkError::TunnelNotFound {
                instance: instance_id.to_string(),
                label: label.to_string(),
            })?;

        let result = if !alive {
            Err(LinkError::Tunnel(format!("listener on port {} stopped", local_port)))
        } else if !self.inner.pool.has_client(instance_id) {
            Err(LinkError::NotConnected(instance_id.to_string()))
        } else {
            self.probe(local_port).await
        };

        self.record_probe(instance_id, label, &result);
        result
    }

    async fn probe(&self, port: u16) -> Result<()> {
        let timeout = self.inner.config.probe_timeout;
        let address = (self.inner.config.bind_address.as_str(), port);
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Err(_) => Err(LinkError::timeout(format!("probing tunnel port {}", port), timeout)),
            Ok(Err(e)) => Err(LinkError::Tunnel(format!("probe of port {} failed: {}", port, e))),
            Ok(Ok(_)) => Ok(()),
        }
    }

    fn record_probe(&self, instance_id: &str, label: &str, result: &Result<()>) {
        let mut tunnels = self.inner.tunnels.lock();
        let Some(entry) = tunnels.get_mut(instance_id).and_then(|t| t.get_mut(label)) else {
            return;
        };

        entry.metrics.last_health_check = Some(Utc::now());
        match result {
            Ok(()) => {
                entry.metrics.successful_checks += 1;
                if entry.info.status != TunnelStatus::Active {
                    tracing::info!("Tunnel {}/{} recovered", instance_id, label);
                }
                entry.info.status = TunnelStatus::Active;
                entry.info.last_error = None;
            }
            Err(e) => {
                entry.metrics.failed_checks += 1;
                if entry.info.status != TunnelStatus::Error {
                    tracing::warn!("Tunnel {}/{} unhealthy: {}", instance_id, label, e);
                }
                entry.info.status = TunnelStatus::Error;
                entry.info.last_error = Some(e.to_string());
            }
        }
    }

    /// Probe every tunnel concurrently. Returns `(healthy, unhealthy)`.
    pub async fn check_all(&self) -> (usize, usize) {
        let keys: Vec<(String, String)> = self
            .inner
            .tunnels
            .lock()
            .iter()
            .flat_map(|(id, t)| t.keys().map(move |label| (id.clone(), label.clone())))
            .collect();

        let results = join_all(
            keys.iter()
                .map(|(id, label)| self.check_tunnel_health(id, label)),
        )
        .await;

        let healthy = results.iter().filter(|r| r.is_ok()).count();
        (healthy, results.len() - healthy)
    }

    /// Rebind tunnels whose listener died, paced by the reconcile backoff.
    ///
    /// Returns how many tunnels were recreated.
    pub async fn reconcile(&self) -> usize {
        let policy = self.inner.config.reconcile.clone();
        let now = Instant::now();

        let candidates: Vec<(String, String, u16)> = self
            .inner
            .tunnels
            .lock()
            .iter()
            .flat_map(|(id, t)| t.values().map(move |e| (id, e)))
            .filter(|(_, e)| {
                e.info.status == TunnelStatus::Error
                    && !e.listener.alive.load(Ordering::SeqCst)
                    && policy.allows(e.reconcile_attempts)
                    && e.next_reconcile.map(|at| at <= now).unwrap_or(true)
            })
            .map(|(id, e)| (id.clone(), e.info.label.clone(), e.info.local_port))
            .collect();

        let mut recreated = 0;
        for (instance_id, label, local_port) in candidates {
            if !self.inner.pool.has_client(&instance_id) {
                continue;
            }

            let bound = self.bind(local_port).await;

            let mut tunnels = self.inner.tunnels.lock();
            let Some(entry) = tunnels.get_mut(&instance_id).and_then(|t| t.get_mut(&label)) else {
                // closed while we were binding
                continue;
            };

            match bound {
                Ok(listener) => {
                    let (handle, task) =
                        self.spawn_accept_loop(listener, &entry.info, entry.relayed.clone());
                    entry.listener = handle;
                    entry.accept_task = Some(task);
                    entry.info.status = TunnelStatus::Active;
                    entry.info.last_error = None;
                    entry.reconcile_attempts = 0;
                    entry.next_reconcile = None;
                    recreated += 1;
                    tracing::info!(
                        "Recreated tunnel {}/{} on port {}",
                        instance_id,
                        label,
                        local_port
                    );
                }
                Err(e) => {
                    entry.reconcile_attempts += 1;
                    entry.next_reconcile =
                        Some(Instant::now() + policy.jittered_delay(entry.reconcile_attempts));
                    entry.info.last_error = Some(e.to_string());
                    if !policy.allows(entry.reconcile_attempts) {
                        tracing::warn!(
                            "Giving up on tunnel {}/{} after {} attempts: {}",
                            instance_id,
                            label,
                            entry.reconcile_attempts,
                            e
                        );
                    }
                }
            }
        }
        recreated
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::super::tests::{connected_harness, ping, VNC_PORT};
    use super::*;
    use crate::pool::CredentialRef;
    use crate::testutil::eventually;
    use crate::transport::Session;

    #[tokio::test]
    async fn test_healthy_tunnel_probe() {
        let (_h, tunnels) = connected_harness().await;
        tunnels
            .create_tunnel(&CancellationToken::new(), "bot-1", "VNC", VNC_PORT, None)
            .await
            .unwrap();

        tunnels.check_tunnel_health("bot-1", "VNC").await.unwrap();
        assert_eq!(tunnels.check_all().await, (1, 0));

        let metrics = &tunnels.tunnel_metrics("bot-1")["VNC"];
        assert_eq!(metrics.successful_checks, 2);
        assert!(metrics.last_health_check.is_some());
        tunnels.shutdown().await;
    }

    #[tokio::test]
    async fn test_tunnel_survives_session_loss() {
        let (h, tunnels) = connected_harness().await;
        let token = CancellationToken::new();
        let port = tunnels
            .create_tunnel(&token, "bot-1", "VNC", VNC_PORT, None)
            .await
            .unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"one").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();

        let lost = h.pool.remove_client("bot-1").unwrap();
        lost.close().await;

        // the established relay keeps flowing
        client.write_all(b"two").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        let err = tunnels.check_tunnel_health("bot-1", "VNC").await.unwrap_err();
        assert!(matches!(err, LinkError::NotConnected(_)));
        let tunnel = tunnels.get_tunnel("bot-1", "VNC").unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Error);
        assert!(tunnel.last_error.is_some());

        // new clients are dropped while there is no session
        assert!(ping(port).await.is_err());

        h.pool
            .connect(&token, "bot-1", "10.0.0.5", 22, CredentialRef::Managed)
            .await
            .unwrap();
        tunnels.check_tunnel_health("bot-1", "VNC").await.unwrap();
        assert_eq!(tunnels.get_tunnel("bot-1", "VNC").unwrap().status, TunnelStatus::Active);
        assert_eq!(ping(port).await.unwrap(), b"ping");
        tunnels.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconcile_recreates_dead_listener() {
        let (_h, tunnels) = connected_harness().await;
        let port = tunnels
            .create_tunnel(&CancellationToken::new(), "bot-1", "VNC", VNC_PORT, None)
            .await
            .unwrap();

        tunnels.stop_listener("bot-1", "VNC");
        eventually(|| {
            !tunnels.inner.tunnels.lock()["bot-1"]["VNC"]
                .listener
                .alive
                .load(Ordering::SeqCst)
        })
        .await;

        assert!(tunnels.check_tunnel_health("bot-1", "VNC").await.is_err());
        assert_eq!(tunnels.reconcile().await, 1);

        let tunnel = tunnels.get_tunnel("bot-1", "VNC").unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Active);
        assert_eq!(tunnel.local_port, port);
        assert_eq!(ping(port).await.unwrap(), b"ping");

        // nothing left to do
        assert_eq!(tunnels.reconcile().await, 0);
        tunnels.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconcile_backs_off_when_port_taken() {
        let (_h, tunnels) = connected_harness().await;
        let port = tunnels
            .create_tunnel(&CancellationToken::new(), "bot-1", "VNC", VNC_PORT, None)
            .await
            .unwrap();

        tunnels.stop_listener("bot-1", "VNC");
        eventually(|| {
            !tunnels.inner.tunnels.lock()["bot-1"]["VNC"]
                .listener
                .alive
                .load(Ordering::SeqCst)
        })
        .await;
        let _ = tunnels.check_tunnel_health("bot-1", "VNC").await;

        // someone else grabs the port in between
        let squatter = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        assert_eq!(tunnels.reconcile().await, 0);
        // the next attempt is not due yet
        assert_eq!(tunnels.reconcile().await, 0);
        {
            let guard = tunnels.inner.tunnels.lock();
            let entry = &guard["bot-1"]["VNC"];
            assert_eq!(entry.reconcile_attempts, 1);
            assert!(entry.next_reconcile.is_some());
        }
        drop(squatter);
        tunnels.shutdown().await;
    }

    #[tokio::test]
    async fn test_watcher_counts_reconnections_and_closes_on_failure() {
        let (h, tunnels) = connected_harness().await;
        tunnels.start();
        tunnels
            .create_tunnel(&CancellationToken::new(), "bot-1", "VNC", VNC_PORT, None)
            .await
            .unwrap();

        h.states
            .transition("bot-1", ConnectionState::Reconnecting, "keepalive failed");
        h.states.transition("bot-1", ConnectionState::Connected, "reconnected");
        eventually(|| tunnels.reconnections("bot-1") == 1).await;
        assert_eq!(tunnels.tunnel_metrics("bot-1")["VNC"].reconnections, 1);

        h.states.transition("bot-1", ConnectionState::Failed, "gave up");
        eventually(|| tunnels.list_tunnels("bot-1").is_empty()).await;
        tunnels.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_flags_tunnel_within_one_interval() {
        let (h, tunnels) = connected_harness().await;
        tunnels
            .create_tunnel(&CancellationToken::new(), "bot-1", "VNC", VNC_PORT, None)
            .await
            .unwrap();
        tunnels.start();

        h.pool.remove_client("bot-1");
        let interval = tunnels.config().health_interval;
        tokio::time::sleep(interval + std::time::Duration::from_secs(1)).await;

        let tunnel = tunnels.get_tunnel("bot-1", "VNC").unwrap();
        assert_eq!(tunnel.status, TunnelStatus::Error);
        assert!(tunnel.last_error.as_deref().unwrap().contains("bot-1"));
        let metrics = &tunnels.tunnel_metrics("bot-1")["VNC"];
        assert_eq!(metrics.failed_checks, 1);
        assert!(metrics.last_health_check.is_some());
        tunnels.shutdown().await;
    }

    #[tokio::test]
    async fn test_lagging_watcher_still_closes_failed_instances() {
        let (h, tunnels) = connected_harness().await;
        tunnels
            .create_tunnel(&CancellationToken::new(), "bot-1", "VNC", VNC_PORT, None)
            .await
            .unwrap();

        let transitions = h.states.subscribe();
        h.states.transition("bot-1", ConnectionState::Failed, "gave up");
        // flood the channel so the failure is dropped before it is read
        for i in 0..1024 {
            let to = if i % 2 == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Disconnected
            };
            h.states.transition("bot-2", to, "flapping");
        }

        let token = CancellationToken::new();
        let watcher = tokio::spawn(lifecycle_watcher(tunnels.clone(), transitions, token.clone()));
        eventually(|| tunnels.list_tunnels("bot-1").is_empty()).await;

        token.cancel();
        watcher.await.unwrap();
        tunnels.shutdown().await;
    }
}
