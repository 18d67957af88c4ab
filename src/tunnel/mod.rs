//! Local port forwarding multiplexed over pooled connections.
//!
//! A tunnel is a `127.0.0.1` listener. Every accepted connection looks up the
//! instance's *current* pooled session, opens its own `direct-tcpip` channel
//! and relays bytes in its own task. Tunnels therefore keep working across
//! reconnects, and one stalled client never blocks another.

mod health;
mod relay;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backoff::BackoffPolicy;
use crate::config::duration_str;
use crate::error::{LinkError, Result};
use crate::pool::ConnectionPool;
use crate::state::ConnectionStateTracker;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// How often every tunnel listener is probed.
    #[serde(with = "duration_str")]
    pub health_interval: Duration,
    #[serde(with = "duration_str")]
    pub probe_timeout: Duration,
    /// Pacing for recreating tunnels whose listener died.
    pub reconcile: BackoffPolicy,
    pub bind_address: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            health_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            reconcile: BackoffPolicy::reconcile(),
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Error,
    Closed,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelStatus::Active => write!(f, "active"),
            TunnelStatus::Error => write!(f, "error"),
            TunnelStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTunnel {
    pub instance_id: String,
    pub label: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub status: TunnelStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelMetrics {
    pub created_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub relayed_connections: u64,
    /// Reconnections of the owning instance since the manager started.
    pub reconnections: u64,
}

/// Handles shared between a tunnel entry and its accept loop.
#[derive(Clone)]
struct ListenerHandle {
    token: CancellationToken,
    alive: Arc<AtomicBool>,
}

struct TunnelEntry {
    info: ActiveTunnel,
    metrics: TunnelMetrics,
    listener: ListenerHandle,
    accept_task: Option<JoinHandle<()>>,
    relayed: Arc<AtomicU64>,
    reconcile_attempts: u32,
    next_reconcile: Option<Instant>,
}

impl TunnelEntry {
    fn snapshot_metrics(&self, reconnections: u64) -> TunnelMetrics {
        TunnelMetrics {
            relayed_connections: self.relayed.load(Ordering::Relaxed),
            reconnections,
            ..self.metrics.clone()
        }
    }
}

type TunnelMap = HashMap<String, HashMap<String, TunnelEntry>>;

struct TunnelInner {
    config: TunnelConfig,
    pool: ConnectionPool,
    states: Arc<ConnectionStateTracker>,
    tunnels: Mutex<TunnelMap>,
    reconnections: Mutex<HashMap<String, u64>>,
    root: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<TunnelInner>,
}

impl TunnelManager {
    pub fn new(
        config: TunnelConfig,
        pool: ConnectionPool,
        states: Arc<ConnectionStateTracker>,
    ) -> Self {
        Self {
            inner: Arc::new(TunnelInner {
                config,
                pool,
                states,
                tunnels: Mutex::new(HashMap::new()),
                reconnections: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                tasks: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }

    /// Spawn the health loop and the lifecycle watcher. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }

        // subscribe before spawning so no transition is missed
        let transitions = self.inner.states.subscribe();
        let manager = self.clone();
        let token = self.inner.root.child_token();
        self.inner
            .tasks
            .spawn(async move { health::lifecycle_watcher(manager, transitions, token).await });

        let manager = self.clone();
        let token = self.inner.root.child_token();
        self.inner
            .tasks
            .spawn(async move { health::health_loop(manager, token).await });

        tracing::debug!(
            "Tunnel health loop started (every {:?})",
            self.inner.config.health_interval
        );
    }

    /// Forward `127.0.0.1:<local>` to port `remote_port` on the instance.
    ///
    /// Returns the bound local port.
    pub async fn create_tunnel(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        label: &str,
        remote_port: u16,
        preferred_local_port: Option<u16>,
    ) -> Result<u16> {
        if label.trim().is_empty() {
            return Err(LinkError::Validation("tunnel label must not be empty".to_string()));
        }
        if remote_port == 0 {
            return Err(LinkError::Validation(
                "remote port must be between 1 and 65535".to_string(),
            ));
        }
        if !self.inner.pool.has_client(instance_id) {
            return Err(LinkError::NotConnected(instance_id.to_string()));
        }
        if self.exists(instance_id, label) {
            return Err(tunnel_exists(instance_id, label));
        }

        let listener = tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            bound = self.bind(preferred_local_port.unwrap_or(0)) => bound?,
        };
        let local_port = listener.local_addr()?.port();

        let info = ActiveTunnel {
            instance_id: instance_id.to_string(),
            label: label.to_string(),
            local_port,
            remote_port,
            status: TunnelStatus::Active,
            last_error: None,
        };

        let mut tunnels = self.inner.tunnels.lock();
        let per_instance = tunnels.entry(instance_id.to_string()).or_default();
        if per_instance.contains_key(label) {
            // lost a race with a concurrent create; the listener is dropped
            return Err(tunnel_exists(instance_id, label));
        }

        let relayed = Arc::new(AtomicU64::new(0));
        let (listener_handle, accept_task) =
            self.spawn_accept_loop(listener, &info, relayed.clone());

        per_instance.insert(
            label.to_string(),
            TunnelEntry {
                info,
                metrics: TunnelMetrics {
                    created_at: Utc::now(),
                    last_health_check: None,
                    successful_checks: 0,
                    failed_checks: 0,
                    relayed_connections: 0,
                    reconnections: 0,
                },
                listener: listener_handle,
                accept_task: Some(accept_task),
                relayed,
                reconcile_attempts: 0,
                next_reconcile: None,
            },
        );
        drop(tunnels);

        tracing::info!(
            "Tunnel {}/{}: 127.0.0.1:{} -> remote :{}",
            instance_id,
            label,
            local_port,
            remote_port
        );
        Ok(local_port)
    }

    async fn bind(&self, port: u16) -> Result<TcpListener> {
        TcpListener::bind((self.inner.config.bind_address.as_str(), port))
            .await
            .map_err(|e| LinkError::Tunnel(format!("Failed to bind local port {}: {}", port, e)))
    }

    fn spawn_accept_loop(
        &self,
        listener: TcpListener,
        info: &ActiveTunnel,
        relayed: Arc<AtomicU64>,
    ) -> (ListenerHandle, JoinHandle<()>) {
        let handle = ListenerHandle {
            token: self.inner.root.child_token(),
            alive: Arc::new(AtomicBool::new(true)),
        };
        let relay = relay::Relay {
            pool: self.inner.pool.clone(),
            tasks: self.inner.tasks.clone(),
            instance_id: info.instance_id.clone(),
            label: info.label.clone(),
            remote_port: info.remote_port,
            relayed,
        };
        let task = self
            .inner
            .tasks
            .spawn(relay::accept_loop(listener, relay, handle.clone()));
        (handle, task)
    }

    fn exists(&self, instance_id: &str, label: &str) -> bool {
        self.inner
            .tunnels
            .lock()
            .get(instance_id)
            .map(|t| t.contains_key(label))
            .unwrap_or(false)
    }

    pub async fn close_tunnel(&self, instance_id: &str, label: &str) -> Result<()> {
        let entry = {
            let mut tunnels = self.inner.tunnels.lock();
            let entry = tunnels.get_mut(instance_id).and_then(|t| t.remove(label));
            if tunnels.get(instance_id).map(|t| t.is_empty()).unwrap_or(false) {
                tunnels.remove(instance_id);
            }
            entry
        };
        let Some(entry) = entry else {
            return Err(LinkError::TunnelNotFound {
                instance: instance_id.to_string(),
                label: label.to_string(),
            });
        };

        stop_entry(entry).await;
        tracing::info!("Closed tunnel {}/{}", instance_id, label);
        Ok(())
    }

    /// Close every tunnel of one instance.
    pub async fn close_all(&self, instance_id: &str) -> usize {
        let entries = self.inner.tunnels.lock().remove(instance_id);
        let Some(entries) = entries else {
            return 0;
        };
        let count = entries.len();
        for (_, entry) in entries {
            stop_entry(entry).await;
        }
        tracing::info!("Closed {} tunnels of {}", count, instance_id);
        count
    }

    /// Close every tunnel and stop the background loops.
    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        let drained: Vec<_> = self.inner.tunnels.lock().drain().collect();
        for (_, entries) in drained {
            for (_, entry) in entries {
                stop_entry(entry).await;
            }
        }
        tracing::info!("Tunnel manager shut down");
    }

    pub fn get_tunnel(&self, instance_id: &str, label: &str) -> Option<ActiveTunnel> {
        self.inner
            .tunnels
            .lock()
            .get(instance_id)
            .and_then(|t| t.get(label))
            .map(|e| e.info.clone())
    }

    pub fn list_tunnels(&self, instance_id: &str) -> Vec<ActiveTunnel> {
        let mut list: Vec<ActiveTunnel> = self
            .inner
            .tunnels
            .lock()
            .get(instance_id)
            .map(|t| t.values().map(|e| e.info.clone()).collect())
            .unwrap_or_default();
        list.sort_by(|a, b| a.label.cmp(&b.label));
        list
    }

    pub fn all_tunnels(&self) -> Vec<ActiveTunnel> {
        let mut list: Vec<ActiveTunnel> = self
            .inner
            .tunnels
            .lock()
            .values()
            .flat_map(|t| t.values().map(|e| e.info.clone()))
            .collect();
        list.sort_by(|a, b| (&a.instance_id, &a.label).cmp(&(&b.instance_id, &b.label)));
        list
    }

    /// Metrics per label for one instance.
    pub fn tunnel_metrics(&self, instance_id: &str) -> HashMap<String, TunnelMetrics> {
        let reconnections = self.reconnections(instance_id);
        self.inner
            .tunnels
            .lock()
            .get(instance_id)
            .map(|t| {
                t.iter()
                    .map(|(label, e)| (label.clone(), e.snapshot_metrics(reconnections)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_tunnel_metrics(&self) -> HashMap<String, HashMap<String, TunnelMetrics>> {
        let reconnections = self.inner.reconnections.lock().clone();
        self.inner
            .tunnels
            .lock()
            .iter()
            .map(|(instance_id, t)| {
                let count = reconnections.get(instance_id).copied().unwrap_or(0);
                let metrics = t
                    .iter()
                    .map(|(label, e)| (label.clone(), e.snapshot_metrics(count)))
                    .collect();
                (instance_id.clone(), metrics)
            })
            .collect()
    }

    pub fn reconnections(&self, instance_id: &str) -> u64 {
        self.inner
            .reconnections
            .lock()
            .get(instance_id)
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn stop_listener(&self, instance_id: &str, label: &str) {
        if let Some(entry) = self
            .inner
            .tunnels
            .lock()
            .get(instance_id)
            .and_then(|t| t.get(label))
        {
            entry.listener.token.cancel();
        }
    }
}

fn tunnel_exists(instance_id: &str, label: &str) -> LinkError {
    LinkError::TunnelExists {
        instance: instance_id.to_string(),
        label: label.to_string(),
    }
}

async fn stop_entry(mut entry: TunnelEntry) {
    entry.listener.token.cancel();
    entry.info.status = TunnelStatus::Closed;
    if let Some(task) = entry.accept_task.take() {
        let _ = task.await;
    }
}
