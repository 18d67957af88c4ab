//! Pool of long-lived SSH connections to agent hosts.
//!
//! One entry per instance holds the live session, the parameters needed to
//! redial it, its health metrics and the reconnect-in-flight flag. Keeping
//! them together under one lock means they cannot drift apart.
//!
//! ```text
//!  connect ──▶ RateLimiter::allow ──▶ Dialer::dial ──▶ host key check ──▶ entry
//!                                                                          │
//!  keepalive loop ──▶ keepalive + echo ──(fail)──▶ trigger_reconnect ◀─────┘
//! ```

mod health;
mod reconnect;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub use health::HEALTH_TOKEN;

use crate::backoff::BackoffPolicy;
use crate::config::duration_str;
use crate::error::{LinkError, Result};
use crate::events::{EventLog, EventType};
use crate::orchestrator::Orchestrator;
use crate::ratelimit::RateLimiter;
use crate::ssh::{load_key_file, HostKeyPolicy, HostKeyRegistry, Identity, KeyStore};
use crate::state::{ConnectionState, ConnectionStateTracker};
use crate::transport::{Dialer, Session};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// How often every pooled connection is probed.
    #[serde(with = "duration_str")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_str")]
    pub keepalive_timeout: Duration,
    /// Bound for the `echo` round trip of a health check.
    #[serde(with = "duration_str")]
    pub health_check_timeout: Duration,
    /// Bound for TCP connect, handshake and authentication.
    #[serde(with = "duration_str")]
    pub dial_timeout: Duration,
    /// 0 means unlimited.
    pub max_connections: usize,
    pub reconnect: BackoffPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(15),
            max_connections: 0,
            reconnect: BackoffPolicy::reconnect(),
        }
    }
}

/// Which key authenticates a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRef {
    /// The managed key pair, re-read on every dial so rotations apply.
    #[default]
    Managed,
    /// An unencrypted OpenSSH private key file.
    KeyFile(PathBuf),
}

/// Everything needed to redial an instance without the original caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub credential: CredentialRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub connected_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub healthy: bool,
}

impl ConnectionMetrics {
    fn new() -> Self {
        Self {
            connected_at: Utc::now(),
            last_health_check: None,
            successful_checks: 0,
            failed_checks: 0,
            healthy: true,
        }
    }
}

struct InstanceEntry {
    session: Option<Arc<dyn Session>>,
    params: Option<ConnectionParams>,
    metrics: Option<ConnectionMetrics>,
    /// Cancels the in-flight reconnect task; `Some` while one runs.
    reconnect: Option<CancellationToken>,
    /// Bumped whenever a session is installed; lets a reconnect task notice
    /// it has been superseded.
    generation: u64,
}

/// Shared collaborators of the pool.
pub struct PoolDeps {
    pub dialer: Arc<dyn Dialer>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub keys: Arc<KeyStore>,
    pub limiter: Arc<RateLimiter>,
    pub states: Arc<ConnectionStateTracker>,
    pub events: Arc<EventLog>,
    pub host_key_policy: HostKeyPolicy,
}

struct PoolInner {
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    orchestrator: Arc<dyn Orchestrator>,
    keys: Arc<KeyStore>,
    limiter: Arc<RateLimiter>,
    states: Arc<ConnectionStateTracker>,
    events: Arc<EventLog>,
    host_keys: HostKeyRegistry,
    entries: Mutex<HashMap<String, InstanceEntry>>,
    generations: AtomicU64,
    root: CancellationToken,
    tasks: TaskTracker,
    started: AtomicBool,
}

/// Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, deps: PoolDeps) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                dialer: deps.dialer,
                orchestrator: deps.orchestrator,
                keys: deps.keys,
                limiter: deps.limiter,
                states: deps.states,
                events: deps.events,
                host_keys: HostKeyRegistry::new(deps.host_key_policy),
                entries: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
                root: CancellationToken::new(),
                tasks: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn host_keys(&self) -> &HostKeyRegistry {
        &self.inner.host_keys
    }

    /// Spawn the keepalive loop. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        let token = self.inner.root.child_token();
        self.inner
            .tasks
            .spawn(async move { health::keepalive_loop(pool, token).await });
        tracing::debug!(
            "Keepalive loop started (every {:?})",
            self.inner.config.keepalive_interval
        );
    }

    /// Dial `host:port` and register the session for `instance_id`.
    ///
    /// A previous session of the instance is closed once the new one is in
    /// place. On failure an existing live session is left untouched.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        host: &str,
        port: u16,
        credential: CredentialRef,
    ) -> Result<Arc<dyn Session>> {
        validate_target(instance_id, host, port)?;

        if let Err(e) = self.inner.limiter.allow(instance_id) {
            self.inner
                .events
                .record(instance_id, EventType::RateLimited, e.to_string());
            return Err(e);
        }

        self.check_capacity(instance_id)?;

        let had_live = self.has_client(instance_id);
        if !had_live {
            self.inner.states.transition_from(
                instance_id,
                &[ConnectionState::Disconnected, ConnectionState::Failed],
                ConnectionState::Connecting,
                format!("connecting to {}:{}", host, port),
            );
        }

        let result = match self.load_identity(&credential) {
            Ok(identity) => self.dial_verified(cancel, instance_id, host, port, &identity).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(session) => {
                let params = ConnectionParams {
                    host: host.to_string(),
                    port,
                    credential,
                };
                self.install(instance_id, session.clone(), params).await;
                self.inner.limiter.record_success(instance_id);
                self.inner.states.transition(
                    instance_id,
                    ConnectionState::Connected,
                    format!("connected to {}:{}", host, port),
                );
                self.inner.events.record(
                    instance_id,
                    EventType::Connected,
                    format!("{}:{}", host, port),
                );
                tracing::info!("Connected to {} at {}:{}", instance_id, host, port);
                Ok(session)
            }
            Err(e) => {
                if !matches!(e, LinkError::Cancelled) {
                    self.inner.limiter.record_failure(instance_id);
                }
                if !had_live {
                    self.inner.states.transition_from(
                        instance_id,
                        &[ConnectionState::Connecting],
                        ConnectionState::Disconnected,
                        format!("connect failed: {}", e),
                    );
                }
                tracing::warn!("Connection to {} failed: {}", instance_id, e);
                Err(e)
            }
        }
    }

    fn check_capacity(&self, instance_id: &str) -> Result<()> {
        let limit = self.inner.config.max_connections;
        if limit == 0 {
            return Ok(());
        }
        let entries = self.inner.entries.lock();
        let pooled = entries
            .get(instance_id)
            .map(|e| e.session.is_some())
            .unwrap_or(false);
        let live = entries.values().filter(|e| e.session.is_some()).count();
        if !pooled && live >= limit {
            return Err(LinkError::Capacity { limit });
        }
        Ok(())
    }

    fn load_identity(&self, credential: &CredentialRef) -> Result<Identity> {
        match credential {
            CredentialRef::Managed => Ok(self.inner.keys.identity()),
            CredentialRef::KeyFile(path) => load_key_file(path),
        }
    }

    /// Dial on a tracked task raced against cancellation and the timeout.
    async fn dial(
        &self,
        cancel: &CancellationToken,
        host: &str,
        port: u16,
        identity: &Identity,
    ) -> Result<Arc<dyn Session>> {
        let dialer = self.inner.dialer.clone();
        let target_host = host.to_string();
        let identity = identity.clone();
        let mut task = self
            .inner
            .tasks
            .spawn(async move { dialer.dial(&target_host, port, &identity).await });

        let timeout = self.inner.config.dial_timeout;
        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => Err(LinkError::Ssh(format!("Dial task failed: {}", e))),
            },
            _ = cancel.cancelled() => {
                task.abort();
                Err(LinkError::Cancelled)
            }
            _ = self.inner.root.cancelled() => {
                task.abort();
                Err(LinkError::Cancelled)
            }
            _ = tokio::time::sleep(timeout) => {
                task.abort();
                Err(LinkError::timeout(format!("dial {}:{}", host, port), timeout))
            }
        }
    }

    async fn dial_verified(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        host: &str,
        port: u16,
        identity: &Identity,
    ) -> Result<Arc<dyn Session>> {
        let session = self.dial(cancel, host, port, identity).await?;
        let fingerprint = session.host_key_fingerprint();
        if let Err(e) = self
            .inner
            .host_keys
            .verify(instance_id, fingerprint.as_deref())
        {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Dial, check the host key and authenticate with `identity` without
    /// registering the session.
    pub async fn probe_with_identity(
        &self,
        instance_id: &str,
        host: &str,
        port: u16,
        identity: &Identity,
    ) -> Result<()> {
        let token = self.inner.root.child_token();
        let session = self
            .dial_verified(&token, instance_id, host, port, identity)
            .await?;
        session.close().await;
        Ok(())
    }

    async fn install(&self, instance_id: &str, session: Arc<dyn Session>, params: ConnectionParams) {
        let generation = self.next_generation();
        let previous = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(instance_id.to_string())
                .or_insert_with(|| InstanceEntry {
                    session: None,
                    params: None,
                    metrics: None,
                    reconnect: None,
                    generation,
                });
            // an explicit connect supersedes any running reconnect
            if let Some(token) = entry.reconnect.take() {
                token.cancel();
            }
            entry.generation = generation;
            entry.params = Some(params);
            entry.metrics = Some(ConnectionMetrics::new());
            entry.session.replace(session)
        };

        if let Some(previous) = previous {
            tracing::debug!("Closing replaced session for {}", instance_id);
            previous.close().await;
        }
    }

    fn next_generation(&self) -> u64 {
        self.inner.generations.fetch_add(1, Ordering::SeqCst)
    }

    pub fn get_client(&self, instance_id: &str) -> Option<Arc<dyn Session>> {
        self.inner
            .entries
            .lock()
            .get(instance_id)
            .and_then(|e| e.session.clone())
    }

    pub fn has_client(&self, instance_id: &str) -> bool {
        self.get_client(instance_id).is_some()
    }

    /// Drop the session from the pool without closing it or touching any
    /// other bookkeeping.
    pub fn remove_client(&self, instance_id: &str) -> Option<Arc<dyn Session>> {
        self.inner
            .entries
            .lock()
            .get_mut(instance_id)
            .and_then(|e| e.session.take())
    }

    /// Close the session and forget the instance entirely.
    pub async fn close(&self, instance_id: &str) {
        let entry = self.inner.entries.lock().remove(instance_id);
        let Some(entry) = entry else {
            return;
        };

        if let Some(token) = entry.reconnect {
            token.cancel();
        }
        if let Some(session) = entry.session {
            session.close().await;
        }
        self.inner
            .states
            .transition(instance_id, ConnectionState::Disconnected, "closed");
        self.inner
            .events
            .record(instance_id, EventType::Disconnected, "closed by caller");
        tracing::info!("Closed connection to {}", instance_id);
    }

    /// Stop every background task, wait for them, then close all sessions.
    pub async fn close_all(&self) {
        self.inner.root.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let drained: Vec<(String, InstanceEntry)> =
            self.inner.entries.lock().drain().collect();

        for (instance_id, entry) in drained {
            if let Some(session) = entry.session {
                session.close().await;
            }
            self.inner.states.transition(
                &instance_id,
                ConnectionState::Disconnected,
                "pool shut down",
            );
        }
        tracing::info!("Connection pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    pub fn metrics(&self, instance_id: &str) -> Option<ConnectionMetrics> {
        self.inner
            .entries
            .lock()
            .get(instance_id)
            .and_then(|e| e.metrics.clone())
    }

    pub fn all_metrics(&self) -> HashMap<String, ConnectionMetrics> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter_map(|(id, e)| e.metrics.clone().map(|m| (id.clone(), m)))
            .collect()
    }

    pub fn params(&self, instance_id: &str) -> Option<ConnectionParams> {
        self.inner
            .entries
            .lock()
            .get(instance_id)
            .and_then(|e| e.params.clone())
    }

    /// Instances the pool knows how to reach.
    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.params.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn validate_target(instance_id: &str, host: &str, port: u16) -> Result<()> {
    if instance_id.trim().is_empty() {
        return Err(LinkError::Validation("instance id must not be empty".to_string()));
    }
    if host.trim().is_empty() {
        return Err(LinkError::Validation("host must not be empty".to_string()));
    }
    if port == 0 {
        return Err(LinkError::Validation(
            "port must be between 1 and 65535".to_string(),
        ));
    }
    Ok(())
}
