//! Application root.
//!
//! [`AgentLink`] builds every component exactly once and hands shared
//! handles to the ones that depend on it. Request handlers talk to this type
//! only; nothing in the crate is a global.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::AppConfig;
use crate::error::{LinkError, Result};
use crate::events::{ConnectionEvent, EventLog};
use crate::orchestrator::{create_orchestrator, Orchestrator};
use crate::pool::{ConnectionMetrics, ConnectionPool, CredentialRef, PoolDeps};
use crate::ratelimit::{RateLimitStatus, RateLimiter};
use crate::rotation::{KeyRotator, RotationPolicy, RotationResult};
use crate::ssh::{KeyStore, SshDialer};
use crate::state::{ConnectionState, ConnectionStateTracker, StateTransition};
use crate::transport::{Dialer, Session};
use crate::tunnel::{ActiveTunnel, TunnelManager, TunnelMetrics};

pub struct AgentLink {
    config: AppConfig,
    orchestrator: Arc<dyn Orchestrator>,
    keys: Arc<KeyStore>,
    limiter: Arc<RateLimiter>,
    states: Arc<ConnectionStateTracker>,
    events: Arc<EventLog>,
    pool: ConnectionPool,
    tunnels: TunnelManager,
    rotator: Arc<KeyRotator>,
    root: CancellationToken,
    tasks: TaskTracker,
}

impl AgentLink {
    /// Build the production stack: russh dialer and the configured
    /// orchestrator.
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        let orchestrator = create_orchestrator(&config)?;
        let dialer = Arc::new(SshDialer::new(config.ssh.clone()));
        Self::with_parts(config, dialer, orchestrator)
    }

    /// Build around an explicit dialer and orchestrator.
    pub fn with_parts(
        config: AppConfig,
        dialer: Arc<dyn Dialer>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Result<Self> {
        let keys = Arc::new(KeyStore::open(config.data_path())?);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let states = Arc::new(ConnectionStateTracker::new());
        let events = Arc::new(EventLog::new());

        let pool = ConnectionPool::new(
            config.pool.clone(),
            PoolDeps {
                dialer,
                orchestrator: orchestrator.clone(),
                keys: keys.clone(),
                limiter: limiter.clone(),
                states: states.clone(),
                events: events.clone(),
                host_key_policy: config.ssh.host_key_policy,
            },
        );
        let tunnels = TunnelManager::new(config.tunnel.clone(), pool.clone(), states.clone());
        let rotator = Arc::new(KeyRotator::new(
            config.rotation.clone(),
            pool.clone(),
            orchestrator.clone(),
            keys.clone(),
        ));

        tracing::debug!(
            "AgentLink ready (orchestrator: {}, key: {})",
            orchestrator.name(),
            keys.fingerprint()
        );

        Ok(Self {
            config,
            orchestrator,
            keys,
            limiter,
            states,
            events,
            pool,
            tunnels,
            rotator,
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Start the keepalive, tunnel health and rotation schedule loops.
    pub fn start(&self) {
        self.pool.start();
        self.tunnels.start();
        if self.config.rotation.interval.is_some() {
            let rotator = self.rotator.clone();
            let token = self.root.child_token();
            self.tasks.spawn(rotator.run_schedule(token));
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn tunnels(&self) -> &TunnelManager {
        &self.tunnels
    }

    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    // Connections

    /// Return the pooled session, connecting through the orchestrator's
    /// address with the managed key when there is none.
    pub async fn ensure_connected(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
    ) -> Result<Arc<dyn Session>> {
        if let Some(session) = self.pool.get_client(instance_id) {
            return Ok(session);
        }
        if self.pool.is_reconnecting(instance_id) {
            // the reconnect task owns this instance until it settles
            return Err(LinkError::NotConnected(instance_id.to_string()));
        }

        let address = tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            address = self.orchestrator.get_address(instance_id) => address?,
        };
        self.pool
            .connect(
                cancel,
                instance_id,
                &address.host,
                address.port,
                CredentialRef::Managed,
            )
            .await
    }

    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        host: &str,
        port: u16,
        credential: CredentialRef,
    ) -> Result<Arc<dyn Session>> {
        self.pool
            .connect(cancel, instance_id, host, port, credential)
            .await
    }

    /// Close the instance's tunnels and its connection.
    pub async fn disconnect(&self, instance_id: &str) {
        self.tunnels.close_all(instance_id).await;
        self.pool.close(instance_id).await;
    }

    pub fn state(&self, instance_id: &str) -> ConnectionState {
        self.states.state(instance_id)
    }

    pub fn state_history(&self, instance_id: &str) -> Vec<StateTransition> {
        self.states.history(instance_id)
    }

    pub fn events(&self, instance_id: &str) -> Vec<ConnectionEvent> {
        self.events.events(instance_id)
    }

    pub fn metrics(&self, instance_id: &str) -> Option<ConnectionMetrics> {
        self.pool.metrics(instance_id)
    }

    pub fn all_metrics(&self) -> HashMap<String, ConnectionMetrics> {
        self.pool.all_metrics()
    }

    pub fn subscribe_states(&self) -> broadcast::Receiver<StateTransition> {
        self.states.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    // Tunnels

    /// Ensure a connection, then forward a local port to `remote_port`.
    pub async fn create_tunnel(
        &self,
        cancel: &CancellationToken,
        instance_id: &str,
        label: &str,
        remote_port: u16,
        preferred_local_port: Option<u16>,
    ) -> Result<u16> {
        self.ensure_connected(cancel, instance_id).await?;
        self.tunnels
            .create_tunnel(cancel, instance_id, label, remote_port, preferred_local_port)
            .await
    }

    pub async fn close_tunnel(&self, instance_id: &str, label: &str) -> Result<()> {
        self.tunnels.close_tunnel(instance_id, label).await
    }

    pub fn tunnel_metrics(&self, instance_id: &str) -> HashMap<String, TunnelMetrics> {
        self.tunnels.tunnel_metrics(instance_id)
    }

    pub fn list_tunnels(&self, instance_id: &str) -> Vec<ActiveTunnel> {
        self.tunnels.list_tunnels(instance_id)
    }

    // Rotation

    pub async fn rotate_keys(&self, extra_instances: &[String]) -> Result<RotationResult> {
        self.rotator.rotate(extra_instances).await
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        self.rotator.policy()
    }

    pub fn last_rotation(&self) -> Option<RotationResult> {
        self.rotator.last_result()
    }

    // Rate limiting

    pub fn rate_limit_status(&self, instance_id: &str) -> RateLimitStatus {
        self.limiter.status(instance_id)
    }

    pub fn reset_rate_limit(&self, instance_id: &str) {
        self.limiter.reset(instance_id);
    }

    /// Stop every background task, then close all tunnels and connections.
    pub async fn shutdown(&self) {
        self.root.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.tunnels.shutdown().await;
        self.pool.close_all().await;
        tracing::info!("AgentLink shut down");
    }
}
