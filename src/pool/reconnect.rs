//! Single-flight reconnection with exponential backoff.
//!
//! At most one reconnect task runs per instance: [`ConnectionPool::trigger_reconnect`]
//! claims the entry's in-flight flag under the pool lock and only the caller
//! that claimed it spawns the task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ConnectionMetrics, ConnectionParams, ConnectionPool};
use crate::error::{LinkError, Result};
use crate::events::EventType;
use crate::orchestrator::OrchestratorError;
use crate::state::ConnectionState;
use crate::transport::Session;

enum Claim {
    Current(ConnectionParams),
    Superseded,
}

impl ConnectionPool {
    /// Start a reconnect task unless one is already running.
    ///
    /// Returns `false` when the instance is unknown, already connected,
    /// already reconnecting, or the pool is shutting down.
    pub fn trigger_reconnect(&self, instance_id: &str) -> bool {
        if self.inner.root.is_cancelled() {
            return false;
        }

        let (generation, token) = {
            let mut entries = self.inner.entries.lock();
            let Some(entry) = entries.get_mut(instance_id) else {
                return false;
            };
            if entry.reconnect.is_some() || entry.session.is_some() || entry.params.is_none() {
                return false;
            }
            let token = self.inner.root.child_token();
            entry.reconnect = Some(token.clone());
            (entry.generation, token)
        };

        let pool = self.clone();
        let id = instance_id.to_string();
        self.inner
            .tasks
            .spawn(async move { pool.run_reconnect(id, generation, token).await });
        true
    }

    pub fn is_reconnecting(&self, instance_id: &str) -> bool {
        self.inner
            .entries
            .lock()
            .get(instance_id)
            .map(|e| e.reconnect.is_some())
            .unwrap_or(false)
    }

    async fn run_reconnect(self, instance_id: String, generation: u64, token: CancellationToken) {
        let policy = self.inner.config.reconnect.clone();

        self.inner.states.transition(
            &instance_id,
            ConnectionState::Reconnecting,
            "reconnection started",
        );
        self.inner.events.record(
            &instance_id,
            EventType::Reconnecting,
            format!("up to {} attempts", policy.max_attempts),
        );
        tracing::info!("Reconnecting to {}", instance_id);

        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            let delay = policy.jittered_delay(attempt);
            tokio::select! {
                _ = token.cancelled() => {
                    self.abandon(&instance_id, generation);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let params = match self.claim(&instance_id, generation) {
                Claim::Current(params) => params,
                Claim::Superseded => {
                    tracing::debug!("Reconnection of {} superseded", instance_id);
                    self.release(&instance_id, generation);
                    return;
                }
            };

            match self.attempt(&instance_id, &params, &token).await {
                Ok((session, params)) => {
                    if self.finish(&instance_id, generation, session.clone(), params) {
                        self.inner.limiter.record_success(&instance_id);
                        self.inner.states.transition(
                            &instance_id,
                            ConnectionState::Connected,
                            format!("reconnected after {} attempts", attempt),
                        );
                        self.inner.events.record(
                            &instance_id,
                            EventType::Reconnected,
                            format!("attempt {}", attempt),
                        );
                        tracing::info!(
                            "Reconnected to {} after {} attempts",
                            instance_id,
                            attempt
                        );
                    } else {
                        session.close().await;
                        self.release(&instance_id, generation);
                    }
                    return;
                }
                Err(LinkError::Cancelled) => {
                    self.abandon(&instance_id, generation);
                    return;
                }
                Err(e) => {
                    self.inner.limiter.record_failure(&instance_id);
                    tracing::warn!(
                        "Reconnect attempt {}/{} to {} failed: {}",
                        attempt,
                        policy.max_attempts,
                        instance_id,
                        e
                    );
                    last_error = e.to_string();
                    // bad keys and host key mismatches never heal with time
                    if !e.is_transient() {
                        self.give_up(&instance_id, generation, attempt, last_error);
                        return;
                    }
                }
            }
        }

        self.give_up(&instance_id, generation, policy.max_attempts, last_error);
    }

    /// One attempt: re-upload the key, re-resolve the address, dial.
    async fn attempt(
        &self,
        instance_id: &str,
        params: &ConnectionParams,
        token: &CancellationToken,
    ) -> Result<(Arc<dyn Session>, ConnectionParams)> {
        let identity = self.load_identity(&params.credential)?;
        let bound = self.inner.config.dial_timeout;
        let orchestrator = self.inner.orchestrator.clone();

        match guarded(
            token,
            bound,
            orchestrator.configure_access(instance_id, &identity.public_key),
        )
        .await
        {
            Err(LinkError::Cancelled) => return Err(LinkError::Cancelled),
            Ok(Ok(())) => {
                self.inner.events.record(
                    instance_id,
                    EventType::KeyUploaded,
                    identity.fingerprint.clone(),
                );
            }
            Ok(Err(OrchestratorError::NotSupported { .. })) => {}
            Ok(Err(e)) => {
                tracing::warn!("Could not re-upload key to {}: {}", instance_id, e);
            }
            Err(e) => {
                tracing::warn!("Could not re-upload key to {}: {}", instance_id, e);
            }
        }

        let mut next = params.clone();
        let resolved = match guarded(token, bound, orchestrator.get_address(instance_id)).await {
            Err(LinkError::Cancelled) => return Err(LinkError::Cancelled),
            Ok(Ok(address)) => Ok(address),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match resolved {
            Ok(address) => {
                next.host = address.host;
                next.port = address.port;
            }
            Err(e) => {
                tracing::debug!(
                    "Address lookup for {} failed, reusing {}:{}: {}",
                    instance_id,
                    params.host,
                    params.port,
                    e
                );
            }
        }

        let session = self
            .dial_verified(token, instance_id, &next.host, next.port, &identity)
            .await?;
        Ok((session, next))
    }

    fn claim(&self, instance_id: &str, generation: u64) -> Claim {
        let entries = self.inner.entries.lock();
        match entries.get(instance_id) {
            Some(entry) if entry.generation == generation && entry.session.is_none() => entry
                .params
                .clone()
                .map(Claim::Current)
                .unwrap_or(Claim::Superseded),
            _ => Claim::Superseded,
        }
    }

    /// Install the new session unless an explicit connect got there first.
    fn finish(
        &self,
        instance_id: &str,
        generation: u64,
        session: Arc<dyn Session>,
        params: ConnectionParams,
    ) -> bool {
        let next_generation = self.next_generation();
        let mut entries = self.inner.entries.lock();
        match entries.get_mut(instance_id) {
            Some(entry) if entry.generation == generation && entry.session.is_none() => {
                entry.session = Some(session);
                entry.params = Some(params);
                entry.metrics = Some(ConnectionMetrics::new());
                entry.reconnect = None;
                entry.generation = next_generation;
                true
            }
            _ => false,
        }
    }

    /// Clear the in-flight flag unless a newer session or task owns the entry.
    fn release(&self, instance_id: &str, generation: u64) -> bool {
        match self.inner.entries.lock().get_mut(instance_id) {
            Some(entry) if entry.generation == generation => {
                entry.reconnect = None;
                true
            }
            _ => false,
        }
    }

    /// Cancelled either by shutdown or by a session installed meanwhile; only
    /// the former leaves the instance disconnected.
    fn abandon(&self, instance_id: &str, generation: u64) {
        if !self.release(instance_id, generation) {
            tracing::debug!("Reconnection of {} superseded", instance_id);
            return;
        }
        self.inner.states.transition_from(
            instance_id,
            &[ConnectionState::Reconnecting],
            ConnectionState::Disconnected,
            "reconnection cancelled",
        );
        tracing::debug!("Reconnection of {} cancelled", instance_id);
    }

    /// Give up permanently: the instance is forgotten and marked failed.
    fn give_up(&self, instance_id: &str, generation: u64, attempts: u32, last_error: String) {
        let removed = {
            let mut entries = self.inner.entries.lock();
            let owned = entries
                .get(instance_id)
                .map(|e| e.generation == generation && e.session.is_none())
                .unwrap_or(false);
            owned && entries.remove(instance_id).is_some()
        };
        if !removed {
            return;
        }

        let error = LinkError::ReconnectExhausted {
            instance: instance_id.to_string(),
            attempts,
        };
        self.inner.states.transition(
            instance_id,
            ConnectionState::Failed,
            format!("{}: {}", error, last_error),
        );
        self.inner
            .events
            .record(instance_id, EventType::ReconnectFailed, last_error);
        tracing::error!("{}", error);
    }
}

/// Await `fut` bounded by `limit`, bailing out on cancellation.
async fn guarded<T>(
    token: &CancellationToken,
    limit: Duration,
    fut: impl Future<Output = T>,
) -> Result<T> {
    tokio::select! {
        _ = token.cancelled() => Err(LinkError::Cancelled),
        result = tokio::time::timeout(limit, fut) => {
            result.map_err(|_| LinkError::timeout("orchestrator call", limit))
        }
    }
}
