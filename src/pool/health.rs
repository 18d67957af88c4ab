//! Keepalive loop and exec-based health checks.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::ConnectionPool;
use crate::error::{LinkError, Result};
use crate::events::EventType;
use crate::state::ConnectionState;
use crate::transport::Session;

/// Echoed back by a healthy agent.
pub const HEALTH_TOKEN: &str = "agentlink-health-ok";

pub(super) async fn keepalive_loop(pool: ConnectionPool, token: CancellationToken) {
    let mut ticker = tokio::time::interval(pool.config().keepalive_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => pool.check_all(&token).await,
        }
    }
    tracing::debug!("Keepalive loop stopped");
}

impl ConnectionPool {
    /// Run `echo` over the pooled connection and compare the output.
    pub async fn health_check(&self, instance_id: &str) -> Result<()> {
        let session = self
            .get_client(instance_id)
            .ok_or_else(|| LinkError::NotConnected(instance_id.to_string()))?;
        self.check_session(instance_id, &session).await
    }

    async fn check_session(&self, instance_id: &str, session: &Arc<dyn Session>) -> Result<()> {
        let timeout = self.inner.config.health_check_timeout;
        let command = format!("echo {}", HEALTH_TOKEN);

        let result = match tokio::time::timeout(timeout, session.exec(&command)).await {
            Err(_) => Err(LinkError::health(
                instance_id,
                format!("no answer within {:?}", timeout),
            )),
            Ok(Err(e)) => Err(LinkError::health(instance_id, e.to_string())),
            Ok(Ok(output)) if !output.success() => Err(LinkError::health(
                instance_id,
                format!("exit code {}: {}", output.exit_code, output.stderr.trim()),
            )),
            Ok(Ok(output)) if output.stdout.trim() != HEALTH_TOKEN => Err(LinkError::health(
                instance_id,
                format!("unexpected output '{}'", output.stdout.trim()),
            )),
            Ok(Ok(_)) => Ok(()),
        };

        self.record_health(instance_id, result.is_ok());
        if let Err(e) = &result {
            self.inner
                .events
                .record(instance_id, EventType::HealthCheckFailed, e.to_string());
        }
        result
    }

    fn record_health(&self, instance_id: &str, healthy: bool) {
        let mut entries = self.inner.entries.lock();
        let Some(metrics) = entries.get_mut(instance_id).and_then(|e| e.metrics.as_mut()) else {
            return;
        };
        metrics.last_health_check = Some(Utc::now());
        metrics.healthy = healthy;
        if healthy {
            metrics.successful_checks += 1;
        } else {
            metrics.failed_checks += 1;
        }
    }

    /// Probe every pooled connection concurrently.
    pub(super) async fn check_all(&self, token: &CancellationToken) {
        let sessions: Vec<(String, Arc<dyn Session>)> = self
            .inner
            .entries
            .lock()
            .iter()
            .filter_map(|(id, e)| e.session.clone().map(|s| (id.clone(), s)))
            .collect();

        if sessions.is_empty() {
            return;
        }

        let checks = sessions
            .into_iter()
            .map(|(id, session)| async move { self.check_instance(&id, session).await });

        tokio::select! {
            _ = token.cancelled() => {}
            _ = join_all(checks) => {}
        }
    }

    async fn check_instance(&self, instance_id: &str, session: Arc<dyn Session>) {
        let timeout = self.inner.config.keepalive_timeout;
        let keepalive = tokio::time::timeout(timeout, session.keepalive()).await;

        let failure = match keepalive {
            Err(_) => Some(format!("keepalive timed out after {:?}", timeout)),
            Ok(Err(e)) => Some(e.to_string()),
            Ok(Ok(())) => None,
        };

        if let Some(reason) = failure {
            self.handle_dead(instance_id, &session, reason).await;
            return;
        }

        if let Err(e) = self.check_session(instance_id, &session).await {
            self.handle_dead(instance_id, &session, e.to_string()).await;
        }
    }

    /// Drop a dead session (if it is still the pooled one) and start
    /// reconnecting.
    async fn handle_dead(&self, instance_id: &str, session: &Arc<dyn Session>, reason: String) {
        let removed = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(instance_id) {
                Some(entry)
                    if entry
                        .session
                        .as_ref()
                        .map(|s| Arc::ptr_eq(s, session))
                        .unwrap_or(false) =>
                {
                    if let Some(metrics) = entry.metrics.as_mut() {
                        metrics.healthy = false;
                    }
                    entry.session.take()
                }
                _ => None,
            }
        };
        let Some(dead) = removed else {
            return;
        };

        tracing::warn!("Connection to {} is dead: {}", instance_id, reason);
        let _ = tokio::time::timeout(self.inner.config.keepalive_timeout, dead.close()).await;

        self.inner
            .states
            .transition(instance_id, ConnectionState::Disconnected, reason.clone());
        self.inner
            .events
            .record(instance_id, EventType::Disconnected, reason);

        self.trigger_reconnect(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pool::tests::harness;
    use crate::pool::CredentialRef;
    use crate::testutil::wait_for_state;

    #[tokio::test]
    async fn test_health_check_success_updates_metrics() {
        let h = harness();
        h.fleet.add_host("bot-1", "10.0.0.5", 22);
        h.pool
            .connect(&CancellationToken::new(), "bot-1", "10.0.0.5", 22, CredentialRef::Managed)
            .await
            .unwrap();

        h.pool.health_check("bot-1").await.unwrap();
        h.pool.health_check("bot-1").await.unwrap();

        let metrics = h.pool.metrics("bot-1").unwrap();
        assert_eq!(metrics.successful_checks, 2);
        assert_eq!(metrics.failed_checks, 0);
        assert!(metrics.healthy);
        assert!(metrics.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_health_check_failure_records_event() {
        let h = harness();
        h.fleet.add_host("bot-1", "10.0.0.5", 22);
        h.pool
            .connect(&CancellationToken::new(), "bot-1", "10.0.0.5", 22, CredentialRef::Managed)
            .await
            .unwrap();
        h.fleet.last_session("bot-1").unwrap().fail_exec();

        let err = h.pool.health_check("bot-1").await.unwrap_err();
        assert!(matches!(err, LinkError::HealthCheck { .. }));

        let metrics = h.pool.metrics("bot-1").unwrap();
        assert_eq!(metrics.failed_checks, 1);
        assert!(!metrics.healthy);
        let last = h.events.recent("bot-1", 1).pop().unwrap();
        assert_eq!(last.event_type, EventType::HealthCheckFailed);
    }

    #[tokio::test]
    async fn test_health_check_without_connection() {
        let h = harness();
        assert!(matches!(
            h.pool.health_check("bot-1").await,
            Err(LinkError::NotConnected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failure_drives_reconnection() {
        let h = harness();
        h.fleet.add_host("bot-1", "10.0.0.5", 22);
        h.pool
            .connect(&CancellationToken::new(), "bot-1", "10.0.0.5", 22, CredentialRef::Managed)
            .await
            .unwrap();
        h.pool.start();

        let first = h.fleet.last_session("bot-1").unwrap();
        first.fail_keepalive();

        let events = h.events.clone();
        tokio::time::timeout(Duration::from_secs(60), async {
            while !events
                .events("bot-1")
                .iter()
                .any(|e| e.event_type == EventType::Reconnected)
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap();

        let states: Vec<ConnectionState> =
            h.states.history("bot-1").iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Reconnecting,
                ConnectionState::Connected,
            ]
        );

        let types: Vec<EventType> = h
            .events
            .events("bot-1")
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                EventType::Connected,
                EventType::Disconnected,
                EventType::Reconnecting,
                EventType::KeyUploaded,
                EventType::Reconnected,
            ]
        );

        let seqs: Vec<u64> = h.events.events("bot-1").iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));

        assert!(first.is_closed());
        assert!(h.pool.has_client("bot-1"));
        h.pool.close_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_health_check_in_loop_marks_disconnected() {
        let h = harness();
        h.fleet.add_host("bot-1", "10.0.0.5", 22);
        h.pool
            .connect(&CancellationToken::new(), "bot-1", "10.0.0.5", 22, CredentialRef::Managed)
            .await
            .unwrap();
        h.fleet.set_reachable("bot-1", false);
        h.fleet.last_session("bot-1").unwrap().fail_exec();
        h.pool.start();

        wait_for_state(&h.states, "bot-1", ConnectionState::Reconnecting).await;
        assert!(h
            .events
            .events("bot-1")
            .iter()
            .any(|e| e.event_type == EventType::HealthCheckFailed));
        h.pool.close_all().await;
    }
}
