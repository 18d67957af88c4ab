//! Global key rotation.
//!
//! Rotation swaps the single managed key pair without ever leaving an
//! instance with no key that works:
//!
//! 1. generate and validate a new pair in memory,
//! 2. append the new public key to every known instance and prove it
//!    authenticates there,
//! 3. back up the live key files and install the new pair (restored on
//!    failure, so an aborted rotation changes nothing),
//! 4. rewrite authorized keys to the new key alone on every instance that
//!    passed step 2,
//! 5. drop the backups once every instance is finalized.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::duration_str;
use crate::error::{LinkError, Result};
use crate::orchestrator::{
    replace_authorized_keys_command, Orchestrator, OrchestratorError, OrchestratorResult,
};
use crate::pool::ConnectionPool;
use crate::ssh::{Identity, KeyPair, KeyStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Automatic rotation interval; `None` rotates only on request.
    #[serde(
        with = "duration_str::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub interval: Option<Duration>,
    /// Bound on every orchestrator call and test connection.
    #[serde(with = "duration_str")]
    pub step_timeout: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval: None,
            step_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-instance outcome of a rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRotationStatus {
    pub instance_id: String,
    /// New key appended to authorized keys.
    pub uploaded: bool,
    /// Test connection with the new key succeeded.
    pub verified: bool,
    /// Authorized keys now hold only the new key.
    pub finalized: bool,
    pub error: Option<String>,
}

impl InstanceRotationStatus {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationResult {
    pub id: String,
    pub old_fingerprint: String,
    pub new_fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub full_success: bool,
    pub instances: Vec<InstanceRotationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationPolicy {
    #[serde(with = "duration_str::option")]
    pub interval: Option<Duration>,
    pub last_rotation: Option<DateTime<Utc>>,
    pub next_due: Option<DateTime<Utc>>,
}

impl RotationPolicy {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_due.map(|due| due <= now).unwrap_or(false)
    }
}

/// Clears the in-progress flag however the rotation ends.
struct RotationGuard<'a>(&'a AtomicBool);

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct KeyRotator {
    config: RotationConfig,
    pool: ConnectionPool,
    orchestrator: Arc<dyn Orchestrator>,
    keys: Arc<KeyStore>,
    in_progress: AtomicBool,
    last_result: Mutex<Option<RotationResult>>,
}

impl KeyRotator {
    pub fn new(
        config: RotationConfig,
        pool: ConnectionPool,
        orchestrator: Arc<dyn Orchestrator>,
        keys: Arc<KeyStore>,
    ) -> Self {
        Self {
            config,
            pool,
            orchestrator,
            keys,
            in_progress: AtomicBool::new(false),
            last_result: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    pub fn last_result(&self) -> Option<RotationResult> {
        self.last_result.lock().clone()
    }

    /// Configured interval, last rotation and when the next one is due.
    ///
    /// Before the first rotation of this process the key file's
    /// modification time stands in for the last rotation.
    pub fn policy(&self) -> RotationPolicy {
        let last_rotation = self
            .last_result
            .lock()
            .as_ref()
            .map(|r| r.timestamp)
            .or_else(|| self.key_file_modified());

        let next_due = match (self.config.interval, last_rotation) {
            (Some(interval), Some(last)) => chrono::Duration::from_std(interval)
                .ok()
                .and_then(|interval| last.checked_add_signed(interval)),
            (Some(_), None) => Some(Utc::now()),
            (None, _) => None,
        };

        RotationPolicy {
            interval: self.config.interval,
            last_rotation,
            next_due,
        }
    }

    fn key_file_modified(&self) -> Option<DateTime<Utc>> {
        std::fs::metadata(self.keys.private_key_path())
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from)
    }

    /// Rotate the managed key across the pool's instances plus `extra`.
    pub async fn rotate(&self, extra: &[String]) -> Result<RotationResult> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LinkError::RotationInProgress);
        }
        let _guard = RotationGuard(&self.in_progress);

        let old_fingerprint = self.keys.fingerprint();

        let new_pair = KeyPair::generate()?;
        new_pair.validate()?;
        let identity = new_pair.identity()?;

        let instances: Vec<String> = self
            .pool
            .instance_ids()
            .into_iter()
            .chain(extra.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        tracing::info!(
            "Rotating managed key {} -> {} across {} instances",
            old_fingerprint,
            new_pair.fingerprint(),
            instances.len()
        );

        let mut statuses = join_all(
            instances
                .iter()
                .map(|id| self.distribute(id, &new_pair, &identity)),
        )
        .await;

        if !statuses.is_empty() && !statuses.iter().any(|s| s.verified) {
            // never install a key that no instance accepts
            return Err(LinkError::Key(format!(
                "new key {} could not be verified on any instance; keeping {}",
                new_pair.fingerprint(),
                old_fingerprint
            )));
        }

        self.keys.backup()?;
        if let Err(e) = self.keys.install(&new_pair) {
            tracing::error!("Installing the new key failed, restoring backup: {}", e);
            if let Err(restore) = self.keys.restore_backup() {
                tracing::error!("Restoring the key backup failed: {}", restore);
            }
            return Err(e);
        }

        join_all(
            statuses
                .iter_mut()
                .filter(|s| s.verified)
                .map(|status| self.finalize(status, new_pair.public_key())),
        )
        .await;

        let mut full_success = statuses.iter().all(|s| s.finalized);
        if full_success {
            // the new key is live everywhere; a stale backup only needs cleanup
            if let Err(e) = self.keys.remove_backup() {
                tracing::warn!("Key rotation finished but the backup was kept: {}", e);
                full_success = false;
            }
        } else {
            let failed: Vec<&str> = statuses
                .iter()
                .filter(|s| !s.finalized)
                .map(|s| s.instance_id.as_str())
                .collect();
            tracing::warn!(
                "Key rotation incomplete on {}; keeping backup in {}",
                failed.join(", "),
                self.keys.dir().display()
            );
        }

        let result = RotationResult {
            id: Uuid::new_v4().to_string(),
            old_fingerprint,
            new_fingerprint: new_pair.fingerprint().to_string(),
            timestamp: Utc::now(),
            full_success,
            instances: statuses,
        };

        tracing::info!(
            "Key rotation {} finished ({}/{} instances finalized)",
            result.id,
            result.instances.iter().filter(|s| s.finalized).count(),
            result.instances.len()
        );

        *self.last_result.lock() = Some(result.clone());
        Ok(result)
    }

    /// Append the new key to one instance and prove it works there.
    async fn distribute(
        &self,
        instance_id: &str,
        pair: &KeyPair,
        identity: &Identity,
    ) -> InstanceRotationStatus {
        let mut status = InstanceRotationStatus::new(instance_id);

        let address = match self
            .bounded("get_address", self.orchestrator.get_address(instance_id))
            .await
        {
            Ok(address) => address,
            Err(e) => {
                status.error = Some(format!("Failed to resolve address: {}", e));
                return status;
            }
        };

        if let Err(e) = self
            .bounded(
                "configure_access",
                self.orchestrator.configure_access(instance_id, pair.public_key()),
            )
            .await
        {
            status.error = Some(format!("Failed to upload new key: {}", e));
            return status;
        }
        status.uploaded = true;

        let probe = tokio::time::timeout(
            self.config.step_timeout,
            self.pool
                .probe_with_identity(instance_id, &address.host, address.port, identity),
        )
        .await
        .unwrap_or_else(|_| {
            Err(LinkError::timeout(
                format!("test connection to {}", instance_id),
                self.config.step_timeout,
            ))
        });

        match probe {
            Ok(()) => status.verified = true,
            Err(e) => {
                tracing::warn!("New key does not authenticate on {}: {}", instance_id, e);
                status.error = Some(format!("Test connection failed: {}", e));
            }
        }
        status
    }

    /// Leave only the new key in the instance's authorized keys.
    async fn finalize(&self, status: &mut InstanceRotationStatus, public_key: &str) {
        let command = replace_authorized_keys_command(public_key);
        let outcome = self
            .bounded(
                "exec",
                self.orchestrator.exec(&status.instance_id, &command),
            )
            .await;

        match outcome {
            Ok(output) if output.success() => status.finalized = true,
            Ok(output) => {
                status.error = Some(format!(
                    "Failed to finalize keys (exit {}): {}",
                    output.exit_code,
                    output.stderr.trim()
                ));
            }
            Err(e) => status.error = Some(format!("Failed to finalize keys: {}", e)),
        }
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = OrchestratorResult<T>>,
    ) -> OrchestratorResult<T> {
        let limit = self.config.step_timeout;
        tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(OrchestratorError::timeout(operation, limit)))
    }

    /// Rotate whenever the policy says a rotation is due.
    pub async fn run_schedule(self: Arc<Self>, token: CancellationToken) {
        let Some(interval) = self.config.interval else {
            return;
        };
        tracing::info!("Automatic key rotation every {:?}", interval);

        loop {
            let wait = self
                .policy()
                .next_due
                .and_then(|due| (due - Utc::now()).to_std().ok())
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match self.rotate(&[]).await {
                Ok(result) if result.full_success => {}
                Ok(result) => tracing::warn!(
                    "Scheduled key rotation {} was partial",
                    result.id
                ),
                Err(e) => {
                    tracing::warn!("Scheduled key rotation failed: {}", e);
                    // avoid a tight loop when rotation keeps failing early
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval.min(Duration::from_secs(3600))) => {}
                    }
                }
            }
        }
    }
}
