//! Connection state machine with transition history.
//!
//! Pure bookkeeping, no I/O. Every instance has exactly one
//! [`ConnectionState`]; the only way to change it is [`ConnectionStateTracker::transition`]
//! (or its conditional variant), which timestamps the change, appends it to a
//! capped history and broadcasts it.
//!
//! Subscribers get a `tokio::sync::broadcast` receiver. A slow subscriber
//! lags and loses the oldest notifications instead of blocking the tracker.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Transitions kept per instance.
pub const HISTORY_CAPACITY: usize = 50;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub instance_id: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct InstanceStates {
    state: ConnectionState,
    history: VecDeque<StateTransition>,
}

pub struct ConnectionStateTracker {
    instances: Mutex<HashMap<String, InstanceStates>>,
    history_capacity: usize,
    tx: broadcast::Sender<StateTransition>,
}

impl ConnectionStateTracker {
    pub fn new() -> Self {
        Self::with_history_capacity(HISTORY_CAPACITY)
    }

    pub fn with_history_capacity(history_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            instances: Mutex::new(HashMap::new()),
            history_capacity: history_capacity.max(1),
            tx,
        }
    }

    /// Current state; unknown instances are `Disconnected`.
    pub fn state(&self, instance_id: &str) -> ConnectionState {
        self.instances
            .lock()
            .get(instance_id)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    /// Move to `to`. Returns `None` when the instance is already there.
    pub fn transition(
        &self,
        instance_id: &str,
        to: ConnectionState,
        reason: impl Into<String>,
    ) -> Option<StateTransition> {
        self.apply(instance_id, None, to, reason.into())
    }

    /// Move to `to` only if the current state is one of `expected`.
    ///
    /// Racing detectors use this so that only one of them wins a transition.
    pub fn transition_from(
        &self,
        instance_id: &str,
        expected: &[ConnectionState],
        to: ConnectionState,
        reason: impl Into<String>,
    ) -> Option<StateTransition> {
        self.apply(instance_id, Some(expected), to, reason.into())
    }

    fn apply(
        &self,
        instance_id: &str,
        expected: Option<&[ConnectionState]>,
        to: ConnectionState,
        reason: String,
    ) -> Option<StateTransition> {
        let mut instances = self.instances.lock();
        let entry = instances.entry(instance_id.to_string()).or_default();
        let from = entry.state;

        if from == to {
            return None;
        }
        if let Some(expected) = expected {
            if !expected.contains(&from) {
                return None;
            }
        }

        // wall clocks can step backwards; history must not
        let mut at = Utc::now();
        if let Some(last) = entry.history.back() {
            if at < last.at {
                at = last.at;
            }
        }

        let transition = StateTransition {
            instance_id: instance_id.to_string(),
            from,
            to,
            reason,
            at,
        };

        entry.state = to;
        if entry.history.len() == self.history_capacity {
            entry.history.pop_front();
        }
        entry.history.push_back(transition.clone());

        tracing::debug!("{}: {} -> {} ({})", instance_id, from, to, transition.reason);

        // no receivers is fine
        let _ = self.tx.send(transition.clone());

        Some(transition)
    }

    pub fn history(&self, instance_id: &str) -> Vec<StateTransition> {
        self.instances
            .lock()
            .get(instance_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn states(&self) -> HashMap<String, ConnectionState> {
        self.instances
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.state))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateTransition> {
        self.tx.subscribe()
    }

    pub fn subscribe_instance(&self, instance_id: &str) -> InstanceSubscription {
        InstanceSubscription {
            instance_id: instance_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ConnectionStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Transitions of a single instance. Dropping it unsubscribes.
pub struct InstanceSubscription {
    instance_id: String,
    rx: broadcast::Receiver<StateTransition>,
}

impl InstanceSubscription {
    /// Next transition for this instance, or `None` once the tracker is gone.
    pub async fn recv(&mut self) -> Option<StateTransition> {
        loop {
            match self.rx.recv().await {
                Ok(t) if t.instance_id == self.instance_id => return Some(t),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        "State subscriber for {} lagged, {} transitions dropped",
                        self.instance_id,
                        skipped
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
