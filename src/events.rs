//! Bounded per-instance lifecycle event log.
//!
//! Each instance gets a fixed-size ring buffer (default 100 entries); the
//! oldest entries are silently dropped. Every entry is also broadcast so an
//! external audit collaborator can persist the feed.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events kept per instance.
pub const EVENT_CAPACITY: usize = 100;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Connected,
    Disconnected,
    Reconnecting,
    Reconnected,
    ReconnectFailed,
    KeyUploaded,
    HealthCheckFailed,
    RateLimited,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::Connected => "connected",
            EventType::Disconnected => "disconnected",
            EventType::Reconnecting => "reconnecting",
            EventType::Reconnected => "reconnected",
            EventType::ReconnectFailed => "reconnect_failed",
            EventType::KeyUploaded => "key_uploaded",
            EventType::HealthCheckFailed => "health_check_failed",
            EventType::RateLimited => "rate_limited",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// Monotonic across the whole log.
    pub seq: u64,
    pub instance_id: String,
    pub event_type: EventType,
    pub details: String,
    pub timestamp: DateTime<Utc>,
}

struct LogState {
    next_seq: u64,
    buffers: HashMap<String, VecDeque<ConnectionEvent>>,
}

pub struct EventLog {
    state: Mutex<LogState>,
    capacity: usize,
    tx: broadcast::Sender<ConnectionEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(LogState {
                next_seq: 1,
                buffers: HashMap::new(),
            }),
            capacity: capacity.max(1),
            tx,
        }
    }

    pub fn record(
        &self,
        instance_id: &str,
        event_type: EventType,
        details: impl Into<String>,
    ) -> ConnectionEvent {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;

        let buffer = state
            .buffers
            .entry(instance_id.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.capacity));

        let mut timestamp = Utc::now();
        if let Some(last) = buffer.back() {
            if timestamp < last.timestamp {
                timestamp = last.timestamp;
            }
        }

        let event = ConnectionEvent {
            seq,
            instance_id: instance_id.to_string(),
            event_type,
            details: details.into(),
            timestamp,
        };

        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event.clone());

        let _ = self.tx.send(event.clone());
        event
    }

    /// All retained events for an instance, oldest first.
    pub fn events(&self, instance_id: &str) -> Vec<ConnectionEvent> {
        self.state
            .lock()
            .buffers
            .get(instance_id)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The newest `limit` events, oldest first.
    pub fn recent(&self, instance_id: &str, limit: usize) -> Vec<ConnectionEvent> {
        let state = self.state.lock();
        let Some(buffer) = state.buffers.get(instance_id) else {
            return Vec::new();
        };
        let skip = buffer.len().saturating_sub(limit);
        buffer.iter().skip(skip).cloned().collect()
    }

    /// Events recorded after `seq` (for pollers resuming a feed).
    pub fn since(&self, instance_id: &str, seq: u64) -> Vec<ConnectionEvent> {
        self.state
            .lock()
            .buffers
            .get(instance_id)
            .map(|b| b.iter().filter(|e| e.seq > seq).cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
