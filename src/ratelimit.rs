//! Per-instance connection attempt limiting.
//!
//! Two independent gates must both pass before a dial is allowed:
//!
//! - a sliding window (default 10 attempts per 60s) against connection storms;
//! - an escalating block after consecutive failures (30s, 1m, 5m) against a
//!   single broken target eating resources forever.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::duration_str;
use crate::error::{LinkError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Attempts allowed inside one window.
    pub max_attempts: usize,
    #[serde(with = "duration_str")]
    pub window: Duration,
    /// Consecutive failures before the first block kicks in.
    pub failure_threshold: u32,
    /// Escalating block durations; the last one repeats.
    #[serde(with = "duration_str::list")]
    pub block_durations: Vec<Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window: Duration::from_secs(60),
            failure_threshold: 3,
            block_durations: vec![
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(300),
            ],
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 || self.window.is_zero() {
            return Err(LinkError::Config(
                "rate_limit: max_attempts and window must be greater than zero".to_string(),
            ));
        }
        if self.failure_threshold == 0 || self.block_durations.is_empty() {
            return Err(LinkError::Config(
                "rate_limit: failure_threshold and block_durations must be set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of one instance's limiter state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub window_count: usize,
    pub consecutive_failures: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LimiterEntry {
    attempts: VecDeque<Instant>,
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
}

impl LimiterEntry {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.attempts.front() {
            if now.saturating_duration_since(*front) >= window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    fn active_block(&self, now: Instant) -> Option<Instant> {
        self.blocked_until.filter(|until| *until > now)
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    entries: Mutex<HashMap<String, LimiterEntry>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check both gates and, if they pass, count this attempt in the window.
    pub fn allow(&self, instance_id: &str) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(instance_id.to_string()).or_default();

        if let Some(until) = entry.active_block(now) {
            return Err(LinkError::RateLimited {
                instance: instance_id.to_string(),
                retry_after: until - now,
            });
        }

        entry.prune(now, self.config.window);
        if entry.attempts.len() >= self.config.max_attempts {
            let oldest = entry.attempts.front().copied().unwrap_or(now);
            let retry_after = self
                .config
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return Err(LinkError::RateLimited {
                instance: instance_id.to_string(),
                retry_after,
            });
        }

        entry.attempts.push_back(now);
        Ok(())
    }

    /// Clear the failure streak. Window attempts still count.
    pub fn record_success(&self, instance_id: &str) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(instance_id) {
            entry.consecutive_failures = 0;
            entry.blocked_until = None;
        }
    }

    pub fn record_failure(&self, instance_id: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.entry(instance_id.to_string()).or_default();

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        if let Some(block) = self.block_duration(entry.consecutive_failures) {
            entry.blocked_until = Some(now + block);
            tracing::warn!(
                "Blocking connection attempts to {} for {:?} after {} consecutive failures",
                instance_id,
                block,
                entry.consecutive_failures
            );
        }
    }

    fn block_duration(&self, failures: u32) -> Option<Duration> {
        if failures < self.config.failure_threshold {
            return None;
        }
        let step = (failures - self.config.failure_threshold) as usize;
        let last = self.config.block_durations.len().checked_sub(1)?;
        self.config.block_durations.get(step.min(last)).copied()
    }

    /// Operator override: forget everything about an instance.
    pub fn reset(&self, instance_id: &str) {
        self.entries.lock().remove(instance_id);
    }

    pub fn status(&self, instance_id: &str) -> RateLimitStatus {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(instance_id) else {
            return RateLimitStatus::default();
        };

        entry.prune(now, self.config.window);
        let blocked_until = entry.active_block(now).and_then(|until| {
            chrono::Duration::from_std(until - now)
                .ok()
                .map(|remaining| Utc::now() + remaining)
        });

        RateLimitStatus {
            window_count: entry.attempts.len(),
            consecutive_failures: entry.consecutive_failures,
            blocked_until,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_rejects_eleventh_attempt() {
        let limiter = RateLimiter::default();

        for _ in 0..10 {
            limiter.allow("bot-1").unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let err = limiter.allow("bot-1").unwrap_err();
        match err {
            LinkError::RateLimited { retry_after, .. } => {
                // oldest attempt is 10s old, 50s left in its window
                assert_eq!(retry_after, Duration::from_secs(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reopens_after_oldest_ages_out() {
        let limiter = RateLimiter::default();

        limiter.allow("bot-1").unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..9 {
            limiter.allow("bot-1").unwrap();
        }
        assert!(limiter.allow("bot-1").is_err());

        // first attempt leaves the window at t=60s, the others stay
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(limiter.allow("bot-1").is_ok());
        assert!(limiter.allow("bot-1").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_instances_are_independent() {
        let limiter = RateLimiter::default();
        for _ in 0..10 {
            limiter.allow("bot-1").unwrap();
        }
        assert!(limiter.allow("bot-1").is_err());
        assert!(limiter.allow("bot-2").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_does_not_clear_window() {
        let limiter = RateLimiter::default();
        for _ in 0..10 {
            limiter.allow("bot-1").unwrap();
            limiter.record_success("bot-1");
        }
        assert!(limiter.allow("bot-1").is_err());
        assert_eq!(limiter.status("bot-1").window_count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_escalates_with_consecutive_failures() {
        let limiter = RateLimiter::default();

        limiter.record_failure("bot-1");
        limiter.record_failure("bot-1");
        assert!(limiter.allow("bot-1").is_ok());

        limiter.record_failure("bot-1");
        match limiter.allow("bot-1").unwrap_err() {
            LinkError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(30))
            }
            other => panic!("unexpected error: {other}"),
        }

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.allow("bot-1").is_ok());

        limiter.record_failure("bot-1");
        match limiter.allow("bot-1").unwrap_err() {
            LinkError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(60))
            }
            other => panic!("unexpected error: {other}"),
        }

        limiter.record_failure("bot-1");
        limiter.record_failure("bot-1");
        match limiter.allow("bot-1").unwrap_err() {
            LinkError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(300))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(limiter.status("bot-1").consecutive_failures, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocked_attempt_does_not_consume_window() {
        let limiter = RateLimiter::default();
        for _ in 0..3 {
            limiter.record_failure("bot-1");
        }
        for _ in 0..20 {
            assert!(limiter.allow("bot-1").is_err());
        }
        assert_eq!(limiter.status("bot-1").window_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_lifts_block() {
        let limiter = RateLimiter::default();
        for _ in 0..3 {
            limiter.record_failure("bot-1");
        }
        assert!(limiter.status("bot-1").blocked_until.is_some());

        limiter.record_success("bot-1");
        let status = limiter.status("bot-1");
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.blocked_until.is_none());
        assert!(limiter.allow("bot-1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_everything() {
        let limiter = RateLimiter::default();
        for _ in 0..10 {
            limiter.allow("bot-1").unwrap();
        }
        for _ in 0..5 {
            limiter.record_failure("bot-1");
        }

        limiter.reset("bot-1");
        assert_eq!(limiter.status("bot-1"), RateLimitStatus::default());
        assert!(limiter.allow("bot-1").is_ok());
    }

    #[test]
    fn test_config_validate() {
        assert!(RateLimitConfig::default().validate().is_ok());
        let config = RateLimitConfig {
            block_durations: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
