//! Exponential backoff shared by reconnection and tunnel reconciliation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_str;
use crate::error::{LinkError, Result};

/// `delay(n) = min(base * factor^(n-1), cap)` for attempt `n` (1-based),
/// optionally stretched by up to `jitter * delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "duration_str")]
    pub base: Duration,
    pub factor: f64,
    #[serde(with = "duration_str")]
    pub cap: Duration,
    pub max_attempts: u32,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default)]
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, factor: f64, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            factor,
            cap,
            max_attempts,
            jitter: 0.0,
        }
    }

    /// Reconnection defaults: 1s, 2s, 4s, 8s, then 16s until 10 attempts.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(16), 10)
    }

    /// Tunnel reconciliation defaults.
    pub fn reconcile() -> Self {
        Self {
            jitter: 0.2,
            ..Self::new(Duration::from_secs(2), 2.0, Duration::from_secs(60), 5)
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic delay before attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base.as_secs_f64() * self.factor.powi(exponent);

        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay with jitter applied; never below [`Self::delay`].
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn validate(&self, field: &str) -> Result<()> {
        if self.base.is_zero() || self.cap < self.base {
            return Err(LinkError::Config(format!(
                "{}: base must be non-zero and not above cap",
                field
            )));
        }
        if self.factor < 1.0 {
            return Err(LinkError::Config(format!(
                "{}: factor must be at least 1.0",
                field
            )));
        }
        if self.max_attempts == 0 {
            return Err(LinkError::Config(format!(
                "{}: max_attempts must be at least 1",
                field
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(LinkError::Config(format!(
                "{}: jitter must be between 0.0 and 1.0",
                field
            )));
        }
        Ok(())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::reconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_sequence_is_capped() {
        let policy = BackoffPolicy::reconnect();
        let delays: Vec<u64> = (1..=10).map(|n| policy.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 16, 16, 16, 16, 16]);
    }

    #[test]
    fn test_delay_is_monotonic_and_bounded() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 3.0, Duration::from_secs(5), 50);
        let mut previous = Duration::ZERO;
        for attempt in 1..=50 {
            let delay = policy.delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(5));
            previous = delay;
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let policy = BackoffPolicy::reconnect();
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(16));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::reconnect().with_jitter(0.5);
        for _ in 0..100 {
            let d = policy.jittered_delay(3);
            assert!(d >= Duration::from_secs(4));
            assert!(d <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = BackoffPolicy::reconnect();
        assert_eq!(policy.jittered_delay(2), Duration::from_secs(2));
    }

    #[test]
    fn test_allows() {
        let policy = BackoffPolicy::reconnect();
        assert!(policy.allows(0));
        assert!(policy.allows(9));
        assert!(!policy.allows(10));
    }

    #[test]
    fn test_validate() {
        assert!(BackoffPolicy::reconnect().validate("x").is_ok());
        assert!(BackoffPolicy::reconcile().validate("x").is_ok());
        assert!(BackoffPolicy::new(Duration::ZERO, 2.0, Duration::from_secs(1), 3)
            .validate("x")
            .is_err());
        assert!(BackoffPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(1), 0)
            .validate("x")
            .is_err());
        assert!(BackoffPolicy::reconnect().with_jitter(1.5).validate("x").is_err());
    }
}
