//! Exponential backoff and reconnect bookkeeping
//!
//! [`BackoffPolicy`] computes `base × multiplier^(attempt-1)` capped at `cap`,
//! optionally with ±25% jitter. [`ReconnectTracker`] counts reconnect attempts
//! for one connection against a cap.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `min(base × 2^(n-1), cap)` in milliseconds; zero when `n == 0`
pub fn exponential_delay_ms(base_ms: u64, cap_ms: u64, n: u32) -> u64 {
    if n == 0 {
        return 0;
    }
    let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(with = "millis")]
    pub base: Duration,
    #[serde(with = "millis")]
    pub cap: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_millis(1000, 30_000)
    }
}

impl BackoffPolicy {
    pub fn from_millis(base_ms: u64, cap_ms: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
            multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let mut delay = if factor.is_finite() && self.base.as_secs_f64() * factor < self.cap.as_secs_f64() {
            self.base.mul_f64(factor)
        } else {
            self.cap
        };

        // ±25%
        if self.jitter && !delay.is_zero() {
            let range = delay.as_millis() as f64 * 0.25;
            let jitter = rand::thread_rng().gen_range(-range..range);
            delay = Duration::from_millis((delay.as_millis() as f64 + jitter).max(0.0) as u64);
        }
        delay
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Connection state as seen by the reconnect logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Reconnect cap reached; cleared on the next successful connect
    Failed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectStats {
    pub total_attempts: u64,
    pub successful_reconnects: u64,
    pub failed_reconnects: u64,
}

/// Reconnect attempts for one connection
#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempts: u32,
    state: ConnectionState,
    stats: ReconnectStats,
}

impl ReconnectTracker {
    pub fn new(policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self {
            policy,
            max_attempts,
            attempts: 0,
            state: ConnectionState::Disconnected,
            stats: ReconnectStats::default(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn stats(&self) -> ReconnectStats {
        self.stats
    }

    /// Register a transport fault. Returns the delay to wait before
    /// reconnecting, or `None` once the cap is reached.
    pub fn on_fault(&mut self) -> Option<Duration> {
        if self.attempts > 0 || self.state == ConnectionState::Reconnecting {
            self.stats.failed_reconnects += 1;
        }
        if self.max_attempts > 0 && self.attempts >= self.max_attempts {
            self.state = ConnectionState::Failed;
            debug!("Reconnect cap ({}) reached", self.max_attempts);
            return None;
        }

        self.attempts += 1;
        self.stats.total_attempts += 1;
        self.state = ConnectionState::Reconnecting;
        Some(self.policy.delay_for(self.attempts))
    }

    pub fn mark_connected(&mut self) {
        if self.attempts > 0 {
            self.stats.successful_reconnects += 1;
        }
        self.attempts = 0;
        self.state = ConnectionState::Connected;
    }

    pub fn mark_disconnected(&mut self) {
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Forget past attempts so the next fault starts from the base delay
    pub fn reset(&mut self) {
        self.attempts = 0;
        if self.state == ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay() {
        assert_eq!(exponential_delay_ms(1000, 60_000, 0), 0);
        assert_eq!(exponential_delay_ms(1000, 60_000, 1), 1000);
        assert_eq!(exponential_delay_ms(1000, 60_000, 2), 2000);
        assert_eq!(exponential_delay_ms(1000, 60_000, 4), 8000);
        assert_eq!(exponential_delay_ms(1000, 60_000, 7), 60_000);
        assert_eq!(exponential_delay_ms(1000, 60_000, 200), 60_000);
    }

    #[test]
    fn test_policy_delays() {
        let policy = BackoffPolicy::from_millis(100, 10_000);
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(30), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = BackoffPolicy::from_millis(1000, 60_000).with_jitter(true);
        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_tracker_caps_attempts() {
        let mut tracker = ReconnectTracker::new(BackoffPolicy::from_millis(10, 1000), 2);
        assert_eq!(tracker.on_fault(), Some(Duration::from_millis(10)));
        assert_eq!(tracker.on_fault(), Some(Duration::from_millis(20)));
        assert_eq!(tracker.on_fault(), None);
        assert_eq!(tracker.state(), ConnectionState::Failed);

        tracker.mark_connected();
        assert_eq!(tracker.attempts(), 0);
        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert_eq!(tracker.on_fault(), Some(Duration::from_millis(10)));
    }
}
