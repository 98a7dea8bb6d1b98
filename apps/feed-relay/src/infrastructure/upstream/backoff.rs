//! Reconnect Backoff Policy
//!
//! Exponential backoff with additive jitter for supervisor reconnects:
//!
//! ```text
//! delay(n) = min(cap, base * 2^n) + uniform[0, base]
//! ```
//!
//! `n` is the retry exponent. The health monitor passes
//! `consecutive_failures - 1`, so the first retry after one failure waits
//! about `base`, the second `2 * base`, and so on. The policy holds no
//! per-attempt state; the failure count lives in [`super::ConnectionMetrics`].

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied before the cap takes over.
const MAX_EXPONENT: u32 = 32;

/// Backoff configuration and delay calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Base delay, also the upper bound of the jitter.
    pub base: Duration,
    /// Upper bound of the exponential part.
    pub cap: Duration,
    /// Failures tolerated before the feed is marked failed.
    pub max_attempts: u32,
    /// Whether to add jitter. Disabled only for deterministic tests.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with jitter enabled.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            jitter: true,
        }
    }

    /// Same policy without jitter.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Exponential part of the delay: `min(cap, base * 2^exponent)`.
    #[must_use]
    pub fn exponential(&self, exponent: u32) -> Duration {
        let factor = 1u32 << exponent.min(MAX_EXPONENT - 1);
        self.base.checked_mul(factor).map_or(self.cap, |d| d.min(self.cap))
    }

    /// Full delay for a retry exponent, jitter included.
    #[must_use]
    pub fn delay(&self, exponent: u32) -> Duration {
        self.exponential(exponent) + self.sample_jitter()
    }

    /// Whether another attempt is allowed after `consecutive_failures`.
    #[must_use]
    pub const fn should_retry(&self, consecutive_failures: u32) -> bool {
        consecutive_failures < self.max_attempts
    }

    fn sample_jitter(&self) -> Duration {
        if !self.jitter {
            return Duration::ZERO;
        }
        let base_millis = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        if base_millis == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(0..=base_millis))
    }
}
