//! Restart backoff for supervised user servers.
//!
//! The delay doubles for every failure that follows the previous one by
//! less than the ceiling and starts over after a longer quiet period:
//!
//! ```text
//! failure n (consecutive)  delay = base * 2^(n-1), capped at max
//! gap >= max               n resets to 1
//! ```

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Default delay after the first failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(1);

/// Default delay ceiling, also the quiet period that resets the counter.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after an isolated failure.
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Upper bound for the delay.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Wall-clock driven failure counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

impl Backoff {
    /// Create a counter with no recorded failures.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    /// Number of failures counted in the current streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record a failure at `now` and return how long to wait before retrying.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        let in_streak = self
            .last_failure
            .is_some_and(|last| now.saturating_duration_since(last) < self.config.max);
        self.last_failure = Some(now);

        if in_streak {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        } else {
            self.consecutive_failures = 1;
        }

        self.delay_for(self.consecutive_failures)
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.config
            .base
            .checked_mul(1u32 << exponent)
            .map_or(self.config.max, |delay| delay.min(self.config.max))
    }
}
