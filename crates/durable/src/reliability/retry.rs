//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::serde_util::duration_millis;

/// How the wait between attempts grows
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same wait before every retry
    Fixed,

    /// Wait grows by `initial_interval` per retry (1x, 2x, 3x, ...)
    Linear,

    /// Wait multiplies by `coefficient` per retry
    Exponential { coefficient: f64 },
}

/// Configuration for retries
///
/// Used at two independent layers: the connection pool retries connection
/// creation with a fixed interval, and the executor retries retriable task
/// failures with linear backoff.
///
/// # Example
///
/// ```
/// use phototask_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::linear(3, Duration::from_secs(1));
///
/// // Second attempt after 1 second, third after 2 seconds
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
/// assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Base delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth of the delay
    pub backoff: Backoff,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means +/-10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Linear backoff: the n-th retry waits `n * interval`
    pub fn linear(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: Duration::from_secs(300),
            backoff: Backoff::Linear,
            jitter: 0.0,
        }
    }

    /// Fixed intervals (no backoff)
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff: Backoff::Fixed,
            jitter: 0.0,
        }
    }

    /// Exponential backoff doubling from `initial`
    pub fn exponential(max_attempts: u32, initial: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval: initial,
            max_interval: Duration::from_secs(60),
            backoff: Backoff::Exponential { coefficient: 2.0 },
            jitter: 0.1,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before `attempt` (1-based); the first attempt never waits
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64();
        let raw = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base * retry_num as f64,
            Backoff::Exponential { coefficient } => base * coefficient.powi(retry_num as i32 - 1),
        };
        let capped = raw.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if there are remaining attempts after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}
