//! Connection pool configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;
use crate::serde_util::duration_millis;

/// Connection pool configuration
///
/// Mirrors the classic queue-pool knobs: `pool_size` connections are kept
/// idle for reuse, up to `max_overflow` more may be opened under load, and
/// `max_size` is the hard ceiling on live connections (by default
/// `pool_size + max_overflow`).
///
/// # Example
///
/// ```
/// use phototask_durable::pool::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_pool_size(5)
///     .with_max_overflow(2)
///     .with_pool_timeout(Duration::from_secs(10));
///
/// assert_eq!(config.max_size, 7);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Connections kept idle for reuse
    pub pool_size: usize,

    /// Extra connections allowed beyond `pool_size` (closed on release)
    pub max_overflow: usize,

    /// Connections opened eagerly by `warm_up`
    pub min_size: usize,

    /// Hard ceiling on live connections
    pub max_size: usize,

    /// How long `acquire` waits for a free connection
    #[serde(with = "duration_millis")]
    pub pool_timeout: Duration,

    /// Connections older than this are retired instead of reused
    #[serde(with = "duration_millis")]
    pub pool_recycle: Duration,

    /// Probe idle connections before handing them out
    pub pool_pre_ping: bool,

    /// Attempts to open a new connection before giving up
    pub retry_count: u32,

    /// Wait between connection attempts
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 20,
            max_overflow: 10,
            min_size: 1,
            max_size: 30,
            pool_timeout: Duration::from_secs(30),
            pool_recycle: Duration::from_secs(3600),
            pool_pre_ping: true,
            retry_count: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle pool size (recomputes `max_size`)
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self.max_size = self.pool_size + self.max_overflow;
        self
    }

    /// Set the overflow allowance (recomputes `max_size`)
    pub fn with_max_overflow(mut self, overflow: usize) -> Self {
        self.max_overflow = overflow;
        self.max_size = self.pool_size + self.max_overflow;
        self
    }

    /// Override the hard ceiling directly
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Set the number of eagerly opened connections
    pub fn with_min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }

    /// Set the acquire wait limit
    pub fn with_pool_timeout(mut self, timeout: Duration) -> Self {
        self.pool_timeout = timeout;
        self
    }

    /// Set the maximum connection age
    pub fn with_pool_recycle(mut self, recycle: Duration) -> Self {
        self.pool_recycle = recycle;
        self
    }

    /// Enable or disable the pre-use liveness probe
    pub fn with_pre_ping(mut self, enabled: bool) -> Self {
        self.pool_pre_ping = enabled;
        self
    }

    /// Set connection-creation retries
    pub fn with_connect_retry(mut self, count: u32, interval: Duration) -> Self {
        self.retry_count = count;
        self.retry_interval = interval;
        self
    }

    /// Retry policy used when opening connections
    pub fn connect_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.retry_count.max(1), self.retry_interval)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be at least 1".into());
        }
        if self.min_size > self.max_size {
            return Err(format!(
                "min_size ({}) must not exceed max_size ({})",
                self.min_size, self.max_size
            ));
        }
        if self.pool_size > self.max_size {
            return Err(format!(
                "pool_size ({}) must not exceed max_size ({})",
                self.pool_size, self.max_size
            ));
        }
        if self.retry_count == 0 {
            return Err("retry_count must be at least 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_queue_pool_settings() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_size, 20);
        assert_eq!(config.max_overflow, 10);
        assert_eq!(config.max_size, 30);
        assert_eq!(config.pool_timeout, Duration::from_secs(30));
        assert_eq!(config.pool_recycle, Duration::from_secs(3600));
        assert!(config.pool_pre_ping);
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_recomputes_ceiling() {
        let config = PoolConfig::new().with_pool_size(4).with_max_overflow(0);
        assert_eq!(config.max_size, 4);

        let config = config.with_max_size(2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_min_above_max() {
        let config = PoolConfig::new()
            .with_pool_size(1)
            .with_max_overflow(0)
            .with_min_size(2);
        assert!(config.validate().unwrap_err().contains("min_size"));
    }

    #[test]
    fn test_connect_retry_policy_is_fixed() {
        let config = PoolConfig::new().with_connect_retry(4, Duration::from_millis(200));
        let policy = config.connect_retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(200));
    }

    #[test]
    fn test_serialization() {
        let config = PoolConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["pool_timeout"], 30_000);
        let parsed: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config, parsed);
    }
}
