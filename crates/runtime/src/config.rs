// Runtime configuration
//
// Every tunable of the pool, health monitor, executor, worker pool and
// manager can be set from an upper-case environment variable. Durations are
// given in seconds (fractions allowed). Unset variables keep the defaults;
// set-but-unparseable ones are errors.

use std::time::Duration;

use phototask_durable::health::HealthCheckConfig;
use phototask_durable::manager::ManagerConfig;
use phototask_durable::pool::PoolConfig;
use phototask_durable::worker::WorkerPoolConfig;
use phototask_durable::ExecutorConfig;
use tracing::debug;

use crate::error::{ConfigError, Result};

/// Environment variable names
pub mod vars {
    pub const DATABASE_URL: &str = "DATABASE_URL";
    pub const POOL_SIZE: &str = "POOL_SIZE";
    pub const MAX_OVERFLOW: &str = "MAX_OVERFLOW";
    pub const POOL_TIMEOUT: &str = "POOL_TIMEOUT";
    pub const POOL_RECYCLE: &str = "POOL_RECYCLE";
    pub const POOL_PRE_PING: &str = "POOL_PRE_PING";
    pub const RETRY_COUNT: &str = "RETRY_COUNT";
    pub const RETRY_INTERVAL: &str = "RETRY_INTERVAL";
    pub const MIN_SIZE: &str = "MIN_SIZE";
    pub const MAX_SIZE: &str = "MAX_SIZE";
    pub const ACQUIRE_TIMEOUT: &str = "ACQUIRE_TIMEOUT";
    pub const HEALTH_CHECK_INTERVAL: &str = "HEALTH_CHECK_INTERVAL";
    pub const HEALTH_CHECK_TIMEOUT: &str = "HEALTH_CHECK_TIMEOUT";
    pub const HEALTH_CHECK_MAX_FAILURES: &str = "HEALTH_CHECK_MAX_FAILURES";
    pub const MAX_RETRIES: &str = "MAX_RETRIES";
    pub const RETRY_BACKOFF: &str = "RETRY_BACKOFF";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const WORKER_CONCURRENCY: &str = "WORKER_CONCURRENCY";
    pub const TASK_QUEUE_DEPTH: &str = "TASK_QUEUE_DEPTH";
    pub const TASK_RETENTION_HOURS: &str = "TASK_RETENTION_HOURS";
    pub const CLEANUP_INTERVAL: &str = "CLEANUP_INTERVAL";
}

/// Configuration for the whole service
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// PostgreSQL URL; `None` runs on the in-memory store
    pub database_url: Option<String>,
    pub pool: PoolConfig,
    pub health: HealthCheckConfig,
    pub executor: ExecutorConfig,
    pub workers: WorkerPoolConfig,
    pub manager: ManagerConfig,
    /// Time between retention cleanups
    pub cleanup_interval: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            pool: PoolConfig::default(),
            health: HealthCheckConfig::default(),
            executor: ExecutorConfig::default(),
            workers: WorkerPoolConfig::default(),
            manager: ManagerConfig::default(),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RuntimeConfig {
    /// Create configuration from environment variables
    ///
    /// Loads a `.env` file first when one is present.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let mut config = Self::default();

        config.database_url = env.get(vars::DATABASE_URL).filter(|url| !url.is_empty());

        // Pool
        let mut pool = config.pool;
        if let Some(size) = env.parse(vars::POOL_SIZE)? {
            pool = pool.with_pool_size(size);
        }
        if let Some(overflow) = env.parse(vars::MAX_OVERFLOW)? {
            pool = pool.with_max_overflow(overflow);
        }
        if let Some(max_size) = env.parse(vars::MAX_SIZE)? {
            pool = pool.with_max_size(max_size);
        }
        if let Some(min_size) = env.parse(vars::MIN_SIZE)? {
            pool = pool.with_min_size(min_size);
        }
        if let Some(timeout) = env.seconds(vars::POOL_TIMEOUT)? {
            pool = pool.with_pool_timeout(timeout);
        }
        if let Some(recycle) = env.seconds(vars::POOL_RECYCLE)? {
            pool = pool.with_pool_recycle(recycle);
        }
        if let Some(pre_ping) = env.flag(vars::POOL_PRE_PING)? {
            pool = pool.with_pre_ping(pre_ping);
        }
        let retry_count = env.parse(vars::RETRY_COUNT)?.unwrap_or(pool.retry_count);
        let retry_interval = env
            .seconds(vars::RETRY_INTERVAL)?
            .unwrap_or(pool.retry_interval);
        config.pool = pool.with_connect_retry(retry_count, retry_interval);

        // Health checks
        let mut health = config.health;
        if let Some(interval) = env.seconds(vars::HEALTH_CHECK_INTERVAL)? {
            if interval.is_zero() {
                return Err(ConfigError::invalid(
                    vars::HEALTH_CHECK_INTERVAL,
                    &env.get(vars::HEALTH_CHECK_INTERVAL).unwrap_or_default(),
                    "must be positive",
                ));
            }
            health = health.with_interval(interval);
        }
        if let Some(timeout) = env.seconds(vars::HEALTH_CHECK_TIMEOUT)? {
            health = health.with_timeout(timeout);
        }
        if let Some(max_failures) = env.parse::<u32>(vars::HEALTH_CHECK_MAX_FAILURES)? {
            if max_failures == 0 {
                return Err(ConfigError::invalid(
                    vars::HEALTH_CHECK_MAX_FAILURES,
                    "0",
                    "must be at least 1",
                ));
            }
            health = health.with_max_failures(max_failures);
        }
        config.health = health;

        // Executor
        let mut executor = config.executor;
        if let Some(max_retries) = env.parse::<u32>(vars::MAX_RETRIES)? {
            if max_retries == 0 {
                return Err(ConfigError::invalid(vars::MAX_RETRIES, "0", "must be at least 1"));
            }
            executor = executor.with_max_retries(max_retries);
        }
        if let Some(backoff) = env.seconds(vars::RETRY_BACKOFF)? {
            executor = executor.with_retry_backoff(backoff);
        }
        if let Some(timeout) = env.seconds(vars::REQUEST_TIMEOUT)? {
            executor = executor.with_request_timeout(timeout);
        }
        // Waiting for a connection defaults to the pool's own wait limit
        let acquire_timeout = env
            .seconds(vars::ACQUIRE_TIMEOUT)?
            .unwrap_or(config.pool.pool_timeout);
        config.executor = executor.with_acquire_timeout(acquire_timeout);

        // Workers and manager
        if let Some(concurrency) = env.parse(vars::WORKER_CONCURRENCY)? {
            config.workers = config.workers.with_max_concurrency(concurrency);
        }
        if let Some(depth) = env.parse(vars::TASK_QUEUE_DEPTH)? {
            config.workers = config.workers.with_queue_depth(depth);
        }
        if let Some(hours) = env.parse::<u64>(vars::TASK_RETENTION_HOURS)? {
            let secs = hours.checked_mul(60 * 60).ok_or_else(|| {
                ConfigError::invalid(
                    vars::TASK_RETENTION_HOURS,
                    &hours.to_string(),
                    "too large",
                )
            })?;
            config.manager = config.manager.with_retention(Duration::from_secs(secs));
        }
        if let Some(interval) = env.seconds(vars::CLEANUP_INTERVAL)? {
            config.cleanup_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        self.pool.validate().map_err(ConfigError::Inconsistent)?;
        if self.executor.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.health.interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "health_check.interval must be positive".into(),
            ));
        }
        if self.health.max_failures == 0 {
            return Err(ConfigError::Inconsistent(
                "health_check.max_failures must be at least 1".into(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::Inconsistent(
                "cleanup_interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string())
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse()
                    .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string()))
            })
            .transpose()
    }

    fn seconds(&self, key: &'static str) -> Result<Option<Duration>> {
        self.get(key)
            .map(|raw| {
                raw.parse::<f64>()
                    .map_err(|e| e.to_string())
                    .and_then(|secs| Duration::try_from_secs_f64(secs).map_err(|e| e.to_string()))
                    .map_err(|reason| ConfigError::invalid(key, &raw, reason))
            })
            .transpose()
    }

    fn flag(&self, key: &'static str) -> Result<Option<bool>> {
        self.get(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &raw, "expected a boolean")),
            })
            .transpose()
    }
}
