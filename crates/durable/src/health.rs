//! Health monitoring
//!
//! [`HealthMonitor`] probes the connection pool on its own schedule and keeps
//! an aggregate status for the `/health` endpoint:
//!
//! ```text
//! healthy --fail--> degraded --(max_failures in a row)--> unhealthy
//!    ^                  |                                     |
//!    +----- success ----+------------- success ---------------+
//! ```
//!
//! The monitor only reads pool statistics and runs probes; it never touches
//! task state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::{ConnectionPool, Connector, Liveness};
use crate::serde_util::duration_millis;

/// Aggregate health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shortest allowed time between probes
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Health check configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Time between probes
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// A probe slower than this counts as failed
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Consecutive failures before the status becomes unhealthy
    pub max_failures: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
            max_failures: 3,
        }
    }
}

impl HealthCheckConfig {
    /// Set the probe interval; clamped to [`MIN_CHECK_INTERVAL`]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }
}

/// Pool occupancy as shown in the health report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub in_use: usize,
    pub idle: usize,
    pub max_size: usize,
}

/// Something the monitor can probe
#[async_trait]
pub trait HealthTarget: Send + Sync + 'static {
    /// One liveness probe; `Err` carries the reason it failed
    async fn probe(&self, timeout: Duration) -> Result<(), String>;

    fn pool_health(&self) -> PoolHealth;

    /// Called after every probe with its outcome
    fn record(&self, _at: DateTime<Utc>, _ok: bool) {}
}

#[async_trait]
impl<C: Connector> HealthTarget for ConnectionPool<C> {
    async fn probe(&self, timeout: Duration) -> Result<(), String> {
        match self.check_health(timeout).await {
            Ok(Liveness::Healthy) => Ok(()),
            Ok(Liveness::Unhealthy) => Err("liveness probe failed".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn pool_health(&self) -> PoolHealth {
        let stats = self.stats();
        PoolHealth {
            in_use: stats.in_use,
            idle: stats.idle,
            max_size: stats.max_size,
        }
    }

    fn record(&self, at: DateTime<Utc>, ok: bool) {
        self.record_health_check(at, ok);
    }
}

/// Body of the `/health` endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub pool: PoolHealth,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct MonitorState {
    status: HealthStatus,
    consecutive_failures: u32,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Periodic pool prober
pub struct HealthMonitor<T: HealthTarget> {
    target: Arc<T>,
    config: HealthCheckConfig,
    state: Mutex<MonitorState>,
}

impl<T: HealthTarget> HealthMonitor<T> {
    /// Starts out healthy until a probe says otherwise
    pub fn new(target: Arc<T>, config: HealthCheckConfig) -> Self {
        Self {
            target,
            config,
            state: Mutex::new(MonitorState {
                status: HealthStatus::Healthy,
                consecutive_failures: 0,
                last_check: None,
                last_error: None,
            }),
        }
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn status(&self) -> HealthStatus {
        self.state.lock().status
    }

    /// Run one probe now and fold its outcome into the status
    pub async fn check_now(&self) -> HealthStatus {
        let timeout = self.config.timeout;
        let outcome = match tokio::time::timeout(timeout, self.target.probe(timeout)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!("health probe exceeded {}ms", timeout.as_millis())),
        };

        let now = Utc::now();
        self.target.record(now, outcome.is_ok());
        self.observe(outcome, now)
    }

    fn observe(&self, outcome: Result<(), String>, at: DateTime<Utc>) -> HealthStatus {
        let mut state = self.state.lock();
        let previous = state.status;
        state.last_check = Some(at);

        match outcome {
            Ok(()) => {
                state.consecutive_failures = 0;
                state.last_error = None;
                state.status = HealthStatus::Healthy;
                if previous != HealthStatus::Healthy {
                    info!(previous = %previous, "Connection pool recovered");
                }
            }
            Err(error) => {
                state.consecutive_failures += 1;
                state.status = if state.consecutive_failures >= self.config.max_failures {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
                if state.status != previous {
                    warn!(
                        status = %state.status,
                        consecutive_failures = state.consecutive_failures,
                        error = %error,
                        "Connection pool health degraded"
                    );
                } else {
                    debug!(
                        consecutive_failures = state.consecutive_failures,
                        error = %error,
                        "Health probe failed"
                    );
                }
                state.last_error = Some(error);
            }
        }

        state.status
    }

    /// Current status with pool occupancy
    pub fn report(&self) -> HealthReport {
        let state = self.state.lock();
        HealthReport {
            status: state.status,
            pool: self.target.pool_health(),
            last_check: state.last_check,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
        }
    }

    /// Probe every `interval` until `shutdown` flips to true
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            // `interval` is a public field and may still be zero
            let period = monitor.config.interval.max(MIN_CHECK_INTERVAL);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        monitor.check_now().await;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }

            debug!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{MemoryConnector, PoolConfig};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Probe outcome set by the test
    #[derive(Default)]
    struct Switch {
        failing: AtomicBool,
        hang: AtomicBool,
        probes: AtomicUsize,
    }

    #[async_trait]
    impl HealthTarget for Switch {
        async fn probe(&self, _timeout: Duration) -> Result<(), String> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                Err("connection refused".to_string())
            } else {
                Ok(())
            }
        }

        fn pool_health(&self) -> PoolHealth {
            PoolHealth {
                in_use: 1,
                idle: 2,
                max_size: 30,
            }
        }
    }

    #[tokio::test]
    async fn test_degrades_then_goes_unhealthy_then_recovers() {
        let target = Arc::new(Switch::default());
        let monitor = HealthMonitor::new(target.clone(), HealthCheckConfig::default());
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        target.failing.store(true, Ordering::SeqCst);
        assert_eq!(monitor.check_now().await, HealthStatus::Degraded);
        assert_eq!(monitor.check_now().await, HealthStatus::Degraded);
        assert_eq!(monitor.check_now().await, HealthStatus::Unhealthy);

        let report = monitor.report();
        assert_eq!(report.consecutive_failures, 3);
        assert_eq!(report.last_error.as_deref(), Some("connection refused"));

        target.failing.store(false, Ordering::SeqCst);
        assert_eq!(monitor.check_now().await, HealthStatus::Healthy);
        assert_eq!(monitor.report().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_counts_as_failure() {
        let target = Arc::new(Switch::default());
        target.hang.store(true, Ordering::SeqCst);
        let monitor = HealthMonitor::new(
            target,
            HealthCheckConfig::default().with_timeout(Duration::from_millis(100)),
        );

        assert_eq!(monitor.check_now().await, HealthStatus::Degraded);
        assert!(monitor
            .report()
            .last_error
            .unwrap()
            .contains("exceeded 100ms"));
    }

    #[test]
    fn test_report_json_shape() {
        let monitor = HealthMonitor::new(Arc::new(Switch::default()), HealthCheckConfig::default());
        let json = serde_json::to_value(monitor.report()).unwrap();

        assert_eq!(json["status"], "healthy");
        assert_eq!(json["pool"]["in_use"], 1);
        assert_eq!(json["pool"]["idle"], 2);
        assert_eq!(json["pool"]["max_size"], 30);
        assert!(json.get("last_error").is_none());
    }

    #[tokio::test]
    async fn test_probes_connection_pool() {
        let connector = MemoryConnector::new();
        let pool = Arc::new(ConnectionPool::new(
            connector.clone(),
            PoolConfig::new().with_pool_size(2).with_max_overflow(0),
        ));
        let monitor = HealthMonitor::new(pool.clone(), HealthCheckConfig::default());

        assert_eq!(monitor.check_now().await, HealthStatus::Healthy);
        assert_eq!(pool.stats().last_health_ok, Some(true));

        connector.set_healthy(false);
        assert_eq!(monitor.check_now().await, HealthStatus::Degraded);
        assert_eq!(pool.stats().last_health_ok, Some(false));
        assert_eq!(monitor.report().pool.max_size, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_probes_on_interval() {
        let target = Arc::new(Switch::default());
        let monitor = Arc::new(HealthMonitor::new(
            target.clone(),
            HealthCheckConfig::default().with_interval(Duration::from_secs(60)),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor.spawn(shutdown_rx);

        // First tick fires immediately, then once per interval
        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(target.probes.load(Ordering::SeqCst), 3);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_probes() {
        let config = HealthCheckConfig::default().with_interval(Duration::ZERO);
        assert_eq!(config.interval, MIN_CHECK_INTERVAL);

        let target = Arc::new(Switch::default());
        let mut config = HealthCheckConfig::default();
        config.interval = Duration::ZERO;
        let monitor = Arc::new(HealthMonitor::new(target.clone(), config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = monitor.spawn(shutdown_rx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(target.probes.load(Ordering::SeqCst) >= 1);
        assert!(monitor.report().last_check.is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
