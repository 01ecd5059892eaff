//! Bounded connection pool
//!
//! Waiting callers are served in FIFO order through a fair semaphore holding
//! `max_size` permits. A permit is taken before a connection is checked out
//! and is given back only after the connection has been returned to the idle
//! set, so a woken waiter always finds it there.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::config::PoolConfig;
use super::connector::{Connector, Liveness};

/// Connection pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// No connection became free within the wait limit
    #[error("connection pool exhausted: no connection available after {waited:?}")]
    Exhausted { waited: Duration },

    /// A new connection could not be opened
    #[error("failed to open connection after {attempts} attempts: {message}")]
    Connect { attempts: u32, message: String },

    /// The pool has been closed
    #[error("connection pool is closed")]
    Closed,
}

impl PoolError {
    /// Exhaustion clears once load drops; connect failures already spent
    /// their retry budget
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub in_use: usize,
    pub idle: usize,
    pub total: usize,
    pub max_size: usize,
    pub cumulative_failures: u64,
    pub timeouts: u64,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_health_ok: Option<bool>,
}

#[derive(Debug, Clone)]
struct ConnectionMeta {
    id: u64,
    born: Instant,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    is_healthy: bool,
}

impl ConnectionMeta {
    fn fresh(id: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            born: Instant::now(),
            created_at: now,
            last_used_at: now,
            is_healthy: true,
        }
    }
}

struct IdleConnection<T> {
    raw: T,
    meta: ConnectionMeta,
}

struct PoolState<T> {
    idle: VecDeque<IdleConnection<T>>,
    /// Live connections: idle, checked out, or being opened
    total: usize,
    closed: bool,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<C::Connection>>,
    next_id: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    last_health: Mutex<Option<(DateTime<Utc>, bool)>>,
}

impl<C: Connector> PoolInner<C> {
    /// Put a connection back, or hand it back to the caller for closing
    fn checkin(&self, raw: C::Connection, mut meta: ConnectionMeta) -> Option<C::Connection> {
        let mut state = self.state.lock();

        let reason = if state.closed {
            Some("pool closed")
        } else if !meta.is_healthy {
            Some("marked unhealthy")
        } else if meta.born.elapsed() >= self.config.pool_recycle {
            Some("exceeded pool_recycle")
        } else if state.idle.len() >= self.config.pool_size {
            Some("overflow")
        } else {
            None
        };

        if let Some(reason) = reason {
            state.total = state.total.saturating_sub(1);
            drop(state);
            debug!(connection_id = meta.id, reason, "Retiring connection");
            return Some(raw);
        }

        meta.last_used_at = Utc::now();
        state.idle.push_back(IdleConnection { raw, meta });
        None
    }

    /// Close a retired connection without awaiting (used from `Drop`)
    fn close_detached(self: &Arc<Self>, raw: C::Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move { inner.connector.close(raw).await });
            }
            Err(_) => drop(raw),
        }
    }
}

/// Accounts for one live connection until it is handed to a caller
///
/// Dropping an armed slot gives the capacity back, which keeps the count
/// right when an `acquire` future is cancelled mid-connect or mid-probe.
struct Slot<'a, C: Connector> {
    inner: &'a PoolInner<C>,
    armed: bool,
}

impl<C: Connector> Slot<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Slot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.inner.state.lock();
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// Bounded, health-checked pool of connections
///
/// Cheap to clone; clones share the same connections.
///
/// # Example
///
/// ```
/// use phototask_durable::pool::{ConnectionPool, MemoryConnector, PoolConfig};
///
/// # tokio_test_block(async {
/// let pool = ConnectionPool::new(MemoryConnector::new(), PoolConfig::default());
///
/// let conn = pool.acquire().await.unwrap();
/// assert_eq!(pool.stats().in_use, 1);
///
/// pool.release(conn).await;
/// assert_eq!(pool.stats().idle, 1);
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connector", &self.inner.connector.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// Create a pool; no connection is opened until `acquire` or `warm_up`
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                permits,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    closed: false,
                }),
                next_id: AtomicU64::new(1),
                failures: AtomicU64::new(0),
                timeouts: AtomicU64::new(0),
                last_health: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Acquire a connection, waiting up to `pool_timeout`
    pub async fn acquire(&self) -> Result<PooledConnection<C>, PoolError> {
        self.acquire_timeout(self.inner.config.pool_timeout).await
    }

    /// Acquire a connection, waiting up to `timeout`
    ///
    /// Idle connections past `pool_recycle` are retired, and with
    /// `pool_pre_ping` the rest are probed before being handed out. When no
    /// idle connection is left a new one is opened.
    #[instrument(skip(self), fields(connector = self.inner.connector.name()))]
    pub async fn acquire_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PooledConnection<C>, PoolError> {
        let permit =
            match tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => {
                    self.inner.timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        waited_ms = timeout.as_millis() as u64,
                        "Connection pool exhausted"
                    );
                    return Err(PoolError::Exhausted { waited: timeout });
                }
            };

        loop {
            let candidate = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                state.idle.pop_front()
            };
            let Some(IdleConnection { mut raw, meta }) = candidate else {
                break;
            };
            let slot = Slot {
                inner: &self.inner,
                armed: true,
            };

            if meta.born.elapsed() >= self.inner.config.pool_recycle {
                debug!(connection_id = meta.id, "Retiring idle connection past pool_recycle");
                self.inner.connector.close(raw).await;
                continue;
            }

            if self.inner.config.pool_pre_ping
                && self.inner.connector.probe(&mut raw).await == Liveness::Unhealthy
            {
                self.inner.failures.fetch_add(1, Ordering::Relaxed);
                warn!(connection_id = meta.id, "Pre-ping failed, discarding connection");
                self.inner.connector.close(raw).await;
                continue;
            }

            slot.disarm();
            debug!(connection_id = meta.id, "Reusing idle connection");
            return Ok(PooledConnection::new(raw, meta, &self.inner, permit));
        }

        let Some(slot) = self.reserve() else {
            return Err(PoolError::Exhausted {
                waited: Duration::ZERO,
            });
        };
        let (raw, meta) = self.open().await?;
        slot.disarm();
        Ok(PooledConnection::new(raw, meta, &self.inner, permit))
    }

    /// Return a connection to the pool
    pub async fn release(&self, conn: PooledConnection<C>) {
        conn.release().await;
    }

    /// Live connections (idle and in use)
    pub fn size(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        let (idle, total) = {
            let state = self.inner.state.lock();
            (state.idle.len(), state.total)
        };
        let health = *self.inner.last_health.lock();

        PoolStats {
            in_use: total.saturating_sub(idle),
            idle,
            total,
            max_size: self.inner.config.max_size,
            cumulative_failures: self.inner.failures.load(Ordering::Relaxed),
            timeouts: self.inner.timeouts.load(Ordering::Relaxed),
            last_health_check: health.map(|(at, _)| at),
            last_health_ok: health.map(|(_, ok)| ok),
        }
    }

    /// Acquire a connection and run the liveness probe on it
    ///
    /// A connection that fails the probe is discarded rather than returned.
    pub async fn check_health(&self, timeout: Duration) -> Result<Liveness, PoolError> {
        let mut conn = self.acquire_timeout(timeout).await?;
        let liveness = self.inner.connector.probe(&mut conn).await;
        if !liveness.is_healthy() {
            self.inner.failures.fetch_add(1, Ordering::Relaxed);
            conn.mark_unhealthy();
        }
        conn.release().await;
        Ok(liveness)
    }

    /// Record the outcome of a health check in the stats
    pub fn record_health_check(&self, at: DateTime<Utc>, ok: bool) {
        *self.inner.last_health.lock() = Some((at, ok));
    }

    /// Open connections until `min_size` are live
    pub async fn warm_up(&self) -> Result<usize, PoolError> {
        let mut opened = 0;
        loop {
            {
                let state = self.inner.state.lock();
                if state.closed {
                    return Err(PoolError::Closed);
                }
                if state.total >= self.inner.config.min_size {
                    break;
                }
            }

            let Ok(permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                break;
            };
            let Some(slot) = self.reserve() else {
                break;
            };
            let (raw, meta) = self.open().await?;
            slot.disarm();
            self.inner
                .state
                .lock()
                .idle
                .push_back(IdleConnection { raw, meta });
            drop(permit);
            opened += 1;
        }

        if opened > 0 {
            info!(opened, "Connection pool warmed up");
        }
        Ok(opened)
    }

    /// Close the pool: idle connections are closed now, in-use ones on release
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle = state.idle.len();
            state.total = state.total.saturating_sub(idle);
            state.idle.drain(..).collect()
        };
        self.inner.permits.close();

        let closed = drained.len();
        for idle in drained {
            self.inner.connector.close(idle.raw).await;
        }
        info!(closed, "Connection pool closed");
    }

    fn reserve(&self) -> Option<Slot<'_, C>> {
        let mut state = self.inner.state.lock();
        if state.total >= self.inner.config.max_size {
            return None;
        }
        state.total += 1;
        drop(state);
        Some(Slot {
            inner: &self.inner,
            armed: true,
        })
    }

    /// Open a connection, retrying with `retry_interval` between attempts
    async fn open(&self) -> Result<(C::Connection, ConnectionMeta), PoolError> {
        let policy = self.inner.config.connect_retry_policy();
        let mut attempt = 1;

        loop {
            match self.inner.connector.connect().await {
                Ok(raw) => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(connection_id = id, attempt, "Opened connection");
                    return Ok((raw, ConnectionMeta::fresh(id)));
                }
                Err(e) => {
                    self.inner.failures.fetch_add(1, Ordering::Relaxed);
                    if !policy.has_attempts_remaining(attempt) {
                        error!(attempts = attempt, error = %e, "Giving up opening connection");
                        return Err(PoolError::Connect {
                            attempts: attempt,
                            message: e.message,
                        });
                    }
                    warn!(attempt, error = %e, "Connection attempt failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                }
            }
        }
    }
}

/// A connection borrowed from the pool
///
/// Dereferences to the raw connection. Return it with [`release`]; dropping
/// it returns it too, closing it in the background when it is retired.
///
/// [`release`]: PooledConnection::release
pub struct PooledConnection<C: Connector> {
    raw: Option<C::Connection>,
    meta: ConnectionMeta,
    pool: Arc<PoolInner<C>>,
    // Dropped after `raw` is checked in
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConnection<C> {
    fn new(
        raw: C::Connection,
        meta: ConnectionMeta,
        pool: &Arc<PoolInner<C>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            raw: Some(raw),
            meta,
            pool: Arc::clone(pool),
            _permit: permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.meta.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.meta.last_used_at
    }

    pub fn is_healthy(&self) -> bool {
        self.meta.is_healthy
    }

    /// Age since the connection was opened
    pub fn age(&self) -> Duration {
        self.meta.born.elapsed()
    }

    /// Have the pool discard this connection instead of reusing it
    pub fn mark_unhealthy(&mut self) {
        self.meta.is_healthy = false;
    }

    /// Return the connection, closing it if it is retired
    pub async fn release(mut self) {
        if let Some(raw) = self.raw.take() {
            if let Some(retired) = self.pool.checkin(raw, self.meta.clone()) {
                self.pool.connector.close(retired).await;
            }
        }
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `release` and `drop` take the connection, and both consume self
        self.raw.as_ref().expect("pooled connection already released")
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.raw.as_mut().expect("pooled connection already released")
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            if let Some(retired) = self.pool.checkin(raw, self.meta.clone()) {
                self.pool.close_detached(retired);
            }
        }
    }
}

impl<C: Connector> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.meta.id)
            .field("created_at", &self.meta.created_at)
            .field("last_used_at", &self.meta.last_used_at)
            .field("is_healthy", &self.meta.is_healthy)
            .finish()
    }
}
