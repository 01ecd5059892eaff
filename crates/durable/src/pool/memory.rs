//! In-process connector
//!
//! Connections are plain tokens. Used when tasks need no external database
//! (the in-memory deployment) and by tests, which flip its health and inject
//! connect failures through a shared handle.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::connector::{Connector, ConnectorError, Liveness};

/// A connection handed out by [`MemoryConnector`]
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryConnection {
    /// Serial number, starting at 1 for the first connection opened
    pub serial: u64,
}

#[derive(Debug, Default)]
struct ConnectorState {
    unhealthy: AtomicBool,
    failing_connects: AtomicU32,
    connects: AtomicU64,
    probes: AtomicU64,
    closes: AtomicU64,
    connect_delay: Mutex<Option<Duration>>,
}

/// Connector for an in-process resource
///
/// Clones share state, so a test can keep one handle and give another to the
/// pool.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<ConnectorState>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make probes report the given liveness
    pub fn set_healthy(&self, healthy: bool) {
        self.state.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.state.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Delay every connect attempt
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Connect attempts so far, failed ones included
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> u64 {
        self.state.probes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Connection = MemoryConnection;

    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<MemoryConnection, ConnectorError> {
        let delay = *self.state.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let serial = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ConnectorError::new("connection refused"));
        }

        Ok(MemoryConnection { serial })
    }

    async fn probe(&self, _conn: &mut MemoryConnection) -> Liveness {
        self.state.probes.fetch_add(1, Ordering::SeqCst);
        if self.state.unhealthy.load(Ordering::SeqCst) {
            Liveness::Unhealthy
        } else {
            Liveness::Healthy
        }
    }

    async fn close(&self, _conn: MemoryConnection) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}
