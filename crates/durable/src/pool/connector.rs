//! Connector capability: how the pool opens, probes and closes connections

use async_trait::async_trait;

/// Failure to open a connection
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ConnectorError {
    pub message: String,
}

impl ConnectorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result of a liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Unhealthy,
}

impl Liveness {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// A backing resource the pool can hold connections to
///
/// Implemented once per resource type (PostgreSQL, fakes in tests). The
/// probe must be cheap, e.g. `SELECT 1`, never a real operation.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The raw connection handed to callers
    type Connection: Send + 'static;

    /// Short name used in logs
    fn name(&self) -> &str {
        "connector"
    }

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Connection, ConnectorError>;

    /// Lightweight liveness check
    async fn probe(&self, conn: &mut Self::Connection) -> Liveness;

    /// Close a connection the pool is retiring
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}
