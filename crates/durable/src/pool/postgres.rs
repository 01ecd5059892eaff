//! PostgreSQL connector
//!
//! Opens plain `sqlx::PgConnection`s so that pooling, recycling and
//! pre-ping are all governed by [`ConnectionPool`](super::ConnectionPool).

use async_trait::async_trait;
use sqlx::{Connection, PgConnection};
use tracing::debug;

use super::connector::{Connector, ConnectorError, Liveness};

/// Connector for a PostgreSQL database
///
/// # Example
///
/// ```ignore
/// use phototask_durable::pool::{ConnectionPool, PgConnector, PoolConfig};
///
/// let pool = ConnectionPool::new(
///     PgConnector::new("postgres://localhost/phototask"),
///     PoolConfig::default(),
/// );
/// pool.warm_up().await?;
/// ```
#[derive(Clone)]
pub struct PgConnector {
    url: String,
}

impl PgConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl std::fmt::Debug for PgConnector {
    // The URL may carry credentials
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    fn name(&self) -> &str {
        "postgres"
    }

    async fn connect(&self) -> Result<PgConnection, ConnectorError> {
        PgConnection::connect(&self.url)
            .await
            .map_err(|e| ConnectorError::new(e.to_string()))
    }

    async fn probe(&self, conn: &mut PgConnection) -> Liveness {
        match conn.ping().await {
            Ok(()) => Liveness::Healthy,
            Err(e) => {
                debug!(error = %e, "PostgreSQL ping failed");
                Liveness::Unhealthy
            }
        }
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "Error closing PostgreSQL connection");
        }
    }
}
