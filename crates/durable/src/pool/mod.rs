//! Connection pooling
//!
//! A bounded pool of reusable connections to one backing resource. The
//! resource is reached through the [`Connector`] capability, so the same pool
//! serves PostgreSQL in production and in-process fakes in tests.

mod config;
mod connection;
mod connector;
mod memory;
mod postgres;

pub use config::PoolConfig;
pub use connection::{ConnectionPool, PoolError, PoolStats, PooledConnection};
pub use connector::{Connector, ConnectorError, Liveness};
pub use memory::{MemoryConnection, MemoryConnector};
pub use postgres::PgConnector;
