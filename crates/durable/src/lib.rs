//! # Durable Task Execution
//!
//! The asynchronous task layer behind the image-processing API: a request
//! becomes a durable, retryable, independently pollable task that shares a
//! bounded pool of connections with every other task.
//!
//! ## Features
//!
//! - **Bounded connection pool**: FIFO waiting, pre-ping, recycling and connect retries
//! - **Compare-and-set task store**: at most one executor owns a running task
//! - **Executor**: per-attempt deadlines, linear-backoff retries, cooperative cancellation
//! - **Worker pool**: bounded dispatch queue with overload signalling and crash recovery
//! - **Health monitor**: periodic probes with healthy/degraded/unhealthy status
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskManager                           │
//! │  (submit, status, result, cancel, list, cleanup)            │
//! └─────────────────────────────────────────────────────────────┘
//!           │ create                        │ enqueue
//!           ▼                               ▼
//! ┌───────────────────────┐     ┌───────────────────────────────┐
//! │       TaskStore       │◄────│  WorkerPool -> TaskExecutor    │
//! │ (memory / PostgreSQL) │ CAS │  (attempts, retries, timeouts) │
//! └───────────────────────┘     └───────────────────────────────┘
//!                                           │ acquire / release
//!                                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                ConnectionPool  ◄──── HealthMonitor           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use phototask_durable::prelude::*;
//!
//! let pool = ConnectionPool::new(MemoryConnector::new(), PoolConfig::default());
//! let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
//! let registry = ProcessorRegistry::new().with(
//!     TaskKind::Dimension,
//!     FnProcessor::new(|_ctx, input| async move { Ok(input) }),
//! );
//!
//! let executor = Arc::new(TaskExecutor::new(store.clone(), pool, registry, ExecutorConfig::default()));
//! let workers = WorkerPool::new(executor.clone(), WorkerPoolConfig::default());
//! let manager = TaskManager::new(store, workers.queue(), ManagerConfig::default())
//!     .with_validator(executor);
//!
//! workers.start().await?;
//! let id = manager.submit(TaskKind::Dimension, json!({"image_url": url, "length": 10.5, "height": 15.2})).await?;
//! ```

pub mod engine;
pub mod health;
pub mod manager;
pub mod persistence;
pub mod pool;
pub mod reliability;
pub mod worker;

mod serde_util;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        ExecutionOutcome, ExecutorConfig, FnProcessor, ProcessContext, ProcessingError,
        Processor, ProcessorRegistry, TaskExecutor,
    };
    pub use crate::health::{HealthCheckConfig, HealthMonitor, HealthReport, HealthStatus};
    pub use crate::manager::{ManagerConfig, ManagerError, TaskManager, TaskOutcome};
    pub use crate::persistence::{
        InMemoryTaskStore, PostgresTaskStore, StoreError, Task, TaskFailure, TaskFilter,
        TaskState, TaskStore,
    };
    pub use crate::pool::{ConnectionPool, Connector, MemoryConnector, PgConnector, PoolConfig};
    pub use crate::reliability::RetryPolicy;
    pub use crate::worker::{WorkerPool, WorkerPoolConfig};
    pub use phototask_core::TaskKind;
}

// Re-export key types at crate root
pub use engine::{ExecutionOutcome, ExecutorConfig, ExecutorError, TaskExecutor};
pub use health::{HealthCheckConfig, HealthMonitor, HealthReport, HealthStatus};
pub use manager::{ManagerConfig, ManagerError, TaskManager, TaskOutcome, TaskStats};
pub use persistence::{InMemoryTaskStore, PostgresTaskStore, StoreError, TaskStore};
pub use pool::{ConnectionPool, PoolConfig, PoolError};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
