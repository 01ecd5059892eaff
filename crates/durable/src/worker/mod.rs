//! Worker pool for task execution
//!
//! This module provides:
//! - [`TaskQueue`] - Bounded dispatch queue between submission and workers
//! - [`WorkerPool`] - Runs queued tasks on the executor with bounded concurrency
//!
//! # Architecture
//!
//! ```text
//! TaskManager::submit
//!         │  try_enqueue(task_id)
//!         ▼
//! ┌──────────────────────┐
//! │  TaskQueue (bounded) │  full -> ManagerError::Overloaded
//! └──────────┬───────────┘
//!            │ dispatch loop (one permit per task)
//!            ▼
//! ┌─────────────────────────────────────────────┐
//! │      TaskExecutor (Semaphore-limited)       │
//! │  [Task 1] [Task 2] ... [Task N]             │
//! └─────────────────────────────────────────────┘
//!            │ acquire per attempt
//!            ▼
//!      ConnectionPool (max_size)
//! ```
//!
//! Running tasks are bounded by both `max_concurrency` and the pool's
//! `max_size`: a worker without a connection waits in the pool's FIFO queue
//! rather than opening more connections.

mod pool;
mod queue;

pub use pool::{RecoveryReport, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use queue::{QueueError, TaskQueue, TaskReceiver};
