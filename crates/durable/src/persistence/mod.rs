//! Persistence layer for task records
//!
//! This module provides:
//! - [`TaskStore`] trait with compare-and-set state transitions
//! - [`InMemoryTaskStore`] for tests and database-less deployments
//! - [`PostgresTaskStore`] backed by the `image_tasks` table
//! - [`stream_tasks`] for lazy, resumable listing

mod memory;
mod postgres;
mod store;
mod stream;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{
    FailureKind, ListQuery, StoreError, Task, TaskFailure, TaskFilter, TaskState, TaskStore,
    TransitionPayload,
};
pub use stream::stream_tasks;
