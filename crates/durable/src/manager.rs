//! Task manager
//!
//! The public task surface used by the HTTP layer: submit, status, result,
//! cancel, list, delete, statistics and retention cleanup. Submission only
//! records the task and enqueues it; execution happens on the worker pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::{Stream, TryStreamExt};
use phototask_core::TaskKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{ProcessingError, ProcessorRegistry, TaskExecutor};
use crate::persistence::{
    stream_tasks, FailureKind, ListQuery, StoreError, Task, TaskFailure, TaskFilter, TaskState,
    TaskStore, TransitionPayload,
};
use crate::pool::{Connector, PoolError};
use crate::serde_util::duration_millis;
use crate::worker::{QueueError, TaskQueue};

/// Expected duration of one task, used for progress estimates
const EXPECTED_RUNTIME_SECS: i64 = 300;

/// Task manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Page size used when scanning the store (cleanup, streams)
    pub page_size: usize,

    /// Retention for [`TaskManager::cleanup_expired`]
    #[serde(with = "duration_millis")]
    pub retention: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl ManagerConfig {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Errors surfaced to task API callers
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("task not found: {0}")]
    NotFound(Uuid),

    /// The task has no outcome yet
    #[error("task {id} is not finished (state: {state})")]
    NotReady { id: Uuid, state: TaskState },

    /// Too much queued work; retry later
    #[error("system overloaded: {capacity} tasks already waiting")]
    Overloaded { capacity: usize },

    /// The request can never succeed as submitted
    #[error("invalid input: {0}")]
    InvalidInput(ProcessingError),

    /// The worker pool no longer accepts tasks
    #[error("task dispatch is shut down")]
    ShuttingDown,

    #[error(transparent)]
    Store(StoreError),
}

impl ManagerError {
    /// Whether the caller should back off and retry the same request
    ///
    /// True for a full dispatch queue and for an exhausted connection pool.
    pub fn is_overloaded(&self) -> bool {
        matches!(
            self,
            ManagerError::Overloaded { .. }
                | ManagerError::Store(StoreError::Pool(PoolError::Exhausted { .. }))
        )
    }
}

impl From<StoreError> for ManagerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ManagerError::NotFound(id),
            other => ManagerError::Store(other),
        }
    }
}

/// Submission-time input check for a task kind
pub trait InputValidator: Send + Sync + 'static {
    /// `None` when nothing is known about the kind
    fn validate(&self, kind: TaskKind, input: &serde_json::Value)
        -> Option<Result<(), ProcessingError>>;
}

impl<C: Connector> InputValidator for ProcessorRegistry<C> {
    fn validate(
        &self,
        kind: TaskKind,
        input: &serde_json::Value,
    ) -> Option<Result<(), ProcessingError>> {
        ProcessorRegistry::validate(self, kind, input)
    }
}

impl<C: Connector> InputValidator for TaskExecutor<C> {
    fn validate(
        &self,
        kind: TaskKind,
        input: &serde_json::Value,
    ) -> Option<Result<(), ProcessingError>> {
        self.registry().validate(kind, input)
    }
}

/// Task metadata without input or result payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub id: Uuid,
    pub kind: TaskKind,
    pub state: TaskState,
    pub message: Option<String>,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Percent complete, estimated from elapsed time
    pub progress: Option<u8>,
    pub estimated_seconds_remaining: Option<u64>,
    pub error: Option<TaskFailure>,
}

impl TaskStatusView {
    /// Build the view as of `now`
    pub fn from_task(task: &Task, now: DateTime<Utc>) -> Self {
        let (progress, remaining) = match task.state {
            TaskState::Pending => (Some(0), None),
            TaskState::Succeeded => (Some(100), None),
            TaskState::Running => {
                let started = task.started_at.unwrap_or(task.created_at);
                let elapsed = (now - started).num_seconds().max(0);
                if elapsed < EXPECTED_RUNTIME_SECS {
                    let percent = (elapsed * 100 / EXPECTED_RUNTIME_SECS).min(99);
                    let remaining = (EXPECTED_RUNTIME_SECS - elapsed).max(1);
                    (Some(percent as u8), Some(remaining as u64))
                } else {
                    (None, None)
                }
            }
            TaskState::Failed | TaskState::Cancelled => (None, None),
        };

        Self {
            id: task.id,
            kind: task.kind,
            state: task.state,
            message: task.message.clone(),
            attempt_count: task.attempt_count,
            created_at: task.created_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
            updated_at: task.updated_at,
            progress,
            estimated_seconds_remaining: remaining,
            error: task.error.clone(),
        }
    }
}

/// Terminal outcome of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded { result: serde_json::Value },
    Failed { error: TaskFailure },
    Cancelled,
}

/// Aggregate counts over all stored tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// `succeeded / total`, 0 when there are no tasks
    pub success_rate: f64,
}

/// Task lifecycle coordinator
///
/// # Example
///
/// ```ignore
/// let manager = TaskManager::new(store, workers.queue(), ManagerConfig::default())
///     .with_validator(executor.clone());
///
/// let id = manager.submit(TaskKind::Dimension, input).await?;
/// let view = manager.status(id).await?;
/// ```
#[derive(Clone)]
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    queue: TaskQueue,
    validator: Option<Arc<dyn InputValidator>>,
    config: ManagerConfig,
}

impl TaskManager {
    pub fn new(store: Arc<dyn TaskStore>, queue: TaskQueue, config: ManagerConfig) -> Self {
        Self {
            store,
            queue,
            validator: None,
            config,
        }
    }

    /// Check inputs at submission time
    pub fn with_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Record a task and enqueue it for execution
    ///
    /// Returns as soon as the task is queued.
    #[instrument(skip(self, input), fields(kind = %kind))]
    pub async fn submit(
        &self,
        kind: TaskKind,
        input: serde_json::Value,
    ) -> Result<Uuid, ManagerError> {
        if let Some(validator) = &self.validator {
            if let Some(Err(e)) = validator.validate(kind, &input) {
                debug!(error = %e, "Rejected task input");
                return Err(ManagerError::InvalidInput(e));
            }
        }

        let task = self.store.create(kind, input).await?;

        if let Err(e) = self.queue.try_enqueue(task.id) {
            // Never handed out, so nobody will poll for it
            if let Err(cleanup) = self.store.delete(task.id).await {
                warn!(task_id = %task.id, "Failed to remove unqueued task: {}", cleanup);
            }
            return Err(match e {
                QueueError::Full { capacity } => {
                    warn!(capacity, "Dispatch queue full, rejecting task");
                    ManagerError::Overloaded { capacity }
                }
                QueueError::Closed => ManagerError::ShuttingDown,
            });
        }

        info!(task_id = %task.id, "Task submitted");
        Ok(task.id)
    }

    /// Task metadata with a progress estimate
    pub async fn status(&self, id: Uuid) -> Result<TaskStatusView, ManagerError> {
        let task = self.store.get(id).await?;
        Ok(TaskStatusView::from_task(&task, Utc::now()))
    }

    /// Full task record, payloads included
    pub async fn get(&self, id: Uuid) -> Result<Task, ManagerError> {
        Ok(self.store.get(id).await?)
    }

    /// Result or error of a finished task
    pub async fn result(&self, id: Uuid) -> Result<TaskOutcome, ManagerError> {
        let task = self.store.get(id).await?;
        match task.state {
            TaskState::Pending | TaskState::Running => Err(ManagerError::NotReady {
                id,
                state: task.state,
            }),
            TaskState::Succeeded => Ok(TaskOutcome::Succeeded {
                result: task.result.unwrap_or(serde_json::Value::Null),
            }),
            TaskState::Failed => Ok(TaskOutcome::Failed {
                error: task.error.unwrap_or_else(|| {
                    TaskFailure::new(
                        FailureKind::Processing,
                        task.message.unwrap_or_else(|| "task failed".to_string()),
                        false,
                    )
                }),
            }),
            TaskState::Cancelled => Ok(TaskOutcome::Cancelled),
        }
    }

    /// Mark a task cancelled unless it already finished
    ///
    /// Best effort: a running attempt is not interrupted, but its result is
    /// never recorded. Returns the task as it stands afterwards.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<Task, ManagerError> {
        loop {
            let task = self.store.get(id).await?;
            if task.state.is_terminal() {
                debug!(state = %task.state, "Task already finished, nothing to cancel");
                return Ok(task);
            }

            match self
                .store
                .transition(
                    id,
                    task.state,
                    TaskState::Cancelled,
                    TransitionPayload::none().with_message("cancelled"),
                )
                .await
            {
                Ok(task) => {
                    info!("Task cancelled");
                    return Ok(task);
                }
                // Moved forward under us; look again
                Err(StoreError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One page of tasks in insertion order
    pub async fn list(&self, filter: TaskFilter, limit: usize) -> Result<Vec<Task>, ManagerError> {
        Ok(self.store.list(&ListQuery::new(filter, limit)).await?)
    }

    /// All matching tasks, fetched lazily
    pub fn stream(
        &self,
        filter: TaskFilter,
        after_sequence: Option<i64>,
    ) -> impl Stream<Item = Result<Task, StoreError>> + Send + 'static {
        stream_tasks(
            Arc::clone(&self.store),
            filter,
            self.config.page_size,
            after_sequence,
        )
    }

    /// Remove one task
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), ManagerError> {
        if self.store.delete(id).await? {
            info!("Task deleted");
            Ok(())
        } else {
            Err(ManagerError::NotFound(id))
        }
    }

    /// Delete terminal tasks that finished more than `older_than` ago
    ///
    /// Pending and running tasks are never touched. Returns the number of
    /// tasks deleted.
    #[instrument(skip(self))]
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, ManagerError> {
        let Some(cutoff) = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };

        let expired: Vec<Uuid> = self
            .stream(TaskFilter::all(), None)
            .try_filter_map(|task| async move {
                let expired = task.state.is_terminal()
                    && task.finished_at.is_some_and(|at| at < cutoff);
                Ok(expired.then_some(task.id))
            })
            .try_collect()
            .await?;

        let mut deleted = 0;
        for id in expired {
            if self.store.delete(id).await? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!(deleted, %cutoff, "Cleaned up expired tasks");
        }
        Ok(deleted)
    }

    /// [`cleanup`](Self::cleanup) with the configured retention
    pub async fn cleanup_expired(&self) -> Result<usize, ManagerError> {
        self.cleanup(self.config.retention).await
    }

    pub async fn stats(&self) -> Result<TaskStats, ManagerError> {
        let counts = self.store.count_by_state().await?;
        let count = |state| counts.get(&state).copied().unwrap_or(0);

        let mut stats = TaskStats {
            pending: count(TaskState::Pending),
            running: count(TaskState::Running),
            succeeded: count(TaskState::Succeeded),
            failed: count(TaskState::Failed),
            cancelled: count(TaskState::Cancelled),
            ..TaskStats::default()
        };
        stats.total =
            stats.pending + stats.running + stats.succeeded + stats.failed + stats.cancelled;
        if stats.total > 0 {
            stats.success_rate = stats.succeeded as f64 / stats.total as f64;
        }
        Ok(stats)
    }

    /// Tasks waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }
}
