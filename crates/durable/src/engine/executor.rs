//! Task executor
//!
//! The `TaskExecutor` binds a task to its processor and owns the attempt
//! lifecycle:
//! - claiming the task (`pending -> running`) with a compare-and-set
//! - borrowing one pooled connection per attempt and running the processor
//!   under a deadline
//! - retrying retriable failures with linear backoff
//! - writing the terminal state
//!
//! Cancellation is cooperative. It is observed:
//! 1. before the claim
//! 2. before each connection acquire (`record_attempt` fails once the task
//!    is no longer running)
//! 3. after the processor returns and its connection has been released
//! 4. by the final compare-and-set itself
//!
//! The connection is always released before the outcome is written, so a
//! store that draws from the same pool never waits on its own executor.
//!
//! Transient store errors (a busy pool, a dropped database connection) are
//! retried with `store_retry`. A task the store never let us claim is handed
//! back as [`ExecutorError::Unclaimed`] and stays `pending`; the terminal
//! write is retried until it lands or loses a compare-and-set.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::processor::{ProcessContext, Processor};
use super::registry::ProcessorRegistry;
use crate::persistence::{
    FailureKind, StoreError, Task, TaskFailure, TaskState, TaskStore, TransitionPayload,
};
use crate::pool::{ConnectionPool, Connector, PoolError};
use crate::reliability::RetryPolicy;
use crate::serde_util::duration_millis;

/// Configuration for the task executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Attempt budget and backoff for retriable failures
    pub retry: RetryPolicy,

    /// Deadline for one processor call
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,

    /// How long one attempt waits for a pooled connection
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,

    /// Backoff for reads and writes of the task record itself
    pub store_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::linear(3, Duration::from_secs(1)),
            request_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            store_retry: RetryPolicy::exponential(8, Duration::from_millis(50))
                .with_max_interval(Duration::from_secs(2)),
        }
    }
}

impl ExecutorConfig {
    /// Set the maximum number of attempts per task
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.retry.max_attempts = max.max(1);
        self
    }

    /// Set the linear backoff step
    pub fn with_retry_backoff(mut self, step: Duration) -> Self {
        self.retry.initial_interval = step;
        self
    }

    /// Replace the whole retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the backoff for transient task-store errors
    pub fn with_store_retry(mut self, retry: RetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }
}

/// Errors from executor operations
///
/// Attempt failures are not errors here: they end up on the task. An error
/// means the executor could not read or write the task itself, or found it
/// owned by someone else.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The store stayed unavailable before the task could be claimed; the
    /// task is still `pending` and may be dispatched again
    #[error("task not claimed, store unavailable: {0}")]
    Unclaimed(StoreError),
}

/// How a call to [`TaskExecutor::run`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed(TaskFailure),
    /// The task was cancelled before or during execution
    Cancelled,
    /// The task was deleted while running
    Abandoned,
}

/// Task executor
///
/// # Example
///
/// ```ignore
/// let executor = TaskExecutor::new(store, pool, registry, ExecutorConfig::default());
/// match executor.run(task_id).await? {
///     ExecutionOutcome::Succeeded => {}
///     other => warn!(?other, "task did not succeed"),
/// }
/// ```
pub struct TaskExecutor<C: Connector> {
    store: Arc<dyn TaskStore>,
    pool: ConnectionPool<C>,
    registry: ProcessorRegistry<C>,
    config: ExecutorConfig,
}

impl<C: Connector> TaskExecutor<C> {
    pub fn new(
        store: Arc<dyn TaskStore>,
        pool: ConnectionPool<C>,
        registry: ProcessorRegistry<C>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            pool,
            registry,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn registry(&self) -> &ProcessorRegistry<C> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute a pending task to a terminal state
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub async fn run(&self, task_id: Uuid) -> Result<ExecutionOutcome, ExecutorError> {
        let task = match self
            .with_store(&self.config.store_retry, || self.store.get(task_id))
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_transient() => return Err(ExecutorError::Unclaimed(e)),
            Err(e) => return Err(e.into()),
        };
        if task.state == TaskState::Cancelled {
            debug!("Task cancelled before execution");
            return Ok(ExecutionOutcome::Cancelled);
        }

        let claim = TransitionPayload::none().with_message("processing");
        let task = match self
            .with_store(&self.config.store_retry, || {
                self.store.transition(
                    task_id,
                    TaskState::Pending,
                    TaskState::Running,
                    claim.clone(),
                )
            })
            .await
        {
            Ok(task) => task,
            Err(e) if e.is_transient() => return Err(ExecutorError::Unclaimed(e)),
            Err(e) => return observe(e),
        };

        let started = Instant::now();
        info!(kind = %task.kind, "Task started");

        let Some(processor) = self.registry.get(task.kind) else {
            let failure = TaskFailure::new(
                FailureKind::Unsupported,
                format!("no processor registered for kind {}", task.kind),
                false,
            );
            error!(kind = %task.kind, "Task failed: unsupported kind");
            return self.fail(task_id, failure).await;
        };

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let message = format!("attempt {attempt} of {max_attempts}");
            let recorded = self
                .with_store(&self.config.store_retry, || {
                    self.store
                        .record_attempt(task_id, attempt, Some(message.clone()))
                })
                .await;
            match recorded {
                Ok(_) => {}
                Err(e) if e.is_transient() => {
                    error!(attempt, error = %e, "Could not record attempt");
                    let failure = TaskFailure::new(FailureKind::Store, e.to_string(), true);
                    return self.fail(task_id, failure).await;
                }
                Err(e) => return observe(e),
            }

            let result = self
                .attempt(processor.as_ref(), &task, attempt, max_attempts)
                .await;

            if let Some(outcome) = self.stopped_externally(task_id).await? {
                debug!(attempt, ?outcome, "Task stopped during attempt");
                return Ok(outcome);
            }

            let failure = match result {
                Ok(output) => {
                    info!(
                        attempts = attempt,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Task succeeded"
                    );
                    return self
                        .finish(
                            task_id,
                            TaskState::Succeeded,
                            TransitionPayload::succeeded(output).with_message("completed"),
                            ExecutionOutcome::Succeeded,
                        )
                        .await;
                }
                Err(failure) => failure,
            };

            if failure.retriable && attempt < max_attempts {
                attempt += 1;
                let delay = self.config.retry.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt - 1,
                    kind = %failure.kind,
                    error = %failure.message,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            error!(
                attempts = attempt,
                kind = %failure.kind,
                error = %failure.message,
                retriable = failure.retriable,
                "Task failed"
            );
            return self.fail(task_id, failure).await;
        }
    }

    /// One attempt: borrow a connection, run the processor, give it back
    async fn attempt(
        &self,
        processor: &dyn Processor<C>,
        task: &Task,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<serde_json::Value, TaskFailure> {
        let mut conn = self
            .pool
            .acquire_timeout(self.config.acquire_timeout)
            .await
            .map_err(pool_failure)?;

        let ctx = ProcessContext {
            task_id: task.id,
            kind: task.kind,
            attempt,
            max_attempts,
        };
        let deadline = self.config.request_timeout;
        let outcome = tokio::time::timeout(
            deadline,
            AssertUnwindSafe(processor.process(&ctx, &mut *conn, &task.input)).catch_unwind(),
        )
        .await;

        let result = match outcome {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(e.to_failure()),
            Ok(Err(panic)) => {
                // State of a connection abandoned mid-call is unknown
                conn.mark_unhealthy();
                Err(TaskFailure::new(
                    FailureKind::Processing,
                    format!("processor panicked: {}", panic_message(panic.as_ref())),
                    false,
                ))
            }
            Err(_) => {
                conn.mark_unhealthy();
                Err(TaskFailure::new(
                    FailureKind::Timeout,
                    format!("attempt exceeded {}ms", deadline.as_millis()),
                    true,
                ))
            }
        };

        conn.release().await;
        result
    }

    /// Whether the task left `running` behind our back
    ///
    /// An unreachable store answers "no": the terminal compare-and-set still
    /// catches a cancellation.
    async fn stopped_externally(
        &self,
        task_id: Uuid,
    ) -> Result<Option<ExecutionOutcome>, ExecutorError> {
        match self
            .with_store(&self.config.store_retry, || self.store.get(task_id))
            .await
        {
            Ok(task) => match task.state {
                TaskState::Running => Ok(None),
                TaskState::Cancelled => Ok(Some(ExecutionOutcome::Cancelled)),
                actual => Err(StoreError::InvalidTransition {
                    id: task_id,
                    expected: TaskState::Running,
                    actual,
                    to: TaskState::Running,
                }
                .into()),
            },
            Err(StoreError::NotFound(_)) => Ok(Some(ExecutionOutcome::Abandoned)),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Could not re-read task after attempt");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fail(
        &self,
        task_id: Uuid,
        failure: TaskFailure,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.finish(
            task_id,
            TaskState::Failed,
            TransitionPayload::failed(failure.clone()),
            ExecutionOutcome::Failed(failure),
        )
        .await
    }

    async fn finish(
        &self,
        task_id: Uuid,
        to: TaskState,
        payload: TransitionPayload,
        outcome: ExecutionOutcome,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        // Leaving the task `running` strands it, so keep trying
        let policy = self.config.store_retry.clone().with_max_attempts(u32::MAX);
        match self
            .with_store(&policy, || {
                self.store
                    .transition(task_id, TaskState::Running, to, payload.clone())
            })
            .await
        {
            Ok(_) => Ok(outcome),
            Err(e) => observe(e),
        }
    }

    /// Run a store call, repeating it while it fails transiently and
    /// `policy` has attempts left
    async fn with_store<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(e) if e.is_transient() && policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Task store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }
}

/// Turn a lost compare-and-set into an outcome where it means cancellation
/// or deletion; anything else is surfaced
fn observe(err: StoreError) -> Result<ExecutionOutcome, ExecutorError> {
    match err {
        StoreError::InvalidTransition {
            actual: TaskState::Cancelled,
            ..
        } => Ok(ExecutionOutcome::Cancelled),
        StoreError::NotFound(_) => Ok(ExecutionOutcome::Abandoned),
        other => Err(other.into()),
    }
}

fn pool_failure(err: PoolError) -> TaskFailure {
    match err {
        PoolError::Exhausted { .. } => {
            TaskFailure::new(FailureKind::PoolExhausted, err.to_string(), true)
        }
        PoolError::Connect { .. } | PoolError::Closed => {
            TaskFailure::new(FailureKind::ConnectError, err.to_string(), false)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
