//! Worker pool for task execution
//!
//! Takes task ids off the dispatch queue and runs them on the executor, at
//! most `max_concurrency` at a time, with graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::queue::{QueueError, TaskQueue, TaskReceiver};
use crate::engine::{ExecutionOutcome, ExecutorError, TaskExecutor};
use crate::persistence::{
    stream_tasks, StoreError, TaskFailure, TaskFilter, TaskState, TransitionPayload,
};
use crate::pool::Connector;
use crate::serde_util::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Tasks allowed to wait for a worker before submissions are refused
    pub queue_depth: usize,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Re-dispatch pending tasks and fail interrupted ones on start
    pub recover_on_start: bool,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_depth: 1000,
            shutdown_timeout: Duration::from_secs(30),
            recover_on_start: true,
        }
    }
}

impl WorkerPoolConfig {
    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the dispatch queue bound
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Dispatch queue error
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Worker already started (a pool runs once)
    #[error("worker pool has already been started")]
    AlreadyStarted,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} tasks still running")]
    ShutdownTimeout(usize),
}

/// What start-up recovery did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Pending tasks put back on the queue
    pub requeued: usize,
    /// Running tasks marked failed as interrupted
    pub interrupted: usize,
}

/// Worker pool for executing tasks
///
/// # Example
///
/// ```ignore
/// use phototask_durable::worker::{WorkerPool, WorkerPoolConfig};
///
/// let workers = WorkerPool::new(executor, WorkerPoolConfig::default().with_max_concurrency(8));
/// let queue = workers.queue();
///
/// workers.start().await?;
/// queue.try_enqueue(task.id)?;
///
/// // ... later, graceful shutdown
/// workers.shutdown().await?;
/// ```
pub struct WorkerPool<C: Connector> {
    executor: Arc<TaskExecutor<C>>,
    config: WorkerPoolConfig,
    queue: TaskQueue,
    receiver: Mutex<Option<TaskReceiver>>,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> WorkerPool<C> {
    /// Create a new worker pool
    pub fn new(executor: Arc<TaskExecutor<C>>, config: WorkerPoolConfig) -> Self {
        let (queue, receiver) = TaskQueue::channel(config.queue_depth);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            executor,
            queue,
            receiver: Mutex::new(Some(receiver)),
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            dispatch_handle: Mutex::new(None),
            config,
        }
    }

    /// Handle for submitting task ids
    pub fn queue(&self) -> TaskQueue {
        self.queue.clone()
    }

    /// Start dispatching, with start-up recovery if configured
    ///
    /// Recovery assumes this process is the only one executing tasks from
    /// the store: anything `running` before dispatch starts belonged to a
    /// previous run. Both sweeps happen before the first dispatch; pending
    /// tasks not already waiting in the queue are requeued once the dispatch
    /// loop is consuming.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<RecoveryReport, WorkerPoolError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(WorkerPoolError::AlreadyStarted)?;

        info!(
            max_concurrency = self.config.max_concurrency,
            queue_depth = self.config.queue_depth,
            "Starting worker pool"
        );

        let mut report = RecoveryReport::default();
        let mut orphaned = Vec::new();
        if self.config.recover_on_start {
            let swept = match self.fail_interrupted().await {
                Ok(interrupted) => self.unqueued_pending().await.map(|ids| (interrupted, ids)),
                Err(e) => Err(e),
            };
            match swept {
                Ok((interrupted, ids)) => {
                    report.interrupted = interrupted;
                    orphaned = ids;
                }
                Err(e) => {
                    *self.receiver.lock() = Some(receiver);
                    return Err(e);
                }
            }
        }

        *self.status.write() = WorkerPoolStatus::Running;
        self.start_dispatch_loop(receiver);

        for task_id in orphaned {
            self.queue.enqueue(task_id).await?;
            report.requeued += 1;
        }

        if report.requeued > 0 || report.interrupted > 0 {
            warn!(
                requeued = report.requeued,
                interrupted = report.interrupted,
                "Recovered tasks from previous run"
            );
        }
        Ok(report)
    }

    /// Fail tasks a previous process left running
    async fn fail_interrupted(&self) -> Result<usize, WorkerPoolError> {
        let store = Arc::clone(self.executor.store());
        let mut interrupted = 0;

        let running: Vec<_> = stream_tasks(
            Arc::clone(&store),
            TaskFilter::all().with_state(TaskState::Running),
            100,
            None,
        )
        .try_collect()
        .await?;
        for task in running {
            let payload = TransitionPayload::failed(TaskFailure::interrupted());
            match store
                .transition(task.id, TaskState::Running, TaskState::Failed, payload)
                .await
            {
                Ok(_) => interrupted += 1,
                // Finished or cancelled in the meantime
                Err(StoreError::InvalidTransition { .. }) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(interrupted)
    }

    /// Pending tasks nobody has queued
    async fn unqueued_pending(&self) -> Result<Vec<Uuid>, WorkerPoolError> {
        let store = Arc::clone(self.executor.store());

        let pending: Vec<_> = stream_tasks(
            store,
            TaskFilter::all().with_state(TaskState::Pending),
            100,
            None,
        )
        .try_collect()
        .await?;
        Ok(pending
            .into_iter()
            .map(|task| task.id)
            .filter(|id| !self.queue.contains(*id))
            .collect())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops taking tasks off the queue and waits for in-flight executions.
    /// Tasks still queued stay `pending` in the store.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if *self.status.read() != WorkerPoolStatus::Running {
            return Ok(());
        }

        info!(
            queued = self.queue.depth(),
            "Initiating graceful shutdown"
        );
        *self.status.write() = WorkerPoolStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let handle = self.dispatch_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dispatch loop panicked: {}", e);
            }
        }

        // Wait for active tasks to complete (with timeout)
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let running = self.active_count();
            if running == 0 {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_tasks = running, "Shutdown timeout reached");
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout(running));
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Tasks currently executing
    pub fn active_count(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Tasks waiting for a worker
    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    fn start_dispatch_loop(&self, mut receiver: TaskReceiver) {
        let executor = Arc::clone(&self.executor);
        let queue = self.queue.clone();
        let active_tasks = Arc::clone(&self.active_tasks);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                // A worker slot first, so queued tasks stay counted as queued
                let permit = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    permit = Arc::clone(&active_tasks).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let task_id = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    task_id = receiver.recv() => match task_id {
                        Some(task_id) => task_id,
                        None => break,
                    },
                };

                let executor = Arc::clone(&executor);
                let queue = queue.clone();
                tokio::spawn(async move {
                    match executor.run(task_id).await {
                        Ok(ExecutionOutcome::Succeeded) => {}
                        Ok(outcome) => debug!(%task_id, ?outcome, "Task finished"),
                        Err(ExecutorError::Store(StoreError::InvalidTransition {
                            actual, ..
                        })) => {
                            debug!(%task_id, %actual, "Task already claimed, skipping");
                        }
                        Err(ExecutorError::Unclaimed(e)) => {
                            // Free the slot first: a full queue only drains
                            // through worker slots
                            drop(permit);
                            warn!(%task_id, "Store unavailable, requeueing task: {}", e);
                            tokio::time::sleep(executor.config().store_retry.max_interval).await;
                            if let Err(e) = queue.enqueue(task_id).await {
                                warn!(%task_id, "Could not requeue task: {}", e);
                            }
                            return;
                        }
                        Err(e) => error!(%task_id, "Task execution error: {}", e),
                    }
                    drop(permit);
                });
            }

            debug!("Dispatch loop exited");
        });

        *self.dispatch_handle.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutorConfig, FnProcessor, ProcessingError, ProcessorRegistry};
    use crate::persistence::{InMemoryTaskStore, Task, TaskStore};
    use crate::pool::{ConnectionPool, MemoryConnector, PoolConfig};
    use phototask_core::TaskKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workers(
        store: Arc<InMemoryTaskStore>,
        registry: ProcessorRegistry<MemoryConnector>,
        config: WorkerPoolConfig,
    ) -> WorkerPool<MemoryConnector> {
        let pool = ConnectionPool::new(MemoryConnector::new(), PoolConfig::new().with_pool_size(4));
        let executor = TaskExecutor::new(store, pool, registry, ExecutorConfig::default());
        WorkerPool::new(Arc::new(executor), config)
    }

    fn echo() -> ProcessorRegistry<MemoryConnector> {
        ProcessorRegistry::new().with(
            TaskKind::Dimension,
            FnProcessor::new(|_ctx, input| async move { Ok(input) }),
        )
    }

    async fn wait_terminal(store: &InMemoryTaskStore, id: Uuid) -> Task {
        loop {
            let task = store.get(id).await.unwrap();
            if task.state.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_concurrency, 10);
        assert_eq!(config.queue_depth, 1000);
        assert!(config.recover_on_start);
    }

    #[tokio::test]
    async fn test_dispatches_queued_tasks() {
        let store = Arc::new(InMemoryTaskStore::new());
        let workers = workers(store.clone(), echo(), WorkerPoolConfig::default());
        workers.start().await.unwrap();

        let task = store.create(TaskKind::Dimension, json!({"n": 1})).await.unwrap();
        workers.queue().try_enqueue(task.id).unwrap();

        let done = wait_terminal(&store, task.id).await;
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.result, Some(json!({"n": 1})));

        workers.shutdown().await.unwrap();
        assert_eq!(workers.status(), WorkerPoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (i, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
        let registry = ProcessorRegistry::new().with(
            TaskKind::Dimension,
            FnProcessor::new(move |_ctx, _input| {
                let (i, p) = (Arc::clone(&i), Arc::clone(&p));
                async move {
                    let now = i.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    i.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, ProcessingError>(json!({}))
                }
            }),
        );

        let store = Arc::new(InMemoryTaskStore::new());
        let workers = workers(
            store.clone(),
            registry,
            WorkerPoolConfig::default().with_max_concurrency(2),
        );
        workers.start().await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..6 {
            let task = store.create(TaskKind::Dimension, json!({})).await.unwrap();
            workers.queue().try_enqueue(task.id).unwrap();
            ids.push(task.id);
        }
        for id in ids {
            assert_eq!(wait_terminal(&store, id).await.state, TaskState::Succeeded);
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        workers.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_on_start() {
        let store = Arc::new(InMemoryTaskStore::new());
        let stale = store.create(TaskKind::Dimension, json!({})).await.unwrap();
        store
            .transition(stale.id, TaskState::Pending, TaskState::Running, TransitionPayload::none())
            .await
            .unwrap();
        let waiting = store.create(TaskKind::Dimension, json!({"n": 2})).await.unwrap();

        let workers = workers(store.clone(), echo(), WorkerPoolConfig::default());
        let report = workers.start().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                requeued: 1,
                interrupted: 1
            }
        );

        let stale = store.get(stale.id).await.unwrap();
        assert_eq!(stale.state, TaskState::Failed);
        assert_eq!(stale.error, Some(TaskFailure::interrupted()));

        assert_eq!(wait_terminal(&store, waiting.id).await.state, TaskState::Succeeded);
        workers.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_task_queued_before_start_is_run_not_interrupted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = ProcessorRegistry::new().with(
            TaskKind::Dimension,
            FnProcessor::new(move |_ctx, input| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, ProcessingError>(input)
                }
            }),
        );
        let store = Arc::new(InMemoryTaskStore::new());
        let workers = workers(store.clone(), registry, WorkerPoolConfig::default());

        let task = store.create(TaskKind::Dimension, json!({"n": 7})).await.unwrap();
        workers.queue().try_enqueue(task.id).unwrap();

        let report = workers.start().await.unwrap();
        assert_eq!(report, RecoveryReport::default());

        let done = wait_terminal(&store, task.id).await;
        assert_eq!(done.state, TaskState::Succeeded);
        assert_eq!(done.result, Some(json!({"n": 7})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        workers.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_skips_ids_already_queued() {
        let store = Arc::new(InMemoryTaskStore::new());
        let queued = store.create(TaskKind::Dimension, json!({"n": 1})).await.unwrap();
        let orphan = store.create(TaskKind::Dimension, json!({"n": 2})).await.unwrap();

        let workers = workers(store.clone(), echo(), WorkerPoolConfig::default());
        workers.queue().try_enqueue(queued.id).unwrap();

        let report = workers.start().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                requeued: 1,
                interrupted: 0
            }
        );
        assert_eq!(wait_terminal(&store, queued.id).await.state, TaskState::Succeeded);
        assert_eq!(wait_terminal(&store, orphan.id).await.state, TaskState::Succeeded);

        workers.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = Arc::new(InMemoryTaskStore::new());
        let workers = workers(store, echo(), WorkerPoolConfig::default());
        workers.start().await.unwrap();
        assert!(matches!(
            workers.start().await,
            Err(WorkerPoolError::AlreadyStarted)
        ));
        workers.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_tasks() {
        let registry = ProcessorRegistry::new().with(
            TaskKind::Dimension,
            FnProcessor::new(|_ctx, _input| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, ProcessingError>(json!({"slow": true}))
            }),
        );
        let store = Arc::new(InMemoryTaskStore::new());
        let workers = workers(store.clone(), registry, WorkerPoolConfig::default());
        workers.start().await.unwrap();

        let task = store.create(TaskKind::Dimension, json!({})).await.unwrap();
        workers.queue().try_enqueue(task.id).unwrap();
        while workers.active_count() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        workers.shutdown().await.unwrap();
        assert_eq!(
            store.get(task.id).await.unwrap().state,
            TaskState::Succeeded
        );
    }
}
