// Service runtime
//
// Builds every long-lived object exactly once (pool, store, executor,
// worker pool, manager, health monitor) and hands out references to them.
// Nothing here is global: an embedding HTTP layer owns one ServiceRuntime and
// clones the TaskManager into its handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use phototask_durable::engine::{ProcessorRegistry, TaskExecutor};
use phototask_durable::health::{HealthMonitor, HealthReport};
use phototask_durable::manager::TaskManager;
use phototask_durable::persistence::{InMemoryTaskStore, PostgresTaskStore, TaskStore};
use phototask_durable::pool::{ConnectionPool, Connector, MemoryConnector, PgConnector};
use phototask_durable::worker::{RecoveryReport, WorkerPool, WorkerPoolError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;

/// The assembled task service
pub struct ServiceRuntime<C: Connector> {
    config: RuntimeConfig,
    pool: ConnectionPool<C>,
    store: Arc<dyn TaskStore>,
    workers: WorkerPool<C>,
    manager: TaskManager,
    health: Arc<HealthMonitor<ConnectionPool<C>>>,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceRuntime<MemoryConnector> {
    /// Runtime over the in-memory store, for tests and database-less runs
    pub fn in_memory(config: RuntimeConfig, registry: ProcessorRegistry<MemoryConnector>) -> Self {
        let pool = ConnectionPool::new(MemoryConnector::new(), config.pool.clone());
        Self::assemble(config, pool, Arc::new(InMemoryTaskStore::new()), registry)
    }
}

impl ServiceRuntime<PgConnector> {
    /// Runtime backed by PostgreSQL at `config.database_url`
    ///
    /// Creates the `image_tasks` table if needed and opens `min_size`
    /// connections before returning.
    pub async fn postgres(
        config: RuntimeConfig,
        registry: ProcessorRegistry<PgConnector>,
    ) -> Result<Self> {
        let url = config
            .database_url
            .clone()
            .context("DATABASE_URL must be set for the PostgreSQL runtime")?;

        let pool = ConnectionPool::new(PgConnector::new(url), config.pool.clone());
        pool.warm_up()
            .await
            .context("Failed to open initial database connections")?;

        let store = PostgresTaskStore::new(pool.clone());
        store
            .ensure_schema()
            .await
            .context("Failed to create image_tasks schema")?;

        Ok(Self::assemble(config, pool, Arc::new(store), registry))
    }
}

impl<C: Connector> ServiceRuntime<C> {
    /// Wire the pieces together
    pub fn assemble(
        config: RuntimeConfig,
        pool: ConnectionPool<C>,
        store: Arc<dyn TaskStore>,
        registry: ProcessorRegistry<C>,
    ) -> Self {
        info!(
            connector = pool.connector().name(),
            max_size = config.pool.max_size,
            workers = config.workers.max_concurrency,
            kinds = ?registry.kinds(),
            "Assembling task runtime"
        );

        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&store),
            pool.clone(),
            registry,
            config.executor.clone(),
        ));
        let workers = WorkerPool::new(Arc::clone(&executor), config.workers.clone());
        let manager = TaskManager::new(Arc::clone(&store), workers.queue(), config.manager.clone())
            .with_validator(executor);
        let health = Arc::new(HealthMonitor::new(
            Arc::new(pool.clone()),
            config.health.clone(),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            pool,
            store,
            workers,
            manager,
            health,
            shutdown_tx,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Start workers, the health monitor and the cleanup loop
    pub async fn start(&self) -> Result<RecoveryReport, WorkerPoolError> {
        let report = self.workers.start().await?;

        let mut background = self.background.lock();
        background.push(self.health.spawn(self.shutdown_tx.subscribe()));
        background.push(self.spawn_cleanup());

        info!(
            requeued = report.requeued,
            interrupted = report.interrupted,
            "Task runtime started"
        );
        Ok(report)
    }

    /// Stop background loops, drain workers and close the pool
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        info!("Shutting down task runtime");
        let _ = self.shutdown_tx.send(true);

        let drained = self.workers.shutdown().await;

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background loop panicked: {}", e);
            }
        }

        self.pool.close().await;
        drained
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    pub fn workers(&self) -> &WorkerPool<C> {
        &self.workers
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Body for the `/health` endpoint
    pub fn health(&self) -> HealthReport {
        self.health.report()
    }

    fn spawn_cleanup(&self) -> JoinHandle<()> {
        let manager = self.manager.clone();
        let interval = self.config.cleanup_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        match manager.cleanup_expired().await {
                            Ok(deleted) => debug!(deleted, "Retention cleanup finished"),
                            Err(e) => warn!("Retention cleanup failed: {}", e),
                        }
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
            }

            debug!("Cleanup loop stopped");
        })
    }
}
