//! Dispatch queue between submission and the worker pool

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Dispatch queue errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Too many tasks already waiting for a worker
    #[error("dispatch queue is full ({capacity} tasks waiting)")]
    Full { capacity: usize },

    /// The worker pool has stopped consuming
    #[error("dispatch queue is closed")]
    Closed,
}

/// Ids currently sitting in the channel
type Queued = Arc<Mutex<HashSet<Uuid>>>;

/// Sending half of the dispatch queue
///
/// Bounded: `try_enqueue` fails fast with [`QueueError::Full`] instead of
/// letting submissions pile up without limit. An id that is already waiting
/// is not queued a second time.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Uuid>,
    queued: Queued,
    capacity: usize,
}

/// Receiving half of the dispatch queue, owned by the worker pool
#[derive(Debug)]
pub struct TaskReceiver {
    rx: mpsc::Receiver<Uuid>,
    queued: Queued,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` waiting tasks
    pub fn channel(capacity: usize) -> (Self, TaskReceiver) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let queued = Queued::default();
        (
            Self {
                tx,
                queued: Arc::clone(&queued),
                capacity,
            },
            TaskReceiver { rx, queued },
        )
    }

    /// Enqueue without waiting
    pub fn try_enqueue(&self, task_id: Uuid) -> Result<(), QueueError> {
        if !self.queued.lock().insert(task_id) {
            return Ok(());
        }
        self.tx.try_send(task_id).map_err(|e| {
            self.queued.lock().remove(&task_id);
            match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full {
                    capacity: self.capacity,
                },
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            }
        })
    }

    /// Enqueue, waiting for room
    pub async fn enqueue(&self, task_id: Uuid) -> Result<(), QueueError> {
        if !self.queued.lock().insert(task_id) {
            return Ok(());
        }
        self.tx.send(task_id).await.map_err(|_| {
            self.queued.lock().remove(&task_id);
            QueueError::Closed
        })
    }

    /// Whether `task_id` is waiting for a worker
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.queued.lock().contains(&task_id)
    }

    /// Tasks waiting for a worker
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl TaskReceiver {
    /// Next task id; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<Uuid> {
        let task_id = self.rx.recv().await?;
        self.queued.lock().remove(&task_id);
        Some(task_id)
    }
}
