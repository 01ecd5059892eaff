//! TaskStore trait definition

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use phototask_core::TaskKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pool::PoolError;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found (never created, or deleted)
    #[error("task not found: {0}")]
    NotFound(Uuid),

    /// Compare-and-set lost: the task was not in the expected state
    #[error("invalid transition for task {id}: expected {expected}, found {actual} (target {to})")]
    InvalidTransition {
        id: Uuid,
        expected: TaskState,
        actual: TaskState,
        to: TaskState,
    },

    /// The requested edge is not part of the task lifecycle
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: TaskState, to: TaskState },

    /// No database connection could be obtained
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the same call may succeed if repeated
    ///
    /// A busy pool and database errors clear on their own; a closed pool and
    /// lost compare-and-sets do not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Pool(PoolError::Closed) => false,
            Self::Pool(_) | Self::Database(_) => true,
            _ => false,
        }
    }
}

/// Task lifecycle state
///
/// Tasks only move forward: `pending -> running -> {succeeded, failed,
/// cancelled}`, and a pending task may be cancelled directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, waiting for a worker
    Pending,

    /// Claimed by exactly one executor
    Running,

    /// Finished with a result
    Succeeded,

    /// Finished with a structured error
    Failed,

    /// Stopped by request
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 5] = [
        TaskState::Pending,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No transition leaves a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is an edge of the lifecycle
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StoreError::Serialization(format!("unknown task state: {s}")))
    }
}

/// Classification of a terminal failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PoolExhausted,
    ConnectError,
    Processing,
    Timeout,
    InvalidInput,
    Unsupported,
    /// The process running the task went away
    Interrupted,
    /// The task record could not be updated
    Store,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PoolExhausted => "pool_exhausted",
            Self::ConnectError => "connect_error",
            Self::Processing => "processing",
            Self::Timeout => "timeout",
            Self::InvalidInput => "invalid_input",
            Self::Unsupported => "unsupported",
            Self::Interrupted => "interrupted",
            Self::Store => "store",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error stored on a failed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retriable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Failure recorded for tasks left running by a process that stopped
    pub fn interrupted() -> Self {
        Self::new(
            FailureKind::Interrupted,
            "task was running when the service stopped",
            true,
        )
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A tracked unit of image-processing work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Monotonic insertion number
    pub sequence: i64,
    pub kind: TaskKind,
    pub state: TaskState,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    /// Human-readable progress text
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub attempt_count: u32,
}

impl Task {
    /// New pending task
    pub fn new(sequence: i64, kind: TaskKind, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            sequence,
            kind,
            state: TaskState::Pending,
            input,
            result: None,
            error: None,
            message: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            attempt_count: 0,
        }
    }

    /// Apply a lifecycle edge, keeping `created_at <= started_at <= finished_at`
    ///
    /// The caller has already checked the edge and the current state.
    pub(crate) fn apply(&mut self, to: TaskState, payload: TransitionPayload, now: DateTime<Utc>) {
        self.state = to;
        if to == TaskState::Running {
            self.started_at = Some(now.max(self.created_at));
        }
        if to.is_terminal() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.finished_at = Some(now.max(floor));
        }
        if to == TaskState::Succeeded {
            self.result = payload.result;
        }
        if to == TaskState::Failed {
            self.error = payload.error;
        }
        if payload.message.is_some() {
            self.message = payload.message;
        }
        self.updated_at = now.max(self.updated_at);
    }
}

/// Data written together with a transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionPayload {
    /// Stored only when moving to `succeeded`
    pub result: Option<serde_json::Value>,
    /// Stored only when moving to `failed`
    pub error: Option<TaskFailure>,
    pub message: Option<String>,
}

impl TransitionPayload {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn failed(error: TaskFailure) -> Self {
        Self {
            message: Some(error.message.clone()),
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub kind: Option<TaskKind>,
    pub created_after: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.state.map_or(true, |s| task.state == s)
            && self.kind.map_or(true, |k| task.kind == k)
            && self.created_after.map_or(true, |at| task.created_at > at)
    }
}

/// One page of a listing, in insertion order
#[derive(Debug, Clone, PartialEq)]
pub struct ListQuery {
    pub filter: TaskFilter,
    /// Only tasks inserted after this sequence number
    pub after_sequence: Option<i64>,
    pub limit: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filter: TaskFilter::default(),
            after_sequence: None,
            limit: 100,
        }
    }
}

impl ListQuery {
    pub fn new(filter: TaskFilter, limit: usize) -> Self {
        Self {
            filter,
            after_sequence: None,
            limit,
        }
    }

    pub fn after(mut self, sequence: i64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }
}

/// Durable record of tasks
///
/// `transition` and `record_attempt` are compare-and-set operations: they
/// succeed only if the task is in the expected state at the moment of the
/// write, which is what keeps a task owned by at most one executor.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Create a pending task
    async fn create(&self, kind: TaskKind, input: serde_json::Value) -> Result<Task, StoreError>;

    /// Move a task from `from` to `to` atomically
    async fn transition(
        &self,
        id: Uuid,
        from: TaskState,
        to: TaskState,
        payload: TransitionPayload,
    ) -> Result<Task, StoreError>;

    /// Fetch a task
    async fn get(&self, id: Uuid) -> Result<Task, StoreError>;

    /// One page of tasks in insertion order
    async fn list(&self, query: &ListQuery) -> Result<Vec<Task>, StoreError>;

    /// Remove a task; returns false if it was already absent
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Record the start of an attempt on a running task
    ///
    /// Fails with `InvalidTransition` if the task is no longer running, which
    /// makes it a cancellation checkpoint.
    async fn record_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        message: Option<String>,
    ) -> Result<Task, StoreError>;

    /// Number of tasks per state
    async fn count_by_state(&self) -> Result<HashMap<TaskState, u64>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lifecycle_edges() {
        use TaskState::*;

        let allowed = [
            (Pending, Running),
            (Pending, Cancelled),
            (Running, Succeeded),
            (Running, Failed),
            (Running, Cancelled),
        ];
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_transient_errors() {
        let exhausted = PoolError::Exhausted {
            waited: std::time::Duration::from_millis(100),
        };
        assert!(StoreError::Pool(exhausted).is_transient());
        assert!(StoreError::Database("connection reset".into()).is_transient());

        assert!(!StoreError::Pool(PoolError::Closed).is_transient());
        assert!(!StoreError::NotFound(Uuid::nil()).is_transient());
        assert!(!StoreError::InvalidTransition {
            id: Uuid::nil(),
            expected: TaskState::Pending,
            actual: TaskState::Running,
            to: TaskState::Running,
        }
        .is_transient());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
    }

    #[test]
    fn test_state_parse() {
        assert_eq!("running".parse::<TaskState>().unwrap(), TaskState::Running);
        assert!("done".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_apply_keeps_timestamps_ordered() {
        let mut task = Task::new(1, TaskKind::Dimension, serde_json::json!({}));
        let skewed = task.created_at - Duration::seconds(5);

        task.apply(TaskState::Running, TransitionPayload::none(), skewed);
        assert_eq!(task.started_at, Some(task.created_at));

        task.apply(
            TaskState::Succeeded,
            TransitionPayload::succeeded(serde_json::json!({"ok": true})),
            skewed,
        );
        assert!(task.finished_at >= task.started_at);
        assert_eq!(task.result, Some(serde_json::json!({"ok": true})));
        assert!(task.error.is_none());
    }

    #[test]
    fn test_failure_serialization() {
        let failure = TaskFailure::new(FailureKind::PoolExhausted, "busy", true);
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "pool_exhausted", "message": "busy", "retriable": true})
        );
    }

    #[test]
    fn test_filter_matches() {
        let task = Task::new(1, TaskKind::Carousel, serde_json::json!({}));

        assert!(TaskFilter::all().matches(&task));
        assert!(TaskFilter::all().with_kind(TaskKind::Carousel).matches(&task));
        assert!(!TaskFilter::all().with_state(TaskState::Running).matches(&task));
        assert!(!TaskFilter::all()
            .created_after(task.created_at)
            .matches(&task));
    }
}
