//! In-memory implementation of TaskStore

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use phototask_core::TaskKind;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::store::*;

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<Uuid, Task>,
    /// sequence -> id, for insertion-order listing
    order: BTreeMap<i64, Uuid>,
    next_sequence: i64,
}

/// In-memory implementation of TaskStore
///
/// Used for tests and single-process deployments without a database. It
/// provides the same compare-and-set semantics as the PostgreSQL store: every
/// check-then-write happens under one write lock.
///
/// # Example
///
/// ```
/// use phototask_durable::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert!(store.is_empty());
/// ```
#[derive(Default)]
pub struct InMemoryTaskStore {
    state: RwLock<MemoryState>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored tasks
    pub fn len(&self) -> usize {
        self.state.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a task as-is (used to seed state in tests)
    pub fn insert(&self, mut task: Task) -> Task {
        let mut state = self.state.write();
        state.next_sequence += 1;
        task.sequence = state.next_sequence;
        state.order.insert(task.sequence, task.id);
        state.tasks.insert(task.id, task.clone());
        task
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    #[instrument(skip(self, input))]
    async fn create(&self, kind: TaskKind, input: serde_json::Value) -> Result<Task, StoreError> {
        let mut state = self.state.write();
        state.next_sequence += 1;
        let task = Task::new(state.next_sequence, kind, input);
        state.order.insert(task.sequence, task.id);
        state.tasks.insert(task.id, task.clone());

        debug!(task_id = %task.id, sequence = task.sequence, "Created task");
        Ok(task)
    }

    #[instrument(skip(self, payload))]
    async fn transition(
        &self,
        id: Uuid,
        from: TaskState,
        to: TaskState,
        payload: TransitionPayload,
    ) -> Result<Task, StoreError> {
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition { from, to });
        }

        let mut state = self.state.write();
        let task = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.state != from {
            return Err(StoreError::InvalidTransition {
                id,
                expected: from,
                actual: task.state,
                to,
            });
        }

        task.apply(to, payload, Utc::now());
        Ok(task.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Task, StoreError> {
        self.state
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Task>, StoreError> {
        let state = self.state.read();
        let start = query.after_sequence.map_or(i64::MIN, |s| s.saturating_add(1));

        Ok(state
            .order
            .range(start..)
            .filter_map(|(_, id)| state.tasks.get(id))
            .filter(|task| query.filter.matches(task))
            .take(query.limit)
            .cloned()
            .collect())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        match state.tasks.remove(&id) {
            Some(task) => {
                state.order.remove(&task.sequence);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        message: Option<String>,
    ) -> Result<Task, StoreError> {
        let mut state = self.state.write();
        let task = state.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if task.state != TaskState::Running {
            return Err(StoreError::InvalidTransition {
                id,
                expected: TaskState::Running,
                actual: task.state,
                to: TaskState::Running,
            });
        }

        task.attempt_count = attempt;
        if message.is_some() {
            task.message = message;
        }
        task.updated_at = Utc::now().max(task.updated_at);
        Ok(task.clone())
    }

    async fn count_by_state(&self) -> Result<HashMap<TaskState, u64>, StoreError> {
        let state = self.state.read();
        let mut counts = HashMap::new();
        for task in state.tasks.values() {
            *counts.entry(task.state).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryTaskStore::new();
        let task = store
            .create(TaskKind::Dimension, json!({"length": 10.5}))
            .await
            .unwrap();

        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempt_count, 0);

        let fetched = store.get(task.id).await.unwrap();
        assert_eq!(fetched, task);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::now_v7();
        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(x)) if x == id));
    }

    #[tokio::test]
    async fn test_transition_compare_and_set() {
        let store = InMemoryTaskStore::new();
        let task = store.create(TaskKind::Carousel, json!({})).await.unwrap();

        let running = store
            .transition(task.id, TaskState::Pending, TaskState::Running, TransitionPayload::none())
            .await
            .unwrap();
        assert!(running.started_at.is_some());

        let err = store
            .transition(task.id, TaskState::Pending, TaskState::Running, TransitionPayload::none())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                expected: TaskState::Pending,
                actual: TaskState::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_terminal_state_is_final() {
        let store = InMemoryTaskStore::new();
        let task = store.create(TaskKind::Carousel, json!({})).await.unwrap();
        store
            .transition(task.id, TaskState::Pending, TaskState::Cancelled, TransitionPayload::none())
            .await
            .unwrap();

        for to in TaskState::ALL {
            let result = store
                .transition(task.id, TaskState::Cancelled, to, TransitionPayload::none())
                .await;
            assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_exactly_one_wins() {
        let store = Arc::new(InMemoryTaskStore::new());
        let task = store.create(TaskKind::Dimension, json!({})).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .transition(task.id, TaskState::Pending, TaskState::Running, TransitionPayload::none())
                    .await
                    .is_ok()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_result_only_on_success_and_error_only_on_failure() {
        let store = InMemoryTaskStore::new();
        let task = store.create(TaskKind::Dimension, json!({})).await.unwrap();
        store
            .transition(task.id, TaskState::Pending, TaskState::Running, TransitionPayload::none())
            .await
            .unwrap();

        let payload = TransitionPayload {
            result: Some(json!({"ignored": true})),
            error: Some(TaskFailure::new(FailureKind::Processing, "boom", false)),
            message: None,
        };
        let failed = store
            .transition(task.id, TaskState::Running, TaskState::Failed, payload)
            .await
            .unwrap();

        assert!(failed.result.is_none());
        assert_eq!(failed.error.unwrap().message, "boom");
    }

    #[tokio::test]
    async fn test_record_attempt_requires_running() {
        let store = InMemoryTaskStore::new();
        let task = store.create(TaskKind::Dimension, json!({})).await.unwrap();

        assert!(store.record_attempt(task.id, 1, None).await.is_err());

        store
            .transition(task.id, TaskState::Pending, TaskState::Running, TransitionPayload::none())
            .await
            .unwrap();
        let updated = store
            .record_attempt(task.id, 2, Some("attempt 2".into()))
            .await
            .unwrap();
        assert_eq!(updated.attempt_count, 2);
        assert_eq!(updated.message.as_deref(), Some("attempt 2"));
    }

    #[tokio::test]
    async fn test_list_in_insertion_order_with_filters() {
        let store = InMemoryTaskStore::new();
        let a = store.create(TaskKind::Dimension, json!({})).await.unwrap();
        let b = store.create(TaskKind::Carousel, json!({})).await.unwrap();
        let c = store.create(TaskKind::Dimension, json!({})).await.unwrap();

        let all = store.list(&ListQuery::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);

        let dims = store
            .list(&ListQuery::new(TaskFilter::all().with_kind(TaskKind::Dimension), 10))
            .await
            .unwrap();
        assert_eq!(dims.len(), 2);

        let page = store
            .list(&ListQuery::new(TaskFilter::all(), 1).after(a.sequence))
            .await
            .unwrap();
        assert_eq!(page[0].id, b.id);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryTaskStore::new();
        let task = store.create(TaskKind::Dimension, json!({})).await.unwrap();

        assert!(store.delete(task.id).await.unwrap());
        assert!(!store.delete(task.id).await.unwrap());
        assert!(matches!(store.get(task.id).await, Err(StoreError::NotFound(_))));
        assert!(store.list(&ListQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_count_by_state() {
        let store = InMemoryTaskStore::new();
        let a = store.create(TaskKind::Dimension, json!({})).await.unwrap();
        store.create(TaskKind::Dimension, json!({})).await.unwrap();
        store
            .transition(a.id, TaskState::Pending, TaskState::Running, TransitionPayload::none())
            .await
            .unwrap();

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts.get(&TaskState::Pending), Some(&1));
        assert_eq!(counts.get(&TaskState::Running), Some(&1));
        assert_eq!(counts.get(&TaskState::Failed), None);
    }
}
