//! PostgreSQL implementation of TaskStore
//!
//! Tasks live in the `image_tasks` table (see `migrations/`). Every
//! operation borrows a connection from the shared [`ConnectionPool`] and
//! gives it back before decoding the result. State changes are single
//! `UPDATE ... WHERE id = $1 AND state = $2 RETURNING ...` statements, so the
//! compare-and-set is atomic in the database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use phototask_core::TaskKind;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::pool::{ConnectionPool, PgConnector};

const TASK_COLUMNS: &str = "id, sequence, kind, state, input, result, error, message, \
     attempt_count, created_at, started_at, finished_at, updated_at";

const SCHEMA: &str = include_str!("../../migrations/001_image_tasks.sql");

/// PostgreSQL implementation of TaskStore
///
/// # Example
///
/// ```ignore
/// use phototask_durable::pool::{ConnectionPool, PgConnector, PoolConfig};
/// use phototask_durable::PostgresTaskStore;
///
/// let pool = ConnectionPool::new(PgConnector::new(url), PoolConfig::default());
/// let store = PostgresTaskStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresTaskStore {
    pool: ConnectionPool<PgConnector>,
}

impl PostgresTaskStore {
    /// Create a store over the given connection pool
    pub fn new(pool: ConnectionPool<PgConnector>) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &ConnectionPool<PgConnector> {
        &self.pool
    }

    /// Create the `image_tasks` table if it does not exist
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::raw_sql(SCHEMA).execute(&mut *conn).await;
        conn.release().await;

        result.map_err(|e| {
            error!("Failed to apply image_tasks schema: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(())
    }

    /// Current state of a task, for explaining a lost compare-and-set
    async fn current_state(&self, id: Uuid) -> Result<Option<TaskState>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT state FROM image_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;
        conn.release().await;

        let row = row.map_err(|e| {
            error!("Failed to read task state: {}", e);
            StoreError::Database(e.to_string())
        })?;
        row.map(|r| r.get::<String, _>("state").parse())
            .transpose()
    }

    async fn lost_race(&self, id: Uuid, expected: TaskState, to: TaskState) -> StoreError {
        match self.current_state(id).await {
            Ok(Some(actual)) => StoreError::InvalidTransition {
                id,
                expected,
                actual,
                to,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, input))]
    async fn create(&self, kind: TaskKind, input: serde_json::Value) -> Result<Task, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO image_tasks (id, kind, state, input)
            VALUES ($1, $2, 'pending', $3)
            RETURNING {TASK_COLUMNS}
            "#
        );

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(kind.as_str())
            .bind(&input)
            .fetch_one(&mut *conn)
            .await;
        conn.release().await;

        let row = row.map_err(|e| {
            error!("Failed to create task: {}", e);
            StoreError::Database(e.to_string())
        })?;
        let task = task_from_row(&row)?;
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

        let error_json = payload
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let sql = format!(
            r#"
            UPDATE image_tasks SET
                state = $3,
                started_at = CASE WHEN $3 = 'running'
                    THEN GREATEST(now(), created_at) ELSE started_at END,
                finished_at = CASE WHEN $3 IN ('succeeded', 'failed', 'cancelled')
                    THEN GREATEST(now(), COALESCE(started_at, created_at)) ELSE finished_at END,
                result = CASE WHEN $3 = 'succeeded' THEN $4 ELSE result END,
                error = CASE WHEN $3 = 'failed' THEN $5 ELSE error END,
                message = COALESCE($6, message),
                updated_at = GREATEST(now(), updated_at)
            WHERE id = $1 AND state = $2
            RETURNING {TASK_COLUMNS}
            "#
        );

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(&payload.result)
            .bind(&error_json)
            .bind(&payload.message)
            .fetch_optional(&mut *conn)
            .await;
        conn.release().await;

        let row = row.map_err(|e| {
            error!("Failed to transition task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(self.lost_race(id, from, to).await),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Task, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM image_tasks WHERE id = $1");

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;
        conn.release().await;

        let row = row.map_err(|e| {
            error!("Failed to get task: {}", e);
            StoreError::Database(e.to_string())
        })?;
        row.map(|r| task_from_row(&r))
            .transpose()?
            .ok_or(StoreError::NotFound(id))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS} FROM image_tasks
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR kind = $2)
              AND ($3::timestamptz IS NULL OR created_at > $3)
              AND sequence > $4
            ORDER BY sequence ASC
            LIMIT $5
            "#
        );

        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(query.filter.state.map(|s| s.as_str()))
            .bind(query.filter.kind.map(|k| k.as_str()))
            .bind(query.filter.created_after)
            .bind(query.after_sequence.unwrap_or(0))
            .bind(query.limit as i64)
            .fetch_all(&mut *conn)
            .await;
        conn.release().await;

        let rows = rows.map_err(|e| {
            error!("Failed to list tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;
        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("DELETE FROM image_tasks WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await;
        conn.release().await;

        let result = result.map_err(|e| {
            error!("Failed to delete task: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_attempt(
        &self,
        id: Uuid,
        attempt: u32,
        message: Option<String>,
    ) -> Result<Task, StoreError> {
        let sql = format!(
            r#"
            UPDATE image_tasks SET
                attempt_count = $2,
                message = COALESCE($3, message),
                updated_at = GREATEST(now(), updated_at)
            WHERE id = $1 AND state = 'running'
            RETURNING {TASK_COLUMNS}
            "#
        );

        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(attempt as i32)
            .bind(&message)
            .fetch_optional(&mut *conn)
            .await;
        conn.release().await;

        let row = row.map_err(|e| {
            error!("Failed to record attempt: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(row) => task_from_row(&row),
            None => Err(self
                .lost_race(id, TaskState::Running, TaskState::Running)
                .await),
        }
    }

    async fn count_by_state(&self) -> Result<HashMap<TaskState, u64>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM image_tasks GROUP BY state")
            .fetch_all(&mut *conn)
            .await;
        conn.release().await;

        let rows = rows.map_err(|e| {
            error!("Failed to count tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let mut counts = HashMap::new();
        for row in rows {
            let state: TaskState = row.get::<String, _>("state").parse()?;
            let count: i64 = row.get("count");
            counts.insert(state, count as u64);
        }
        Ok(counts)
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let kind: String = row.get("kind");
    let state: String = row.get("state");
    let error: Option<serde_json::Value> = row.get("error");
    let attempt_count: i32 = row.get("attempt_count");

    Ok(Task {
        id: row.get("id"),
        sequence: row.get("sequence"),
        kind: kind
            .parse()
            .map_err(|e: phototask_core::UnknownTaskKind| StoreError::Serialization(e.to_string()))?,
        state: state.parse()?,
        input: row.get("input"),
        result: row.get("result"),
        error: error
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        message: row.get("message"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        updated_at: row.get("updated_at"),
        attempt_count: attempt_count.max(0) as u32,
    })
}
