//! PostgreSQL implementation of TaskStore
//!
//! Every mutation is a single conditional `UPDATE ... WHERE id = $1 AND
//! version = $2`, so nodes never hold row locks between calls. A statement
//! that matches no row is resolved into not-found, version conflict or
//! invalid transition by re-reading the row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::task::{TaskId, TaskInstance, TaskStatus};

const TASK_COLUMNS: &str = "id, task_type, run_at, retry_at, attempts, owner_id, status, version, \
     lease_expires_at, started_at, last_error, params, state, scope";

/// Shared by `list_due` and `count_due`; `$1` is now, `$2` the task types
const DUE_PREDICATE: &str = "task_type = ANY($2) AND (\
     (status = 'idle' AND COALESCE(retry_at, run_at) <= $1) \
     OR (status IN ('claimed', 'running') AND lease_expires_at <= $1))";

/// PostgreSQL implementation of TaskStore
///
/// # Example
///
/// ```ignore
/// use tasklane_manager::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/tasklane").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    /// Explain why a conditional update matched no row
    async fn unmatched(&self, id: TaskId, expected_version: i64) -> StoreError {
        let row = sqlx::query("SELECT version, status FROM tasklane_task_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;

        match row {
            Ok(None) => StoreError::TaskNotFound(id),
            Ok(Some(row)) => {
                let actual: i64 = match row.try_get("version") {
                    Ok(v) => v,
                    Err(e) => return StoreError::Database(e.to_string()),
                };
                if actual != expected_version {
                    return StoreError::VersionConflict {
                        id,
                        expected: expected_version,
                        actual,
                    };
                }
                match row
                    .try_get::<String, _>("status")
                    .map_err(|e| StoreError::Database(e.to_string()))
                    .and_then(|s| parse_status(&s))
                {
                    Ok(status) => StoreError::InvalidTransition { id, status },
                    Err(e) => e,
                }
            }
            Err(e) => StoreError::Database(e.to_string()),
        }
    }

    /// Map a conditional update result: the row, or why no row matched
    async fn matched(
        &self,
        row: Result<Option<PgRow>, sqlx::Error>,
        id: TaskId,
        expected_version: i64,
    ) -> Result<TaskInstance, StoreError> {
        match row {
            Ok(Some(row)) => task_from_row(&row),
            Ok(None) => Err(self.unmatched(id, expected_version).await),
            Err(e) => {
                error!(task_id = %id, "Conditional update failed: {}", e);
                Err(StoreError::Database(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task_types))]
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInstance>, StoreError> {
        if task_types.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasklane_task_instances \
             WHERE {DUE_PREDICATE} \
             ORDER BY CASE WHEN status = 'idle' THEN COALESCE(retry_at, run_at) \
                      ELSE lease_expires_at END, id \
             LIMIT $3"
        );

        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(task_types)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list due tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, task_types))]
    async fn count_due(
        &self,
        now: DateTime<Utc>,
        task_types: &[String],
    ) -> Result<usize, StoreError> {
        if task_types.is_empty() {
            return Ok(0);
        }

        let sql =
            format!("SELECT COUNT(*) AS due FROM tasklane_task_instances WHERE {DUE_PREDICATE}");
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(task_types)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to count due tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let due: i64 = row
            .try_get("due")
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(due.max(0) as usize)
    }

    #[instrument(skip(self))]
    async fn get(&self, id: TaskId) -> Result<TaskInstance, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasklane_task_instances WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .ok_or(StoreError::TaskNotFound(id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn try_claim(
        &self,
        id: TaskId,
        expected_version: i64,
        owner_id: &str,
        _now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        let sql = format!(
            "UPDATE tasklane_task_instances \
             SET status = 'claimed', owner_id = $3, lease_expires_at = $4, started_at = NULL, \
                 version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $2 AND status <> 'failed' \
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected_version)
            .bind(owner_id)
            .bind(lease_expires_at)
            .fetch_optional(&self.pool)
            .await;

        let task = self.matched(row, id, expected_version).await?;
        debug!(task_id = %id, owner_id, version = task.version, "claimed task");
        Ok(task)
    }

    #[instrument(skip(self))]
    async fn try_mark_running(
        &self,
        id: TaskId,
        expected_version: i64,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        let sql = format!(
            "UPDATE tasklane_task_instances \
             SET status = 'running', started_at = $3, lease_expires_at = $4, \
                 attempts = attempts + 1, version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $2 AND status = 'claimed' \
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected_version)
            .bind(now)
            .bind(lease_expires_at)
            .fetch_optional(&self.pool)
            .await;

        self.matched(row, id, expected_version).await
    }

    #[instrument(skip(self))]
    async fn release(
        &self,
        id: TaskId,
        expected_version: i64,
    ) -> Result<TaskInstance, StoreError> {
        let sql = format!(
            "UPDATE tasklane_task_instances \
             SET status = 'idle', owner_id = NULL, lease_expires_at = NULL, started_at = NULL, \
                 version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $2 AND status IN ('claimed', 'running') \
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(id)
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await;

        self.matched(row, id, expected_version).await
    }

    #[instrument(skip(self, outcome))]
    async fn complete(
        &self,
        id: TaskId,
        expected_version: i64,
        outcome: CompletionOutcome,
    ) -> Result<(), StoreError> {
        const OWNED_GUARD: &str = "WHERE id = $1 AND version = $2 AND status = 'running'";
        const CLEAR_OWNER: &str = "owner_id = NULL, lease_expires_at = NULL, started_at = NULL, \
             version = version + 1, updated_at = NOW()";

        let query = match &outcome {
            CompletionOutcome::Remove => {
                format!("DELETE FROM tasklane_task_instances {OWNED_GUARD} RETURNING id")
            }
            CompletionOutcome::Reschedule { .. } => format!(
                "UPDATE tasklane_task_instances \
                 SET status = 'idle', run_at = $3, state = COALESCE($4, state), retry_at = NULL, \
                     attempts = 0, last_error = NULL, {CLEAR_OWNER} \
                 {OWNED_GUARD} RETURNING id"
            ),
            CompletionOutcome::Retry { .. } => format!(
                "UPDATE tasklane_task_instances \
                 SET status = 'idle', retry_at = $3, last_error = $4, {CLEAR_OWNER} \
                 {OWNED_GUARD} RETURNING id"
            ),
            CompletionOutcome::Fail { .. } => format!(
                "UPDATE tasklane_task_instances \
                 SET status = 'failed', last_error = $3, {CLEAR_OWNER} \
                 {OWNED_GUARD} RETURNING id"
            ),
        };

        let mut q = sqlx::query(&query).bind(id).bind(expected_version);
        q = match outcome {
            CompletionOutcome::Remove => q,
            CompletionOutcome::Reschedule { run_at, state } => q.bind(run_at).bind(state),
            CompletionOutcome::Retry { retry_at, error } => q.bind(retry_at).bind(error),
            CompletionOutcome::Fail { error } => q.bind(error),
        };

        let row = q.fetch_optional(&self.pool).await.map_err(|e| {
            error!(task_id = %id, "Failed to complete task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        match row {
            Some(_) => Ok(()),
            None => Err(self.unmatched(id, expected_version).await),
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type))]
    async fn schedule(&self, task: NewTask) -> Result<TaskInstance, StoreError> {
        let sql = format!(
            "INSERT INTO tasklane_task_instances (id, task_type, run_at, params, state, scope) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(task.id)
            .bind(&task.task_type)
            .bind(task.run_at)
            .bind(&task.params)
            .bind(&task.state)
            .bind(&task.scope)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to schedule task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        task_from_row(&row)
    }
}

fn task_from_row(row: &PgRow) -> Result<TaskInstance, StoreError> {
    let db = |e: sqlx::Error| StoreError::Database(e.to_string());
    let status: String = row.try_get("status").map_err(db)?;
    let attempts: i32 = row.try_get("attempts").map_err(db)?;

    Ok(TaskInstance {
        id: row.try_get("id").map_err(db)?,
        task_type: row.try_get("task_type").map_err(db)?,
        run_at: row.try_get("run_at").map_err(db)?,
        retry_at: row.try_get("retry_at").map_err(db)?,
        attempts: attempts.max(0) as u32,
        owner_id: row.try_get("owner_id").map_err(db)?,
        status: parse_status(&status)?,
        version: row.try_get("version").map_err(db)?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(db)?,
        started_at: row.try_get("started_at").map_err(db)?,
        last_error: row.try_get("last_error").map_err(db)?,
        params: row.try_get("params").map_err(db)?,
        state: row.try_get("state").map_err(db)?,
        scope: row.try_get("scope").map_err(db)?,
    })
}

fn parse_status(status: &str) -> Result<TaskStatus, StoreError> {
    status.parse().map_err(StoreError::Database)
}
