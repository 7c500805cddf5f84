//! TaskStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::task::{TaskId, TaskInstance, TaskStatus};

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Concurrency conflict (optimistic version check failed)
    #[error("version conflict on task {id}: expected {expected}, got {actual}")]
    VersionConflict {
        id: TaskId,
        expected: i64,
        actual: i64,
    },

    /// The task is not in a status the transition starts from
    #[error("task {id} cannot move from {status}")]
    InvalidTransition { id: TaskId, status: TaskStatus },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether another writer moved the task past the expected version
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Definition of a task to be scheduled
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: TaskId,
    pub task_type: String,
    pub run_at: DateTime<Utc>,
    pub params: serde_json::Value,
    pub state: serde_json::Value,
    pub scope: Vec<String>,
}

impl NewTask {
    /// Create an idle task of `task_type` due at `run_at`
    pub fn new(task_type: impl Into<String>, run_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_type: task_type.into(),
            run_at,
            params: serde_json::json!({}),
            state: serde_json::json!({}),
            scope: vec![],
        }
    }

    /// Use a caller-chosen id
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Set the handler params
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Set the initial task state
    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    /// Set the task scope
    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }
}

/// What `complete` does with a task whose run has finished
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionOutcome {
    /// Delete the task
    Remove,

    /// Back to idle with a new run time; attempts reset
    Reschedule {
        run_at: DateTime<Utc>,
        state: Option<serde_json::Value>,
    },

    /// Back to idle, eligible again at `retry_at`
    Retry {
        retry_at: DateTime<Utc>,
        error: String,
    },

    /// Park the task as failed
    Fail { error: String },
}

/// Shared task store
///
/// Every mutation takes the version the caller last observed and either
/// applies atomically and bumps the version, or fails with
/// [`StoreError::VersionConflict`]. Implementations never retry internally.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Claim candidates at `now`, oldest due first, id as tiebreak
    ///
    /// Idle tasks are due at `retry_at` (or `run_at`); claimed and running
    /// tasks only once their lease has expired.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInstance>, StoreError>;

    /// Number of claim candidates at `now`
    async fn count_due(&self, now: DateTime<Utc>, task_types: &[String])
        -> Result<usize, StoreError>;

    /// Get a task by id
    async fn get(&self, id: TaskId) -> Result<TaskInstance, StoreError>;

    // =========================================================================
    // Conditional updates
    // =========================================================================

    /// Take ownership of a due task
    async fn try_claim(
        &self,
        id: TaskId,
        expected_version: i64,
        owner_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError>;

    /// Move a claimed task to running and count the attempt
    async fn try_mark_running(
        &self,
        id: TaskId,
        expected_version: i64,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError>;

    /// Give a claim back without running the task
    async fn release(&self, id: TaskId, expected_version: i64)
        -> Result<TaskInstance, StoreError>;

    /// Record the outcome of a finished run
    async fn complete(
        &self,
        id: TaskId,
        expected_version: i64,
        outcome: CompletionOutcome,
    ) -> Result<(), StoreError>;

    // =========================================================================
    // Scheduler-of-record
    // =========================================================================

    /// Insert a new idle task
    async fn schedule(&self, task: NewTask) -> Result<TaskInstance, StoreError>;
}
