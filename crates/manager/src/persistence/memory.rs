//! In-memory implementation of TaskStore

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::store::*;
use crate::task::{TaskId, TaskInstance, TaskStatus};

/// In-memory implementation of TaskStore
///
/// Every operation runs under a single write lock, which gives the same
/// compare-and-swap semantics as the PostgreSQL implementation. Useful for
/// tests and for nodes that do not share their tasks.
///
/// # Example
///
/// ```
/// use tasklane_manager::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert!(store.is_empty());
/// ```
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, TaskInstance>>,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite a task exactly as given
    pub fn insert(&self, task: TaskInstance) {
        self.tasks.write().insert(task.id, task);
    }

    /// Get the number of stored tasks
    pub fn len(&self) -> usize {
        self.tasks.read().len()
    }

    /// Check if the store holds no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.read().is_empty()
    }

    /// Get the number of tasks in `status`
    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.tasks.write().clear();
    }

    fn due_tasks(
        tasks: &HashMap<TaskId, TaskInstance>,
        now: DateTime<Utc>,
        task_types: &[String],
    ) -> Vec<TaskInstance> {
        let mut due: Vec<TaskInstance> = tasks
            .values()
            .filter(|t| t.is_due(now) && task_types.contains(&t.task_type))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.due_at().cmp(&b.due_at()).then_with(|| a.id.cmp(&b.id)));
        due
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Look up a task and check the caller's version
fn versioned(
    tasks: &mut HashMap<TaskId, TaskInstance>,
    id: TaskId,
    expected_version: i64,
) -> Result<&mut TaskInstance, StoreError> {
    let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
    if task.version != expected_version {
        return Err(StoreError::VersionConflict {
            id,
            expected: expected_version,
            actual: task.version,
        });
    }
    Ok(task)
}

/// Back to idle with no owner
fn reset_ownership(task: &mut TaskInstance) {
    task.status = TaskStatus::Idle;
    task.owner_id = None;
    task.lease_expires_at = None;
    task.started_at = None;
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let tasks = self.tasks.read();
        let mut due = Self::due_tasks(&tasks, now, task_types);
        due.truncate(limit);
        Ok(due)
    }

    async fn count_due(
        &self,
        now: DateTime<Utc>,
        task_types: &[String],
    ) -> Result<usize, StoreError> {
        let tasks = self.tasks.read();
        Ok(tasks
            .values()
            .filter(|t| t.is_due(now) && task_types.contains(&t.task_type))
            .count())
    }

    async fn get(&self, id: TaskId) -> Result<TaskInstance, StoreError> {
        self.tasks
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn try_claim(
        &self,
        id: TaskId,
        expected_version: i64,
        owner_id: &str,
        _now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        let mut tasks = self.tasks.write();
        let task = versioned(&mut tasks, id, expected_version)?;

        if task.status == TaskStatus::Failed {
            return Err(StoreError::InvalidTransition {
                id,
                status: task.status,
            });
        }

        task.status = TaskStatus::Claimed;
        task.owner_id = Some(owner_id.to_string());
        task.lease_expires_at = Some(lease_expires_at);
        task.started_at = None;
        task.version += 1;
        Ok(task.clone())
    }

    async fn try_mark_running(
        &self,
        id: TaskId,
        expected_version: i64,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        let mut tasks = self.tasks.write();
        let task = versioned(&mut tasks, id, expected_version)?;

        if task.status != TaskStatus::Claimed {
            return Err(StoreError::InvalidTransition {
                id,
                status: task.status,
            });
        }

        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.lease_expires_at = Some(lease_expires_at);
        task.attempts += 1;
        task.version += 1;
        Ok(task.clone())
    }

    async fn release(
        &self,
        id: TaskId,
        expected_version: i64,
    ) -> Result<TaskInstance, StoreError> {
        let mut tasks = self.tasks.write();
        let task = versioned(&mut tasks, id, expected_version)?;

        if !task.status.is_owned() {
            return Err(StoreError::InvalidTransition {
                id,
                status: task.status,
            });
        }

        reset_ownership(task);
        task.version += 1;
        Ok(task.clone())
    }

    async fn complete(
        &self,
        id: TaskId,
        expected_version: i64,
        outcome: CompletionOutcome,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = versioned(&mut tasks, id, expected_version)?;

        if task.status != TaskStatus::Running {
            return Err(StoreError::InvalidTransition {
                id,
                status: task.status,
            });
        }

        match outcome {
            CompletionOutcome::Remove => {
                tasks.remove(&id);
                return Ok(());
            }
            CompletionOutcome::Reschedule { run_at, state } => {
                reset_ownership(task);
                task.run_at = run_at;
                task.retry_at = None;
                task.attempts = 0;
                task.last_error = None;
                if let Some(state) = state {
                    task.state = state;
                }
            }
            CompletionOutcome::Retry { retry_at, error } => {
                reset_ownership(task);
                task.retry_at = Some(retry_at);
                task.last_error = Some(error);
            }
            CompletionOutcome::Fail { error } => {
                reset_ownership(task);
                task.status = TaskStatus::Failed;
                task.last_error = Some(error);
            }
        }
        task.version += 1;
        Ok(())
    }

    async fn schedule(&self, new_task: NewTask) -> Result<TaskInstance, StoreError> {
        let task = TaskInstance {
            id: new_task.id,
            task_type: new_task.task_type,
            run_at: new_task.run_at,
            retry_at: None,
            attempts: 0,
            owner_id: None,
            status: TaskStatus::Idle,
            version: 0,
            lease_expires_at: None,
            started_at: None,
            last_error: None,
            params: new_task.params,
            state: new_task.state,
            scope: new_task.scope,
        };
        self.tasks.write().insert(task.id, task.clone());
        Ok(task)
    }
}
