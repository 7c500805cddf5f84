//! Task instances and the handler registry
//!
//! This module provides:
//! - [`TaskInstance`] - the unit of schedulable work as stored in the task store
//! - [`TaskStatus`] - ownership state of a task instance
//! - [`TaskRunResult`] - how a finished run left the task
//! - [`TaskTypeRegistry`] - handlers keyed by task type

mod registry;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use registry::{
    HandlerError, HandlerOutput, HandlerResult, TaskDefinition, TaskHandler, TaskTypeRegistry,
};

/// Stable task identifier
pub type TaskId = Uuid;

/// Ownership state of a task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its due time, owned by nobody
    Idle,

    /// Claimed by a node, not yet started
    Claimed,

    /// Marked running by its owner
    Running,

    /// Attempts exhausted or failed permanently, never claimed again
    Failed,
}

impl TaskStatus {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Failed => "failed",
        }
    }

    /// Whether a node currently owns the task
    pub fn is_owned(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A task instance as read from the task store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: TaskId,

    /// Selects the registered handler
    pub task_type: String,

    /// Next scheduled execution time
    pub run_at: DateTime<Utc>,

    /// Retry time after a recoverable failure, takes precedence over `run_at`
    pub retry_at: Option<DateTime<Utc>>,

    /// Runs started since the last success
    pub attempts: u32,

    /// Node holding the claim
    pub owner_id: Option<String>,

    pub status: TaskStatus,

    /// Bumped by every mutation, guards every conditional update
    pub version: i64,

    /// Deadline after which a claimed or running task may be reclaimed
    pub lease_expires_at: Option<DateTime<Utc>>,

    /// Start of the current run
    pub started_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,

    pub params: serde_json::Value,

    pub state: serde_json::Value,

    pub scope: Vec<String>,
}

impl TaskInstance {
    /// The instant this task becomes a claim candidate
    ///
    /// Returns `None` for failed tasks and for owned tasks without a lease.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            TaskStatus::Idle => Some(self.retry_at.unwrap_or(self.run_at)),
            TaskStatus::Claimed | TaskStatus::Running => self.lease_expires_at,
            TaskStatus::Failed => None,
        }
    }

    /// Whether the task may be claimed at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_at().is_some_and(|due| due <= now)
    }
}

/// How a run left the task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunResult {
    /// One-shot task finished and was removed
    Success,

    /// Recurring task finished and went back to idle with a new `run_at`
    SuccessRescheduled,

    /// Run failed and the task went back to idle with a `retry_at`
    RetryScheduled,

    /// Run failed and the task will not be retried
    Failed,
}

/// `now + timeout`, saturating at the largest representable instant
pub fn deadline(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
pub(crate) fn test_task(task_type: &str, run_at: DateTime<Utc>) -> TaskInstance {
    TaskInstance {
        id: Uuid::now_v7(),
        task_type: task_type.to_string(),
        run_at,
        retry_at: None,
        attempts: 0,
        owner_id: None,
        status: TaskStatus::Idle,
        version: 0,
        lease_expires_at: None,
        started_at: None,
        last_error: None,
        params: serde_json::json!({}),
        state: serde_json::json!({}),
        scope: vec![],
    }
}
