//! Task lifecycle events
//!
//! Every step a node takes is described by a [`TaskEvent`]. The set of event
//! kinds is closed: each variant carries its own record type whose `event`
//! field holds the step's outcome as a `Result`, and consumers match on the
//! enum exhaustively.
//!
//! | Event          | Ok                         | Err                          |
//! |----------------|----------------------------|------------------------------|
//! | Claim          | [`TaskInstance`]           | `Option<TaskInstance>`       |
//! | MarkRunning    | [`TaskInstance`]           | [`StoreError`]               |
//! | Run            | [`RanTask`]                | [`ErroredTask`]              |
//! | RunRequest     | [`TaskId`]                 | [`RunRequestError`]          |
//! | PollingCycle   | [`ClaimAndFillPoolResult`] | `PollingError<StoreError>`   |
//! | ManagerStat    | `f64`                      | `Infallible`                 |

mod bus;
mod timing;

use std::convert::Infallible;

use serde::{Deserialize, Serialize};

pub use bus::{EventEmitter, EventSubscription};
pub use timing::{start_task_timer, TaskTiming};

use crate::manager::RunRequestError;
use crate::persistence::StoreError;
use crate::task::{TaskId, TaskInstance};
use crate::worker::{ClaimAndFillPoolResult, ErroredTask, PollingError, RanTask};

/// Event type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskEventType {
    TaskClaim,
    TaskMarkRunning,
    TaskRun,
    TaskRunRequest,
    TaskPollingCycle,
    TaskManagerStat,
}

/// Aggregate statistics republished as events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskManagerStats {
    /// Fraction of pool capacity in use
    Load,

    /// Observed inter-cycle interval minus the configured one, in milliseconds
    PollingDelay,
}

/// One immutable event record
#[derive(Debug, Clone)]
pub struct TaskEventRecord<T, E, Id = TaskId> {
    pub id: Option<Id>,
    pub timing: Option<TaskTiming>,
    pub event: Result<T, E>,
}

pub type TaskClaim = TaskEventRecord<TaskInstance, Option<TaskInstance>>;
pub type TaskMarkRunning = TaskEventRecord<TaskInstance, StoreError>;
pub type TaskRun = TaskEventRecord<RanTask, ErroredTask>;
pub type TaskRunRequest = TaskEventRecord<TaskId, RunRequestError>;
pub type TaskPollingCycle = TaskEventRecord<ClaimAndFillPoolResult, PollingError<StoreError>>;
pub type TaskManagerStat = TaskEventRecord<f64, Infallible, TaskManagerStats>;

/// A task lifecycle event
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Claim(TaskClaim),
    MarkRunning(TaskMarkRunning),
    Run(TaskRun),
    RunRequest(TaskRunRequest),
    PollingCycle(TaskPollingCycle),
    ManagerStat(TaskManagerStat),
}

impl TaskEvent {
    /// A claim attempt; `Err(None)` when the candidate no longer exists
    pub fn claim(
        id: TaskId,
        event: Result<TaskInstance, Option<TaskInstance>>,
        timing: Option<TaskTiming>,
    ) -> Self {
        Self::Claim(TaskEventRecord {
            id: Some(id),
            timing,
            event,
        })
    }

    /// The store update marking a claimed task as running
    pub fn mark_running(
        id: TaskId,
        event: Result<TaskInstance, StoreError>,
        timing: Option<TaskTiming>,
    ) -> Self {
        Self::MarkRunning(TaskEventRecord {
            id: Some(id),
            timing,
            event,
        })
    }

    /// A finished run
    pub fn run(
        id: TaskId,
        event: Result<RanTask, ErroredTask>,
        timing: Option<TaskTiming>,
    ) -> Self {
        Self::Run(TaskEventRecord {
            id: Some(id),
            timing,
            event,
        })
    }

    /// A run-now request that could not be enqueued
    ///
    /// Accepted requests produce no event, so this only takes the error.
    pub fn run_request(id: TaskId, error: RunRequestError, timing: Option<TaskTiming>) -> Self {
        Self::RunRequest(TaskEventRecord {
            id: Some(id),
            timing,
            event: Err(error),
        })
    }

    /// A finished polling cycle
    pub fn polling_cycle(
        event: Result<ClaimAndFillPoolResult, PollingError<StoreError>>,
        timing: Option<TaskTiming>,
    ) -> Self {
        Self::PollingCycle(TaskEventRecord {
            id: None,
            timing,
            event,
        })
    }

    /// An aggregate statistic
    pub fn manager_stat(stat: TaskManagerStats, event: Result<f64, Infallible>) -> Self {
        Self::ManagerStat(TaskEventRecord {
            id: Some(stat),
            timing: None,
            event,
        })
    }

    /// The type tag of this event
    pub fn event_type(&self) -> TaskEventType {
        match self {
            Self::Claim(_) => TaskEventType::TaskClaim,
            Self::MarkRunning(_) => TaskEventType::TaskMarkRunning,
            Self::Run(_) => TaskEventType::TaskRun,
            Self::RunRequest(_) => TaskEventType::TaskRunRequest,
            Self::PollingCycle(_) => TaskEventType::TaskPollingCycle,
            Self::ManagerStat(_) => TaskEventType::TaskManagerStat,
        }
    }

    /// Task id for task-scoped events
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::Claim(e) => e.id,
            Self::MarkRunning(e) => e.id,
            Self::Run(e) => e.id,
            Self::RunRequest(e) => e.id,
            Self::PollingCycle(_) | Self::ManagerStat(_) => None,
        }
    }

    /// Timing, when the step was timed
    pub fn timing(&self) -> Option<&TaskTiming> {
        match self {
            Self::Claim(e) => e.timing.as_ref(),
            Self::MarkRunning(e) => e.timing.as_ref(),
            Self::Run(e) => e.timing.as_ref(),
            Self::RunRequest(e) => e.timing.as_ref(),
            Self::PollingCycle(e) => e.timing.as_ref(),
            Self::ManagerStat(e) => e.timing.as_ref(),
        }
    }

    /// Whether the event reports success
    pub fn is_ok(&self) -> bool {
        match self {
            Self::Claim(e) => e.event.is_ok(),
            Self::MarkRunning(e) => e.event.is_ok(),
            Self::Run(e) => e.event.is_ok(),
            Self::RunRequest(e) => e.event.is_ok(),
            Self::PollingCycle(e) => e.event.is_ok(),
            Self::ManagerStat(e) => e.event.is_ok(),
        }
    }

    pub fn as_claim(&self) -> Option<&TaskClaim> {
        match self {
            Self::Claim(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_mark_running(&self) -> Option<&TaskMarkRunning> {
        match self {
            Self::MarkRunning(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_run(&self) -> Option<&TaskRun> {
        match self {
            Self::Run(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_run_request(&self) -> Option<&TaskRunRequest> {
        match self {
            Self::RunRequest(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_polling_cycle(&self) -> Option<&TaskPollingCycle> {
        match self {
            Self::PollingCycle(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_manager_stat(&self) -> Option<&TaskManagerStat> {
        match self {
            Self::ManagerStat(e) => Some(e),
            _ => None,
        }
    }
}
