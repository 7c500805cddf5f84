//! Running one claimed task
//!
//! A run is three store steps around the handler call: mark running, run,
//! complete. Every step is checked against the version the previous step
//! produced, so a report from a node whose lease expired is rejected.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, instrument, warn};

use super::PoolSlot;
use crate::events::{start_task_timer, EventEmitter, TaskEvent};
use crate::persistence::{CompletionOutcome, StoreError, TaskStore};
use crate::result::ResultExt;
use crate::task::{
    deadline, HandlerError, HandlerOutput, TaskDefinition, TaskInstance, TaskRunResult,
};

/// Why a run did not succeed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TaskRunError {
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// Recording the outcome failed, usually because the task was reclaimed
    #[error("failed to record run outcome: {0}")]
    Store(StoreError),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// A run whose outcome was recorded
#[derive(Debug, Clone, PartialEq)]
pub struct RanTask {
    /// The task as marked running
    pub task: TaskInstance,
    pub result: TaskRunResult,
}

/// A run that failed or whose outcome could not be recorded
#[derive(Debug, Clone, PartialEq)]
pub struct ErroredTask {
    /// The task as marked running
    pub task: TaskInstance,

    /// The outcome the runner tried to record
    ///
    /// With [`TaskRunError::Store`] this outcome was never written; the
    /// stored task reflects whatever the store last accepted. Check
    /// [`ErroredTask::is_recorded`] before treating it as stored state.
    pub result: TaskRunResult,
    pub error: TaskRunError,
}

impl ErroredTask {
    /// Whether `result` was written to the store
    pub fn is_recorded(&self) -> bool {
        !matches!(self.error, TaskRunError::Store(_))
    }
}

/// What happened to a claimed task handed to the runner
#[derive(Debug, Clone, PartialEq)]
pub enum RunAttempt {
    /// Marking the task running failed; the handler never ran
    NotStarted(StoreError),

    /// The handler ran
    Ran(Result<RanTask, ErroredTask>),
}

/// Executes claimed tasks
#[derive(Clone)]
pub struct TaskRunner {
    store: Arc<dyn TaskStore>,
    emitter: EventEmitter,
    running_timeout: Duration,
    max_attempts: u32,
}

impl TaskRunner {
    pub fn new(
        store: Arc<dyn TaskStore>,
        emitter: EventEmitter,
        running_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            emitter,
            running_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run a claimed task, holding `slot` until the run is over
    ///
    /// Emits MARK_RUNNING and, if the handler ran, RUN.
    #[instrument(skip_all, fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn run(
        &self,
        task: TaskInstance,
        definition: TaskDefinition,
        slot: PoolSlot,
    ) -> RunAttempt {
        let attempt = match self.mark_running(&task, &definition).await {
            Ok(running) => RunAttempt::Ran(self.execute(running, &definition).await),
            Err(e) => {
                self.release_claim(&task).await;
                RunAttempt::NotStarted(e)
            }
        };
        slot.release();
        attempt
    }

    async fn mark_running(
        &self,
        task: &TaskInstance,
        definition: &TaskDefinition,
    ) -> Result<TaskInstance, StoreError> {
        let now = Utc::now();
        let lease = deadline(now, definition.timeout.unwrap_or(self.running_timeout));

        let stop = start_task_timer();
        let result = self
            .store
            .try_mark_running(task.id, task.version, now, lease)
            .await;
        self.emitter
            .emit(TaskEvent::mark_running(task.id, result.clone(), Some(stop())));

        if let Err(e) = &result {
            warn!(error = %e, "failed to mark task running");
        }
        result
    }

    /// Give the claim back so another cycle can pick the task up
    async fn release_claim(&self, task: &TaskInstance) {
        match self.store.release(task.id, task.version).await {
            Ok(_) => debug!("claim released"),
            Err(e) => debug!(error = %e, "claim not released"),
        }
    }

    async fn execute(
        &self,
        running: TaskInstance,
        definition: &TaskDefinition,
    ) -> Result<RanTask, ErroredTask> {
        let stop = start_task_timer();

        let handler = definition.handler.clone();
        let input = running.clone();
        let handled = match AssertUnwindSafe(async move { handler(input).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(TaskRunError::Handler(e)),
            Err(payload) => Err(TaskRunError::Panicked(panic_message(payload))),
        };

        let max_attempts = definition.max_attempts.unwrap_or(self.max_attempts);
        let (outcome, result) = completion(&running, &handled, max_attempts);

        let completed = self
            .store
            .complete(running.id, running.version, outcome)
            .await;

        let event = match (completed, handled) {
            (Ok(()), Ok(_)) => {
                info!(?result, "task finished");
                Ok(RanTask {
                    task: running,
                    result,
                })
            }
            (Ok(()), Err(error)) => {
                warn!(?result, attempts = running.attempts, error = %error, "task failed");
                Err(ErroredTask {
                    task: running,
                    result,
                    error,
                })
            }
            (Err(e), handled) => {
                if let Err(error) = &handled {
                    debug!(error = %error, "handler error superseded by store error");
                }
                if e.is_conflict() {
                    warn!(error = %e, "task was reclaimed, discarding stale run report");
                } else {
                    warn!(error = %e, "failed to record run outcome");
                }
                Err(ErroredTask {
                    task: running,
                    result,
                    error: TaskRunError::Store(e),
                })
            }
        };

        let id = event.fold_ref(|ran| ran.task.id, |errored| errored.task.id);
        self.emitter.emit(TaskEvent::run(id, event.clone(), Some(stop())));
        event
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("running_timeout", &self.running_timeout)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Store outcome for a finished handler run
fn completion(
    running: &TaskInstance,
    handled: &Result<HandlerOutput, TaskRunError>,
    max_attempts: u32,
) -> (CompletionOutcome, TaskRunResult) {
    match handled {
        Ok(HandlerOutput {
            run_at: Some(run_at),
            state,
        }) => (
            CompletionOutcome::Reschedule {
                run_at: *run_at,
                state: state.clone(),
            },
            TaskRunResult::SuccessRescheduled,
        ),
        Ok(HandlerOutput { run_at: None, .. }) => {
            (CompletionOutcome::Remove, TaskRunResult::Success)
        }
        Err(error) => {
            let (retryable, retry_at) = match error {
                TaskRunError::Handler(e) => (e.retryable, e.retry_at),
                TaskRunError::Panicked(_) => (true, None),
                TaskRunError::Store(_) => (false, None),
            };
            if retryable && running.attempts < max_attempts {
                (
                    CompletionOutcome::Retry {
                        retry_at: retry_at.unwrap_or_else(Utc::now),
                        error: error.to_string(),
                    },
                    TaskRunResult::RetryScheduled,
                )
            } else {
                (
                    CompletionOutcome::Fail {
                        error: error.to_string(),
                    },
                    TaskRunResult::Failed,
                )
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
