//! Built-in task handlers

use chrono::Utc;
use serde::Deserialize;
use tasklane_manager::task::{HandlerOutput, TaskTypeRegistry};
use tasklane_manager::TaskInstance;
use tracing::info;

#[derive(Debug, Deserialize)]
struct LogParams {
    message: Option<String>,

    /// Repeat every `every_ms` milliseconds; one-shot when absent
    every_ms: Option<u64>,
}

/// Handlers this node runs
pub fn registry() -> TaskTypeRegistry {
    let mut registry = TaskTypeRegistry::new();
    registry.register("log", |task| async move { log_message(task) });
    registry
}

/// Log the task's message, rescheduling when it repeats
fn log_message(task: TaskInstance) -> tasklane_manager::task::HandlerResult {
    let params: LogParams = serde_json::from_value(task.params)?;
    let runs = task.state.get("runs").and_then(|v| v.as_u64()).unwrap_or(0) + 1;

    info!(
        task_id = %task.id,
        runs,
        message = params.message.as_deref().unwrap_or(""),
        "log task"
    );

    let state = serde_json::json!({ "runs": runs });
    Ok(match params.every_ms {
        Some(every_ms) => {
            HandlerOutput::reschedule(Utc::now() + chrono::Duration::milliseconds(every_ms as i64))
                .with_state(state)
        }
        None => HandlerOutput::done().with_state(state),
    })
}
