//! Handler registry keyed by task type
//!
//! Handlers are type-erased async closures. The registry also carries the
//! per-type overrides for the running timeout and the attempt limit.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::TaskInstance;

/// What a successful handler run asks the store to do next
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// Next run of a recurring task; `None` removes the task
    pub run_at: Option<DateTime<Utc>>,

    /// Replacement for the task state, kept as-is when `None`
    pub state: Option<serde_json::Value>,
}

impl HandlerOutput {
    /// One-shot task finished
    pub fn done() -> Self {
        Self::default()
    }

    /// Recurring task finished, run again at `run_at`
    pub fn reschedule(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            state: None,
        }
    }

    /// Replace the stored task state
    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = Some(state);
        self
    }
}

/// A failed handler run
///
/// The handler decides the back-off: `retry_at` is honoured as-is, and a
/// retryable error without one becomes eligible again on the next cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub retry_at: Option<DateTime<Utc>>,
    pub retryable: bool,
}

impl HandlerError {
    /// Retryable failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_at: None,
            retryable: true,
        }
    }

    /// Failure that must not be retried
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_at: None,
            retryable: false,
        }
    }

    /// Retry no earlier than `retry_at`
    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::permanent(format!("invalid task params: {e}"))
    }
}

/// Handler execution result
pub type HandlerResult = Result<HandlerOutput, HandlerError>;

/// Handler function type
pub type TaskHandler = Arc<
    dyn Fn(TaskInstance) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync,
>;

/// A registered task type
#[derive(Clone)]
pub struct TaskDefinition {
    pub task_type: String,
    pub handler: TaskHandler,

    /// Overrides the configured running timeout
    pub timeout: Option<Duration>,

    /// Overrides the configured attempt limit
    pub max_attempts: Option<u32>,
}

impl TaskDefinition {
    /// Create a definition from an async handler
    pub fn new<F, Fut>(task_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |task| Box::pin(handler(task)));
        Self {
            task_type: task_type.into(),
            handler,
            timeout: None,
            max_attempts: None,
        }
    }

    /// Set the running timeout for this task type
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the attempt limit for this task type
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_type", &self.task_type)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Registry of task definitions
///
/// # Example
///
/// ```
/// use tasklane_manager::task::{HandlerOutput, TaskTypeRegistry};
///
/// let mut registry = TaskTypeRegistry::new();
/// registry.register("cleanup", |_task| async { Ok(HandlerOutput::done()) });
///
/// assert!(registry.contains("cleanup"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TaskTypeRegistry {
    definitions: HashMap<String, TaskDefinition>,
}

impl TaskTypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler with default timeout and attempt limit
    pub fn register<F, Fut>(&mut self, task_type: &str, handler: F) -> &mut Self
    where
        F: Fn(TaskInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_definition(TaskDefinition::new(task_type, handler))
    }

    /// Register a full definition, replacing any previous one for the type
    pub fn register_definition(&mut self, definition: TaskDefinition) -> &mut Self {
        self.definitions
            .insert(definition.task_type.clone(), definition);
        self
    }

    /// Look up a definition
    pub fn get(&self, task_type: &str) -> Option<&TaskDefinition> {
        self.definitions.get(task_type)
    }

    /// Check if a task type is registered
    pub fn contains(&self, task_type: &str) -> bool {
        self.definitions.contains_key(task_type)
    }

    /// Registered task types, sorted
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.definitions.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get the number of registered types
    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::test_task;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TaskTypeRegistry::new();
        registry
            .register("b_type", |_| async { Ok(HandlerOutput::done()) })
            .register_definition(
                TaskDefinition::new("a_type", |_| async { Ok(HandlerOutput::done()) })
                    .with_timeout(Duration::from_secs(30))
                    .with_max_attempts(0),
            );

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.task_types(), vec!["a_type", "b_type"]);

        let a = registry.get("a_type").unwrap();
        assert_eq!(a.timeout, Some(Duration::from_secs(30)));
        assert_eq!(a.max_attempts, Some(1));
        assert!(registry.get("c_type").is_none());
    }

    #[tokio::test]
    async fn test_handler_receives_task() {
        let mut registry = TaskTypeRegistry::new();
        registry.register("echo", |task| async move {
            Ok(HandlerOutput::done().with_state(task.params))
        });

        let mut task = test_task("echo", Utc::now());
        task.params = serde_json::json!({"n": 1});

        let handler = registry.get("echo").unwrap().handler.clone();
        let output = handler(task).await.unwrap();
        assert_eq!(output.state, Some(serde_json::json!({"n": 1})));
        assert_eq!(output.run_at, None);
    }

    #[test]
    fn test_handler_error_builders() {
        let at = Utc::now();
        let retry = HandlerError::new("flaky").with_retry_at(at);
        assert!(retry.retryable);
        assert_eq!(retry.retry_at, Some(at));
        assert_eq!(retry.to_string(), "flaky");

        let permanent = HandlerError::permanent("bad input");
        assert!(!permanent.retryable);

        let parse: HandlerError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(!parse.retryable);
    }
}
