//! # Tasklane Task Manager
//!
//! The scheduling core of a tasklane node. Many nodes poll one shared task
//! store, claim due tasks under optimistic concurrency control, run them in a
//! bounded worker pool and publish a typed event stream describing every step.
//!
//! ## Features
//!
//! - **Lock-free claiming**: every store mutation is a compare-and-swap on the task version
//! - **Bounded execution**: a cycle never claims more tasks than the pool has free slots
//! - **Crash recovery**: claimed or running tasks become claimable again once their lease expires
//! - **Typed events**: claim, mark-running, run, run-request, polling-cycle and stat events
//! - **Never-overlapping cycles**: timer ticks and run-now requests coalesce into one in-flight cycle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskManager                           │
//! │  (start / shutdown / run-now requests / event subscription)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PollingCycleDriver                        │
//! │   TaskClaimer ──► WorkerPool ──► TaskRunner (per task)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         TaskStore                            │
//! │     (list due, CAS claim, CAS mark running, CAS complete)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use tasklane_manager::prelude::*;
//!
//! let mut registry = TaskTypeRegistry::new();
//! registry.register("send_report", |task| async move {
//!     let report: Report = serde_json::from_value(task.params)?;
//!     // ... do the work
//!     Ok(HandlerOutput::done())
//! });
//!
//! let config = ManagerConfig::new(Duration::from_secs(300)).with_max_workers(20);
//! let manager = TaskManager::new(store, config, registry)?;
//!
//! let mut events = manager.subscribe();
//! manager.start().await?;
//!
//! // ... later, graceful shutdown
//! manager.shutdown().await?;
//! ```

pub mod config;
pub mod events;
pub mod manager;
pub mod persistence;
pub mod result;
pub mod stats;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{ConfigError, ManagerConfig};
    pub use crate::events::{
        start_task_timer, EventEmitter, EventSubscription, TaskEvent, TaskEventType, TaskTiming,
    };
    pub use crate::manager::{ManagerError, ManagerStatus, TaskManager};
    pub use crate::persistence::{
        CompletionOutcome, InMemoryTaskStore, NewTask, PostgresTaskStore, StoreError, TaskStore,
    };
    pub use crate::result::{OptionExt, ResultExt};
    pub use crate::task::{
        HandlerError, HandlerOutput, TaskId, TaskInstance, TaskRunResult, TaskStatus,
        TaskTypeRegistry,
    };
    pub use crate::worker::{ClaimAndFillPoolResult, PollingError, WorkerPool};
}

// Re-export key types at crate root
pub use config::{ConfigError, ManagerConfig};
pub use events::{EventEmitter, EventSubscription, TaskEvent, TaskEventType, TaskTiming};
pub use manager::{ManagerError, ManagerStatus, TaskManager};
pub use persistence::{
    CompletionOutcome, InMemoryTaskStore, NewTask, PostgresTaskStore, StoreError, TaskStore,
};
pub use task::{HandlerError, HandlerOutput, TaskId, TaskInstance, TaskTypeRegistry};
pub use worker::{ClaimAndFillPoolResult, PollingError, WorkerPool};
