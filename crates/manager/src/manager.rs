//! Task manager node
//!
//! [`TaskManager`] owns one node's polling loop, worker pool and event
//! channel, and exposes start, shutdown, run-now requests and event
//! subscriptions.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, ManagerConfig};
use crate::events::{EventEmitter, EventSubscription, TaskEvent};
use crate::persistence::{StoreError, TaskStore};
use crate::stats::StatsAggregator;
use crate::task::{TaskId, TaskTypeRegistry};
use crate::worker::{ClaimAndFillPoolResult, PollingCycleDriver, PollingError, PoolUtilization};

/// Lifecycle of a task manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagerStatus {
    Stopped,
    Running,
    Draining,
}

/// Task manager errors
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no task types registered")]
    NoTaskTypes,

    #[error("task manager is already running")]
    AlreadyRunning,

    /// Running tasks outlived the shutdown timeout
    #[error("graceful shutdown timed out with {0} task(s) still running")]
    ShutdownTimeout(usize),
}

/// A run-now request that could not be enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RunRequestError {
    #[error("run request queue is full")]
    QueueFull,

    #[error("task manager is not running")]
    Stopped,
}

/// Handles of a started polling loop
struct RunningLoop {
    shutdown_tx: watch::Sender<bool>,
    run_request_tx: mpsc::Sender<TaskId>,
    poll_handle: JoinHandle<()>,
    stats_handle: Option<JoinHandle<()>>,
}

/// One task manager node
///
/// # Example
///
/// ```ignore
/// use tasklane_manager::prelude::*;
///
/// let mut registry = TaskTypeRegistry::new();
/// registry.register("cleanup", |_task| async { Ok(HandlerOutput::done()) });
///
/// let config = ManagerConfig::new(Duration::from_secs(300));
/// let manager = TaskManager::new(store, config, registry)?;
///
/// let mut events = manager.subscribe();
/// manager.start().await?;
/// manager.request_run(task_id)?;
///
/// manager.shutdown().await?;
/// ```
pub struct TaskManager {
    config: ManagerConfig,
    driver: Arc<PollingCycleDriver>,
    emitter: EventEmitter,
    status: RwLock<ManagerStatus>,
    running: Mutex<Option<RunningLoop>>,
}

impl TaskManager {
    /// Create a stopped manager
    pub fn new(
        store: Arc<dyn TaskStore>,
        config: ManagerConfig,
        registry: TaskTypeRegistry,
    ) -> Result<Self, ManagerError> {
        config.validate()?;
        if registry.is_empty() {
            return Err(ManagerError::NoTaskTypes);
        }

        let emitter = EventEmitter::new();
        let driver = Arc::new(PollingCycleDriver::new(
            store,
            Arc::new(registry),
            emitter.clone(),
            &config,
        ));

        Ok(Self {
            config,
            driver,
            emitter,
            status: RwLock::new(ManagerStatus::Stopped),
            running: Mutex::new(None),
        })
    }

    /// Start polling
    #[instrument(skip(self), fields(node_id = %self.config.node_id))]
    pub async fn start(&self) -> Result<(), ManagerError> {
        {
            let mut status = self.status.write();
            if *status != ManagerStatus::Stopped {
                return Err(ManagerError::AlreadyRunning);
            }
            *status = ManagerStatus::Running;
        }

        info!(
            node_id = %self.config.node_id,
            max_workers = self.config.max_workers,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Starting task manager"
        );

        let stats_handle = self.config.stats_enabled.then(|| {
            let aggregator = StatsAggregator::new(self.config.poll_interval);
            tokio::spawn(aggregator.run(self.emitter.subscribe(), self.emitter.clone()))
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (run_request_tx, run_request_rx) = mpsc::channel(self.config.run_request_buffer);
        let driver = Arc::clone(&self.driver);
        let poll_handle =
            tokio::spawn(async move { driver.run(run_request_rx, shutdown_rx).await });

        *self.running.lock() = Some(RunningLoop {
            shutdown_tx,
            run_request_tx,
            poll_handle,
            stats_handle,
        });
        Ok(())
    }

    /// Stop polling and wait for running tasks
    ///
    /// Waits at most the configured shutdown timeout for running tasks. The
    /// manager is stopped afterwards either way.
    #[instrument(skip(self), fields(node_id = %self.config.node_id))]
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let running = {
            let mut status = self.status.write();
            if *status != ManagerStatus::Running {
                return Ok(());
            }
            *status = ManagerStatus::Draining;
            self.running.lock().take()
        };

        info!(node_id = %self.config.node_id, "Initiating graceful shutdown");

        if let Some(running) = running {
            let _ = running.shutdown_tx.send(true);
            drop(running.run_request_tx);
            if let Err(e) = running.poll_handle.await {
                warn!(error = %e, "polling loop ended abnormally");
            }
            if let Some(stats) = running.stats_handle {
                stats.abort();
            }
        }

        let drained = tokio::time::timeout(
            self.config.shutdown_timeout,
            self.driver.wait_for_running_tasks(),
        )
        .await;
        *self.status.write() = ManagerStatus::Stopped;

        match drained {
            Ok(()) => {
                info!(node_id = %self.config.node_id, "Task manager stopped");
                Ok(())
            }
            Err(_) => {
                let remaining = self.driver.running_tasks();
                warn!(remaining_tasks = remaining, "Shutdown timeout reached");
                Err(ManagerError::ShutdownTimeout(remaining))
            }
        }
    }

    /// Ask for a polling cycle as soon as possible
    ///
    /// Requests arriving while a cycle is in flight collapse into a single
    /// follow-up cycle. A request that cannot be enqueued emits a
    /// RUN_REQUEST event and returns the error.
    pub fn request_run(&self, task_id: TaskId) -> Result<(), RunRequestError> {
        let sent = match (self.status(), self.running.lock().as_ref()) {
            (ManagerStatus::Running, Some(running)) => {
                running.run_request_tx.try_send(task_id).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => RunRequestError::QueueFull,
                    mpsc::error::TrySendError::Closed(_) => RunRequestError::Stopped,
                })
            }
            _ => Err(RunRequestError::Stopped),
        };

        match sent {
            Ok(()) => {
                debug!(%task_id, "run request enqueued");
                Ok(())
            }
            Err(e) => {
                warn!(%task_id, error = %e, "run request rejected");
                self.emitter.emit(TaskEvent::run_request(task_id, e, None));
                Err(e)
            }
        }
    }

    /// Run one polling cycle now, `None` if a cycle is already in flight
    pub async fn poll_now(
        &self,
    ) -> Option<Result<ClaimAndFillPoolResult, PollingError<StoreError>>> {
        self.driver.run_cycle().await
    }

    /// Wait until every task handed to the pool has finished
    pub async fn wait_for_running_tasks(&self) {
        self.driver.wait_for_running_tasks().await;
    }

    /// Subscribe to this node's events
    pub fn subscribe(&self) -> EventSubscription {
        self.emitter.subscribe()
    }

    pub fn status(&self) -> ManagerStatus {
        *self.status.read()
    }

    pub fn pool_utilization(&self) -> PoolUtilization {
        self.driver.pool().utilization()
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("node_id", &self.config.node_id)
            .field("status", &self.status())
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}
