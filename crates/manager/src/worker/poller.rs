//! Polling cycle driver
//!
//! One cycle reads the pool's free capacity, claims at most that many due
//! tasks and spawns a runner for each. Cycles never overlap: a cycle asked
//! for while another is in flight is skipped, and run-now requests that
//! arrive during a cycle collapse into one follow-up cycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::{ClaimAndFillPoolResult, PollingError, TaskClaimer, TaskRunner, WorkerPool};
use crate::config::ManagerConfig;
use crate::events::{start_task_timer, EventEmitter, TaskEvent};
use crate::persistence::{StoreError, TaskStore};
use crate::task::{TaskId, TaskTypeRegistry};

/// Marks a cycle in flight until dropped
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives polling cycles for one node
pub struct PollingCycleDriver {
    claimer: TaskClaimer,
    runner: TaskRunner,
    pool: WorkerPool,
    registry: Arc<TaskTypeRegistry>,
    emitter: EventEmitter,
    tracker: TaskTracker,
    in_flight: AtomicBool,
    poll_interval: Duration,
    poll_jitter: Duration,
}

impl PollingCycleDriver {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        emitter: EventEmitter,
        config: &ManagerConfig,
    ) -> Self {
        let claimer = TaskClaimer::new(
            store.clone(),
            registry.clone(),
            emitter.clone(),
            config.node_id.clone(),
            config.running_timeout,
        );
        let runner = TaskRunner::new(
            store,
            emitter.clone(),
            config.running_timeout,
            config.max_attempts,
        );
        Self {
            claimer,
            runner,
            pool: WorkerPool::new(config.max_workers),
            registry,
            emitter,
            tracker: TaskTracker::new(),
            in_flight: AtomicBool::new(false),
            poll_interval: config.poll_interval,
            poll_jitter: config.poll_jitter,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Whether a cycle is running right now
    pub fn is_cycle_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of spawned runners that have not finished
    pub fn running_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Run one cycle unless another is in flight
    ///
    /// Returns `None` when skipped. Otherwise emits POLLING_CYCLE and returns
    /// its outcome.
    #[instrument(skip(self), fields(owner_id = %self.claimer.owner_id()))]
    pub async fn run_cycle(
        &self,
    ) -> Option<Result<ClaimAndFillPoolResult, PollingError<StoreError>>> {
        let Some(_guard) = CycleGuard::acquire(&self.in_flight) else {
            debug!("polling cycle already in flight, skipping");
            return None;
        };

        let stop = start_task_timer();
        let result = self.fill_pool().await;
        let timing = stop();

        match &result {
            Ok(filled) => debug!(
                result = ?filled.result,
                claimed = filled.claimed_tasks.len(),
                left_unclaimed = filled.tasks_left_unclaimed,
                in_use = filled.pool.in_use,
                "polling cycle finished"
            ),
            Err(e) if e.is_capacity() => debug!("worker pool full, nothing claimed"),
            Err(e) => warn!(error = %e, "polling cycle failed"),
        }

        self.emitter
            .emit(TaskEvent::polling_cycle(result.clone(), Some(timing)));
        Some(result)
    }

    async fn fill_pool(&self) -> Result<ClaimAndFillPoolResult, PollingError<StoreError>> {
        let batch = self
            .claimer
            .claim_available(Utc::now(), self.pool.available())
            .await?;

        let mut handed = Vec::with_capacity(batch.claimed.len());
        let mut left_unclaimed = batch.tasks_left_unclaimed;

        for task in batch.claimed {
            let slot = self.pool.try_acquire();
            let definition = self.registry.get(&task.task_type).cloned();

            let (Some(slot), Some(definition)) = (slot, definition) else {
                debug!(task_id = %task.id, "no slot for claimed task, releasing claim");
                if let Err(e) = self.claimer.release(&task).await {
                    warn!(task_id = %task.id, error = %e, "failed to release claim");
                }
                left_unclaimed += 1;
                continue;
            };

            handed.push(task.clone());
            let runner = self.runner.clone();
            self.tracker.spawn(async move {
                runner.run(task, definition, slot).await;
            });
        }

        Ok(ClaimAndFillPoolResult::new(
            handed,
            left_unclaimed,
            batch.stats,
            self.pool.utilization(),
        ))
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        self.poll_interval + Duration::from_millis(jitter)
    }

    /// Poll until `shutdown` flips to true or its sender is dropped
    ///
    /// Each wait lasts the poll interval plus a random jitter, cut short by
    /// a run request. Cycle errors are reported as events and never stop
    /// the loop.
    pub async fn run(
        &self,
        mut run_requests: mpsc::Receiver<TaskId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            owner_id = %self.claimer.owner_id(),
            capacity = self.pool.capacity(),
            "polling loop started"
        );
        let mut requests_open = true;

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {}
                request = run_requests.recv(), if requests_open => match request {
                    Some(task_id) => debug!(%task_id, "run requested"),
                    None => {
                        requests_open = false;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            }

            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;

            let mut coalesced = 0usize;
            while let Ok(task_id) = run_requests.try_recv() {
                debug!(%task_id, "run requested during cycle");
                coalesced += 1;
            }
            if coalesced > 0 {
                debug!(coalesced, "running follow-up cycle");
                self.run_cycle().await;
            }
        }

        info!(owner_id = %self.claimer.owner_id(), "polling loop stopped");
    }

    /// Wait until every spawned runner has finished
    pub async fn wait_for_running_tasks(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

impl std::fmt::Debug for PollingCycleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingCycleDriver")
            .field("claimer", &self.claimer)
            .field("pool", &self.pool)
            .field("poll_interval", &self.poll_interval)
            .field("poll_jitter", &self.poll_jitter)
            .finish_non_exhaustive()
    }
}
