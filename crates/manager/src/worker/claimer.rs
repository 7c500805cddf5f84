//! Claiming due tasks
//!
//! Claims are plain compare-and-swap updates on the version read by
//! `list_due`. Losing a race to another node is normal and only costs the
//! candidate; it never fails the cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::{ClaimStats, PollingError};
use crate::events::{start_task_timer, EventEmitter, TaskEvent};
use crate::persistence::{StoreError, TaskStore};
use crate::result::OptionExt;
use crate::task::{deadline, TaskInstance, TaskTypeRegistry};

/// Tasks claimed by one call to [`TaskClaimer::claim_available`]
#[derive(Debug, Clone, Default)]
pub struct ClaimBatch {
    /// Claimed tasks in claim order, each at its post-claim version
    pub claimed: Vec<TaskInstance>,

    /// Due tasks beyond the batch size
    pub tasks_left_unclaimed: usize,

    pub stats: ClaimStats,
}

/// Claims due tasks on behalf of one node
pub struct TaskClaimer {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskTypeRegistry>,
    emitter: EventEmitter,
    owner_id: String,
    running_timeout: Duration,
    task_types: Vec<String>,
}

impl TaskClaimer {
    /// Create a claimer for the task types in `registry`
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskTypeRegistry>,
        emitter: EventEmitter,
        owner_id: impl Into<String>,
        running_timeout: Duration,
    ) -> Self {
        let task_types = registry.task_types();
        Self {
            store,
            registry,
            emitter,
            owner_id: owner_id.into(),
            running_timeout,
            task_types,
        }
    }

    /// Node id written as the owner of claimed tasks
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Lease length for a task, the type's timeout or the configured one
    pub fn lease_timeout(&self, task_type: &str) -> Duration {
        self.registry
            .get(task_type)
            .and_then(|definition| definition.timeout)
            .get_or_else(|| self.running_timeout)
    }

    /// Claim up to `batch_size` due tasks
    ///
    /// Emits one CLAIM event per candidate. Fails only when the pool has no
    /// room or the candidates cannot be read; in both cases nothing is
    /// claimed.
    #[instrument(skip(self), fields(owner_id = %self.owner_id))]
    pub async fn claim_available(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<ClaimBatch, PollingError<StoreError>> {
        if batch_size == 0 {
            return Err(PollingError::RequestCapacityReached);
        }

        let candidates = self
            .store
            .list_due(now, batch_size, &self.task_types)
            .await
            .map_err(PollingError::PoolFillRequestFailed)?;

        let tasks_left_unclaimed = if candidates.len() < batch_size {
            0
        } else {
            self.store
                .count_due(now, &self.task_types)
                .await
                .map_err(PollingError::WorkError)?
                .saturating_sub(candidates.len())
        };

        let mut batch = ClaimBatch {
            claimed: Vec::with_capacity(candidates.len()),
            tasks_left_unclaimed,
            stats: ClaimStats::default(),
        };

        for candidate in candidates {
            self.claim_one(candidate, now, &mut batch).await;
        }

        debug!(
            claimed = batch.stats.claimed,
            conflicted = batch.stats.conflicted,
            errored = batch.stats.errored,
            left_unclaimed = batch.tasks_left_unclaimed,
            "claim pass finished"
        );
        Ok(batch)
    }

    /// Hand a claimed task back to idle without running it
    pub async fn release(&self, task: &TaskInstance) -> Result<TaskInstance, StoreError> {
        self.store.release(task.id, task.version).await
    }

    async fn claim_one(
        &self,
        candidate: TaskInstance,
        now: DateTime<Utc>,
        batch: &mut ClaimBatch,
    ) {
        let lease = deadline(now, self.lease_timeout(&candidate.task_type));
        let stop = start_task_timer();
        let result = self
            .store
            .try_claim(candidate.id, candidate.version, &self.owner_id, now, lease)
            .await;
        let timing = stop();

        let event = match result {
            Ok(task) => {
                batch.stats.claimed += 1;
                batch.claimed.push(task.clone());
                Ok(task)
            }
            Err(StoreError::TaskNotFound(_)) => {
                debug!(task_id = %candidate.id, "claim candidate vanished");
                batch.stats.conflicted += 1;
                Err(None)
            }
            Err(e) if e.is_conflict() => {
                debug!(task_id = %candidate.id, "claim lost to another node");
                batch.stats.conflicted += 1;
                Err(Some(candidate.clone()))
            }
            Err(e) => {
                warn!(task_id = %candidate.id, error = %e, "failed to claim task");
                batch.stats.errored += 1;
                Err(Some(candidate.clone()))
            }
        };

        self.emitter
            .emit(TaskEvent::claim(candidate.id, event, Some(timing)));
    }
}

impl std::fmt::Debug for TaskClaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClaimer")
            .field("owner_id", &self.owner_id)
            .field("running_timeout", &self.running_timeout)
            .field("task_types", &self.task_types)
            .finish_non_exhaustive()
    }
}
