//! Polling cycle outcomes

use serde::{Deserialize, Serialize};

use crate::task::TaskInstance;

/// Summary of how a cycle filled the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPoolResult {
    /// Nothing was claimed and nothing was left behind
    NoTasksClaimed,

    /// Eligible tasks were left unclaimed for lack of capacity
    RanOutOfCapacity,

    /// Every eligible task the cycle saw was claimed
    PoolFilled,
}

/// Per-cycle claim counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimStats {
    pub claimed: usize,

    /// Candidates another node claimed first
    pub conflicted: usize,

    /// Candidates whose claim failed for any other reason
    pub errored: usize,
}

/// Pool occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUtilization {
    pub in_use: usize,
    pub capacity: usize,
}

impl PoolUtilization {
    /// Fraction of capacity in use, 0.0 for an empty pool
    pub fn load(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.in_use as f64 / self.capacity as f64
        }
    }
}

/// Outcome of a successful polling cycle
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimAndFillPoolResult {
    pub result: FillPoolResult,

    /// Tasks claimed and handed to the pool, in claim order
    pub claimed_tasks: Vec<TaskInstance>,

    /// Eligible tasks not claimed because the pool had no room
    pub tasks_left_unclaimed: usize,

    pub stats: ClaimStats,

    /// Taken after the pool was filled
    pub pool: PoolUtilization,
}

impl ClaimAndFillPoolResult {
    pub(crate) fn new(
        claimed_tasks: Vec<TaskInstance>,
        tasks_left_unclaimed: usize,
        stats: ClaimStats,
        pool: PoolUtilization,
    ) -> Self {
        let result = if tasks_left_unclaimed > 0 {
            FillPoolResult::RanOutOfCapacity
        } else if claimed_tasks.is_empty() {
            FillPoolResult::NoTasksClaimed
        } else {
            FillPoolResult::PoolFilled
        };
        Self {
            result,
            claimed_tasks,
            tasks_left_unclaimed,
            stats,
            pool,
        }
    }
}

/// A polling cycle that claimed nothing
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PollingError<T> {
    /// The pool had no free slot, the store was not contacted
    #[error("worker pool has no free capacity")]
    RequestCapacityReached,

    /// Reading claim candidates failed
    #[error("failed to fetch claimable tasks: {0}")]
    PoolFillRequestFailed(T),

    /// Any other failure while filling the pool
    #[error("polling cycle failed: {0}")]
    WorkError(T),
}

impl<T> PollingError<T> {
    /// Whether the cycle was skipped for lack of capacity rather than a failure
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::RequestCapacityReached)
    }
}
