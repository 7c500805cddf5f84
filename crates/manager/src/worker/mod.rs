//! Claiming and running tasks
//!
//! This module provides:
//! - [`TaskClaimer`] - claims due tasks from the store under version checks
//! - [`WorkerPool`] - bounded, node-local execution slots
//! - [`TaskRunner`] - marks a claimed task running, runs its handler, reports the outcome
//! - [`PollingCycleDriver`] - the single in-flight polling loop tying them together
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   PollingCycleDriver                         │
//! │   timer (interval + jitter) ──┐                              │
//! │   run-now requests ───────────┼──► run_cycle (one in flight) │
//! │                               │                              │
//! │         ┌─────────────────────▼───────────────────────┐      │
//! │         │ TaskClaimer: list due → CAS claim each      │      │
//! │         └─────────────────────┬───────────────────────┘      │
//! │                               ▼                              │
//! │         ┌─────────────────────────────────────────────┐      │
//! │         │ WorkerPool: one PoolSlot per claimed task   │      │
//! │         └─────────────────────┬───────────────────────┘      │
//! │                               ▼                              │
//! │   [TaskRunner] [TaskRunner] ... (spawned, slot released)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod claimer;
mod fill_pool;
mod poller;
mod pool;
mod runner;

pub use claimer::{ClaimBatch, TaskClaimer};
pub use fill_pool::{
    ClaimAndFillPoolResult, ClaimStats, FillPoolResult, PollingError, PoolUtilization,
};
pub use poller::PollingCycleDriver;
pub use pool::{PoolSlot, WorkerPool};
pub use runner::{ErroredTask, RanTask, RunAttempt, TaskRunError, TaskRunner};
