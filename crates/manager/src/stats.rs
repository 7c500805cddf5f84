//! Aggregate statistics derived from the event stream
//!
//! The aggregator only consumes events. It turns every POLLING_CYCLE event
//! into MANAGER_STAT events:
//!
//! - `load`: pool slots in use over capacity, taken when the cycle finished
//!   filling the pool. A cycle skipped because the pool was full reports 1.0;
//!   failed cycles report nothing.
//! - `polling_delay`: milliseconds between the starts of consecutive cycles,
//!   minus the configured poll interval.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::events::{EventEmitter, EventSubscription, TaskEvent, TaskManagerStats};
use crate::worker::PollingError;

/// Folds polling cycle events into load and delay statistics
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    poll_interval: Duration,
    last_cycle_start: Option<DateTime<Utc>>,
}

impl StatsAggregator {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            last_cycle_start: None,
        }
    }

    /// Stats produced by one event, in emission order
    pub fn observe(&mut self, event: &TaskEvent) -> Vec<TaskEvent> {
        match event {
            TaskEvent::PollingCycle(cycle) => {
                let mut stats = Vec::with_capacity(2);

                let load = match &cycle.event {
                    Ok(filled) => Some(filled.pool.load()),
                    Err(PollingError::RequestCapacityReached) => Some(1.0),
                    Err(PollingError::PoolFillRequestFailed(_) | PollingError::WorkError(_)) => {
                        None
                    }
                };
                if let Some(load) = load {
                    stats.push(TaskEvent::manager_stat(TaskManagerStats::Load, Ok(load)));
                }

                if let Some(timing) = &cycle.timing {
                    if let Some(previous) = self.last_cycle_start.replace(timing.start) {
                        let elapsed_ms = (timing.start - previous).num_milliseconds() as f64;
                        let delay_ms = elapsed_ms - self.poll_interval.as_millis() as f64;
                        stats.push(TaskEvent::manager_stat(
                            TaskManagerStats::PollingDelay,
                            Ok(delay_ms),
                        ));
                    }
                }

                stats
            }
            TaskEvent::Claim(_)
            | TaskEvent::MarkRunning(_)
            | TaskEvent::Run(_)
            | TaskEvent::RunRequest(_)
            | TaskEvent::ManagerStat(_) => Vec::new(),
        }
    }

    /// Republish stats until the subscription closes
    pub async fn run(mut self, mut subscription: EventSubscription, emitter: EventEmitter) {
        debug!("stats aggregator started");
        while let Some(event) = subscription.recv().await {
            for stat in self.observe(&event) {
                emitter.emit(stat);
            }
        }
        debug!("stats aggregator stopped");
    }
}
