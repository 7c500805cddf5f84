//! Event timing

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Start and stop instants of a timed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTiming {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl TaskTiming {
    /// Elapsed time between start and stop
    pub fn duration(&self) -> chrono::Duration {
        self.stop - self.start
    }
}

/// Start a timer; calling the returned closure stops it
///
/// The stop instant is the wall-clock start plus the monotonic elapsed time,
/// so `stop >= start` holds even if the system clock steps backwards.
///
/// # Example
///
/// ```
/// use tasklane_manager::events::start_task_timer;
///
/// let stop = start_task_timer();
/// let timing = stop();
/// assert!(timing.stop >= timing.start);
/// ```
pub fn start_task_timer() -> impl FnOnce() -> TaskTiming {
    let start = Utc::now();
    let started = Instant::now();
    move || {
        let elapsed = chrono::Duration::from_std(started.elapsed()).unwrap_or_default();
        TaskTiming {
            start,
            stop: start.checked_add_signed(elapsed).unwrap_or(start),
        }
    }
}
