//! Bounded worker pool
//!
//! A node runs at most `capacity` tasks at once. Each running task owns a
//! [`PoolSlot`]; the slot goes back to the pool when it is released or
//! dropped, so every exit path of a run frees its capacity exactly once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::PoolUtilization;

#[derive(Debug, Default)]
struct SlotCounters {
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Node-local pool of execution slots
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<SlotCounters>,
}

impl WorkerPool {
    /// Create a pool with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(SlotCounters::default()),
        }
    }

    /// Take a free slot without waiting
    pub fn try_acquire(&self) -> Option<PoolSlot> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        Some(PoolSlot {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    /// Total slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free slots
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Slots held by running tasks
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }

    /// Current occupancy
    pub fn utilization(&self) -> PoolUtilization {
        PoolUtilization {
            in_use: self.in_use(),
            capacity: self.capacity,
        }
    }

    /// Slots handed out since the pool was created
    pub fn acquired_total(&self) -> u64 {
        self.counters.acquired.load(Ordering::Relaxed)
    }

    /// Slots returned since the pool was created
    pub fn released_total(&self) -> u64 {
        self.counters.released.load(Ordering::Relaxed)
    }
}

/// One execution slot, returned to the pool on release or drop
#[derive(Debug)]
#[must_use = "dropping a slot returns it to the pool immediately"]
pub struct PoolSlot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<SlotCounters>,
}

impl PoolSlot {
    /// Return the slot to the pool
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.counters.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_full() {
        let pool = WorkerPool::new(2);
        let a = pool.try_acquire().unwrap();
        let b = pool.try_acquire().unwrap();

        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.utilization().load(), 1.0);

        a.release();
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_counters_balance() {
        let pool = WorkerPool::new(3);
        for _ in 0..10 {
            let slot = pool.try_acquire().unwrap();
            slot.release();
        }
        assert_eq!(pool.acquired_total(), 10);
        assert_eq!(pool.released_total(), 10);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_zero_capacity_pool() {
        let pool = WorkerPool::new(0);
        assert!(pool.try_acquire().is_none());
        assert_eq!(pool.utilization().load(), 0.0);
        assert_eq!(pool.acquired_total(), 0);
    }

    #[tokio::test]
    async fn test_slot_freed_when_task_panics() {
        let pool = WorkerPool::new(1);
        let slot = pool.try_acquire().unwrap();

        let handle = tokio::spawn(async move {
            let _slot = slot;
            panic!("boom");
        });
        assert!(handle.await.is_err());

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.released_total(), 1);
    }
}
