//! End-to-end polling scenarios against the in-memory store

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};

use tasklane_manager::events::TaskEvent;
use tasklane_manager::persistence::{CompletionOutcome, NewTask};
use tasklane_manager::task::{HandlerError, HandlerOutput, TaskId, TaskInstance, TaskStatus};
use tasklane_manager::worker::{FillPoolResult, PollingError, TaskRunError};
use tasklane_manager::{
    InMemoryTaskStore, ManagerConfig, StoreError, TaskEventType, TaskManager, TaskStore,
    TaskTypeRegistry,
};

fn config(node_id: &str, max_workers: usize) -> ManagerConfig {
    ManagerConfig::new(Duration::from_secs(60))
        .with_node_id(node_id)
        .with_max_workers(max_workers)
        .with_poll_interval(Duration::from_secs(3600))
        .with_poll_jitter(Duration::ZERO)
        .with_stats_enabled(false)
}

fn done_registry() -> TaskTypeRegistry {
    let mut registry = TaskTypeRegistry::new();
    registry.register("report", |_| async { Ok(HandlerOutput::done()) });
    registry
}

async fn schedule_due(store: &dyn TaskStore, count: usize) -> Vec<TaskInstance> {
    let now = Utc::now();
    let mut tasks = Vec::with_capacity(count);
    for i in 0..count {
        let run_at = now - chrono::Duration::seconds(60) + chrono::Duration::milliseconds(i as i64);
        tasks.push(
            store
                .schedule(NewTask::new("report", run_at))
                .await
                .unwrap(),
        );
    }
    tasks
}

/// Store wrapper that can stall reads or let a rival node claim first
struct InterferingStore {
    inner: Arc<InMemoryTaskStore>,
    list_delay: Duration,
    rival: Option<&'static str>,
}

impl InterferingStore {
    fn slow(inner: Arc<InMemoryTaskStore>, list_delay: Duration) -> Self {
        Self {
            inner,
            list_delay,
            rival: None,
        }
    }

    fn racing(inner: Arc<InMemoryTaskStore>, rival: &'static str) -> Self {
        Self {
            inner,
            list_delay: Duration::ZERO,
            rival: Some(rival),
        }
    }
}

#[async_trait]
impl TaskStore for InterferingStore {
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        task_types: &[String],
    ) -> Result<Vec<TaskInstance>, StoreError> {
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        let due = self.inner.list_due(now, limit, task_types).await?;
        if let Some(rival) = self.rival {
            // The rival claims every candidate between our read and our claim
            for task in &due {
                self.inner
                    .try_claim(task.id, task.version, rival, now, now + chrono::Duration::hours(1))
                    .await?;
            }
        }
        Ok(due)
    }

    async fn count_due(
        &self,
        now: DateTime<Utc>,
        task_types: &[String],
    ) -> Result<usize, StoreError> {
        self.inner.count_due(now, task_types).await
    }

    async fn get(&self, id: TaskId) -> Result<TaskInstance, StoreError> {
        self.inner.get(id).await
    }

    async fn try_claim(
        &self,
        id: TaskId,
        expected_version: i64,
        owner_id: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        self.inner
            .try_claim(id, expected_version, owner_id, now, lease_expires_at)
            .await
    }

    async fn try_mark_running(
        &self,
        id: TaskId,
        expected_version: i64,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<TaskInstance, StoreError> {
        self.inner
            .try_mark_running(id, expected_version, now, lease_expires_at)
            .await
    }

    async fn release(&self, id: TaskId, expected_version: i64) -> Result<TaskInstance, StoreError> {
        self.inner.release(id, expected_version).await
    }

    async fn complete(
        &self,
        id: TaskId,
        expected_version: i64,
        outcome: CompletionOutcome,
    ) -> Result<(), StoreError> {
        self.inner.complete(id, expected_version, outcome).await
    }

    async fn schedule(&self, task: NewTask) -> Result<TaskInstance, StoreError> {
        self.inner.schedule(task).await
    }
}

#[test_log::test(tokio::test)]
async fn capacity_exhaustion_leaves_surplus_idle() {
    let store = Arc::new(InMemoryTaskStore::new());
    let tasks = schedule_due(store.as_ref(), 5).await;

    let gate = Arc::new(Semaphore::new(0));
    let mut registry = TaskTypeRegistry::new();
    let handler_gate = gate.clone();
    registry.register("report", move |_| {
        let gate = handler_gate.clone();
        async move {
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(HandlerOutput::done())
        }
    });

    let manager = TaskManager::new(store.clone(), config("node-a", 2), registry).unwrap();

    let first = assert_ok!(manager.poll_now().await.unwrap());
    assert_eq!(first.result, FillPoolResult::RanOutOfCapacity);
    assert_eq!(first.claimed_tasks.len(), 2);
    let claimed_ids: Vec<TaskId> = first.claimed_tasks.iter().map(|t| t.id).collect();
    let earliest_ids: Vec<TaskId> = tasks[..2].iter().map(|t| t.id).collect();
    assert_eq!(claimed_ids, earliest_ids);
    assert_eq!(first.tasks_left_unclaimed, 3);
    assert_eq!(first.pool.in_use, 2);
    assert_eq!(store.count_with_status(TaskStatus::Idle), 3);

    // Both slots are held by blocked handlers
    let second = assert_err!(manager.poll_now().await.unwrap());
    assert_eq!(second, PollingError::RequestCapacityReached);
    assert_eq!(store.count_with_status(TaskStatus::Idle), 3);

    gate.add_permits(Semaphore::MAX_PERMITS / 2);
    manager.wait_for_running_tasks().await;

    let third = assert_ok!(manager.poll_now().await.unwrap());
    assert_eq!(third.claimed_tasks.len(), 2);
    assert_eq!(third.tasks_left_unclaimed, 1);
    manager.wait_for_running_tasks().await;
    assert_eq!(store.len(), 1);
}

#[test_log::test(tokio::test)]
async fn lost_race_is_dropped_silently() {
    let inner = Arc::new(InMemoryTaskStore::new());
    let tasks = schedule_due(inner.as_ref(), 1).await;
    let store = Arc::new(InterferingStore::racing(inner.clone(), "node-b"));

    let manager = TaskManager::new(store, config("node-a", 4), done_registry()).unwrap();
    let mut events = manager.subscribe();

    let filled = assert_ok!(manager.poll_now().await.unwrap());
    assert_eq!(filled.result, FillPoolResult::NoTasksClaimed);
    assert_eq!(filled.stats.conflicted, 1);
    assert_eq!(filled.stats.errored, 0);

    let events = events.drain();
    let claim = events.iter().find_map(TaskEvent::as_claim).unwrap();
    assert!(matches!(&claim.event, Err(Some(t)) if t.id == tasks[0].id));
    assert!(events.iter().all(|e| e.as_mark_running().is_none()));

    let stored = inner.get(tasks[0].id).await.unwrap();
    assert_eq!(stored.owner_id.as_deref(), Some("node-b"));
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_claims_have_exactly_one_winner() {
    const CLAIMERS: usize = 16;

    let store = Arc::new(InMemoryTaskStore::new());
    let task = schedule_due(store.as_ref(), 1).await.remove(0);
    let (id, version) = (task.id, task.version);
    let now = Utc::now();
    let start = Arc::new(tokio::sync::Barrier::new(CLAIMERS));

    let attempts: Vec<_> = (0..CLAIMERS)
        .map(|n| {
            let store = store.clone();
            let start = start.clone();
            tokio::spawn(async move {
                let owner = format!("node-{n}");
                start.wait().await;
                let lease = now + chrono::Duration::seconds(60);
                let result = store.try_claim(id, version, &owner, now, lease).await;
                (owner, result)
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            (owner, Ok(claimed)) => winners.push((owner, claimed)),
            (_, Err(e)) => {
                assert!(e.is_conflict(), "{e:?}");
                conflicts += 1;
            }
        }
    }
    assert_eq!((winners.len(), conflicts), (1, CLAIMERS - 1));

    let (owner, claimed) = &winners[0];
    let stored = assert_ok!(store.get(id).await);
    assert_eq!(&stored, claimed);
    assert_eq!(stored.owner_id.as_deref(), Some(owner.as_str()));
    assert_eq!(stored.status, TaskStatus::Claimed);
    assert_eq!(stored.version, version + 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn concurrent_nodes_run_each_task_once() {
    const TASKS: usize = 60;

    let store = Arc::new(InMemoryTaskStore::new());
    schedule_due(store.as_ref(), TASKS).await;

    let runs: Arc<Mutex<HashMap<TaskId, usize>>> = Arc::default();
    let managers: Vec<Arc<TaskManager>> = (0..4)
        .map(|n| {
            let runs = runs.clone();
            let mut registry = TaskTypeRegistry::new();
            registry.register("report", move |task: TaskInstance| {
                let runs = runs.clone();
                async move {
                    *runs.lock().entry(task.id).or_default() += 1;
                    tokio::task::yield_now().await;
                    Ok(HandlerOutput::done())
                }
            });
            let manager =
                TaskManager::new(store.clone(), config(&format!("node-{n}"), 3), registry)
                    .unwrap();
            Arc::new(manager)
        })
        .collect();

    let polls = managers.iter().cloned().map(|manager| {
        tokio::spawn(async move {
            for _ in 0..200 {
                manager.poll_now().await;
                tokio::task::yield_now().await;
            }
            manager.wait_for_running_tasks().await;
        })
    });
    for poll in polls.collect::<Vec<_>>() {
        poll.await.unwrap();
    }

    // Whatever is left gets drained by one node
    while !store.is_empty() {
        managers[0].poll_now().await;
        managers[0].wait_for_running_tasks().await;
    }

    let runs = runs.lock();
    assert_eq!(runs.len(), TASKS);
    assert!(runs.values().all(|&count| count == 1), "{runs:?}");
    for manager in &managers {
        assert_eq!(manager.pool_utilization().in_use, 0);
    }
}

#[test_log::test(tokio::test)]
async fn expired_lease_is_reclaimed_by_another_node() {
    let store = Arc::new(InMemoryTaskStore::new());
    let task = schedule_due(store.as_ref(), 1).await.remove(0);

    // node-a claims and marks running, then crashes
    let now = Utc::now();
    let claimed = store
        .try_claim(task.id, task.version, "node-a", now, now + chrono::Duration::seconds(60))
        .await
        .unwrap();
    store
        .try_mark_running(
            claimed.id,
            claimed.version,
            now,
            now - chrono::Duration::milliseconds(1),
        )
        .await
        .unwrap();

    let manager = TaskManager::new(store.clone(), config("node-b", 2), done_registry()).unwrap();
    let filled = assert_ok!(manager.poll_now().await.unwrap());
    assert_eq!(filled.claimed_tasks.len(), 1);
    assert_eq!(filled.claimed_tasks[0].owner_id.as_deref(), Some("node-b"));

    manager.wait_for_running_tasks().await;
    assert!(store.is_empty());
}

#[test_log::test(tokio::test)]
async fn unexpired_lease_is_not_reclaimed() {
    let store = Arc::new(InMemoryTaskStore::new());
    let task = schedule_due(store.as_ref(), 1).await.remove(0);
    let now = Utc::now();
    store
        .try_claim(task.id, task.version, "node-a", now, now + chrono::Duration::minutes(5))
        .await
        .unwrap();

    let manager = TaskManager::new(store.clone(), config("node-b", 2), done_registry()).unwrap();
    let filled = assert_ok!(manager.poll_now().await.unwrap());
    assert_eq!(filled.result, FillPoolResult::NoTasksClaimed);
    assert_eq!(store.count_with_status(TaskStatus::Claimed), 1);
}

#[test_log::test(tokio::test)]
async fn handler_panic_frees_slot_and_polling_continues() {
    let store = Arc::new(InMemoryTaskStore::new());
    schedule_due(store.as_ref(), 1).await;

    let mut registry = TaskTypeRegistry::new();
    registry.register("report", |task: TaskInstance| async move {
        if task.attempts == 1 {
            panic!("handler exploded");
        }
        Ok(HandlerOutput::done())
    });

    let manager = TaskManager::new(store.clone(), config("node-a", 1), registry).unwrap();
    let mut events = manager.subscribe();

    assert_ok!(manager.poll_now().await.unwrap());
    manager.wait_for_running_tasks().await;
    assert_eq!(manager.pool_utilization().in_use, 0);

    let run = events
        .drain()
        .into_iter()
        .find_map(|e| e.as_run().cloned())
        .unwrap();
    let errored = run.event.unwrap_err();
    assert_eq!(
        errored.error,
        TaskRunError::Panicked("handler exploded".to_string())
    );

    // Retryable: the next cycle picks the task up again and succeeds
    let filled = assert_ok!(manager.poll_now().await.unwrap());
    assert_eq!(filled.claimed_tasks.len(), 1);
    manager.wait_for_running_tasks().await;
    assert!(store.is_empty());
}

#[test_log::test(tokio::test)]
async fn handler_error_reports_errored_task() {
    let store = Arc::new(InMemoryTaskStore::new());
    let task = schedule_due(store.as_ref(), 1).await.remove(0);

    let mut registry = TaskTypeRegistry::new();
    registry.register("report", |_| async { Err(HandlerError::permanent("bad report")) });
    let manager = TaskManager::new(store.clone(), config("node-a", 1), registry).unwrap();
    let mut events = manager.subscribe();

    assert_ok!(manager.poll_now().await.unwrap());
    manager.wait_for_running_tasks().await;

    let run = events
        .drain()
        .into_iter()
        .find_map(|e| e.as_run().cloned())
        .unwrap();
    assert!(matches!(run.event, Err(ref e) if matches!(e.error, TaskRunError::Handler(_))));
    assert_eq!(store.get(task.id).await.unwrap().status, TaskStatus::Failed);
    assert_eq!(manager.pool_utilization().in_use, 0);
}

#[test_log::test(tokio::test)]
async fn cycles_never_overlap() {
    let inner = Arc::new(InMemoryTaskStore::new());
    schedule_due(inner.as_ref(), 2).await;
    let store = Arc::new(InterferingStore::slow(inner, Duration::from_millis(100)));
    let manager = TaskManager::new(store, config("node-a", 4), done_registry()).unwrap();

    let (first, second) = tokio::join!(manager.poll_now(), manager.poll_now());
    let ran: Vec<_> = [first, second].into_iter().flatten().collect();
    assert_eq!(ran.len(), 1);
    assert_eq!(ran[0].as_ref().unwrap().claimed_tasks.len(), 2);
}

#[test_log::test(tokio::test)]
async fn every_emitted_event_reaches_a_slow_subscriber() {
    let store = Arc::new(InMemoryTaskStore::new());
    schedule_due(store.as_ref(), 8).await;
    let manager = TaskManager::new(store.clone(), config("node-a", 8), done_registry()).unwrap();
    let mut events = manager.subscribe();

    // Nothing reads the subscription until the whole cycle has finished
    assert_ok!(manager.poll_now().await.unwrap());
    manager.wait_for_running_tasks().await;

    let events = events.drain();
    let count = |wanted: TaskEventType| {
        events
            .iter()
            .filter(|e| e.event_type() == wanted)
            .count()
    };
    assert_eq!(count(TaskEventType::TaskClaim), 8);
    assert_eq!(count(TaskEventType::TaskMarkRunning), 8);
    assert_eq!(count(TaskEventType::TaskRun), 8);
    assert_eq!(count(TaskEventType::TaskPollingCycle), 1);
    assert_eq!(events.len(), 25);
}

#[test_log::test(tokio::test)]
async fn events_are_ordered_and_timed() {
    let store = Arc::new(InMemoryTaskStore::new());
    let tasks = schedule_due(store.as_ref(), 3).await;
    let manager = TaskManager::new(store.clone(), config("node-a", 3), done_registry()).unwrap();
    let mut events = manager.subscribe();

    assert_ok!(manager.poll_now().await.unwrap());
    manager.wait_for_running_tasks().await;
    let events = events.drain();

    for timing in events.iter().filter_map(TaskEvent::timing) {
        assert!(timing.stop >= timing.start);
    }

    for task in &tasks {
        let sequence: Vec<_> = events
            .iter()
            .filter(|e| e.task_id() == Some(task.id))
            .map(TaskEvent::event_type)
            .collect();
        assert_eq!(
            sequence,
            vec![
                tasklane_manager::TaskEventType::TaskClaim,
                tasklane_manager::TaskEventType::TaskMarkRunning,
                tasklane_manager::TaskEventType::TaskRun,
            ]
        );
    }
    assert_eq!(
        events.iter().filter(|e| e.as_polling_cycle().is_some()).count(),
        1
    );
}
