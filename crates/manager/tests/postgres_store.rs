//! PostgreSQL task store tests
//!
//! Require a database: `DATABASE_URL=postgres://... cargo test -- --ignored`

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::PgPool;
use tokio_test::assert_ok;

use tasklane_manager::persistence::{CompletionOutcome, NewTask};
use tasklane_manager::task::TaskStatus;
use tasklane_manager::{PostgresTaskStore, StoreError, TaskStore};

async fn store() -> PostgresTaskStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.expect("connect");
    let store = PostgresTaskStore::new(pool);
    store.migrate().await.expect("migrate");
    store
}

/// Task type unique to one test so parallel tests don't see each other's rows
fn unique_type(name: &str) -> String {
    format!("{name}_{}", uuid::Uuid::now_v7().simple())
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn claim_run_complete_round() {
    let store = store().await;
    let task_type = unique_type("report");
    let types = vec![task_type.clone()];
    let now = Utc::now();

    let task = assert_ok!(
        store
            .schedule(
                NewTask::new(&task_type, now - Duration::seconds(1))
                    .with_params(serde_json::json!({"n": 1}))
            )
            .await
    );

    let due = assert_ok!(store.list_due(now, 10, &types).await);
    assert_eq!(due.len(), 1);
    assert_eq!(assert_ok!(store.count_due(now, &types).await), 1);

    let lease = now + Duration::seconds(30);
    let claimed = assert_ok!(store.try_claim(task.id, task.version, "node-a", now, lease).await);
    assert_eq!(claimed.status, TaskStatus::Claimed);
    assert_eq!(claimed.version, task.version + 1);

    let running = assert_ok!(
        store
            .try_mark_running(claimed.id, claimed.version, now, lease)
            .await
    );
    assert_eq!(running.attempts, 1);

    assert_ok!(
        store
            .complete(running.id, running.version, CompletionOutcome::Remove)
            .await
    );
    assert_eq!(
        store.get(task.id).await.unwrap_err(),
        StoreError::TaskNotFound(task.id)
    );
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn stale_version_conflicts() {
    let store = store().await;
    let task_type = unique_type("report");
    let now = Utc::now();
    let task = assert_ok!(store.schedule(NewTask::new(&task_type, now)).await);
    let lease = now + Duration::seconds(30);

    assert_ok!(store.try_claim(task.id, task.version, "node-a", now, lease).await);
    let err = store
        .try_claim(task.id, task.version, "node-b", now, lease)
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "{err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires PostgreSQL"]
async fn concurrent_claims_have_one_winner() {
    const CLAIMERS: usize = 8;

    let store = Arc::new(store().await);
    let task_type = unique_type("report");
    let now = Utc::now();
    let task = assert_ok!(store.schedule(NewTask::new(&task_type, now)).await);
    let start = Arc::new(tokio::sync::Barrier::new(CLAIMERS));

    let attempts: Vec<_> = (0..CLAIMERS)
        .map(|n| {
            let store = store.clone();
            let start = start.clone();
            let (id, version) = (task.id, task.version);
            tokio::spawn(async move {
                let owner = format!("node-{n}");
                start.wait().await;
                let result = store
                    .try_claim(id, version, &owner, now, now + Duration::seconds(30))
                    .await;
                (owner, result)
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            (owner, Ok(_)) => winners.push(owner),
            (_, Err(e)) => {
                assert!(e.is_conflict(), "{e:?}");
                conflicts += 1;
            }
        }
    }
    assert_eq!((winners.len(), conflicts), (1, CLAIMERS - 1));

    let stored = assert_ok!(store.get(task.id).await);
    assert_eq!(stored.owner_id.as_deref(), Some(winners[0].as_str()));
    assert_eq!(stored.status, TaskStatus::Claimed);
    assert_eq!(stored.version, task.version + 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL"]
async fn retry_and_reschedule_return_to_idle() {
    let store = store().await;
    let task_type = unique_type("tick");
    let now = Utc::now();
    let lease = now + Duration::seconds(30);

    let task = assert_ok!(store.schedule(NewTask::new(&task_type, now)).await);
    let claimed = assert_ok!(store.try_claim(task.id, task.version, "node-a", now, lease).await);
    let running = assert_ok!(
        store
            .try_mark_running(claimed.id, claimed.version, now, lease)
            .await
    );

    let retry_at = now + Duration::minutes(1);
    assert_ok!(
        store
            .complete(
                running.id,
                running.version,
                CompletionOutcome::Retry {
                    retry_at,
                    error: "flaky".into()
                }
            )
            .await
    );
    let retried = assert_ok!(store.get(task.id).await);
    assert_eq!(retried.status, TaskStatus::Idle);
    assert_eq!(retried.owner_id, None);
    assert_eq!(retried.last_error.as_deref(), Some("flaky"));
    assert!(!retried.is_due(now));

    let claimed = assert_ok!(
        store
            .try_claim(retried.id, retried.version, "node-a", retry_at, lease)
            .await
    );
    let running = assert_ok!(
        store
            .try_mark_running(claimed.id, claimed.version, retry_at, lease)
            .await
    );
    let next = now + Duration::hours(1);
    assert_ok!(
        store
            .complete(
                running.id,
                running.version,
                CompletionOutcome::Reschedule {
                    run_at: next,
                    state: Some(serde_json::json!({"runs": 2}))
                }
            )
            .await
    );

    let rescheduled = assert_ok!(store.get(task.id).await);
    assert_eq!(rescheduled.attempts, 0);
    assert_eq!(rescheduled.retry_at, None);
    assert_eq!(rescheduled.state, serde_json::json!({"runs": 2}));
}
