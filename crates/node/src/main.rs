//! tasklane node
//!
//! Runs one task manager against the shared task store until interrupted.
//!
//! Configuration comes from `TASKLANE_*` environment variables (see
//! `ManagerConfig::from_env`). With `DATABASE_URL` set the node uses the
//! PostgreSQL task store, otherwise an in-memory one.

mod handlers;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tasklane_manager::events::EventSubscription;
use tasklane_manager::{
    InMemoryTaskStore, ManagerConfig, PostgresTaskStore, TaskEvent, TaskManager, TaskStore,
};
use tracing::{debug, info, trace, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    telemetry::init();

    info!("tasklane-node starting...");

    let config = ManagerConfig::from_env().context("Invalid task manager configuration")?;
    let store = connect_store(config.max_workers).await?;

    info!(
        node_id = %config.node_id,
        max_workers = config.max_workers,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        running_timeout_ms = config.running_timeout.as_millis() as u64,
        "Starting task manager"
    );

    let manager = TaskManager::new(store, config, handlers::registry())
        .context("Failed to create task manager")?;
    let event_log = tokio::spawn(log_events(manager.subscribe()));

    manager.start().await.context("Failed to start task manager")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    if let Err(e) = manager.shutdown().await {
        warn!(error = %e, "Task manager did not shut down cleanly");
    }
    event_log.abort();

    info!("Node shutdown complete");
    Ok(())
}

async fn connect_store(max_workers: usize) -> Result<Arc<dyn TaskStore>> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        warn!("DATABASE_URL not set, using in-memory task store");
        return Ok(Arc::new(InMemoryTaskStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(db_pool_size(max_workers))
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;

    let store = PostgresTaskStore::new(pool);
    store.migrate().await.context("Failed to run migrations")?;
    info!("Connected to PostgreSQL task store");

    Ok(Arc::new(store))
}

async fn log_events(mut events: EventSubscription) {
    while let Some(event) = events.recv().await {
        match &event {
            TaskEvent::Run(run) => match &run.event {
                Ok(ran) => info!(
                    task_id = %ran.task.id,
                    task_type = %ran.task.task_type,
                    result = ?ran.result,
                    "Task run"
                ),
                Err(errored) => warn!(
                    task_id = %errored.task.id,
                    task_type = %errored.task.task_type,
                    result = ?errored.result,
                    error = %errored.error,
                    "Task run failed"
                ),
            },
            TaskEvent::ManagerStat(stat) => debug!(
                stat = ?stat.id,
                value = stat.event.as_ref().ok().copied().unwrap_or_default(),
                "Manager stat"
            ),
            other => trace!(
                event_type = ?other.event_type(),
                task_id = ?other.task_id(),
                ok = other.is_ok(),
                "Task event"
            ),
        }
    }
}

/// One connection per worker plus headroom for the polling loop
fn db_pool_size(max_workers: usize) -> u32 {
    u32::try_from(max_workers)
        .unwrap_or(u32::MAX)
        .saturating_add(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_pool_size_adds_headroom() {
        assert_eq!(db_pool_size(10), 12);
    }

    #[test]
    fn test_db_pool_size_saturates() {
        assert_eq!(db_pool_size(u32::MAX as usize - 1), u32::MAX);
        assert_eq!(db_pool_size(usize::MAX), u32::MAX);
    }
}
