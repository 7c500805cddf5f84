//! Persistence layer for task instances
//!
//! This module provides:
//! - [`TaskStore`] trait, the compare-and-swap contract the core relies on
//! - [`InMemoryTaskStore`] for tests and single-process nodes
//! - [`PostgresTaskStore`] for nodes sharing a PostgreSQL database

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{CompletionOutcome, NewTask, StoreError, TaskStore};
