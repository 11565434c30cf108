//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`HistoryStore`] for the append-only event log of each execution
//! - [`ExecutionStore`] for execution records
//! - [`TaskStore`] for write-once task claims
//! - in-memory implementations of all three

mod memory;
mod store;

pub use memory::{InMemoryExecutionStore, InMemoryHistoryStore, InMemoryTaskStore};
pub use store::{ExecutionStore, HistoryStore, StoreError, TaskRecord, TaskStore};
