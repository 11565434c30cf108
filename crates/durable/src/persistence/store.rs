//! Store traits for histories, execution records and task claims

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{Execution, Seq, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// An execution with this id was already created
    #[error("execution already exists: {0}")]
    ExecutionAlreadyExists(String),

    /// No claim was recorded for the task
    #[error("task not claimed: {execution_id} seq {seq}")]
    TaskNotClaimed { execution_id: String, seq: Seq },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Append-only event log per execution
///
/// Appends for one execution id are made by one orchestrator cycle at a time;
/// implementations only need to keep each append atomic.
#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Append events in order; returns the size of the stored batch in bytes
    async fn append(&self, execution_id: &str, events: &[WorkflowEvent])
        -> Result<usize, StoreError>;

    /// Load the full ordered history; empty for unknown executions
    async fn read(&self, execution_id: &str) -> Result<Vec<WorkflowEvent>, StoreError>;
}

/// Execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    /// Create a record; fails with `ExecutionAlreadyExists` when the id is taken
    async fn create(&self, execution: Execution) -> Result<(), StoreError>;

    async fn get(&self, execution_id: &str) -> Result<Option<Execution>, StoreError>;

    async fn update_to_succeeded(
        &self,
        execution_id: &str,
        result: Value,
        end_time: DateTime<Utc>,
    ) -> Result<Execution, StoreError>;

    async fn update_to_failed(
        &self,
        execution_id: &str,
        error: &str,
        message: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Execution, StoreError>;
}

/// State of one claimed task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub execution_id: String,
    pub seq: Seq,

    /// Retry numbers that have been claimed, in claim order
    pub claims: Vec<u32>,

    /// Time of the last heartbeat, if any
    pub heartbeat_time: Option<DateTime<Utc>>,
}

/// Claim records for task invocations
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    /// Atomically claim `(execution_id, seq, retry)`
    ///
    /// Returns `true` for exactly one caller per key. Claims are never released.
    async fn claim(&self, execution_id: &str, seq: Seq, retry: u32) -> Result<bool, StoreError>;

    /// Record a heartbeat for a claimed task
    async fn heartbeat(
        &self,
        execution_id: &str,
        seq: Seq,
        at: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError>;

    async fn get(&self, execution_id: &str, seq: Seq) -> Result<Option<TaskRecord>, StoreError>;
}
