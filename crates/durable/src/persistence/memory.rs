//! In-memory store implementations for tests and the local runtime

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

use super::store::*;
use crate::workflow::{Execution, ExecutionStatus, Seq, WorkflowEvent};

/// In-memory history log
///
/// # Example
///
/// ```
/// use durable_engine::persistence::InMemoryHistoryStore;
///
/// let store = InMemoryHistoryStore::new();
/// assert_eq!(store.execution_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    histories: RwLock<HashMap<String, Vec<WorkflowEvent>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executions with at least one event
    pub fn execution_count(&self) -> usize {
        self.histories.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.histories.write().clear();
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(
        &self,
        execution_id: &str,
        events: &[WorkflowEvent],
    ) -> Result<usize, StoreError> {
        let bytes = serde_json::to_vec(events)?.len();
        self.histories
            .write()
            .entry(execution_id.to_string())
            .or_default()
            .extend_from_slice(events);
        Ok(bytes)
    }

    async fn read(&self, execution_id: &str) -> Result<Vec<WorkflowEvent>, StoreError> {
        Ok(self
            .histories
            .read()
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory execution records
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<String, Execution>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executions with the given status
    pub fn count_with_status(&self, status: ExecutionStatus) -> usize {
        self.executions
            .read()
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    fn finish(
        &self,
        execution_id: &str,
        end_time: DateTime<Utc>,
        apply: impl FnOnce(&mut Execution),
    ) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(execution_id)
            .ok_or_else(|| StoreError::ExecutionNotFound(execution_id.to_string()))?;
        apply(execution);
        execution.end_time = Some(end_time);
        Ok(execution.clone())
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if executions.contains_key(&execution.id) {
            return Err(StoreError::ExecutionAlreadyExists(execution.id));
        }
        executions.insert(execution.id.clone(), execution);
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().get(execution_id).cloned())
    }

    async fn update_to_succeeded(
        &self,
        execution_id: &str,
        result: Value,
        end_time: DateTime<Utc>,
    ) -> Result<Execution, StoreError> {
        self.finish(execution_id, end_time, |execution| {
            execution.status = ExecutionStatus::Succeeded;
            execution.result = Some(result);
        })
    }

    async fn update_to_failed(
        &self,
        execution_id: &str,
        error: &str,
        message: &str,
        end_time: DateTime<Utc>,
    ) -> Result<Execution, StoreError> {
        self.finish(execution_id, end_time, |execution| {
            execution.status = ExecutionStatus::Failed;
            execution.error = Some(error.to_string());
            execution.message = Some(message.to_string());
        })
    }
}

/// In-memory claim records
///
/// Each `(execution_id, seq)` entry is updated under its shard lock, which
/// makes the claim check-and-insert atomic.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<(String, Seq), TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of granted claims
    pub fn claim_count(&self) -> usize {
        self.tasks.iter().map(|entry| entry.claims.len()).sum()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn claim(&self, execution_id: &str, seq: Seq, retry: u32) -> Result<bool, StoreError> {
        match self.tasks.entry((execution_id.to_string(), seq)) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                if record.claims.contains(&retry) {
                    return Ok(false);
                }
                record.claims.push(retry);
                Ok(true)
            }
            Entry::Vacant(entry) => {
                entry.insert(TaskRecord {
                    execution_id: execution_id.to_string(),
                    seq,
                    claims: vec![retry],
                    heartbeat_time: None,
                });
                Ok(true)
            }
        }
    }

    async fn heartbeat(
        &self,
        execution_id: &str,
        seq: Seq,
        at: DateTime<Utc>,
    ) -> Result<TaskRecord, StoreError> {
        let mut record = self
            .tasks
            .get_mut(&(execution_id.to_string(), seq))
            .ok_or_else(|| StoreError::TaskNotClaimed {
                execution_id: execution_id.to_string(),
                seq,
            })?;
        record.heartbeat_time = Some(at);
        Ok(record.clone())
    }

    async fn get(&self, execution_id: &str, seq: Seq) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self
            .tasks
            .get(&(execution_id.to_string(), seq))
            .map(|record| record.clone()))
    }
}
