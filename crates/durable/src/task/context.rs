//! Task execution context

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::TaskToken;
use crate::clients::TaskWorkerRequest;
use crate::clock::Clock;
use crate::persistence::{StoreError, TaskStore};
use crate::workflow::Seq;

/// Context handed to a task handler
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &TaskContext, input: Input) -> Result<TaskResult<Output>, TaskError> {
///     for chunk in input.chunks {
///         upload(chunk).await?;
///         ctx.heartbeat().await.map_err(anyhow::Error::from)?;
///     }
///     Ok(TaskResult::Complete(Output::default()))
/// }
/// ```
pub struct TaskContext {
    /// Unique id of this attempt, for logs
    pub attempt_id: Uuid,

    pub execution_id: String,
    pub workflow_name: String,
    pub task_name: String,
    pub seq: Seq,

    /// Retry number the claim was made for
    pub retry: u32,

    /// When the orchestrator dispatched the task
    pub scheduled_time: DateTime<Utc>,

    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("attempt_id", &self.attempt_id)
            .field("execution_id", &self.execution_id)
            .field("task_name", &self.task_name)
            .field("seq", &self.seq)
            .field("retry", &self.retry)
            .finish()
    }
}

impl TaskContext {
    pub(crate) fn new(
        request: &TaskWorkerRequest,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            execution_id: request.execution_id.clone(),
            workflow_name: request.workflow_name.clone(),
            task_name: request.task_name.clone(),
            seq: request.seq,
            retry: request.retry,
            scheduled_time: request.scheduled_time,
            store,
            clock,
        }
    }

    /// Token for completing the task from elsewhere
    ///
    /// Handlers returning [`TaskResult::Async`](super::TaskResult::Async) pass
    /// this to whatever finishes the work.
    pub fn token(&self) -> TaskToken {
        TaskToken::new(self.execution_id.clone(), self.seq)
    }

    /// Record liveness for the heartbeat monitor
    pub async fn heartbeat(&self) -> Result<(), StoreError> {
        self.store
            .heartbeat(&self.execution_id, self.seq, self.clock.now())
            .await
            .map(|_| ())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryTaskStore;

    fn request() -> TaskWorkerRequest {
        TaskWorkerRequest {
            execution_id: "orders/1".into(),
            workflow_name: "orders".into(),
            task_name: "charge".into(),
            seq: 3,
            retry: 0,
            input: serde_json::Value::Null,
            heartbeat: None,
            scheduled_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_records_clock_time() {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(ManualClock::default());
        let ctx = TaskContext::new(&request(), store.clone(), clock.clone());

        assert!(ctx.heartbeat().await.is_err());

        store.claim("orders/1", 3, 0).await.unwrap();
        ctx.heartbeat().await.unwrap();

        let record = store.get("orders/1", 3).await.unwrap().unwrap();
        assert_eq!(record.heartbeat_time, Some(clock.now()));
        assert_eq!(ctx.token(), TaskToken::new("orders/1", 3));
    }
}
