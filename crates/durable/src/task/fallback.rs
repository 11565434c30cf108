//! Redelivery of task results the worker could not submit

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::clients::{DispatchError, ExecutionQueue};
use crate::reliability::RetryPolicy;
use crate::workflow::WorkflowEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskFallbackKind {
    /// The completion event was computed but not delivered
    TaskSendEventFailure,
}

/// A computed completion event that still has to reach the execution
///
/// Handling it never runs the task again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFallbackRequest {
    pub kind: TaskFallbackKind,
    pub execution_id: String,
    pub event: WorkflowEvent,
}

impl TaskFallbackRequest {
    pub fn send_event_failure(execution_id: impl Into<String>, event: WorkflowEvent) -> Self {
        Self {
            kind: TaskFallbackKind::TaskSendEventFailure,
            execution_id: execution_id.into(),
            event,
        }
    }
}

/// Re-submits fallback requests with backoff
pub struct TaskFallbackHandler {
    queue: Arc<dyn ExecutionQueue>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for TaskFallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFallbackHandler")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl TaskFallbackHandler {
    pub fn new(queue: Arc<dyn ExecutionQueue>, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    #[instrument(skip(self, request), fields(execution_id = %request.execution_id, seq = request.event.seq()))]
    pub async fn handle(&self, request: TaskFallbackRequest) -> Result<(), DispatchError> {
        let TaskFallbackRequest {
            execution_id,
            event,
            ..
        } = request;

        let result = self
            .policy
            .run("task_fallback_submit", || {
                self.queue.submit_events(&execution_id, vec![event.clone()])
            })
            .await;

        match &result {
            Ok(()) => info!("fallback event delivered"),
            Err(err) => error!(error = %err, "fallback delivery exhausted retries"),
        }
        result
    }
}
