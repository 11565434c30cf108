//! Collaborator contracts
//!
//! The orchestrator and task worker only talk to the outside world through
//! these traits. Every operation is send-and-forget: results come back as
//! events submitted to the execution's queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::persistence::StoreError;
use crate::workflow::{
    option_duration_millis, duration_millis, EntityOperation, EventEnvelope, ParentRef, Seq,
    WorkflowEvent,
};

/// Errors from collaborator calls
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Collaborator could not be reached
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// Target execution does not exist
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Collaborator refused the request
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// At-least-once delivery of events to an execution's orchestration queue
#[async_trait]
pub trait ExecutionQueue: Send + Sync + 'static {
    async fn submit_events(
        &self,
        execution_id: &str,
        events: Vec<WorkflowEvent>,
    ) -> Result<(), DispatchError>;
}

/// One task invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskWorkerRequest {
    pub execution_id: String,
    pub workflow_name: String,
    pub task_name: String,
    pub seq: Seq,

    /// Attempt number; each retry claims a new key
    #[serde(default)]
    pub retry: u32,

    pub input: Value,

    #[serde(
        default,
        with = "option_duration_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat: Option<Duration>,

    pub scheduled_time: DateTime<Utc>,
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync + 'static {
    async fn start_task(&self, request: TaskWorkerRequest) -> Result<(), DispatchError>;
}

/// Work for the timer service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimerRequest {
    /// Deliver `event` to the execution at `fire_at`
    ScheduleEvent {
        execution_id: String,
        fire_at: DateTime<Utc>,
        event: WorkflowEvent,
    },

    /// Check at `fire_at` that the task heartbeated within `heartbeat`
    HeartbeatMonitor {
        execution_id: String,
        seq: Seq,
        #[serde(with = "duration_millis")]
        heartbeat: Duration,
        fire_at: DateTime<Utc>,
    },
}

impl TimerRequest {
    pub fn fire_at(&self) -> DateTime<Utc> {
        match self {
            Self::ScheduleEvent { fire_at, .. } | Self::HeartbeatMonitor { fire_at, .. } => {
                *fire_at
            }
        }
    }

    pub fn execution_id(&self) -> &str {
        match self {
            Self::ScheduleEvent { execution_id, .. }
            | Self::HeartbeatMonitor { execution_id, .. } => execution_id,
        }
    }
}

#[async_trait]
pub trait TimerService: Send + Sync + 'static {
    async fn schedule(&self, request: TimerRequest) -> Result<(), DispatchError>;
}

/// Request to start an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    pub workflow_name: String,

    /// Instance part of the execution id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_name: Option<String>,

    pub input: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
}

impl StartExecutionRequest {
    pub fn new(workflow_name: impl Into<String>, input: Value) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            execution_name: None,
            input,
            parent: None,
        }
    }

    pub fn with_execution_name(mut self, name: impl Into<String>) -> Self {
        self.execution_name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartExecutionResponse {
    pub execution_id: String,

    /// The execution existed before this request
    pub already_running: bool,
}

/// Starts executions, including child executions
#[async_trait]
pub trait ExecutionStarter: Send + Sync + 'static {
    async fn start_execution(
        &self,
        request: StartExecutionRequest,
    ) -> Result<StartExecutionResponse, DispatchError>;
}

/// Publishes application events
#[async_trait]
pub trait EventEmitter: Send + Sync + 'static {
    async fn emit(&self, execution_id: &str, events: &[EventEnvelope]) -> Result<(), DispatchError>;
}

/// Executes entity operations and reports back with `EntityRequest*` events
#[async_trait]
pub trait EntityService: Send + Sync + 'static {
    async fn request(
        &self,
        execution_id: &str,
        seq: Seq,
        operation: EntityOperation,
    ) -> Result<(), DispatchError>;
}

/// Runs named transactions and reports back with `TransactionRequest*` events
#[async_trait]
pub trait TransactionService: Send + Sync + 'static {
    async fn invoke(
        &self,
        execution_id: &str,
        seq: Seq,
        transaction_name: &str,
        input: Value,
    ) -> Result<(), DispatchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_request_serialization() {
        let request = TaskWorkerRequest {
            execution_id: "orders/1".into(),
            workflow_name: "orders".into(),
            task_name: "charge".into(),
            seq: 2,
            retry: 0,
            input: json!({"amount": 5}),
            heartbeat: Some(Duration::from_secs(30)),
            scheduled_time: Utc::now(),
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["heartbeat"], 30_000);

        let parsed: TaskWorkerRequest = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, request);
    }

    #[test]
    fn test_timer_request_accessors() {
        let fire_at = Utc::now();
        let request = TimerRequest::HeartbeatMonitor {
            execution_id: "orders/1".into(),
            seq: 0,
            heartbeat: Duration::from_secs(5),
            fire_at,
        };
        assert_eq!(request.fire_at(), fire_at);
        assert_eq!(request.execution_id(), "orders/1");
    }
}
