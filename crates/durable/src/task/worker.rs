//! Task worker
//!
//! Runs one task invocation: claim, optional heartbeat monitor, handler,
//! completion submit. The claim is the only lock; a request whose claim is
//! already taken does nothing.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{TaskContext, TaskFallbackRequest, TaskRegistry, TaskResult};
use crate::clients::{DispatchError, ExecutionQueue, TaskWorkerRequest, TimerRequest, TimerService};
use crate::clock::{add_duration, Clock};
use crate::persistence::{StoreError, TaskStore};
use crate::workflow::{error_names, EventKind, WorkflowEvent};

/// Task worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskWorkerConfig {
    /// Worker id recorded in logs (generated if not provided)
    pub worker_id: String,
}

impl Default for TaskWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("task-worker-{}", Uuid::now_v7()),
        }
    }
}

impl TaskWorkerConfig {
    /// Read `DURABLE_TASK_WORKER_ID`, generating an id when unset
    pub fn from_env() -> Self {
        match std::env::var("DURABLE_TASK_WORKER_ID") {
            Ok(id) if !id.trim().is_empty() => Self::default().with_worker_id(id.trim()),
            _ => Self::default(),
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }
}

/// Failures outside the task handler
#[derive(Debug, thiserror::Error)]
pub enum TaskWorkerError {
    #[error("claim failed: {0}")]
    Claim(#[from] StoreError),

    #[error("dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskWorkerError {
    /// Error name reported to the workflow
    pub fn error_name(&self) -> &'static str {
        match self {
            Self::UnknownTask(_) => error_names::TASK_NOT_FOUND,
            Self::Panicked(_) => error_names::TASK_PANICKED,
            Self::Claim(_) | Self::Dispatch(_) => error_names::TASK_WORKER_ERROR,
        }
    }
}

/// What handling one request did
#[derive(Debug, Clone, PartialEq)]
pub enum TaskWorkerOutcome {
    /// Another worker already claimed this invocation
    ClaimRejected,

    /// The completion event was submitted
    Completed(WorkflowEvent),

    /// The handler will complete the task later through its token
    Async,

    /// The result could not be delivered; hand this to the fallback handler
    Fallback(TaskFallbackRequest),
}

/// Executes task invocations dispatched by the orchestrator
pub struct TaskWorker {
    registry: Arc<TaskRegistry>,
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn ExecutionQueue>,
    timers: Arc<dyn TimerService>,
    clock: Arc<dyn Clock>,
    config: TaskWorkerConfig,
}

impl std::fmt::Debug for TaskWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskWorker")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TaskWorker {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn ExecutionQueue>,
        timers: Arc<dyn TimerService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            timers,
            clock,
            config: TaskWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: TaskWorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &TaskWorkerConfig {
        &self.config
    }

    /// Handle one invocation
    ///
    /// Never fails: anything unexpected becomes a `TaskFailed` fallback request.
    #[instrument(
        skip(self, request),
        fields(
            worker_id = %self.config.worker_id,
            execution_id = %request.execution_id,
            task = %request.task_name,
            seq = request.seq,
            retry = request.retry,
        )
    )]
    pub async fn handle(&self, request: TaskWorkerRequest) -> TaskWorkerOutcome {
        match self.try_handle(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "task worker failed, reporting task as failed");
                let event = WorkflowEvent::at(
                    EventKind::TaskFailed {
                        seq: request.seq,
                        error: err.error_name().to_string(),
                        message: err.to_string(),
                    },
                    self.clock.now(),
                );
                TaskWorkerOutcome::Fallback(TaskFallbackRequest::send_event_failure(
                    request.execution_id,
                    event,
                ))
            }
        }
    }

    async fn try_handle(
        &self,
        request: &TaskWorkerRequest,
    ) -> Result<TaskWorkerOutcome, TaskWorkerError> {
        if !self
            .store
            .claim(&request.execution_id, request.seq, request.retry)
            .await?
        {
            info!("task already claimed");
            return Ok(TaskWorkerOutcome::ClaimRejected);
        }

        if let Some(heartbeat) = request.heartbeat {
            self.timers
                .schedule(TimerRequest::HeartbeatMonitor {
                    execution_id: request.execution_id.clone(),
                    seq: request.seq,
                    heartbeat,
                    fire_at: add_duration(self.clock.now(), heartbeat),
                })
                .await?;
        }

        let handler = self
            .registry
            .get(&request.task_name)
            .ok_or_else(|| TaskWorkerError::UnknownTask(request.task_name.clone()))?;

        let ctx = Arc::new(TaskContext::new(
            request,
            self.store.clone(),
            self.clock.clone(),
        ));
        debug!(attempt_id = %ctx.attempt_id, "running task handler");

        let result = AssertUnwindSafe(handler.call(ctx, request.input.clone()))
            .catch_unwind()
            .await
            .map_err(|panic| TaskWorkerError::Panicked(panic_message(panic.as_ref())))?;

        let kind = match result {
            Ok(TaskResult::Complete(result)) => EventKind::TaskSucceeded {
                seq: request.seq,
                result,
            },
            Ok(TaskResult::Async) => {
                debug!("task completes asynchronously");
                return Ok(TaskWorkerOutcome::Async);
            }
            Err(err) => {
                debug!(error = %err, "task handler failed");
                EventKind::TaskFailed {
                    seq: request.seq,
                    error: err.error,
                    message: err.message,
                }
            }
        };
        let event = WorkflowEvent::at(kind, self.clock.now());

        match self
            .queue
            .submit_events(&request.execution_id, vec![event.clone()])
            .await
        {
            Ok(()) => Ok(TaskWorkerOutcome::Completed(event)),
            Err(err) => {
                warn!(error = %err, "could not submit task result");
                Ok(TaskWorkerOutcome::Fallback(
                    TaskFallbackRequest::send_event_failure(request.execution_id.clone(), event),
                ))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::InMemoryTaskStore;
    use crate::task::TaskError;

    #[derive(Default)]
    struct Recorder {
        fail_submit: bool,
        submitted: Mutex<Vec<WorkflowEvent>>,
        timers: Mutex<Vec<TimerRequest>>,
    }

    #[async_trait]
    impl ExecutionQueue for Recorder {
        async fn submit_events(
            &self,
            _execution_id: &str,
            events: Vec<WorkflowEvent>,
        ) -> Result<(), DispatchError> {
            if self.fail_submit {
                return Err(DispatchError::Unavailable("queue".into()));
            }
            self.submitted.lock().extend(events);
            Ok(())
        }
    }

    #[async_trait]
    impl TimerService for Recorder {
        async fn schedule(&self, request: TimerRequest) -> Result<(), DispatchError> {
            self.timers.lock().push(request);
            Ok(())
        }
    }

    fn registry() -> Arc<TaskRegistry> {
        let mut registry = TaskRegistry::new();
        registry.register_fn("double", |_ctx, input: Value| async move {
            Ok::<_, TaskError>(TaskResult::Complete(json!(input.as_i64().unwrap_or(0) * 2)))
        });
        registry.register_fn("decline", |_ctx, _input| async move {
            Err::<TaskResult<Value>, _>(TaskError::new("CardDeclined", "insufficient funds"))
        });
        registry.register_fn("later", |_ctx, _input| async move {
            Ok::<TaskResult<Value>, TaskError>(TaskResult::Async)
        });
        registry.register_fn("explode", |_ctx, input: Value| async move {
            if input.is_null() {
                panic!("kaboom");
            }
            Ok::<_, TaskError>(TaskResult::Complete(input))
        });
        Arc::new(registry)
    }

    fn worker(recorder: Arc<Recorder>) -> (TaskWorker, Arc<InMemoryTaskStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryTaskStore::new());
        let clock = Arc::new(ManualClock::default());
        let worker = TaskWorker::new(
            registry(),
            store.clone(),
            recorder.clone(),
            recorder,
            clock.clone(),
        )
        .with_config(TaskWorkerConfig::default().with_worker_id("test-worker"));
        (worker, store, clock)
    }

    fn request(task: &str, input: Value) -> TaskWorkerRequest {
        TaskWorkerRequest {
            execution_id: "orders/1".into(),
            workflow_name: "orders".into(),
            task_name: task.into(),
            seq: 4,
            retry: 0,
            input,
            heartbeat: None,
            scheduled_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_success_submits_task_succeeded() {
        let recorder = Arc::new(Recorder::default());
        let (worker, _, _) = worker(recorder.clone());

        let outcome = worker.handle(request("double", json!(21))).await;
        let TaskWorkerOutcome::Completed(event) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(
            event.kind,
            EventKind::TaskSucceeded {
                seq: 4,
                result: json!(42)
            }
        );
        assert_eq!(recorder.submitted.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_second_delivery_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let (worker, store, _) = worker(recorder.clone());

        worker.handle(request("double", json!(1))).await;
        let outcome = worker.handle(request("double", json!(1))).await;

        assert_eq!(outcome, TaskWorkerOutcome::ClaimRejected);
        assert_eq!(recorder.submitted.lock().len(), 1);
        assert_eq!(store.claim_count(), 1);

        let mut retry = request("double", json!(1));
        retry.retry = 1;
        assert!(matches!(
            worker.handle(retry).await,
            TaskWorkerOutcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_handler_error_submits_task_failed() {
        let recorder = Arc::new(Recorder::default());
        let (worker, _, _) = worker(recorder.clone());

        let outcome = worker.handle(request("decline", Value::Null)).await;
        let TaskWorkerOutcome::Completed(event) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(
            event.kind,
            EventKind::TaskFailed {
                seq: 4,
                error: "CardDeclined".into(),
                message: "insufficient funds".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_async_task_submits_nothing() {
        let recorder = Arc::new(Recorder::default());
        let (worker, _, _) = worker(recorder.clone());

        let outcome = worker.handle(request("later", Value::Null)).await;
        assert_eq!(outcome, TaskWorkerOutcome::Async);
        assert!(recorder.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_monitor_is_scheduled() {
        let recorder = Arc::new(Recorder::default());
        let (worker, _, clock) = worker(recorder.clone());

        let mut req = request("later", Value::Null);
        req.heartbeat = Some(Duration::from_secs(30));
        worker.handle(req).await;

        let timers = recorder.timers.lock();
        assert_eq!(timers.len(), 1);
        assert_eq!(
            timers[0],
            TimerRequest::HeartbeatMonitor {
                execution_id: "orders/1".into(),
                seq: 4,
                heartbeat: Duration::from_secs(30),
                fire_at: clock.now() + chrono::Duration::seconds(30),
            }
        );
    }

    #[tokio::test]
    async fn test_submit_failure_returns_fallback() {
        let recorder = Arc::new(Recorder {
            fail_submit: true,
            ..Default::default()
        });
        let (worker, _, _) = worker(recorder);

        let outcome = worker.handle(request("double", json!(2))).await;
        let TaskWorkerOutcome::Fallback(fallback) = outcome else {
            panic!("expected fallback, got {outcome:?}");
        };
        assert_eq!(fallback.execution_id, "orders/1");
        assert_eq!(
            fallback.event.kind,
            EventKind::TaskSucceeded {
                seq: 4,
                result: json!(4)
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_task_becomes_failed_fallback() {
        let recorder = Arc::new(Recorder::default());
        let (worker, _, _) = worker(recorder);

        let outcome = worker.handle(request("missing", Value::Null)).await;
        let TaskWorkerOutcome::Fallback(fallback) = outcome else {
            panic!("expected fallback, got {outcome:?}");
        };
        assert!(matches!(
            fallback.event.kind,
            EventKind::TaskFailed { seq: 4, ref error, .. } if error == error_names::TASK_NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_panicking_task_becomes_failed_fallback() {
        let recorder = Arc::new(Recorder::default());
        let (worker, _, _) = worker(recorder);

        let outcome = worker.handle(request("explode", Value::Null)).await;
        let TaskWorkerOutcome::Fallback(fallback) = outcome else {
            panic!("expected fallback, got {outcome:?}");
        };
        match fallback.event.kind {
            EventKind::TaskFailed { error, message, .. } => {
                assert_eq!(error, error_names::TASK_PANICKED);
                assert!(message.contains("kaboom"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
