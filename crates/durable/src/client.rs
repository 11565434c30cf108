//! Workflow client
//!
//! Entry point for code outside the engine: start executions, deliver
//! signals, complete asynchronous tasks and read back state.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::clients::{
    DispatchError, ExecutionQueue, ExecutionStarter, StartExecutionRequest,
    StartExecutionResponse,
};
use crate::clock::Clock;
use crate::persistence::{ExecutionStore, HistoryStore, StoreError, TaskStore};
use crate::task::{TaskToken, TokenError};
use crate::workflow::{
    format_execution_id, parse_execution_id, EventKind, Execution, InvalidExecutionId,
    WorkflowEvent, WorkflowSignal,
};

/// Errors from client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    InvalidExecutionId(#[from] InvalidExecutionId),

    #[error("invalid workflow name: {0:?}")]
    InvalidWorkflowName(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
}

impl From<ClientError> for DispatchError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Store(err) => DispatchError::Store(err),
            ClientError::Dispatch(err) => err,
            ClientError::ExecutionNotFound(id) => DispatchError::ExecutionNotFound(id),
            other => DispatchError::Rejected(other.to_string()),
        }
    }
}

/// Client over the stores and the execution queue
///
/// # Example
///
/// ```ignore
/// let started = client
///     .start_execution(StartExecutionRequest::new("orders", json!({"id": 42})))
///     .await?;
/// client
///     .send_signal(&started.execution_id, WorkflowSignal::new("approve", json!(true)))
///     .await?;
/// ```
#[derive(Clone)]
pub struct WorkflowClient {
    executions: Arc<dyn ExecutionStore>,
    history: Arc<dyn HistoryStore>,
    queue: Arc<dyn ExecutionQueue>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WorkflowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowClient").finish_non_exhaustive()
    }
}

impl WorkflowClient {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        history: Arc<dyn HistoryStore>,
        queue: Arc<dyn ExecutionQueue>,
        tasks: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            executions,
            history,
            queue,
            tasks,
            clock,
        }
    }

    /// Create the execution record and enqueue `WorkflowStarted`
    ///
    /// Starting an id that already exists is not an error. While that
    /// execution is in progress its `WorkflowStarted` is submitted again,
    /// which the executor dedupes.
    #[instrument(skip(self, request), fields(workflow = %request.workflow_name))]
    pub async fn start_execution(
        &self,
        request: StartExecutionRequest,
    ) -> Result<StartExecutionResponse, ClientError> {
        let StartExecutionRequest {
            workflow_name,
            execution_name,
            input,
            parent,
        } = request;

        if workflow_name.is_empty() || workflow_name.contains('/') {
            return Err(ClientError::InvalidWorkflowName(workflow_name));
        }
        let execution_name = execution_name.unwrap_or_else(|| Uuid::now_v7().to_string());
        let execution_id = format_execution_id(&workflow_name, &execution_name);
        parse_execution_id(&execution_id)?;

        let now = self.clock.now();
        let record = Execution::in_progress(&execution_id, &workflow_name, parent.clone(), now);
        let already_running = match self.executions.create(record).await {
            Ok(()) => false,
            Err(StoreError::ExecutionAlreadyExists(_)) => true,
            Err(err) => return Err(err.into()),
        };

        if already_running {
            let existing = self.get_execution(&execution_id).await?;
            if existing.status.is_terminal() {
                debug!(%execution_id, status = %existing.status, "execution already finished");
                return Ok(StartExecutionResponse {
                    execution_id,
                    already_running,
                });
            }
        }

        let started = WorkflowEvent::at(
            EventKind::WorkflowStarted {
                execution_id: execution_id.clone(),
                workflow_name,
                input,
                parent,
            },
            now,
        );
        self.queue
            .submit_events(&execution_id, vec![started])
            .await?;

        info!(%execution_id, already_running, "execution started");
        Ok(StartExecutionResponse {
            execution_id,
            already_running,
        })
    }

    /// Deliver raw events to an execution
    pub async fn submit_events(
        &self,
        execution_id: &str,
        events: Vec<WorkflowEvent>,
    ) -> Result<(), ClientError> {
        parse_execution_id(execution_id)?;
        self.queue.submit_events(execution_id, events).await?;
        Ok(())
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution, ClientError> {
        self.executions
            .get(execution_id)
            .await?
            .ok_or_else(|| ClientError::ExecutionNotFound(execution_id.to_string()))
    }

    pub async fn get_history(&self, execution_id: &str) -> Result<Vec<WorkflowEvent>, ClientError> {
        Ok(self.history.read(execution_id).await?)
    }

    /// Deliver a signal to an execution
    ///
    /// Each call is a separate delivery. A signal without a dedupe id gets a
    /// fresh one, so only redelivery of the same send is collapsed.
    #[instrument(skip(self, signal), fields(signal_id = %signal.signal_id))]
    pub async fn send_signal(
        &self,
        execution_id: &str,
        mut signal: WorkflowSignal,
    ) -> Result<(), ClientError> {
        parse_execution_id(execution_id)?;
        if signal.id.is_none() {
            signal.id = Some(Uuid::now_v7().to_string());
        }
        let mut event = signal.into_event();
        event.timestamp = self.clock.now();
        self.queue
            .submit_events(execution_id, vec![event])
            .await?;
        Ok(())
    }

    /// Complete an asynchronous task
    pub async fn send_task_success(&self, token: &str, result: Value) -> Result<(), ClientError> {
        let token = TaskToken::decode(token)?;
        self.submit_task_event(
            &token,
            EventKind::TaskSucceeded {
                seq: token.seq,
                result,
            },
        )
        .await
    }

    /// Fail an asynchronous task
    pub async fn send_task_failure(
        &self,
        token: &str,
        error: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), ClientError> {
        let token = TaskToken::decode(token)?;
        self.submit_task_event(
            &token,
            EventKind::TaskFailed {
                seq: token.seq,
                error: error.into(),
                message: message.into(),
            },
        )
        .await
    }

    /// Record a heartbeat for the task behind `token`
    pub async fn send_task_heartbeat(&self, token: &str) -> Result<(), ClientError> {
        let token = TaskToken::decode(token)?;
        self.tasks
            .heartbeat(&token.execution_id, token.seq, self.clock.now())
            .await?;
        Ok(())
    }

    async fn submit_task_event(&self, token: &TaskToken, kind: EventKind) -> Result<(), ClientError> {
        debug!(execution_id = %token.execution_id, seq = token.seq, event = kind.type_name(), "completing task");
        self.queue
            .submit_events(
                &token.execution_id,
                vec![WorkflowEvent::at(kind, self.clock.now())],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionStarter for WorkflowClient {
    async fn start_execution(
        &self,
        request: StartExecutionRequest,
    ) -> Result<StartExecutionResponse, DispatchError> {
        WorkflowClient::start_execution(self, request)
            .await
            .map_err(DispatchError::from)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::persistence::{InMemoryExecutionStore, InMemoryHistoryStore, InMemoryTaskStore};
    use crate::workflow::ParentRef;

    #[derive(Default)]
    struct Recorder {
        submitted: Mutex<Vec<(String, WorkflowEvent)>>,
    }

    #[async_trait]
    impl ExecutionQueue for Recorder {
        async fn submit_events(
            &self,
            execution_id: &str,
            events: Vec<WorkflowEvent>,
        ) -> Result<(), DispatchError> {
            let mut submitted = self.submitted.lock();
            for event in events {
                submitted.push((execution_id.to_string(), event));
            }
            Ok(())
        }
    }

    struct Fixture {
        client: WorkflowClient,
        queue: Arc<Recorder>,
        executions: Arc<InMemoryExecutionStore>,
        tasks: Arc<InMemoryTaskStore>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(Recorder::default());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let tasks = Arc::new(InMemoryTaskStore::new());
        let client = WorkflowClient::new(
            executions.clone(),
            Arc::new(InMemoryHistoryStore::new()),
            queue.clone(),
            tasks.clone(),
            Arc::new(ManualClock::default()),
        );
        Fixture {
            client,
            queue,
            executions,
            tasks,
        }
    }

    #[tokio::test]
    async fn test_start_execution_creates_record_and_event() {
        let f = fixture();
        let response = f
            .client
            .start_execution(
                StartExecutionRequest::new("orders", json!({"id": 1})).with_execution_name("a"),
            )
            .await
            .unwrap();

        assert_eq!(response.execution_id, "orders/a");
        assert!(!response.already_running);

        let execution = f.client.get_execution("orders/a").await.unwrap();
        assert_eq!(execution.workflow_name, "orders");

        let submitted = f.queue.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert!(matches!(
            &submitted[0].1.kind,
            EventKind::WorkflowStarted { execution_id, .. } if execution_id == "orders/a"
        ));
    }

    #[tokio::test]
    async fn test_generated_execution_name() {
        let f = fixture();
        let response = f
            .client
            .start_execution(StartExecutionRequest::new("orders", json!(null)))
            .await
            .unwrap();
        assert!(response.execution_id.starts_with("orders/"));
        assert!(response.execution_id.len() > "orders/".len());
    }

    #[tokio::test]
    async fn test_restart_is_idempotent() {
        let f = fixture();
        let request = StartExecutionRequest::new("orders", json!(1))
            .with_execution_name("a")
            .with_parent(ParentRef {
                execution_id: "batch/x".into(),
                seq: 0,
            });

        f.client.start_execution(request.clone()).await.unwrap();
        let again = f.client.start_execution(request.clone()).await.unwrap();
        assert!(again.already_running);
        assert_eq!(f.queue.submitted.lock().len(), 2);

        f.executions
            .update_to_succeeded("orders/a", json!(2), chrono::Utc::now())
            .await
            .unwrap();
        let finished = f.client.start_execution(request).await.unwrap();
        assert!(finished.already_running);
        assert_eq!(f.queue.submitted.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_workflow_name() {
        let f = fixture();
        let err = f
            .client
            .start_execution(StartExecutionRequest::new("a/b", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidWorkflowName(_)));

        let err = f.client.get_execution("orders/none").await.unwrap_err();
        assert!(matches!(err, ClientError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn test_task_token_operations() {
        let f = fixture();
        let token = TaskToken::new("orders/a", 3).encode();

        f.client.send_task_success(&token, json!("ok")).await.unwrap();
        f.client
            .send_task_failure(&token, "Declined", "no funds")
            .await
            .unwrap();

        {
            let submitted = f.queue.submitted.lock();
            assert_eq!(
                submitted[0].1.kind,
                EventKind::TaskSucceeded {
                    seq: 3,
                    result: json!("ok")
                }
            );
            assert_eq!(submitted[1].0, "orders/a");
        }

        assert!(f.client.send_task_heartbeat(&token).await.is_err());
        f.tasks.claim("orders/a", 3, 0).await.unwrap();
        f.client.send_task_heartbeat(&token).await.unwrap();
        assert!(matches!(
            f.client.send_task_success("???", json!(1)).await,
            Err(ClientError::Token(_))
        ));
    }

    #[tokio::test]
    async fn test_send_signal() {
        let f = fixture();
        f.client
            .send_signal("orders/a", WorkflowSignal::new("approve", json!(true)).with_id("s1"))
            .await
            .unwrap();

        let submitted = f.queue.submitted.lock();
        assert_eq!(
            submitted[0].1.kind,
            EventKind::SignalReceived {
                signal_id: "approve".into(),
                payload: json!(true),
                id: Some("s1".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_anonymous_signals_get_distinct_ids() {
        let f = fixture();
        for _ in 0..2 {
            f.client
                .send_signal("orders/a", WorkflowSignal::new("inc", json!(1)))
                .await
                .unwrap();
        }

        let submitted = f.queue.submitted.lock();
        let ids: Vec<Option<String>> = submitted
            .iter()
            .map(|(_, event)| match &event.kind {
                EventKind::SignalReceived { id, .. } => id.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().all(Option::is_some));
        assert_ne!(ids[0], ids[1]);
    }
}
