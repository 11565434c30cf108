//! Workflow trait definition

use std::future::Future;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::engine::WorkflowContext;

/// Well-known error names
pub mod error_names {
    /// A racing timeout call resolved first
    pub const TIMEOUT: &str = "Timeout";

    /// A task missed its heartbeat interval
    pub const HEARTBEAT_TIMEOUT: &str = "HeartbeatTimeout";

    /// The program panicked while being interpreted
    pub const WORKFLOW_PANICKED: &str = "WorkflowPanicked";

    /// The execution input did not match the program's input type
    pub const INVALID_INPUT: &str = "InvalidInput";

    /// No handler registered under the requested task name
    pub const TASK_NOT_FOUND: &str = "TaskNotFound";

    /// No transaction registered under the requested name
    pub const TRANSACTION_NOT_FOUND: &str = "TransactionNotFound";

    /// A task handler panicked
    pub const TASK_PANICKED: &str = "TaskPanicked";

    /// The task worker failed outside the handler
    pub const TASK_WORKER_ERROR: &str = "TaskWorkerError";

    /// Fallback name for errors without one
    pub const ERROR: &str = "Error";
}

/// Failure of a call or of a whole execution
///
/// Carried as plain data so it can be persisted in `*Failed` events and
/// handed back to the program on replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error name for programmatic handling
    pub error: String,

    /// Human readable message
    pub message: String,
}

impl WorkflowError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    /// An error with the generic `Error` name
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(error_names::ERROR, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(error_names::TIMEOUT, message)
    }

    pub fn heartbeat_timeout() -> Self {
        Self::new(error_names::HEARTBEAT_TIMEOUT, "Task Heartbeat TimedOut")
    }

    pub fn is_timeout(&self) -> bool {
        self.error == error_names::TIMEOUT
    }

    pub fn is_heartbeat_timeout(&self) -> bool {
        self.error == error_names::HEARTBEAT_TIMEOUT
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("SerializationError", err.to_string())
    }
}

/// State of a call, or of the program as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Outcome {
    Pending,
    Resolved { value: Value },
    Failed { error: WorkflowError },
}

impl Outcome {
    pub fn resolved(value: Value) -> Self {
        Self::Resolved { value }
    }

    pub fn failed(error: WorkflowError) -> Self {
        Self::Failed { error }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    /// Resolved or failed
    pub fn is_settled(&self) -> bool {
        !self.is_pending()
    }

    /// `None` while pending
    pub fn into_result(self) -> Option<Result<Value, WorkflowError>> {
        match self {
            Self::Pending => None,
            Self::Resolved { value } => Some(Ok(value)),
            Self::Failed { error } => Some(Err(error)),
        }
    }
}

impl From<Result<Value, WorkflowError>> for Outcome {
    fn from(result: Result<Value, WorkflowError>) -> Self {
        match result {
            Ok(value) => Self::resolved(value),
            Err(error) => Self::failed(error),
        }
    }
}

/// A durable workflow program
///
/// The program is an ordinary async function over a [`WorkflowContext`]. It is
/// re-run from the start on every orchestration cycle, with calls that already
/// completed resolving instantly from history.
///
/// # Determinism
///
/// Given the same history, the program must make the same calls in the same
/// order. Branch only on inputs and call results; reach the outside world
/// (clocks, randomness, I/O) through tasks.
///
/// # Example
///
/// ```ignore
/// use durable_engine::prelude::*;
///
/// struct OrderWorkflow;
///
/// impl Workflow for OrderWorkflow {
///     const NAME: &'static str = "orders";
///     type Input = OrderInput;
///     type Output = OrderReceipt;
///
///     fn run(
///         ctx: WorkflowContext,
///         input: Self::Input,
///     ) -> impl Future<Output = Result<Self::Output, WorkflowError>> + 'static {
///         async move {
///             let charge = ctx.task("charge", json!(input.amount)).await?;
///             ctx.sleep_for(Duration::from_secs(60)).await?;
///             Ok(OrderReceipt::from(charge))
///         }
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique name for this workflow
    ///
    /// This is the first part of every execution id of the workflow.
    const NAME: &'static str;

    /// Input type
    type Input: DeserializeOwned + 'static;

    /// Output type
    type Output: Serialize + 'static;

    /// The program body
    fn run(
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> impl Future<Output = Result<Self::Output, WorkflowError>> + 'static;
}
