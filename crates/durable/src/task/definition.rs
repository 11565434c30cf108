//! Task trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use super::TaskContext;
use crate::workflow::error_names;

/// Error type for task failures
///
/// `error` and `message` end up in the `TaskFailed` event the workflow sees.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    /// Error name for programmatic handling
    pub error: String,

    pub message: String,

    /// Additional error details (for logs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl TaskError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Error with the generic `Error` name
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(error_names::ERROR, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::message(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(error_names::INVALID_INPUT, err.to_string())
    }
}

/// What a handler produced
#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult<T> {
    /// Finished; the worker reports `TaskSucceeded`
    Complete(T),

    /// Will be finished later through the task token
    Async,
}

impl<T> From<T> for TaskResult<T> {
    fn from(value: T) -> Self {
        Self::Complete(value)
    }
}

/// A unit of work invoked by workflows through `ctx.task(..)`
///
/// Tasks run at most once per `(execution, seq, retry)`; anything
/// nondeterministic a workflow needs belongs here.
///
/// # Example
///
/// ```ignore
/// use durable_engine::prelude::*;
///
/// struct ChargeCard;
///
/// #[async_trait]
/// impl Task for ChargeCard {
///     const NAME: &'static str = "charge";
///     type Input = ChargeInput;
///     type Output = ChargeReceipt;
///
///     async fn execute(
///         &self,
///         ctx: &TaskContext,
///         input: Self::Input,
///     ) -> Result<TaskResult<Self::Output>, TaskError> {
///         let receipt = payments::charge(input.card, input.amount).await?;
///         Ok(TaskResult::Complete(receipt))
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Name workflows invoke the task by
    const NAME: &'static str;

    type Input: DeserializeOwned + Send;

    type Output: Serialize + Send;

    async fn execute(
        &self,
        ctx: &TaskContext,
        input: Self::Input,
    ) -> Result<TaskResult<Self::Output>, TaskError>;
}
