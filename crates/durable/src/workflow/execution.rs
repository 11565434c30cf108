//! Execution records and identifiers
//!
//! An execution id has the form `workflowName/executionName`. The execution
//! name may itself contain `/`; the workflow name may not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Seq;

/// Prefix reserved for names generated by the engine
pub const INTERNAL_EXECUTION_NAME_PREFIX: &str = "%";

/// Error returned for malformed execution ids
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid execution id: {0}")]
pub struct InvalidExecutionId(pub String);

/// Build an execution id from its parts
pub fn format_execution_id(workflow_name: &str, execution_name: &str) -> String {
    format!("{workflow_name}/{execution_name}")
}

/// Split an execution id into `(workflow_name, execution_name)`
pub fn parse_execution_id(execution_id: &str) -> Result<(&str, &str), InvalidExecutionId> {
    match execution_id.split_once('/') {
        Some((workflow, name)) if !workflow.is_empty() && !name.is_empty() => Ok((workflow, name)),
        _ => Err(InvalidExecutionId(execution_id.to_string())),
    }
}

/// Workflow name part of an execution id
pub fn parse_workflow_name(execution_id: &str) -> Result<&str, InvalidExecutionId> {
    parse_execution_id(execution_id).map(|(workflow, _)| workflow)
}

/// Deterministic execution name for a child started at `seq`
///
/// Replaying the parent always yields the same child id, which keeps the
/// start idempotent. The prefix keeps it out of the user namespace.
pub fn child_execution_name(parent_execution_id: &str, seq: Seq) -> String {
    format!(
        "{INTERNAL_EXECUTION_NAME_PREFIX}{}-{seq}",
        parent_execution_id.replacen('/', "-", 1)
    )
}

/// Dedupe id attached to a signal sent by a workflow at `seq`
pub fn signal_dedupe_id(execution_id: &str, seq: Seq) -> String {
    format!("{execution_id}/{seq}")
}

/// Calling execution of a child workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ParentRef {
    pub execution_id: String,
    pub seq: Seq,
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Durable record of one execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,

    /// Output of a succeeded execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error name of a failed execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl Execution {
    /// A new in-progress execution
    pub fn in_progress(
        id: impl Into<String>,
        workflow_name: impl Into<String>,
        parent: Option<ParentRef>,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_name: workflow_name.into(),
            status: ExecutionStatus::InProgress,
            parent,
            result: None,
            error: None,
            message: None,
            start_time,
            end_time: None,
        }
    }
}
