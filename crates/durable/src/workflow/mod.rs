//! Workflow abstractions and types
//!
//! This module contains the vocabulary shared by every other layer:
//! - [`Workflow`] trait for defining programs
//! - [`WorkflowEvent`] for persisted history
//! - [`Command`] for side effects requested by a program
//! - [`Execution`] records and execution id helpers
//! - [`WorkflowSignal`] for external communication

mod command;
mod definition;
mod entity;
mod event;
mod execution;
mod signal;

pub(crate) use command::{duration_millis, option_duration_millis};

pub use command::{Command, EventEnvelope, Schedule};
pub use definition::{error_names, Outcome, Workflow, WorkflowError};
pub use entity::{EntityOperation, EntityWrite};
pub use event::{EventKind, Seq, WorkflowEvent};
pub use execution::{
    child_execution_name, format_execution_id, parse_execution_id, parse_workflow_name,
    signal_dedupe_id, Execution, ExecutionStatus, InvalidExecutionId, ParentRef,
    INTERNAL_EXECUTION_NAME_PREFIX,
};
pub use signal::{SignalTarget, WorkflowSignal};
