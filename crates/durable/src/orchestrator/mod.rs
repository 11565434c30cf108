//! Orchestration loop
//!
//! Drives executions forward: each inbound batch of events becomes one cycle
//! per execution id, serialized per id and parallel across ids.

mod commands;
mod config;
mod cycle;

use std::any::Any;

pub use commands::Collaborators;
pub use config::OrchestratorConfig;
pub use cycle::{BatchReport, CycleFailure, CycleReport, ExecutionMessage, Orchestrator};

use crate::clients::DispatchError;
use crate::engine::{DeterminismError, RegistryError};
use crate::persistence::StoreError;
use crate::workflow::InvalidExecutionId;

/// Errors from orchestration cycles
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Replay does not match history; the execution is left in progress
    #[error("determinism error: {0}")]
    Determinism(#[from] DeterminismError),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Command dispatch failed
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    InvalidExecutionId(#[from] InvalidExecutionId),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    /// Too many events
    #[error("execution {execution_id} has too many events ({count} > {max})")]
    TooManyEvents {
        execution_id: String,
        count: usize,
        max: usize,
    },

    /// The cycle panicked
    #[error("orchestration cycle panicked: {0}")]
    Panicked(String),
}

impl OrchestratorError {
    pub(crate) fn from_panic(panic: Box<dyn Any + Send>) -> Self {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::Panicked(message)
    }

    /// Whether redelivering the same batch may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Dispatch(_))
    }
}
