//! # Durable Workflow Engine
//!
//! A replay-based engine for long-running workflow programs.
//!
//! ## Features
//!
//! - **Deterministic replay**: programs are plain async functions re-run from
//!   the start against an append-only history
//! - **Call correlation**: tasks, timers, child workflows, signals, entity and
//!   transaction requests matched to history by sequence number
//! - **Timeout races and conditions**: any call can race another; the loser's
//!   late completion is ignored
//! - **Batched orchestration**: one cycle per execution id per batch, serialized
//!   per id and concurrent across ids
//! - **At-most-once tasks**: write-once claims, heartbeat monitors and fallback
//!   redelivery of computed results
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Orchestrator                           │
//! │  (groups batches, runs cycles, dispatches commands)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           WorkflowExecutor  →  interpret()                   │
//! │  (dedupes events, replays the program, emits commands)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │       Collaborators: queue, tasks, timers, children, ...     │
//! │  (TaskWorker claims and runs tasks, TimerHandler fires)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_engine::prelude::*;
//!
//! let mut workflows = WorkflowRegistry::new();
//! workflows.register_fn("checkout", |ctx, input| async move {
//!     let timeout = ctx.sleep_for(Duration::from_secs(300));
//!     let options = TaskOptions::default().with_timeout(&timeout);
//!     let receipt = ctx.task_with("charge", input, options).await?;
//!     ctx.emit_events(vec![EventEnvelope::new("charged", receipt.clone())]).await?;
//!     Ok(receipt)
//! });
//!
//! let mut tasks = TaskRegistry::new();
//! tasks.register_fn("charge", |_ctx, input| async move {
//!     Ok(TaskResult::Complete(json!({"charged": input})))
//! });
//!
//! let runtime = LocalRuntime::new(workflows, tasks);
//! runtime
//!     .client()
//!     .start_execution(StartExecutionRequest::new("checkout", json!(25)))
//!     .await?;
//! runtime.run_until_idle().await;
//! ```

pub mod client;
pub mod clients;
pub mod clock;
pub mod engine;
pub mod local;
pub mod orchestrator;
pub mod persistence;
pub mod reliability;
pub mod task;
pub mod telemetry;
pub mod timer;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{ClientError, WorkflowClient};
    pub use crate::clients::{StartExecutionRequest, StartExecutionResponse};
    pub use crate::engine::{
        Eventual, SignalHandler, TaskOptions, WorkflowContext, WorkflowRegistry,
    };
    pub use crate::local::LocalRuntime;
    pub use crate::orchestrator::{ExecutionMessage, Orchestrator, OrchestratorConfig};
    pub use crate::reliability::RetryPolicy;
    pub use crate::task::{Task, TaskContext, TaskError, TaskRegistry, TaskResult};
    pub use crate::workflow::{
        EntityOperation, EventEnvelope, Outcome, SignalTarget, Workflow, WorkflowError,
        WorkflowEvent, WorkflowSignal,
    };
}

// Re-export key types at crate root
pub use client::{ClientError, WorkflowClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{
    interpret, DeterminismError, Interpretation, WorkflowContext, WorkflowExecutor,
    WorkflowProgram, WorkflowRegistry,
};
pub use local::{LocalReport, LocalRuntime};
pub use orchestrator::{BatchReport, Orchestrator, OrchestratorConfig, OrchestratorError};
pub use persistence::{ExecutionStore, HistoryStore, StoreError, TaskStore};
pub use reliability::RetryPolicy;
pub use task::{Task, TaskError, TaskRegistry, TaskResult, TaskToken, TaskWorker};
pub use timer::TimerHandler;
pub use workflow::{
    Command, EventKind, Execution, ExecutionStatus, Outcome, Workflow, WorkflowError,
    WorkflowEvent, WorkflowSignal,
};
