//! Tasks and the task worker
//!
//! Tasks are units of work invoked by workflows. They:
//! - Run at most once per `(execution, seq, retry)` thanks to write-once claims
//! - May heartbeat to prove liveness
//! - May complete asynchronously through a [`TaskToken`]

mod context;
mod definition;
mod fallback;
mod registry;
mod token;
mod worker;

pub use context::TaskContext;
pub use definition::{Task, TaskError, TaskResult};
pub use fallback::{TaskFallbackHandler, TaskFallbackKind, TaskFallbackRequest};
pub use registry::{TaskHandler, TaskRegistry};
pub use token::{TaskToken, TokenError};
pub use worker::{TaskWorker, TaskWorkerConfig, TaskWorkerError, TaskWorkerOutcome};
