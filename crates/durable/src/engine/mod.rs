//! Workflow replay engine
//!
//! The engine turns a program plus an ordered history into an outcome and a
//! list of commands. Nothing in this module performs I/O.

mod calls;
mod context;
mod error;
mod executor;
mod interpreter;
mod registry;
mod replay;

pub use calls::{completion_outcome, Correlation, EventualCall, EventualDefinition, Trigger};
pub use context::{Eventual, SignalHandler, TaskOptions, WorkflowContext};
pub use error::DeterminismError;
pub use executor::{event_key, filter_events, EventKey, ExecutorRun, WorkflowExecutor};
pub use interpreter::{interpret, Interpretation};
pub use registry::{RegistryError, WorkflowProgram, WorkflowRegistry};
pub use replay::{replay_execution, verify_execution};
