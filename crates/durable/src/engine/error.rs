//! Replay errors

use crate::workflow::Seq;

/// The program's trace no longer matches the persisted history
///
/// Fatal and non-retryable: either history is corrupt or the program was
/// changed in a non-deterministic way. The execution is left in progress for
/// inspection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeterminismError {
    #[error("no workflow_started event found")]
    MissingWorkflowStarted,

    #[error("call {seq} does not match history: program made {call}, history has {event}")]
    CallMismatch {
        seq: Seq,
        call: String,
        event: &'static str,
    },

    #[error("history has {event} for seq {seq} but the program never made that call")]
    MissingCall { seq: Seq, event: &'static str },

    #[error("{event} for seq {seq} cannot complete a {call} call")]
    UnexpectedCompletion {
        seq: Seq,
        event: &'static str,
        call: &'static str,
    },

    #[error("execution returned a different result on replay: expected {expected}, received {received}")]
    ResultMismatch { expected: String, received: String },
}
