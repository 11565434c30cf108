//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` owns the replay state of one execution:
//! - merging persisted history with newly delivered events
//! - dropping redelivered duplicates before they reach the interpreter
//! - exposing the commands the next orchestration cycle has to dispatch

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::error::DeterminismError;
use super::interpreter::{interpret, Interpretation};
use super::registry::WorkflowProgram;
use crate::workflow::{Command, EventKind, Outcome, Seq, WorkflowEvent};

/// Identity of an event for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKey {
    /// WorkflowStarted, WorkflowCompleted and WorkflowFailed occur once
    Lifecycle(&'static str),

    /// Origin and completion events of a call
    Call { event_type: &'static str, seq: Seq },

    /// Signal carrying a sender-provided dedupe id
    SignalId { signal_id: String, id: String },

    /// Signal without a dedupe id, identified by its payload
    SignalPayload { signal_id: String, payload: String },
}

/// Deduplication key of an event; `None` for task bracket markers
pub fn event_key(kind: &EventKind) -> Option<EventKey> {
    match kind {
        EventKind::WorkflowTaskStarted | EventKind::WorkflowTaskCompleted => None,
        EventKind::WorkflowStarted { .. }
        | EventKind::WorkflowCompleted { .. }
        | EventKind::WorkflowFailed { .. } => Some(EventKey::Lifecycle(kind.type_name())),
        EventKind::SignalReceived {
            signal_id,
            id: Some(id),
            ..
        } => Some(EventKey::SignalId {
            signal_id: signal_id.clone(),
            id: id.clone(),
        }),
        EventKind::SignalReceived {
            signal_id,
            payload,
            id: None,
        } => Some(EventKey::SignalPayload {
            signal_id: signal_id.clone(),
            payload: payload.to_string(),
        }),
        other => other.seq().map(|seq| EventKey::Call {
            event_type: other.type_name(),
            seq,
        }),
    }
}

/// Drop events already present in `history` or earlier in `new_events`
pub fn filter_events(history: &[WorkflowEvent], new_events: Vec<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut seen: HashSet<EventKey> = history.iter().filter_map(|e| event_key(&e.kind)).collect();
    dedupe(&mut seen, new_events)
}

fn dedupe(seen: &mut HashSet<EventKey>, events: Vec<WorkflowEvent>) -> Vec<WorkflowEvent> {
    events
        .into_iter()
        .filter(|event| match event_key(&event.kind) {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

/// Result of one executor run
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorRun {
    /// Outcome of the program after this run
    pub outcome: Outcome,

    /// Commands to dispatch, in seq order
    pub commands: Vec<Command>,

    /// Delivered events that were not duplicates, in delivery order
    pub new_history_events: Vec<WorkflowEvent>,
}

/// Replay session of one execution
///
/// # Example
///
/// ```ignore
/// let program = registry.get("orders")?;
/// let mut executor = WorkflowExecutor::new(program, store.read(&id).await?);
///
/// let run = executor.run(batch)?;
/// for command in &run.commands {
///     // dispatch, then record the origin event
/// }
/// ```
pub struct WorkflowExecutor {
    program: Arc<dyn WorkflowProgram>,
    history: Vec<WorkflowEvent>,
    seen: HashSet<EventKey>,
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("workflow", &self.program.name())
            .field("history", &self.history.len())
            .finish()
    }
}

impl WorkflowExecutor {
    /// Create an executor over persisted history
    pub fn new(program: Arc<dyn WorkflowProgram>, history: Vec<WorkflowEvent>) -> Self {
        let seen = history.iter().filter_map(|e| event_key(&e.kind)).collect();
        Self {
            program,
            history,
            seen,
        }
    }

    /// History known to the executor, including events accepted by earlier runs
    pub fn history(&self) -> &[WorkflowEvent] {
        &self.history
    }

    /// Merge `new_events` into history and interpret
    ///
    /// State is only updated when interpretation succeeds, so a failed run can
    /// be retried with the same batch.
    pub fn run(&mut self, new_events: Vec<WorkflowEvent>) -> Result<ExecutorRun, DeterminismError> {
        let delivered = new_events.len();
        let mut seen = self.seen.clone();
        let accepted = dedupe(&mut seen, new_events);

        let base = self.history.len();
        self.history.extend(accepted);

        let Interpretation { outcome, commands } =
            match interpret(self.program.as_ref(), &self.history) {
                Ok(interpretation) => interpretation,
                Err(err) => {
                    self.history.truncate(base);
                    return Err(err);
                }
            };

        self.seen = seen;
        let new_history_events = self.history[base..].to_vec();

        debug!(
            workflow = self.program.name(),
            delivered,
            accepted = new_history_events.len(),
            commands = commands.len(),
            "executor run finished"
        );

        Ok(ExecutorRun {
            outcome,
            commands,
            new_history_events,
        })
    }

    /// Append events produced outside interpretation, such as command origins
    pub fn record(&mut self, events: impl IntoIterator<Item = WorkflowEvent>) {
        for event in events {
            if let Some(key) = event_key(&event.kind) {
                self.seen.insert(key);
            }
            self.history.push(event);
        }
    }
}
