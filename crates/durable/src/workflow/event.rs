//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityOperation, EventEnvelope, ParentRef};

/// Position of a call within one execution, assigned in program order from 0.
pub type Seq = u32;

/// One entry of an execution's history
///
/// Every event is stamped with the time it was created. The interpreter never
/// reads timestamps, so replays do not depend on wall-clock time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEvent {
    /// When the event was produced
    pub timestamp: DateTime<Utc>,

    /// Type-specific payload
    #[serde(flatten)]
    pub kind: EventKind,
}

impl WorkflowEvent {
    /// Create an event stamped with the current time
    pub fn new(kind: EventKind) -> Self {
        Self::at(kind, Utc::now())
    }

    /// Create an event with an explicit timestamp
    pub fn at(kind: EventKind, timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, kind }
    }

    /// Sequence number of the call this event belongs to, if any
    pub fn seq(&self) -> Option<Seq> {
        self.kind.seq()
    }

    /// Whether this event is replayed by the interpreter
    pub fn is_history_event(&self) -> bool {
        !self.kind.is_task_bracket()
    }
}

/// Events stored in an execution's history
///
/// Origin events (`*Scheduled`, `SignalSent`, `EventsEmitted`, `*Request`) are
/// written by the orchestrator when it dispatches a command. Completion events
/// arrive later through the execution queue and carry the same `seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Execution was started with the given input
    WorkflowStarted {
        /// Full execution id (`workflow_name/execution_name`)
        execution_id: String,

        /// Registered name of the workflow program
        workflow_name: String,

        /// Input handed to the program
        input: Value,

        /// Calling execution, when started as a child workflow
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentRef>,
    },

    /// Program returned successfully
    WorkflowCompleted { output: Value },

    /// Program returned an error
    WorkflowFailed { error: String, message: String },

    // =========================================================================
    // Orchestration Cycle Markers
    // =========================================================================
    /// Start of one orchestrator cycle
    WorkflowTaskStarted,

    /// End of one orchestrator cycle
    WorkflowTaskCompleted,

    // =========================================================================
    // Task Events
    // =========================================================================
    TaskScheduled { seq: Seq, name: String },

    TaskSucceeded { seq: Seq, result: Value },

    TaskFailed {
        seq: Seq,
        error: String,
        message: String,
    },

    /// No heartbeat was recorded within the declared interval
    TaskHeartbeatTimedOut { seq: Seq },

    // =========================================================================
    // Timer Events
    // =========================================================================
    TimerScheduled { seq: Seq, until_time: DateTime<Utc> },

    TimerCompleted { seq: Seq },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    ChildWorkflowScheduled { seq: Seq, name: String, input: Value },

    ChildWorkflowSucceeded { seq: Seq, result: Value },

    ChildWorkflowFailed {
        seq: Seq,
        error: String,
        message: String,
    },

    // =========================================================================
    // Signal Events
    // =========================================================================
    /// The program sent a signal to another execution
    SignalSent {
        seq: Seq,
        signal_id: String,
        execution_id: String,
        payload: Value,
    },

    /// A signal was delivered to this execution
    ///
    /// Correlated by `signal_id` rather than `seq`. The optional `id` lets
    /// senders deduplicate redelivery.
    SignalReceived {
        signal_id: String,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    // =========================================================================
    // Event Emission, Entities and Transactions
    // =========================================================================
    EventsEmitted { seq: Seq, events: Vec<EventEnvelope> },

    EntityRequest { seq: Seq, operation: EntityOperation },

    EntityRequestSucceeded { seq: Seq, result: Value },

    EntityRequestFailed {
        seq: Seq,
        error: String,
        message: String,
    },

    TransactionRequest {
        seq: Seq,
        transaction_name: String,
        input: Value,
    },

    TransactionRequestSucceeded { seq: Seq, result: Value },

    TransactionRequestFailed {
        seq: Seq,
        error: String,
        message: String,
    },
}

impl EventKind {
    /// Sequence number carried by the event
    pub fn seq(&self) -> Option<Seq> {
        match self {
            Self::TaskScheduled { seq, .. }
            | Self::TaskSucceeded { seq, .. }
            | Self::TaskFailed { seq, .. }
            | Self::TaskHeartbeatTimedOut { seq }
            | Self::TimerScheduled { seq, .. }
            | Self::TimerCompleted { seq }
            | Self::ChildWorkflowScheduled { seq, .. }
            | Self::ChildWorkflowSucceeded { seq, .. }
            | Self::ChildWorkflowFailed { seq, .. }
            | Self::SignalSent { seq, .. }
            | Self::EventsEmitted { seq, .. }
            | Self::EntityRequest { seq, .. }
            | Self::EntityRequestSucceeded { seq, .. }
            | Self::EntityRequestFailed { seq, .. }
            | Self::TransactionRequest { seq, .. }
            | Self::TransactionRequestSucceeded { seq, .. }
            | Self::TransactionRequestFailed { seq, .. } => Some(*seq),
            Self::WorkflowStarted { .. }
            | Self::WorkflowCompleted { .. }
            | Self::WorkflowFailed { .. }
            | Self::WorkflowTaskStarted
            | Self::WorkflowTaskCompleted
            | Self::SignalReceived { .. } => None,
        }
    }

    /// Serialized type tag, used in logs and deduplication keys
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowTaskStarted => "workflow_task_started",
            Self::WorkflowTaskCompleted => "workflow_task_completed",
            Self::TaskScheduled { .. } => "task_scheduled",
            Self::TaskSucceeded { .. } => "task_succeeded",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskHeartbeatTimedOut { .. } => "task_heartbeat_timed_out",
            Self::TimerScheduled { .. } => "timer_scheduled",
            Self::TimerCompleted { .. } => "timer_completed",
            Self::ChildWorkflowScheduled { .. } => "child_workflow_scheduled",
            Self::ChildWorkflowSucceeded { .. } => "child_workflow_succeeded",
            Self::ChildWorkflowFailed { .. } => "child_workflow_failed",
            Self::SignalSent { .. } => "signal_sent",
            Self::SignalReceived { .. } => "signal_received",
            Self::EventsEmitted { .. } => "events_emitted",
            Self::EntityRequest { .. } => "entity_request",
            Self::EntityRequestSucceeded { .. } => "entity_request_succeeded",
            Self::EntityRequestFailed { .. } => "entity_request_failed",
            Self::TransactionRequest { .. } => "transaction_request",
            Self::TransactionRequestSucceeded { .. } => "transaction_request_succeeded",
            Self::TransactionRequestFailed { .. } => "transaction_request_failed",
        }
    }

    /// Cycle markers are logged but never interpreted
    pub fn is_task_bracket(&self) -> bool {
        matches!(self, Self::WorkflowTaskStarted | Self::WorkflowTaskCompleted)
    }

    /// Events written when a command is dispatched
    pub fn is_origin(&self) -> bool {
        matches!(
            self,
            Self::TaskScheduled { .. }
                | Self::TimerScheduled { .. }
                | Self::ChildWorkflowScheduled { .. }
                | Self::SignalSent { .. }
                | Self::EventsEmitted { .. }
                | Self::EntityRequest { .. }
                | Self::TransactionRequest { .. }
        )
    }

    /// Events that settle a call identified by `seq`
    pub fn is_completion(&self) -> bool {
        self.seq().is_some() && !self.is_origin()
    }

    /// Whether this event records the end of the execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. } | Self::WorkflowFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_is_flat() {
        let event = WorkflowEvent::new(EventKind::TaskSucceeded {
            seq: 3,
            result: json!({"ok": true}),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_succeeded");
        assert_eq!(json["seq"], 3);
        assert!(json.get("timestamp").is_some());

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_type_name_matches_serde_tag() {
        let kinds = vec![
            EventKind::WorkflowTaskStarted,
            EventKind::TimerCompleted { seq: 1 },
            EventKind::SignalReceived {
                signal_id: "go".into(),
                payload: Value::Null,
                id: None,
            },
            EventKind::TransactionRequestFailed {
                seq: 2,
                error: "Error".into(),
                message: "boom".into(),
            },
        ];

        for kind in kinds {
            let json = serde_json::to_value(WorkflowEvent::new(kind.clone())).unwrap();
            assert_eq!(json["type"], kind.type_name());
        }
    }

    #[test]
    fn test_classification() {
        let scheduled = EventKind::TaskScheduled {
            seq: 0,
            name: "charge".into(),
        };
        assert!(scheduled.is_origin());
        assert!(!scheduled.is_completion());
        assert_eq!(scheduled.seq(), Some(0));

        let timed_out = EventKind::TaskHeartbeatTimedOut { seq: 0 };
        assert!(timed_out.is_completion());

        let signal = EventKind::SignalReceived {
            signal_id: "go".into(),
            payload: Value::Null,
            id: None,
        };
        assert_eq!(signal.seq(), None);
        assert!(!signal.is_completion());

        assert!(EventKind::WorkflowTaskCompleted.is_task_bracket());
        assert!(!WorkflowEvent::new(EventKind::WorkflowTaskStarted).is_history_event());
        assert!(EventKind::WorkflowCompleted { output: Value::Null }.is_terminal());
    }
}
