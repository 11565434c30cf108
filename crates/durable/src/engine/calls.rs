//! Call registry: correlation and triggers for every kind of call
//!
//! Each async operation a program starts becomes an [`EventualCall`]. Its
//! [`EventualDefinition`] says which history event originated it (checked on
//! replay) and which later events, signals or racing calls settle it.
//! Nothing here performs side effects.

use std::time::Duration;

use serde_json::Value;

use crate::workflow::{
    Command, EntityOperation, EventEnvelope, EventKind, Outcome, Schedule, Seq, SignalTarget,
    WorkflowError,
};

/// One async operation requested by a program
#[derive(Debug, Clone, PartialEq)]
pub enum EventualCall {
    Task {
        name: String,
        input: Value,
        heartbeat: Option<Duration>,
        timeout: Option<Seq>,
    },
    ChildWorkflow {
        name: String,
        input: Value,
        timeout: Option<Seq>,
    },
    AwaitTimer {
        schedule: Schedule,
    },
    SendSignal {
        target: SignalTarget,
        signal_id: String,
        payload: Value,
    },
    ExpectSignal {
        signal_id: String,
        timeout: Option<Seq>,
    },
    RegisterSignalHandler {
        signal_id: String,
    },
    EmitEvents {
        events: Vec<EventEnvelope>,
    },
    Entity {
        operation: EntityOperation,
    },
    InvokeTransaction {
        name: String,
        input: Value,
    },
    /// `satisfied` is the predicate's value when the call was made
    Condition {
        satisfied: bool,
        timeout: Option<Seq>,
    },
}

/// Matches the origin event of a call during replay
#[derive(Debug, Clone, PartialEq)]
pub enum Correlation {
    TaskScheduled { name: String },
    ChildWorkflowScheduled { name: String },
    TimerScheduled,
    SignalSent { signal_id: String },
    EventsEmitted,
    EntityRequest { operation: EntityOperation },
    TransactionRequest { name: String },
}

impl Correlation {
    /// Whether `event` is the origin event of the call
    pub fn is_corresponding(&self, event: &EventKind) -> bool {
        match (self, event) {
            (Self::TaskScheduled { name }, EventKind::TaskScheduled { name: other, .. }) => {
                name == other
            }
            (
                Self::ChildWorkflowScheduled { name },
                EventKind::ChildWorkflowScheduled { name: other, .. },
            ) => name == other,
            (Self::TimerScheduled, EventKind::TimerScheduled { .. }) => true,
            (
                Self::SignalSent { signal_id },
                EventKind::SignalSent {
                    signal_id: other, ..
                },
            ) => signal_id == other,
            (Self::EventsEmitted, EventKind::EventsEmitted { .. }) => true,
            (
                Self::EntityRequest { operation },
                EventKind::EntityRequest {
                    operation: other, ..
                },
            ) => operation.corresponds_to(other),
            (
                Self::TransactionRequest { name },
                EventKind::TransactionRequest {
                    transaction_name, ..
                },
            ) => name == transaction_name,
            _ => false,
        }
    }
}

/// Rule that maps something observed during replay to a call's outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// A completion event of the given type carrying the call's seq
    OnWorkflowEvent { event_type: &'static str },

    /// Any SignalReceived with a matching id
    OnSignal { signal_id: String },

    /// Another call settled first
    OnPromiseResolution { seq: Seq, outcome: Outcome },

    /// Re-check the call after every applied event
    AfterEveryEvent,
}

/// Correlation, triggers and immediate result of one call
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventualDefinition {
    pub correlation: Option<Correlation>,
    pub triggers: Vec<Trigger>,

    /// Settled at creation, without waiting for any event
    pub result: Option<Outcome>,
}

impl EventualDefinition {
    /// Whether `event` is the origin event of this call
    pub fn is_corresponding(&self, event: &EventKind) -> bool {
        self.correlation
            .as_ref()
            .is_some_and(|c| c.is_corresponding(event))
    }

    /// Whether a completion of this type is expected by the call
    pub fn accepts(&self, event: &EventKind) -> bool {
        let event_type = event.type_name();
        self.triggers.iter().any(
            |t| matches!(t, Trigger::OnWorkflowEvent { event_type: e } if *e == event_type),
        )
    }

    /// Signal ids the call listens to
    pub fn listens_to(&self, signal_id: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, Trigger::OnSignal { signal_id: s } if s == signal_id))
    }

    /// Outcome to take when call `seq` settles first
    pub fn on_resolution_of(&self, seq: Seq) -> Option<&Outcome> {
        self.triggers.iter().find_map(|t| match t {
            Trigger::OnPromiseResolution { seq: s, outcome } if *s == seq => Some(outcome),
            _ => None,
        })
    }

    /// Seq of the racing call, if any
    pub fn races(&self) -> Option<Seq> {
        self.triggers.iter().find_map(|t| match t {
            Trigger::OnPromiseResolution { seq, .. } => Some(*seq),
            _ => None,
        })
    }

    pub fn checks_after_every_event(&self) -> bool {
        self.triggers.contains(&Trigger::AfterEveryEvent)
    }
}

/// Outcome carried by a completion event
pub fn completion_outcome(event: &EventKind) -> Option<Outcome> {
    match event {
        EventKind::TaskSucceeded { result, .. }
        | EventKind::ChildWorkflowSucceeded { result, .. }
        | EventKind::EntityRequestSucceeded { result, .. }
        | EventKind::TransactionRequestSucceeded { result, .. } => {
            Some(Outcome::resolved(result.clone()))
        }
        EventKind::TaskFailed { error, message, .. }
        | EventKind::ChildWorkflowFailed { error, message, .. }
        | EventKind::EntityRequestFailed { error, message, .. }
        | EventKind::TransactionRequestFailed { error, message, .. } => Some(Outcome::failed(
            WorkflowError::new(error.clone(), message.clone()),
        )),
        EventKind::TaskHeartbeatTimedOut { .. } => {
            Some(Outcome::failed(WorkflowError::heartbeat_timeout()))
        }
        EventKind::TimerCompleted { .. } => Some(Outcome::resolved(Value::Null)),
        _ => None,
    }
}

fn on_event(event_type: &'static str) -> Trigger {
    Trigger::OnWorkflowEvent { event_type }
}

fn race(timeout: Option<Seq>, outcome: Outcome) -> Option<Trigger> {
    timeout.map(|seq| Trigger::OnPromiseResolution { seq, outcome })
}

impl EventualCall {
    /// Short name used in logs and errors
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Task { .. } => "task",
            Self::ChildWorkflow { .. } => "child_workflow",
            Self::AwaitTimer { .. } => "timer",
            Self::SendSignal { .. } => "send_signal",
            Self::ExpectSignal { .. } => "expect_signal",
            Self::RegisterSignalHandler { .. } => "signal_handler",
            Self::EmitEvents { .. } => "emit_events",
            Self::Entity { .. } => "entity",
            Self::InvokeTransaction { .. } => "transaction",
            Self::Condition { .. } => "condition",
        }
    }

    /// Human readable description of the call
    pub fn describe(&self) -> String {
        match self {
            Self::Task { name, .. } => format!("task '{name}'"),
            Self::ChildWorkflow { name, .. } => format!("child workflow '{name}'"),
            Self::SendSignal { signal_id, .. } => format!("send signal '{signal_id}'"),
            Self::ExpectSignal { signal_id, .. } => format!("expect signal '{signal_id}'"),
            Self::RegisterSignalHandler { signal_id } => format!("signal handler '{signal_id}'"),
            Self::Entity { operation } => match operation.entity_name() {
                Some(name) => format!("entity {} on '{name}'", operation.kind()),
                None => format!("entity {}", operation.kind()),
            },
            Self::InvokeTransaction { name, .. } => format!("transaction '{name}'"),
            other => other.kind_name().to_string(),
        }
    }

    /// Compute the correlation and triggers of the call
    pub fn definition(&self) -> EventualDefinition {
        match self {
            Self::Task { name, timeout, .. } => EventualDefinition {
                correlation: Some(Correlation::TaskScheduled { name: name.clone() }),
                triggers: [
                    Some(on_event("task_succeeded")),
                    Some(on_event("task_failed")),
                    Some(on_event("task_heartbeat_timed_out")),
                    race(
                        *timeout,
                        Outcome::failed(WorkflowError::timeout("Task Timed Out")),
                    ),
                ]
                .into_iter()
                .flatten()
                .collect(),
                result: None,
            },
            Self::ChildWorkflow { name, timeout, .. } => EventualDefinition {
                correlation: Some(Correlation::ChildWorkflowScheduled { name: name.clone() }),
                triggers: [
                    Some(on_event("child_workflow_succeeded")),
                    Some(on_event("child_workflow_failed")),
                    race(
                        *timeout,
                        Outcome::failed(WorkflowError::timeout("Child Workflow Timed Out")),
                    ),
                ]
                .into_iter()
                .flatten()
                .collect(),
                result: None,
            },
            Self::AwaitTimer { .. } => EventualDefinition {
                correlation: Some(Correlation::TimerScheduled),
                triggers: vec![on_event("timer_completed")],
                result: None,
            },
            Self::SendSignal { signal_id, .. } => EventualDefinition {
                correlation: Some(Correlation::SignalSent {
                    signal_id: signal_id.clone(),
                }),
                triggers: vec![],
                result: Some(Outcome::resolved(Value::Null)),
            },
            Self::ExpectSignal { signal_id, timeout } => EventualDefinition {
                correlation: None,
                triggers: [
                    Some(Trigger::OnSignal {
                        signal_id: signal_id.clone(),
                    }),
                    race(
                        *timeout,
                        Outcome::failed(WorkflowError::timeout("Expect Signal Timed Out")),
                    ),
                ]
                .into_iter()
                .flatten()
                .collect(),
                result: None,
            },
            Self::RegisterSignalHandler { signal_id } => EventualDefinition {
                correlation: None,
                triggers: vec![Trigger::OnSignal {
                    signal_id: signal_id.clone(),
                }],
                result: None,
            },
            Self::EmitEvents { .. } => EventualDefinition {
                correlation: Some(Correlation::EventsEmitted),
                triggers: vec![],
                result: Some(Outcome::resolved(Value::Null)),
            },
            Self::Entity { operation } => EventualDefinition {
                correlation: Some(Correlation::EntityRequest {
                    operation: operation.clone(),
                }),
                triggers: vec![
                    on_event("entity_request_succeeded"),
                    on_event("entity_request_failed"),
                ],
                result: None,
            },
            Self::InvokeTransaction { name, .. } => EventualDefinition {
                correlation: Some(Correlation::TransactionRequest { name: name.clone() }),
                triggers: vec![
                    on_event("transaction_request_succeeded"),
                    on_event("transaction_request_failed"),
                ],
                result: None,
            },
            Self::Condition { satisfied, timeout } => {
                if *satisfied {
                    EventualDefinition {
                        correlation: None,
                        triggers: vec![],
                        result: Some(Outcome::resolved(Value::Bool(true))),
                    }
                } else {
                    EventualDefinition {
                        correlation: None,
                        triggers: [
                            Some(Trigger::AfterEveryEvent),
                            race(*timeout, Outcome::resolved(Value::Bool(false))),
                        ]
                        .into_iter()
                        .flatten()
                        .collect(),
                        result: None,
                    }
                }
            }
        }
    }

    /// Command that dispatches the call, for calls with an external side effect
    pub fn command(&self, seq: Seq) -> Option<Command> {
        match self {
            Self::Task {
                name,
                input,
                heartbeat,
                ..
            } => Some(Command::ScheduleTask {
                seq,
                name: name.clone(),
                input: input.clone(),
                heartbeat: *heartbeat,
            }),
            Self::ChildWorkflow { name, input, .. } => Some(Command::StartChildWorkflow {
                seq,
                name: name.clone(),
                input: input.clone(),
            }),
            Self::AwaitTimer { schedule } => Some(Command::StartTimer {
                seq,
                schedule: schedule.clone(),
            }),
            Self::SendSignal {
                target,
                signal_id,
                payload,
            } => Some(Command::SendSignal {
                seq,
                target: target.clone(),
                signal_id: signal_id.clone(),
                payload: payload.clone(),
            }),
            Self::EmitEvents { events } => Some(Command::EmitEvents {
                seq,
                events: events.clone(),
            }),
            Self::Entity { operation } => Some(Command::EntityRequest {
                seq,
                operation: operation.clone(),
            }),
            Self::InvokeTransaction { name, input } => Some(Command::InvokeTransaction {
                seq,
                transaction_name: name.clone(),
                input: input.clone(),
            }),
            Self::ExpectSignal { .. }
            | Self::RegisterSignalHandler { .. }
            | Self::Condition { .. } => None,
        }
    }
}
