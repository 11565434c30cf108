//! Signals exchanged between executions and external callers

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{child_execution_name, format_execution_id, EventKind, Seq, WorkflowEvent};

/// Where a workflow-sent signal is delivered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalTarget {
    /// Any execution, by id
    Execution { execution_id: String },

    /// A child this workflow started at `seq`
    ChildExecution { workflow_name: String, seq: Seq },
}

impl SignalTarget {
    pub fn execution(execution_id: impl Into<String>) -> Self {
        Self::Execution {
            execution_id: execution_id.into(),
        }
    }

    pub fn child(workflow_name: impl Into<String>, seq: Seq) -> Self {
        Self::ChildExecution {
            workflow_name: workflow_name.into(),
            seq,
        }
    }

    /// Execution id the signal goes to, given the sending execution
    pub fn resolve(&self, sender_execution_id: &str) -> String {
        match self {
            Self::Execution { execution_id } => execution_id.clone(),
            Self::ChildExecution { workflow_name, seq } => format_execution_id(
                workflow_name,
                &child_execution_name(sender_execution_id, *seq),
            ),
        }
    }
}

/// A signal to deliver to a running execution
///
/// # Example
///
/// ```ignore
/// let signal = WorkflowSignal::new("approve", json!({"by": "ops"}));
/// client.send_signal("orders/abc", signal).await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowSignal {
    /// Identifier handlers and expectations match on
    pub signal_id: String,

    pub payload: Value,

    /// Optional dedupe id; redelivery with the same id is applied once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl WorkflowSignal {
    pub fn new(signal_id: impl Into<String>, payload: Value) -> Self {
        Self {
            signal_id: signal_id.into(),
            payload,
            id: None,
        }
    }

    /// Set the dedupe id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// History event recording delivery of this signal
    pub fn into_event(self) -> WorkflowEvent {
        WorkflowEvent::new(EventKind::SignalReceived {
            signal_id: self.signal_id,
            payload: self.payload,
            id: self.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_child_target() {
        let target = SignalTarget::child("shipping", 2);
        assert_eq!(target.resolve("orders/abc"), "shipping/%orders-abc-2");

        let direct = SignalTarget::execution("billing/x");
        assert_eq!(direct.resolve("orders/abc"), "billing/x");
    }

    #[test]
    fn test_signal_into_event() {
        let event = WorkflowSignal::new("approve", json!({"ok": true}))
            .with_id("req-1")
            .into_event();

        match event.kind {
            EventKind::SignalReceived {
                signal_id, id, ..
            } => {
                assert_eq!(signal_id, "approve");
                assert_eq!(id.as_deref(), Some("req-1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
