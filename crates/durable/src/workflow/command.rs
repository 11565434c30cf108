//! Commands produced by an interpretation pass

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{EntityOperation, Seq, SignalTarget};

/// An application event published by a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Event name subscribers match on
    pub name: String,

    /// Event body
    pub event: Value,
}

impl EventEnvelope {
    pub fn new(name: impl Into<String>, event: Value) -> Self {
        Self {
            name: name.into(),
            event,
        }
    }
}

/// When a timer should fire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Relative to the time the command is dispatched
    Duration {
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// At an absolute point in time
    Time { until: DateTime<Utc> },
}

impl Schedule {
    pub fn duration(duration: Duration) -> Self {
        Self::Duration { duration }
    }

    pub fn time(until: DateTime<Utc>) -> Self {
        Self::Time { until }
    }

    /// Resolve the schedule against the dispatch time
    pub fn until_time(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Duration { duration } => chrono::Duration::from_std(*duration)
                .ok()
                .and_then(|delta| base.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            Self::Time { until } => *until,
        }
    }
}

/// Instructions computed by the interpreter for the orchestrator to dispatch
///
/// Commands are never persisted. Dispatching one yields the origin event
/// (`TaskScheduled`, `TimerScheduled`, ...) that is appended to history, which
/// is what stops the same command from being produced again on replay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Invoke a task on a task worker
    ScheduleTask {
        seq: Seq,
        name: String,
        input: Value,

        /// Interval the worker must heartbeat within
        #[serde(default, with = "option_duration_millis")]
        heartbeat: Option<Duration>,
    },

    /// Start a durable timer
    StartTimer { seq: Seq, schedule: Schedule },

    /// Start a child execution
    StartChildWorkflow { seq: Seq, name: String, input: Value },

    /// Deliver a signal to another execution
    SendSignal {
        seq: Seq,
        target: SignalTarget,
        signal_id: String,
        payload: Value,
    },

    /// Publish application events
    EmitEvents { seq: Seq, events: Vec<EventEnvelope> },

    /// Run an entity operation
    EntityRequest { seq: Seq, operation: EntityOperation },

    /// Invoke a registered transaction
    InvokeTransaction {
        seq: Seq,
        transaction_name: String,
        input: Value,
    },
}

impl Command {
    /// Sequence number of the call that produced this command
    pub fn seq(&self) -> Seq {
        match self {
            Self::ScheduleTask { seq, .. }
            | Self::StartTimer { seq, .. }
            | Self::StartChildWorkflow { seq, .. }
            | Self::SendSignal { seq, .. }
            | Self::EmitEvents { seq, .. }
            | Self::EntityRequest { seq, .. }
            | Self::InvokeTransaction { seq, .. } => *seq,
        }
    }

    /// Short name used in logs
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ScheduleTask { .. } => "schedule_task",
            Self::StartTimer { .. } => "start_timer",
            Self::StartChildWorkflow { .. } => "start_child_workflow",
            Self::SendSignal { .. } => "send_signal",
            Self::EmitEvents { .. } => "emit_events",
            Self::EntityRequest { .. } => "entity_request",
            Self::InvokeTransaction { .. } => "invoke_transaction",
        }
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_schedule_until_time() {
        let base = Utc::now();
        let schedule = Schedule::duration(Duration::from_secs(10));
        assert_eq!(
            schedule.until_time(base),
            base + chrono::Duration::seconds(10)
        );

        let fixed = base + chrono::Duration::days(1);
        assert_eq!(Schedule::time(fixed).until_time(base), fixed);
    }

    #[test]
    fn test_command_serialization() {
        let command = Command::ScheduleTask {
            seq: 4,
            name: "charge".into(),
            input: json!({"amount": 10}),
            heartbeat: Some(Duration::from_secs(30)),
        };

        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["kind"], "schedule_task");
        assert_eq!(json["heartbeat"], 30_000);

        let parsed: Command = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, command);
        assert_eq!(parsed.seq(), 4);
    }
}
