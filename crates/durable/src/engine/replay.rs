//! Replay verification
//!
//! Replays a stored history through the current program and checks that the
//! outcome agrees with what the execution record says happened. Useful before
//! deploying a changed program.

use tracing::{info, instrument};

use super::error::DeterminismError;
use super::interpreter::interpret;
use super::registry::WorkflowProgram;
use crate::workflow::{Execution, ExecutionStatus, Outcome, WorkflowError, WorkflowEvent};

/// Replay a full history and return the program's outcome
pub fn replay_execution(
    program: &dyn WorkflowProgram,
    history: &[WorkflowEvent],
) -> Result<Outcome, DeterminismError> {
    interpret(program, history).map(|interpretation| interpretation.outcome)
}

/// Replay `history` and compare the outcome with `execution`
#[instrument(skip(program, execution, history), fields(execution_id = %execution.id))]
pub fn verify_execution(
    program: &dyn WorkflowProgram,
    execution: &Execution,
    history: &[WorkflowEvent],
) -> Result<(), DeterminismError> {
    let received = replay_execution(program, history)?;

    let expected = match execution.status {
        ExecutionStatus::InProgress => Outcome::Pending,
        ExecutionStatus::Succeeded => {
            Outcome::resolved(execution.result.clone().unwrap_or_default())
        }
        ExecutionStatus::Failed => Outcome::failed(WorkflowError::new(
            execution.error.clone().unwrap_or_default(),
            execution.message.clone().unwrap_or_default(),
        )),
    };

    if received != expected {
        return Err(DeterminismError::ResultMismatch {
            expected: describe(&expected),
            received: describe(&received),
        });
    }

    info!(status = %execution.status, "replay matches execution record");
    Ok(())
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Pending => "pending".to_string(),
        Outcome::Resolved { value } => format!("resolved {value}"),
        Outcome::Failed { error } => format!("failed {error}"),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::engine::WorkflowRegistry;
    use crate::workflow::EventKind;

    fn program() -> std::sync::Arc<dyn WorkflowProgram> {
        let mut registry = WorkflowRegistry::new();
        registry.register_fn("lookup", |ctx, input| async move {
            ctx.task("fetch", input).await
        });
        registry.get("lookup").unwrap()
    }

    fn history() -> Vec<WorkflowEvent> {
        vec![
            WorkflowEvent::new(EventKind::WorkflowStarted {
                execution_id: "lookup/a".into(),
                workflow_name: "lookup".into(),
                input: json!("key"),
                parent: None,
            }),
            WorkflowEvent::new(EventKind::TaskScheduled {
                seq: 0,
                name: "fetch".into(),
            }),
            WorkflowEvent::new(EventKind::TaskSucceeded {
                seq: 0,
                result: json!("value"),
            }),
        ]
    }

    fn execution(status: ExecutionStatus, result: Option<serde_json::Value>) -> Execution {
        let mut execution = Execution::in_progress("lookup/a", "lookup", None, Utc::now());
        execution.status = status;
        execution.result = result;
        execution
    }

    #[test]
    fn test_replay_returns_outcome() {
        let outcome = replay_execution(program().as_ref(), &history()).unwrap();
        assert_eq!(outcome, Outcome::resolved(json!("value")));
    }

    #[test]
    fn test_verify_matching_record() {
        let record = execution(ExecutionStatus::Succeeded, Some(json!("value")));
        assert!(verify_execution(program().as_ref(), &record, &history()).is_ok());
    }

    #[test]
    fn test_verify_detects_result_mismatch() {
        let record = execution(ExecutionStatus::Succeeded, Some(json!("other")));
        let err = verify_execution(program().as_ref(), &record, &history()).unwrap_err();
        assert!(matches!(err, DeterminismError::ResultMismatch { .. }));

        let record = execution(ExecutionStatus::InProgress, None);
        assert!(verify_execution(program().as_ref(), &record, &history()).is_err());
    }
}
