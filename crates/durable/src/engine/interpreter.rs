//! Deterministic interpreter
//!
//! Runs a workflow program from its input against an ordered list of history
//! events. The program's root future is polled with a no-op waker: suspension
//! is nothing more than a call node still being `Pending`, so the driver just
//! re-polls after every event that could have changed a node.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::noop_waker;
use serde_json::Value;
use tracing::debug;

use super::context::{ExecutionInfo, Session};
use super::error::DeterminismError;
use super::registry::WorkflowProgram;
use super::WorkflowContext;
use crate::workflow::{error_names, Command, EventKind, Outcome, WorkflowError, WorkflowEvent};

/// Result of one interpretation pass
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    /// `Pending` until the program's root future returns
    pub outcome: Outcome,

    /// Calls that need dispatching, in seq order
    pub commands: Vec<Command>,
}

/// Replay `events` through `program`
///
/// Task bracket events are skipped. The program is started before the first
/// event is applied and re-polled after each one.
pub fn interpret(
    program: &dyn WorkflowProgram,
    events: &[WorkflowEvent],
) -> Result<Interpretation, DeterminismError> {
    let history: Vec<&WorkflowEvent> = events.iter().filter(|e| e.is_history_event()).collect();

    let (info, input) = history
        .iter()
        .find_map(|event| match &event.kind {
            EventKind::WorkflowStarted {
                execution_id,
                workflow_name,
                input,
                parent,
            } => Some((
                ExecutionInfo {
                    execution_id: execution_id.clone(),
                    workflow_name: workflow_name.clone(),
                    start_time: event.timestamp,
                    parent: parent.clone(),
                },
                input.clone(),
            )),
            _ => None,
        })
        .ok_or(DeterminismError::MissingWorkflowStarted)?;

    let execution_id = info.execution_id.clone();
    let session = Rc::new(RefCell::new(Session::new(info, history.iter().copied())));
    let mut driver = Driver::new(session);

    driver.start(program, input);
    driver.drive()?;

    for event in &history {
        driver.apply(&event.kind);
        driver.drive()?;
    }

    let interpretation = driver.finish()?;
    debug!(
        %execution_id,
        events = history.len(),
        commands = interpretation.commands.len(),
        settled = interpretation.outcome.is_settled(),
        "interpretation pass finished"
    );
    Ok(interpretation)
}

/// Polls the root future and spawned branches of one session
struct Driver {
    session: Rc<RefCell<Session>>,
    root: Option<LocalBoxFuture<'static, Result<Value, WorkflowError>>>,
    branches: Vec<LocalBoxFuture<'static, ()>>,
    output: Option<Outcome>,
}

impl Driver {
    fn new(session: Rc<RefCell<Session>>) -> Self {
        Self {
            session,
            root: None,
            branches: Vec::new(),
            output: None,
        }
    }

    fn start(&mut self, program: &dyn WorkflowProgram, input: Value) {
        let ctx = WorkflowContext::new(self.session.clone());
        match catch_unwind(AssertUnwindSafe(|| program.start(ctx, input))) {
            Ok(root) => self.root = Some(root),
            Err(panic) => self.panicked(panic),
        }
    }

    fn running(&self) -> bool {
        self.output.is_none()
    }

    /// Poll until nothing changes any more
    fn drive(&mut self) -> Result<(), DeterminismError> {
        while self.running() {
            self.session.borrow_mut().reset_progress();

            self.poll_root();
            if self.running() {
                self.poll_branches();
            }
            if self.running() {
                self.check_conditions();
            }

            if let Some(error) = self.session.borrow_mut().take_error() {
                return Err(error);
            }
            if !self.session.borrow().progressed() {
                break;
            }
        }
        Ok(())
    }

    fn poll_root(&mut self) {
        let Some(root) = self.root.as_mut() else {
            return;
        };
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        match catch_unwind(AssertUnwindSafe(|| root.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(result)) => {
                self.root = None;
                self.branches.clear();
                self.output = Some(Outcome::from(result));
            }
            Ok(Poll::Pending) => {}
            Err(panic) => self.panicked(panic),
        }
    }

    fn poll_branches(&mut self) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        let spawned = self.session.borrow_mut().take_spawned();
        self.branches.extend(spawned);

        let mut index = 0;
        while index < self.branches.len() {
            let branch = &mut self.branches[index];
            match catch_unwind(AssertUnwindSafe(|| branch.as_mut().poll(&mut cx))) {
                Ok(Poll::Ready(())) => {
                    drop(self.branches.remove(index));
                }
                Ok(Poll::Pending) => index += 1,
                Err(panic) => {
                    self.panicked(panic);
                    return;
                }
            }

            // Branches spawned by a branch run in the same round
            let spawned = self.session.borrow_mut().take_spawned();
            self.branches.extend(spawned);
        }
    }

    fn check_conditions(&mut self) {
        let waiting = self.session.borrow().waiting_conditions();

        for seq in waiting {
            let Some(predicate) = self.session.borrow_mut().take_predicate(seq) else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| predicate())) {
                Ok(true) => self
                    .session
                    .borrow_mut()
                    .settle(seq, Outcome::resolved(Value::Bool(true))),
                Ok(false) => self.session.borrow_mut().restore_predicate(seq, predicate),
                Err(panic) => {
                    self.panicked(panic);
                    return;
                }
            }
        }
    }

    /// Apply one history event to the session
    fn apply(&mut self, event: &EventKind) {
        match event {
            EventKind::SignalReceived {
                signal_id, payload, ..
            } => {
                let handlers = self.session.borrow_mut().apply_signal(signal_id, payload);
                if !self.running() {
                    return;
                }
                for seq in handlers {
                    let Some(mut handler) = self.session.borrow_mut().take_handler(seq) else {
                        continue;
                    };
                    let payload = payload.clone();
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                        self.panicked(panic);
                        return;
                    }
                    self.session.borrow_mut().restore_handler(seq, handler);
                }
            }
            kind if kind.is_completion() => {
                if let Some(seq) = kind.seq() {
                    self.session.borrow_mut().complete(seq, kind);
                }
            }
            _ => {}
        }
    }

    fn panicked(&mut self, panic: Box<dyn Any + Send>) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "workflow panicked".to_string());

        debug!(%message, "workflow program panicked");
        self.root = None;
        self.branches.clear();
        self.output = Some(Outcome::failed(WorkflowError::new(
            error_names::WORKFLOW_PANICKED,
            message,
        )));
    }

    fn finish(&mut self) -> Result<Interpretation, DeterminismError> {
        let mut session = self.session.borrow_mut();
        session.finish()?;
        Ok(Interpretation {
            outcome: self.output.clone().unwrap_or(Outcome::Pending),
            commands: session.take_commands(),
        })
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.root = None;
        self.branches.clear();
        if let Ok(mut session) = self.session.try_borrow_mut() {
            session.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::engine::{TaskOptions, WorkflowRegistry};
    use crate::workflow::{Schedule, Seq};

    fn program<F, Fut>(body: F) -> Arc<dyn WorkflowProgram>
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, WorkflowError>> + 'static,
    {
        let mut registry = WorkflowRegistry::new();
        registry.register_fn("test", body);
        registry.get("test").unwrap()
    }

    fn started(input: Value) -> WorkflowEvent {
        WorkflowEvent::new(EventKind::WorkflowStarted {
            execution_id: "test/1".into(),
            workflow_name: "test".into(),
            input,
            parent: None,
        })
    }

    fn ev(kind: EventKind) -> WorkflowEvent {
        WorkflowEvent::new(kind)
    }

    fn scheduled(seq: Seq, name: &str) -> WorkflowEvent {
        ev(EventKind::TaskScheduled {
            seq,
            name: name.into(),
        })
    }

    fn succeeded(seq: Seq, result: Value) -> WorkflowEvent {
        ev(EventKind::TaskSucceeded { seq, result })
    }

    fn two_steps() -> Arc<dyn WorkflowProgram> {
        program(|ctx, input| async move {
            let a = ctx.task("first", input).await?;
            let b = ctx.task("second", a).await?;
            Ok(b)
        })
    }

    #[test]
    fn test_first_pass_schedules_first_call() {
        let result = interpret(two_steps().as_ref(), &[started(json!(1))]).unwrap();

        assert_eq!(result.outcome, Outcome::Pending);
        assert_eq!(result.commands.len(), 1);
        assert!(matches!(
            &result.commands[0],
            Command::ScheduleTask { seq: 0, name, .. } if name == "first"
        ));
    }

    #[test]
    fn test_replay_runs_to_completion() {
        let events = vec![
            started(json!(1)),
            scheduled(0, "first"),
            succeeded(0, json!(2)),
            scheduled(1, "second"),
            succeeded(1, json!(3)),
        ];
        let result = interpret(two_steps().as_ref(), &events).unwrap();

        assert_eq!(result.outcome, Outcome::resolved(json!(3)));
        assert!(result.commands.is_empty());
    }

    #[test]
    fn test_bracket_events_are_skipped() {
        let events = vec![
            ev(EventKind::WorkflowTaskStarted),
            started(json!(1)),
            scheduled(0, "first"),
            ev(EventKind::WorkflowTaskCompleted),
        ];
        let result = interpret(two_steps().as_ref(), &events).unwrap();
        assert_eq!(result.outcome, Outcome::Pending);
        assert!(result.commands.is_empty());
    }

    #[test]
    fn test_missing_workflow_started() {
        let result = interpret(two_steps().as_ref(), &[scheduled(0, "first")]);
        assert_eq!(result, Err(DeterminismError::MissingWorkflowStarted));
    }

    #[test]
    fn test_origin_for_different_call_is_mismatch() {
        let events = vec![started(json!(1)), scheduled(0, "other")];
        let err = interpret(two_steps().as_ref(), &events).unwrap_err();
        assert!(matches!(
            err,
            DeterminismError::CallMismatch {
                seq: 0,
                event: "task_scheduled",
                ..
            }
        ));
    }

    #[test]
    fn test_origin_beyond_program_is_missing_call() {
        let events = vec![
            started(json!(1)),
            scheduled(0, "first"),
            succeeded(0, json!(2)),
            scheduled(1, "second"),
            succeeded(1, json!(3)),
            scheduled(2, "third"),
        ];
        let err = interpret(two_steps().as_ref(), &events).unwrap_err();
        assert_eq!(
            err,
            DeterminismError::MissingCall {
                seq: 2,
                event: "task_scheduled"
            }
        );
    }

    #[test]
    fn test_unexplained_completion_is_missing_call() {
        let events = vec![started(json!(1)), succeeded(5, json!(null))];
        let err = interpret(two_steps().as_ref(), &events).unwrap_err();
        assert_eq!(
            err,
            DeterminismError::MissingCall {
                seq: 5,
                event: "task_succeeded"
            }
        );
    }

    #[test]
    fn test_wrong_completion_kind() {
        let events = vec![
            started(json!(1)),
            scheduled(0, "first"),
            ev(EventKind::TimerCompleted { seq: 0 }),
        ];
        let err = interpret(two_steps().as_ref(), &events).unwrap_err();
        assert!(matches!(
            err,
            DeterminismError::UnexpectedCompletion {
                seq: 0,
                event: "timer_completed",
                call: "task"
            }
        ));
    }

    #[test]
    fn test_completion_before_registration_is_held() {
        // seq 1 finished before seq 0 was seen to finish
        let events = vec![
            started(json!(1)),
            scheduled(0, "first"),
            scheduled(1, "second"),
            succeeded(1, json!("b")),
            succeeded(0, json!("a")),
        ];
        let result = interpret(two_steps().as_ref(), &events).unwrap();
        assert_eq!(result.outcome, Outcome::resolved(json!("b")));
        assert!(result.commands.is_empty());
    }

    #[test]
    fn test_parallel_calls_each_get_a_command() {
        let program = program(|ctx, _input| async move {
            let (a, b) = futures::join!(
                ctx.task("a", json!(null)),
                ctx.task("b", json!(null))
            );
            Ok(json!([a?, b?]))
        });

        let result = interpret(program.as_ref(), &[started(json!(null))]).unwrap();
        let seqs: Vec<Seq> = result.commands.iter().map(Command::seq).collect();
        assert_eq!(seqs, vec![0, 1]);

        let events = vec![
            started(json!(null)),
            scheduled(0, "a"),
            scheduled(1, "b"),
            succeeded(1, json!(2)),
        ];
        let result = interpret(program.as_ref(), &events).unwrap();
        assert_eq!(result.outcome, Outcome::Pending);
        assert!(result.commands.is_empty());
    }

    #[test]
    fn test_timeout_race_ignores_late_completion() {
        let program = program(|ctx, _input| async move {
            let timer = ctx.sleep_for(Duration::from_secs(10));
            let options = TaskOptions::default().with_timeout(&timer);
            match ctx.task_with("slow", json!(null), options).await {
                Ok(value) => Ok(value),
                Err(e) if e.is_timeout() => Ok(json!("timed out")),
                Err(e) => Err(e),
            }
        });

        let first = interpret(program.as_ref(), &[started(json!(null))]).unwrap();
        assert!(matches!(
            &first.commands[0],
            Command::StartTimer {
                seq: 0,
                schedule: Schedule::Duration { .. }
            }
        ));
        assert!(matches!(&first.commands[1], Command::ScheduleTask { seq: 1, .. }));

        let events = vec![
            started(json!(null)),
            ev(EventKind::TimerScheduled {
                seq: 0,
                until_time: Utc::now(),
            }),
            scheduled(1, "slow"),
            ev(EventKind::TimerCompleted { seq: 0 }),
            succeeded(1, json!("late")),
        ];
        let result = interpret(program.as_ref(), &events).unwrap();
        assert_eq!(result.outcome, Outcome::resolved(json!("timed out")));
    }

    #[test]
    fn test_expect_signal_resolves_with_payload() {
        let program = program(|ctx, _input| async move { ctx.expect_signal("approve").await });

        let events = vec![
            started(json!(null)),
            ev(EventKind::SignalReceived {
                signal_id: "other".into(),
                payload: json!(0),
                id: None,
            }),
            ev(EventKind::SignalReceived {
                signal_id: "approve".into(),
                payload: json!({"by": "ops"}),
                id: None,
            }),
        ];
        let result = interpret(program.as_ref(), &events).unwrap();
        assert_eq!(result.outcome, Outcome::resolved(json!({"by": "ops"})));
    }

    #[test]
    fn test_signal_handler_with_condition() {
        let program = program(|ctx, _input| async move {
            let count = Rc::new(Cell::new(0));
            let counter = count.clone();
            let handler = ctx.on_signal("tick", move |_| counter.set(counter.get() + 1));

            let watched = count.clone();
            ctx.condition(move || watched.get() >= 2).await?;
            handler.dispose();
            Ok(json!(count.get()))
        });

        let tick = || {
            ev(EventKind::SignalReceived {
                signal_id: "tick".into(),
                payload: json!(null),
                id: None,
            })
        };

        let one = interpret(program.as_ref(), &[started(json!(null)), tick()]).unwrap();
        assert_eq!(one.outcome, Outcome::Pending);
        assert!(one.commands.is_empty());

        let events = vec![started(json!(null)), tick(), tick(), tick()];
        let done = interpret(program.as_ref(), &events).unwrap();
        assert_eq!(done.outcome, Outcome::resolved(json!(2)));
    }

    #[test]
    fn test_condition_with_timeout_resolves_false() {
        let program = program(|ctx, _input| async move {
            let timer = ctx.sleep_for(Duration::from_secs(1));
            let ready = ctx.condition_with(|| false, &timer).await?;
            Ok(ready)
        });

        let events = vec![
            started(json!(null)),
            ev(EventKind::TimerScheduled {
                seq: 0,
                until_time: Utc::now(),
            }),
            ev(EventKind::TimerCompleted { seq: 0 }),
        ];
        let result = interpret(program.as_ref(), &events).unwrap();
        assert_eq!(result.outcome, Outcome::resolved(json!(false)));
    }

    #[test]
    fn test_spawned_branch_runs_independently() {
        let program = program(|ctx, _input| async move {
            let branch_ctx = ctx.clone();
            ctx.spawn(async move {
                let _ = branch_ctx.task("audit", json!(null)).await;
            });
            ctx.task("main", json!(null)).await
        });

        let result = interpret(program.as_ref(), &[started(json!(null))]).unwrap();
        let names: Vec<&str> = result
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::ScheduleTask { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["main", "audit"]);
    }

    #[test]
    fn test_panic_fails_execution() {
        let program = program(|ctx, _input| async move {
            let value = ctx.task("first", json!(null)).await?;
            if value.is_null() {
                panic!("boom");
            }
            Ok(value)
        });

        let events = vec![
            started(json!(null)),
            scheduled(0, "first"),
            succeeded(0, json!(null)),
        ];
        let result = interpret(program.as_ref(), &events).unwrap();
        assert_eq!(
            result.outcome,
            Outcome::failed(WorkflowError::new(error_names::WORKFLOW_PANICKED, "boom"))
        );
    }

    #[test]
    fn test_program_error_fails_execution() {
        let program = program(|_ctx, _input| async move {
            Err::<Value, _>(WorkflowError::new("Rejected", "not today"))
        });
        let result = interpret(program.as_ref(), &[started(json!(null))]).unwrap();
        assert_eq!(
            result.outcome,
            Outcome::failed(WorkflowError::new("Rejected", "not today"))
        );
    }

    #[test]
    fn test_replay_is_idempotent() {
        let events = vec![started(json!(1)), scheduled(0, "first"), succeeded(0, json!(2))];
        let a = interpret(two_steps().as_ref(), &events).unwrap();
        let b = interpret(two_steps().as_ref(), &events).unwrap();
        assert_eq!(a, b);
        assert!(matches!(&a.commands[0], Command::ScheduleTask { seq: 1, .. }));
    }
}
