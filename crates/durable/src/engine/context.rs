//! Interpretation session and the program-facing workflow context
//!
//! One [`Session`] exists per interpretation pass. It owns every call the
//! program makes during that pass, indexed by seq, together with the outcome
//! each call has reached so far. Programs only see it through
//! [`WorkflowContext`] and the [`Eventual`] futures it hands out; there is no
//! global "current workflow" state.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::LocalBoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::calls::{completion_outcome, EventualCall, EventualDefinition};
use super::error::DeterminismError;
use crate::workflow::{
    Command, EntityOperation, EventEnvelope, EventKind, Outcome, ParentRef, Schedule, Seq,
    SignalTarget, WorkflowError, WorkflowEvent,
};

type Predicate = Box<dyn Fn() -> bool>;
type SignalCallback = Box<dyn FnMut(Value)>;

/// Identity of the execution being interpreted
#[derive(Debug, Clone)]
pub(crate) struct ExecutionInfo {
    pub execution_id: String,
    pub workflow_name: String,
    pub start_time: DateTime<Utc>,
    pub parent: Option<ParentRef>,
}

struct CallNode {
    call: EventualCall,
    definition: EventualDefinition,
    outcome: Outcome,
    disposed: bool,
}

/// Arena of calls for one interpretation pass
pub(crate) struct Session {
    info: ExecutionInfo,
    calls: Vec<CallNode>,

    /// Origin events found in the input, by seq
    origins: BTreeMap<Seq, EventKind>,

    /// Seqs that have at least one completion event in the input
    completed: HashSet<Seq>,

    /// Completions that arrived before the program made their call
    held: BTreeMap<Seq, Vec<EventKind>>,

    predicates: BTreeMap<Seq, Predicate>,
    handlers: BTreeMap<Seq, SignalCallback>,
    spawned: Vec<LocalBoxFuture<'static, ()>>,
    commands: Vec<Command>,
    error: Option<DeterminismError>,

    /// Set whenever a call settles or a branch is spawned
    progressed: bool,
}

impl Session {
    pub(crate) fn new<'a>(
        info: ExecutionInfo,
        history: impl IntoIterator<Item = &'a WorkflowEvent>,
    ) -> Self {
        let mut origins = BTreeMap::new();
        let mut completed = HashSet::new();

        for event in history {
            match event.kind.seq() {
                Some(seq) if event.kind.is_origin() => {
                    origins.entry(seq).or_insert_with(|| event.kind.clone());
                }
                Some(seq) => {
                    completed.insert(seq);
                }
                None => {}
            }
        }

        Self {
            info,
            calls: Vec::new(),
            origins,
            completed,
            held: BTreeMap::new(),
            predicates: BTreeMap::new(),
            handlers: BTreeMap::new(),
            spawned: Vec::new(),
            commands: Vec::new(),
            error: None,
            progressed: false,
        }
    }

    fn fail(&mut self, error: DeterminismError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Record a new call, assigning it the next seq
    fn register(&mut self, call: EventualCall) -> Seq {
        let seq = self.calls.len() as Seq;
        let definition = call.definition();
        let outcome = definition.result.clone().unwrap_or(Outcome::Pending);

        let origin = self
            .origins
            .get(&seq)
            .map(|event| (event.type_name(), definition.is_corresponding(event)));

        match origin {
            Some((event, false)) => {
                self.fail(DeterminismError::CallMismatch {
                    seq,
                    call: call.describe(),
                    event,
                });
            }
            Some((_, true)) => {}
            // A completion without its origin event means the command was
            // dispatched but the origin was never persisted.
            None if self.completed.contains(&seq) => {}
            None => {
                if let Some(command) = call.command(seq) {
                    self.commands.push(command);
                }
            }
        }

        let races = definition.races();
        self.calls.push(CallNode {
            call,
            definition,
            outcome,
            disposed: false,
        });

        if let Some(events) = self.held.remove(&seq) {
            for event in events {
                self.complete(seq, &event);
            }
        }

        if let Some(rival) = races {
            let rival_settled = self
                .calls
                .get(rival as usize)
                .is_some_and(|node| node.outcome.is_settled());
            if rival_settled {
                self.settle_race(seq, rival);
            }
        }

        seq
    }

    fn node(&self, seq: Seq) -> Option<&CallNode> {
        self.calls.get(seq as usize)
    }

    fn outcome(&self, seq: Seq) -> Outcome {
        self.node(seq)
            .map(|node| node.outcome.clone())
            .unwrap_or(Outcome::Pending)
    }

    fn settle_race(&mut self, seq: Seq, rival: Seq) {
        let outcome = self
            .node(seq)
            .filter(|node| node.outcome.is_pending() && !node.disposed)
            .and_then(|node| node.definition.on_resolution_of(rival).cloned());
        if let Some(outcome) = outcome {
            self.settle(seq, outcome);
        }
    }

    /// Settle a pending call and every call racing against it
    pub(crate) fn settle(&mut self, seq: Seq, outcome: Outcome) {
        let mut settled = Vec::new();

        if let Some(node) = self.calls.get_mut(seq as usize) {
            if node.outcome.is_pending() {
                node.outcome = outcome;
                settled.push(seq);
            }
        }

        while let Some(done) = settled.pop() {
            self.predicates.remove(&done);
            self.progressed = true;

            for (index, node) in self.calls.iter_mut().enumerate() {
                if !node.outcome.is_pending() || node.disposed {
                    continue;
                }
                if let Some(outcome) = node.definition.on_resolution_of(done) {
                    node.outcome = outcome.clone();
                    settled.push(index as Seq);
                }
            }
        }
    }

    /// Apply a completion event addressed to `seq`
    pub(crate) fn complete(&mut self, seq: Seq, event: &EventKind) {
        let Some(node) = self.node(seq) else {
            self.held.entry(seq).or_default().push(event.clone());
            return;
        };

        if !node.definition.accepts(event) {
            let call = node.call.kind_name();
            self.fail(DeterminismError::UnexpectedCompletion {
                seq,
                event: event.type_name(),
                call,
            });
            return;
        }

        if node.outcome.is_settled() {
            debug!(seq, event = event.type_name(), "completion for settled call ignored");
            return;
        }

        if let Some(outcome) = completion_outcome(event) {
            self.settle(seq, outcome);
        }
    }

    /// Resolve signal expectations; returns the handlers to invoke
    pub(crate) fn apply_signal(&mut self, signal_id: &str, payload: &Value) -> Vec<Seq> {
        let mut handlers = Vec::new();

        for index in 0..self.calls.len() {
            let node = &self.calls[index];
            if node.disposed || node.outcome.is_settled() || !node.definition.listens_to(signal_id)
            {
                continue;
            }
            let is_handler = matches!(node.call, EventualCall::RegisterSignalHandler { .. });
            if is_handler {
                handlers.push(index as Seq);
            } else {
                self.settle(index as Seq, Outcome::resolved(payload.clone()));
            }
        }

        handlers
    }

    pub(crate) fn take_handler(&mut self, seq: Seq) -> Option<SignalCallback> {
        self.handlers.remove(&seq)
    }

    pub(crate) fn restore_handler(&mut self, seq: Seq, handler: SignalCallback) {
        self.progressed = true;
        if self.node(seq).is_some_and(|node| !node.disposed) {
            self.handlers.insert(seq, handler);
        }
    }

    /// Conditions still waiting for their predicate
    pub(crate) fn waiting_conditions(&self) -> Vec<Seq> {
        self.predicates
            .keys()
            .copied()
            .filter(|seq| {
                self.node(*seq).is_some_and(|node| {
                    node.outcome.is_pending()
                        && !node.disposed
                        && node.definition.checks_after_every_event()
                })
            })
            .collect()
    }

    pub(crate) fn take_predicate(&mut self, seq: Seq) -> Option<Predicate> {
        self.predicates.remove(&seq)
    }

    pub(crate) fn restore_predicate(&mut self, seq: Seq, predicate: Predicate) {
        self.predicates.insert(seq, predicate);
    }

    pub(crate) fn take_spawned(&mut self) -> Vec<LocalBoxFuture<'static, ()>> {
        std::mem::take(&mut self.spawned)
    }

    pub(crate) fn take_error(&mut self) -> Option<DeterminismError> {
        self.error.take()
    }

    pub(crate) fn reset_progress(&mut self) {
        self.progressed = false;
    }

    pub(crate) fn progressed(&self) -> bool {
        self.progressed
    }

    pub(crate) fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    /// Check that history holds nothing the program did not account for
    pub(crate) fn finish(&mut self) -> Result<(), DeterminismError> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }

        let made = self.calls.len() as Seq;
        let unexplained = self
            .held
            .iter()
            .filter_map(|(seq, events)| events.first().map(|event| (*seq, event.type_name())))
            .chain(
                self.origins
                    .range(made..)
                    .map(|(seq, event)| (*seq, event.type_name())),
            )
            .min_by_key(|(seq, _)| *seq);

        match unexplained {
            Some((seq, event)) => Err(DeterminismError::MissingCall { seq, event }),
            None => Ok(()),
        }
    }

    /// Drop program closures and futures so no reference cycle outlives the pass
    pub(crate) fn teardown(&mut self) {
        self.predicates.clear();
        self.handlers.clear();
        self.spawned.clear();
    }
}

/// Options for a task call
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Interval the worker must heartbeat within
    pub heartbeat: Option<Duration>,

    /// Seq of a call that fails the task with a timeout if it settles first
    pub timeout: Option<Seq>,
}

impl TaskOptions {
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Race the task against another call, usually a timer
    pub fn with_timeout(mut self, timeout: &Eventual) -> Self {
        self.timeout = Some(timeout.seq());
        self
    }
}

/// Handle a program uses to make durable calls
///
/// Every method registers a call with the current interpretation session and
/// returns immediately. Calls get their seq in the order the program makes
/// them, so the order of calls must depend only on inputs and earlier results.
///
/// # Example
///
/// ```ignore
/// async fn approval(ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
///     let timeout = ctx.sleep_for(Duration::from_secs(3600));
///     let approved = ctx.expect_signal_with("approve", &timeout).await;
///     match approved {
///         Ok(payload) => ctx.task("ship", payload).await,
///         Err(e) if e.is_timeout() => ctx.task("cancel", input).await,
///         Err(e) => Err(e),
///     }
/// }
/// ```
#[derive(Clone)]
pub struct WorkflowContext {
    session: Rc<RefCell<Session>>,
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.borrow();
        f.debug_struct("WorkflowContext")
            .field("execution_id", &session.info.execution_id)
            .field("calls", &session.calls.len())
            .finish()
    }
}

impl WorkflowContext {
    pub(crate) fn new(session: Rc<RefCell<Session>>) -> Self {
        Self { session }
    }

    pub fn execution_id(&self) -> String {
        self.session.borrow().info.execution_id.clone()
    }

    pub fn workflow_name(&self) -> String {
        self.session.borrow().info.workflow_name.clone()
    }

    /// Time the execution was started, as recorded in history
    pub fn start_time(&self) -> DateTime<Utc> {
        self.session.borrow().info.start_time
    }

    /// Calling execution, if this is a child workflow
    pub fn parent(&self) -> Option<ParentRef> {
        self.session.borrow().info.parent.clone()
    }

    fn call(&self, call: EventualCall) -> Eventual {
        let seq = self.session.borrow_mut().register(call);
        Eventual {
            seq,
            session: self.session.clone(),
        }
    }

    /// Invoke a task by name
    pub fn task(&self, name: impl Into<String>, input: Value) -> Eventual {
        self.task_with(name, input, TaskOptions::default())
    }

    pub fn task_with(&self, name: impl Into<String>, input: Value, options: TaskOptions) -> Eventual {
        self.call(EventualCall::Task {
            name: name.into(),
            input,
            heartbeat: options.heartbeat,
            timeout: options.timeout,
        })
    }

    /// Durable timer relative to the time the command is dispatched
    pub fn sleep_for(&self, duration: Duration) -> Eventual {
        self.call(EventualCall::AwaitTimer {
            schedule: Schedule::duration(duration),
        })
    }

    /// Durable timer firing at an absolute time
    pub fn sleep_until(&self, time: DateTime<Utc>) -> Eventual {
        self.call(EventualCall::AwaitTimer {
            schedule: Schedule::time(time),
        })
    }

    /// Start a child execution and wait for its result
    pub fn child_workflow(&self, name: impl Into<String>, input: Value) -> Eventual {
        self.call(EventualCall::ChildWorkflow {
            name: name.into(),
            input,
            timeout: None,
        })
    }

    pub fn child_workflow_with(
        &self,
        name: impl Into<String>,
        input: Value,
        timeout: &Eventual,
    ) -> Eventual {
        self.call(EventualCall::ChildWorkflow {
            name: name.into(),
            input,
            timeout: Some(timeout.seq()),
        })
    }

    /// Wait for the next signal with the given id
    pub fn expect_signal(&self, signal_id: impl Into<String>) -> Eventual {
        self.call(EventualCall::ExpectSignal {
            signal_id: signal_id.into(),
            timeout: None,
        })
    }

    pub fn expect_signal_with(&self, signal_id: impl Into<String>, timeout: &Eventual) -> Eventual {
        self.call(EventualCall::ExpectSignal {
            signal_id: signal_id.into(),
            timeout: Some(timeout.seq()),
        })
    }

    /// Run `handler` for every matching signal until the handle is disposed
    pub fn on_signal<F>(&self, signal_id: impl Into<String>, handler: F) -> SignalHandler
    where
        F: FnMut(Value) + 'static,
    {
        let mut session = self.session.borrow_mut();
        let seq = session.register(EventualCall::RegisterSignalHandler {
            signal_id: signal_id.into(),
        });
        session.handlers.insert(seq, Box::new(handler));
        SignalHandler {
            seq,
            session: self.session.clone(),
        }
    }

    /// Fire-and-forget signal to another execution
    pub fn send_signal(
        &self,
        target: SignalTarget,
        signal_id: impl Into<String>,
        payload: Value,
    ) -> Eventual {
        self.call(EventualCall::SendSignal {
            target,
            signal_id: signal_id.into(),
            payload,
        })
    }

    /// Publish application events
    pub fn emit_events(&self, events: Vec<EventEnvelope>) -> Eventual {
        self.call(EventualCall::EmitEvents { events })
    }

    pub fn entity(&self, operation: EntityOperation) -> Eventual {
        self.call(EventualCall::Entity { operation })
    }

    pub fn transaction(&self, name: impl Into<String>, input: Value) -> Eventual {
        self.call(EventualCall::InvokeTransaction {
            name: name.into(),
            input,
        })
    }

    /// Wait until `predicate` holds; resolves with `true`
    pub fn condition<F>(&self, predicate: F) -> Eventual
    where
        F: Fn() -> bool + 'static,
    {
        self.register_condition(predicate, None)
    }

    /// Like [`condition`](Self::condition), resolving `false` if `timeout` settles first
    pub fn condition_with<F>(&self, predicate: F, timeout: &Eventual) -> Eventual
    where
        F: Fn() -> bool + 'static,
    {
        self.register_condition(predicate, Some(timeout.seq()))
    }

    fn register_condition<F>(&self, predicate: F, timeout: Option<Seq>) -> Eventual
    where
        F: Fn() -> bool + 'static,
    {
        let satisfied = predicate();
        let mut session = self.session.borrow_mut();
        let seq = session.register(EventualCall::Condition { satisfied, timeout });
        if session.outcome(seq).is_pending() {
            session.predicates.insert(seq, Box::new(predicate));
        }
        Eventual {
            seq,
            session: self.session.clone(),
        }
    }

    /// Run a concurrent branch of the program
    ///
    /// Spawned branches are polled after the main body, in spawn order.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let mut session = self.session.borrow_mut();
        session.spawned.push(Box::pin(future));
        session.progressed = true;
    }
}

/// A call made by the program; resolves once history settles it
#[must_use = "calls only make progress when awaited or raced"]
pub struct Eventual {
    seq: Seq,
    session: Rc<RefCell<Session>>,
}

impl fmt::Debug for Eventual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Eventual")
            .field("seq", &self.seq)
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl Eventual {
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Current state without waiting
    pub fn outcome(&self) -> Outcome {
        self.session.borrow().outcome(self.seq)
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_settled()
    }

    /// Await the call and decode its value
    pub async fn typed<T: DeserializeOwned>(self) -> Result<T, WorkflowError> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Future for Eventual {
    type Output = Result<Value, WorkflowError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.outcome().into_result() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

/// Registration of a signal handler
pub struct SignalHandler {
    seq: Seq,
    session: Rc<RefCell<Session>>,
}

impl fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHandler").field("seq", &self.seq).finish()
    }
}

impl SignalHandler {
    pub fn seq(&self) -> Seq {
        self.seq
    }

    /// Stop receiving signals
    pub fn dispose(&self) {
        let removed = {
            let mut session = self.session.borrow_mut();
            if let Some(node) = session.calls.get_mut(self.seq as usize) {
                node.disposed = true;
            }
            session.handlers.remove(&self.seq)
        };
        drop(removed);
    }
}
