//! Single-process runtime
//!
//! Wires the in-memory stores, an in-process bus and a manual clock to the
//! orchestrator, task worker, timer handler and fallback handler. Nothing
//! runs in the background: [`LocalRuntime::run_until_idle`] drains the work
//! queue and fires due timers until nothing is left, and
//! [`LocalRuntime::advance_time`] moves the clock.
//!
//! # Example
//!
//! ```ignore
//! let mut workflows = WorkflowRegistry::new();
//! workflows.register_fn("greet", |ctx, input| async move {
//!     ctx.task("hello", input).await
//! });
//! let mut tasks = TaskRegistry::new();
//! tasks.register_fn("hello", |_ctx, input| async move {
//!     Ok(TaskResult::Complete(json!(format!("hello {input}"))))
//! });
//!
//! let runtime = LocalRuntime::new(workflows, tasks);
//! let started = runtime
//!     .client()
//!     .start_execution(StartExecutionRequest::new("greet", json!("ada")))
//!     .await?;
//! runtime.run_until_idle().await;
//! ```

mod bus;
mod entities;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

pub use entities::{LocalEntityStore, LocalTransactions, TransactionFn};

use self::bus::{LocalBus, WorkItem};
use crate::client::WorkflowClient;
use crate::clock::{Clock, ManualClock};
use crate::engine::WorkflowRegistry;
use crate::orchestrator::{
    Collaborators, CycleFailure, ExecutionMessage, Orchestrator, OrchestratorConfig,
};
use crate::persistence::{InMemoryExecutionStore, InMemoryHistoryStore, InMemoryTaskStore};
use crate::reliability::RetryPolicy;
use crate::task::{TaskFallbackHandler, TaskRegistry, TaskWorker, TaskWorkerOutcome};
use crate::timer::TimerHandler;
use crate::workflow::{EventEnvelope, WorkflowError};

/// Rounds after which `run_until_idle` gives up
pub const DEFAULT_MAX_ROUNDS: usize = 1_000;

/// Times a failed batch is redelivered before it is dropped
const MAX_REDELIVERIES: u32 = 3;

/// What one `run_until_idle` call did
#[derive(Debug, Default)]
pub struct LocalReport {
    /// Orchestration cycles run
    pub cycles: usize,

    /// Task requests handled, including rejected claims
    pub tasks: usize,

    /// Timers fired
    pub timers: usize,

    /// Fallback requests delivered
    pub fallbacks: usize,

    /// Cycles that failed and were not redelivered
    pub failures: Vec<CycleFailure>,

    /// Stopped at the round limit with work still queued
    pub exhausted: bool,
}

/// Everything needed to run executions in one process
pub struct LocalRuntime {
    clock: Arc<ManualClock>,
    history: Arc<InMemoryHistoryStore>,
    executions: Arc<InMemoryExecutionStore>,
    tasks: Arc<InMemoryTaskStore>,
    entities: Arc<LocalEntityStore>,
    transactions: Arc<LocalTransactions>,
    bus: Arc<LocalBus>,
    client: WorkflowClient,
    orchestrator: Orchestrator,
    worker: TaskWorker,
    timers: TimerHandler,
    fallback: TaskFallbackHandler,
    max_rounds: usize,
}

impl std::fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("now", &self.clock.now())
            .field("orchestrator", &self.orchestrator)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}

impl LocalRuntime {
    pub fn new(workflows: WorkflowRegistry, tasks: TaskRegistry) -> Self {
        let clock = Arc::new(ManualClock::default());
        let history = Arc::new(InMemoryHistoryStore::new());
        let executions = Arc::new(InMemoryExecutionStore::new());
        let task_store = Arc::new(InMemoryTaskStore::new());
        let entities = Arc::new(LocalEntityStore::new());
        let transactions = Arc::new(LocalTransactions::default());
        let bus = Arc::new(LocalBus::new(
            clock.clone(),
            entities.clone(),
            transactions.clone(),
        ));

        let client = WorkflowClient::new(
            executions.clone(),
            history.clone(),
            bus.clone(),
            task_store.clone(),
            clock.clone(),
        );

        let collaborators = Collaborators {
            queue: bus.clone(),
            tasks: bus.clone(),
            timers: bus.clone(),
            starter: Arc::new(client.clone()),
            emitter: bus.clone(),
            entities: bus.clone(),
            transactions: bus.clone(),
        };
        let orchestrator = Orchestrator::new(
            Arc::new(workflows),
            history.clone(),
            executions.clone(),
            collaborators,
            clock.clone(),
        );

        let worker = TaskWorker::new(
            Arc::new(tasks),
            task_store.clone(),
            bus.clone(),
            bus.clone(),
            clock.clone(),
        );
        let timers = TimerHandler::new(bus.clone(), task_store.clone(), bus.clone(), clock.clone());
        let fallback = TaskFallbackHandler::new(
            bus.clone(),
            RetryPolicy::fixed(Duration::from_millis(1), 5),
        );

        Self {
            clock,
            history,
            executions,
            tasks: task_store,
            entities,
            transactions,
            bus,
            client,
            orchestrator,
            worker,
            timers,
            fallback,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }

    pub fn with_orchestrator_config(mut self, config: OrchestratorConfig) -> Self {
        self.orchestrator = self.orchestrator.with_config(config);
        self
    }

    pub fn with_fallback_policy(mut self, policy: RetryPolicy) -> Self {
        self.fallback = TaskFallbackHandler::new(self.bus.clone(), policy);
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn client(&self) -> &WorkflowClient {
        &self.client
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn history_store(&self) -> &InMemoryHistoryStore {
        &self.history
    }

    pub fn execution_store(&self) -> &InMemoryExecutionStore {
        &self.executions
    }

    pub fn task_store(&self) -> &InMemoryTaskStore {
        &self.tasks
    }

    pub fn entities(&self) -> &LocalEntityStore {
        &self.entities
    }

    /// Register a transaction workflows can invoke by name
    pub fn register_transaction<F>(&self, name: impl Into<String>, body: F)
    where
        F: Fn(&LocalEntityStore, Value) -> Result<Value, WorkflowError> + Send + Sync + 'static,
    {
        self.transactions.register(name, body);
    }

    /// Application events emitted so far, with the emitting execution id
    pub fn emitted_events(&self) -> Vec<(String, EventEnvelope)> {
        self.bus.emitted()
    }

    /// Make the next `count` event submissions fail
    pub fn fail_next_submits(&self, count: u32) {
        self.bus.fail_next_submits(count);
    }

    /// Timers that have not fired yet
    pub fn pending_timers(&self) -> usize {
        self.bus.pending_timers()
    }

    /// Move the clock forward, then run until idle
    pub async fn advance_time(&self, by: Duration) -> LocalReport {
        self.clock.advance(by);
        self.run_until_idle().await
    }

    /// Process queued work and due timers until nothing is left
    pub async fn run_until_idle(&self) -> LocalReport {
        let mut report = LocalReport::default();
        let mut redeliveries: Vec<(String, u32)> = Vec::new();

        for round in 0..self.max_rounds {
            let mut progressed = false;

            for timer in self.bus.due_timers(self.clock.now()) {
                progressed = true;
                report.timers += 1;
                if let Err(err) = self.timers.fire(timer).await {
                    warn!(error = %err, "timer failed to fire");
                }
            }

            let items = self.bus.drain();
            if items.is_empty() && !progressed {
                debug!(round, "local runtime idle");
                return report;
            }

            let mut messages = Vec::new();
            let mut requests = Vec::new();
            for item in items {
                match item {
                    WorkItem::Events {
                        execution_id,
                        events,
                    } => messages.push(ExecutionMessage::new(execution_id, events)),
                    WorkItem::Task(request) => requests.push(request),
                }
            }

            if !messages.is_empty() {
                let batch = self.orchestrator.process_batch(messages).await;
                report.cycles += batch.cycles.len() + batch.failures.len();
                for failure in batch.failures {
                    self.redeliver_or_report(failure, &mut redeliveries, &mut report);
                }
            }

            for request in requests {
                report.tasks += 1;
                if let TaskWorkerOutcome::Fallback(fallback) = self.worker.handle(request).await {
                    match self.fallback.handle(fallback).await {
                        Ok(()) => report.fallbacks += 1,
                        Err(err) => warn!(error = %err, "fallback request dropped"),
                    }
                }
            }
        }

        warn!(max_rounds = self.max_rounds, "local runtime stopped at round limit");
        report.exhausted = true;
        report
    }

    fn redeliver_or_report(
        &self,
        failure: CycleFailure,
        redeliveries: &mut Vec<(String, u32)>,
        report: &mut LocalReport,
    ) {
        if failure.error.is_retryable() {
            let attempts = match redeliveries
                .iter_mut()
                .find(|(id, _)| *id == failure.execution_id)
            {
                Some((_, attempts)) => {
                    *attempts += 1;
                    *attempts
                }
                None => {
                    redeliveries.push((failure.execution_id.clone(), 1));
                    1
                }
            };
            if attempts <= MAX_REDELIVERIES {
                debug!(execution_id = %failure.execution_id, attempts, "redelivering failed batch");
                self.bus.push(WorkItem::Events {
                    execution_id: failure.execution_id,
                    events: failure.events,
                });
                return;
            }
        }
        report.failures.push(failure);
    }
}
