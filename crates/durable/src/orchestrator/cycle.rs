//! Orchestration cycles
//!
//! One cycle loads an execution's history, replays it together with newly
//! delivered events, dispatches the resulting commands and persists all new
//! events in a single append.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use super::commands::{CommandExecutor, Collaborators};
use super::config::OrchestratorConfig;
use super::OrchestratorError;
use crate::clock::Clock;
use crate::engine::{WorkflowExecutor, WorkflowRegistry};
use crate::persistence::{ExecutionStore, HistoryStore};
use crate::workflow::{parse_workflow_name, EventKind, Execution, Outcome, WorkflowEvent};

/// Events delivered to one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionMessage {
    pub execution_id: String,
    pub events: Vec<WorkflowEvent>,
}

impl ExecutionMessage {
    pub fn new(execution_id: impl Into<String>, events: Vec<WorkflowEvent>) -> Self {
        Self {
            execution_id: execution_id.into(),
            events,
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub execution_id: String,

    /// Delivered events that were new to the history
    pub accepted: usize,

    /// Commands dispatched
    pub commands: usize,

    /// Events appended, including bracket markers
    pub events_written: usize,

    /// Size of the append in bytes
    pub bytes_written: usize,

    /// Program outcome after the cycle
    pub outcome: Outcome,

    /// The execution was already terminal and the batch was dropped
    pub skipped: bool,
}

impl CycleReport {
    fn skipped(execution_id: &str, outcome: Outcome) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            accepted: 0,
            commands: 0,
            events_written: 0,
            bytes_written: 0,
            outcome,
            skipped: true,
        }
    }
}

/// Cycle that ended in an error
#[derive(Debug)]
pub struct CycleFailure {
    pub execution_id: String,
    pub error: OrchestratorError,

    /// Events of the failed batch, for redelivery
    pub events: Vec<WorkflowEvent>,
}

/// Result of processing one batch of messages
#[derive(Debug, Default)]
pub struct BatchReport {
    pub cycles: Vec<CycleReport>,
    pub failures: Vec<CycleFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// The batch-processing control loop
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::new(registry, history, executions, collaborators, clock);
///
/// let report = orchestrator
///     .process_batch(vec![ExecutionMessage::new("orders/42", events)])
///     .await;
/// for failure in report.failures {
///     tracing::warn!(execution_id = %failure.execution_id, error = %failure.error);
/// }
/// ```
pub struct Orchestrator {
    registry: Arc<WorkflowRegistry>,
    history: Arc<dyn HistoryStore>,
    executions: Arc<dyn ExecutionStore>,
    collaborators: Collaborators,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        history: Arc<dyn HistoryStore>,
        executions: Arc<dyn ExecutionStore>,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            history,
            executions,
            collaborators,
            clock,
            config: OrchestratorConfig::default(),
            locks: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Group messages by execution and run one cycle per execution
    ///
    /// Cycles for different executions run concurrently. A failure in one
    /// cycle is reported and does not affect the others.
    #[instrument(skip(self, messages), fields(messages = messages.len()))]
    pub async fn process_batch(&self, messages: Vec<ExecutionMessage>) -> BatchReport {
        let mut order: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<WorkflowEvent>)> = Vec::new();
        for message in messages {
            match order.get(&message.execution_id) {
                Some(index) => groups[*index].1.extend(message.events),
                None => {
                    order.insert(message.execution_id.clone(), groups.len());
                    groups.push((message.execution_id, message.events));
                }
            }
        }

        let results: Vec<_> = futures::stream::iter(groups)
            .map(|(execution_id, events)| async move {
                let result = AssertUnwindSafe(self.orchestrate(&execution_id, events.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(OrchestratorError::from_panic(panic)));
                (execution_id, events, result)
            })
            .buffer_unordered(self.config.max_concurrent_executions)
            .collect()
            .await;

        let mut report = BatchReport::default();
        for (execution_id, events, result) in results {
            match result {
                Ok(cycle) => report.cycles.push(cycle),
                Err(error) => {
                    warn!(%execution_id, %error, "orchestration cycle failed");
                    report.failures.push(CycleFailure {
                        execution_id,
                        error,
                        events,
                    });
                }
            }
        }
        report
    }

    fn lock_for(&self, execution_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(execution_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for `execution_id` unless another cycle holds or awaits it
    fn release_lock(&self, execution_id: &str) {
        self.locks
            .remove_if(execution_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Run one cycle for one execution
    #[instrument(skip(self, events), fields(execution_id = %execution_id, delivered = events.len()))]
    pub async fn orchestrate(
        &self,
        execution_id: &str,
        events: Vec<WorkflowEvent>,
    ) -> Result<CycleReport, OrchestratorError> {
        let lock = self.lock_for(execution_id);
        let result = {
            let _guard = lock.lock().await;
            self.run_cycle(execution_id, events).await
        };
        drop(lock);
        self.release_lock(execution_id);
        result
    }

    async fn run_cycle(
        &self,
        execution_id: &str,
        events: Vec<WorkflowEvent>,
    ) -> Result<CycleReport, OrchestratorError> {
        parse_workflow_name(execution_id)?;
        let execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;

        if execution.status.is_terminal() {
            warn!(status = %execution.status, "dropping batch for terminal execution");
            return Ok(CycleReport::skipped(execution_id, terminal_outcome(&execution)));
        }

        let history = self.history.read(execution_id).await?;
        let total = history.len() + events.len();
        if total > self.config.max_history_events {
            return Err(OrchestratorError::TooManyEvents {
                execution_id: execution_id.to_string(),
                count: total,
                max: self.config.max_history_events,
            });
        }

        let program = self.registry.get(&execution.workflow_name)?;
        let already_terminal = history.iter().any(|e| e.kind.is_terminal());
        let mut executor = WorkflowExecutor::new(program, history);

        let run = executor.run(events).map_err(|err| {
            error!(error = %err, "determinism error, execution left in progress");
            OrchestratorError::from(err)
        })?;

        let terminal = run.outcome.is_settled();
        if run.new_history_events.is_empty() && run.commands.is_empty() && !terminal {
            debug!("nothing new to record");
            return Ok(CycleReport {
                execution_id: execution_id.to_string(),
                accepted: 0,
                commands: 0,
                events_written: 0,
                bytes_written: 0,
                outcome: run.outcome,
                skipped: false,
            });
        }

        let now = self.clock.now();
        let accepted = run.new_history_events.len();
        let command_count = run.commands.len();

        let mut new_events = Vec::with_capacity(accepted + command_count + 3);
        new_events.push(WorkflowEvent::at(EventKind::WorkflowTaskStarted, now));
        new_events.extend(run.new_history_events);

        let dispatcher = CommandExecutor {
            collaborators: &self.collaborators,
            execution_id,
            workflow_name: &execution.workflow_name,
            now,
        };
        let mut origins = Vec::with_capacity(command_count);
        for command in run.commands {
            origins.push(dispatcher.dispatch(command).await?);
        }
        executor.record(origins.iter().cloned());
        new_events.extend(origins);

        if !already_terminal {
            match &run.outcome {
                Outcome::Resolved { value } => new_events.push(WorkflowEvent::at(
                    EventKind::WorkflowCompleted {
                        output: value.clone(),
                    },
                    now,
                )),
                Outcome::Failed { error } => new_events.push(WorkflowEvent::at(
                    EventKind::WorkflowFailed {
                        error: error.error.clone(),
                        message: error.message.clone(),
                    },
                    now,
                )),
                Outcome::Pending => {}
            }
        }
        new_events.push(WorkflowEvent::at(EventKind::WorkflowTaskCompleted, now));

        let bytes_written = self.history.append(execution_id, &new_events).await?;

        if terminal {
            self.finish_execution(&execution, &run.outcome).await?;
        }

        debug!(
            accepted,
            commands = command_count,
            events_written = new_events.len(),
            bytes_written,
            "cycle persisted"
        );

        Ok(CycleReport {
            execution_id: execution_id.to_string(),
            accepted,
            commands: command_count,
            events_written: new_events.len(),
            bytes_written,
            outcome: run.outcome,
            skipped: false,
        })
    }

    /// Update the execution record and notify the parent, if any
    async fn finish_execution(
        &self,
        execution: &Execution,
        outcome: &Outcome,
    ) -> Result<(), OrchestratorError> {
        let now = self.clock.now();

        let notification = match outcome {
            Outcome::Resolved { value } => {
                self.executions
                    .update_to_succeeded(&execution.id, value.clone(), now)
                    .await?;
                info!(execution_id = %execution.id, "execution succeeded");
                execution
                    .parent
                    .as_ref()
                    .map(|parent| EventKind::ChildWorkflowSucceeded {
                        seq: parent.seq,
                        result: value.clone(),
                    })
            }
            Outcome::Failed { error } => {
                self.executions
                    .update_to_failed(&execution.id, &error.error, &error.message, now)
                    .await?;
                info!(execution_id = %execution.id, error = %error, "execution failed");
                execution
                    .parent
                    .as_ref()
                    .map(|parent| EventKind::ChildWorkflowFailed {
                        seq: parent.seq,
                        error: error.error.clone(),
                        message: error.message.clone(),
                    })
            }
            Outcome::Pending => None,
        };

        if let (Some(parent), Some(kind)) = (&execution.parent, notification) {
            debug!(parent = %parent.execution_id, seq = parent.seq, "notifying parent");
            self.collaborators
                .queue
                .submit_events(&parent.execution_id, vec![WorkflowEvent::at(kind, now)])
                .await?;
        }
        Ok(())
    }
}

fn terminal_outcome(execution: &Execution) -> Outcome {
    match (&execution.result, &execution.error) {
        (_, Some(error)) => Outcome::failed(crate::workflow::WorkflowError::new(
            error.clone(),
            execution.message.clone().unwrap_or_default(),
        )),
        (Some(result), None) => Outcome::resolved(result.clone()),
        (None, None) => Outcome::resolved(serde_json::Value::Null),
    }
}
