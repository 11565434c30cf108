//! Command dispatch
//!
//! Hands each command to its collaborator and returns the origin event the
//! orchestrator writes to history for it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clients::{
    DispatchError, EntityService, EventEmitter, ExecutionQueue, ExecutionStarter,
    StartExecutionRequest, TaskDispatcher, TaskWorkerRequest, TimerRequest, TimerService,
    TransactionService,
};
use crate::workflow::{
    child_execution_name, signal_dedupe_id, Command, EventKind, ParentRef, WorkflowEvent,
};

/// Every collaborator a cycle may dispatch to
#[derive(Clone)]
pub struct Collaborators {
    pub queue: Arc<dyn ExecutionQueue>,
    pub tasks: Arc<dyn TaskDispatcher>,
    pub timers: Arc<dyn TimerService>,
    pub starter: Arc<dyn ExecutionStarter>,
    pub emitter: Arc<dyn EventEmitter>,
    pub entities: Arc<dyn EntityService>,
    pub transactions: Arc<dyn TransactionService>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// Dispatches commands for one execution
pub(crate) struct CommandExecutor<'a> {
    pub collaborators: &'a Collaborators,
    pub execution_id: &'a str,
    pub workflow_name: &'a str,
    pub now: DateTime<Utc>,
}

impl CommandExecutor<'_> {
    pub async fn dispatch(&self, command: Command) -> Result<WorkflowEvent, DispatchError> {
        let execution_id = self.execution_id;
        debug!(
            %execution_id,
            seq = command.seq(),
            kind = command.kind_name(),
            "dispatching command"
        );

        let origin = match command {
            Command::ScheduleTask {
                seq,
                name,
                input,
                heartbeat,
            } => {
                self.collaborators
                    .tasks
                    .start_task(TaskWorkerRequest {
                        execution_id: execution_id.to_string(),
                        workflow_name: self.workflow_name.to_string(),
                        task_name: name.clone(),
                        seq,
                        retry: 0,
                        input,
                        heartbeat,
                        scheduled_time: self.now,
                    })
                    .await?;
                EventKind::TaskScheduled { seq, name }
            }
            Command::StartTimer { seq, schedule } => {
                let until_time = schedule.until_time(self.now);
                self.collaborators
                    .timers
                    .schedule(TimerRequest::ScheduleEvent {
                        execution_id: execution_id.to_string(),
                        fire_at: until_time,
                        event: WorkflowEvent::at(EventKind::TimerCompleted { seq }, until_time),
                    })
                    .await?;
                EventKind::TimerScheduled { seq, until_time }
            }
            Command::StartChildWorkflow { seq, name, input } => {
                let request = StartExecutionRequest::new(name.clone(), input.clone())
                    .with_execution_name(child_execution_name(execution_id, seq))
                    .with_parent(ParentRef {
                        execution_id: execution_id.to_string(),
                        seq,
                    });
                let started = self.collaborators.starter.start_execution(request).await?;
                debug!(
                    %execution_id,
                    child = %started.execution_id,
                    already_running = started.already_running,
                    "child execution started"
                );
                EventKind::ChildWorkflowScheduled { seq, name, input }
            }
            Command::SendSignal {
                seq,
                target,
                signal_id,
                payload,
            } => {
                let target_id = target.resolve(execution_id);
                let delivery = WorkflowEvent::at(
                    EventKind::SignalReceived {
                        signal_id: signal_id.clone(),
                        payload: payload.clone(),
                        id: Some(signal_dedupe_id(execution_id, seq)),
                    },
                    self.now,
                );
                self.collaborators
                    .queue
                    .submit_events(&target_id, vec![delivery])
                    .await?;
                EventKind::SignalSent {
                    seq,
                    signal_id,
                    execution_id: target_id,
                    payload,
                }
            }
            Command::EmitEvents { seq, events } => {
                self.collaborators.emitter.emit(execution_id, &events).await?;
                EventKind::EventsEmitted { seq, events }
            }
            Command::EntityRequest { seq, operation } => {
                self.collaborators
                    .entities
                    .request(execution_id, seq, operation.clone())
                    .await?;
                EventKind::EntityRequest { seq, operation }
            }
            Command::InvokeTransaction {
                seq,
                transaction_name,
                input,
            } => {
                self.collaborators
                    .transactions
                    .invoke(execution_id, seq, &transaction_name, input.clone())
                    .await?;
                EventKind::TransactionRequest {
                    seq,
                    transaction_name,
                    input,
                }
            }
        };

        Ok(WorkflowEvent::at(origin, self.now))
    }
}
