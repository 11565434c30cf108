//! In-process queues standing in for every collaborator

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::entities::{LocalEntityStore, LocalTransactions};
use crate::clients::{
    DispatchError, EntityService, EventEmitter, ExecutionQueue, TaskDispatcher, TaskWorkerRequest,
    TimerRequest, TimerService, TransactionService,
};
use crate::clock::Clock;
use crate::workflow::{
    error_names, EntityOperation, EventEnvelope, EventKind, Seq, WorkflowError, WorkflowEvent,
};

/// Pending unit of work
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WorkItem {
    Events {
        execution_id: String,
        events: Vec<WorkflowEvent>,
    },
    Task(TaskWorkerRequest),
}

/// Work queue, timer list and sinks shared by the local runtime
pub(crate) struct LocalBus {
    clock: Arc<dyn Clock>,
    work: Mutex<VecDeque<WorkItem>>,
    timers: Mutex<Vec<TimerRequest>>,
    emitted: Mutex<Vec<(String, EventEnvelope)>>,
    failing_submits: AtomicU32,
    entities: Arc<LocalEntityStore>,
    transactions: Arc<LocalTransactions>,
}

impl LocalBus {
    pub fn new(
        clock: Arc<dyn Clock>,
        entities: Arc<LocalEntityStore>,
        transactions: Arc<LocalTransactions>,
    ) -> Self {
        Self {
            clock,
            work: Mutex::new(VecDeque::new()),
            timers: Mutex::new(Vec::new()),
            emitted: Mutex::new(Vec::new()),
            failing_submits: AtomicU32::new(0),
            entities,
            transactions,
        }
    }

    /// Make the next `count` event submissions fail
    pub fn fail_next_submits(&self, count: u32) {
        self.failing_submits.store(count, Ordering::SeqCst);
    }

    pub fn push(&self, item: WorkItem) {
        self.work.lock().push_back(item);
    }

    pub fn drain(&self) -> Vec<WorkItem> {
        self.work.lock().drain(..).collect()
    }

    /// Remove and return timers due at `now`, earliest first
    pub fn due_timers(&self, now: DateTime<Utc>) -> Vec<TimerRequest> {
        let mut timers = self.timers.lock();
        let (mut due, pending): (Vec<_>, Vec<_>) =
            timers.drain(..).partition(|timer| timer.fire_at() <= now);
        *timers = pending;
        due.sort_by_key(TimerRequest::fire_at);
        due
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn emitted(&self) -> Vec<(String, EventEnvelope)> {
        self.emitted.lock().clone()
    }

    fn enqueue_events(&self, execution_id: &str, events: Vec<WorkflowEvent>) {
        self.push(WorkItem::Events {
            execution_id: execution_id.to_string(),
            events,
        });
    }

    fn report(&self, execution_id: &str, kind: EventKind) {
        let event = WorkflowEvent::at(kind, self.clock.now());
        self.enqueue_events(execution_id, vec![event]);
    }
}

#[async_trait]
impl ExecutionQueue for LocalBus {
    async fn submit_events(
        &self,
        execution_id: &str,
        events: Vec<WorkflowEvent>,
    ) -> Result<(), DispatchError> {
        if self
            .failing_submits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DispatchError::Unavailable(format!(
                "injected submit failure for {execution_id}"
            )));
        }
        self.enqueue_events(execution_id, events);
        Ok(())
    }
}

#[async_trait]
impl TaskDispatcher for LocalBus {
    async fn start_task(&self, request: TaskWorkerRequest) -> Result<(), DispatchError> {
        self.push(WorkItem::Task(request));
        Ok(())
    }
}

#[async_trait]
impl TimerService for LocalBus {
    async fn schedule(&self, request: TimerRequest) -> Result<(), DispatchError> {
        debug!(execution_id = %request.execution_id(), fire_at = %request.fire_at(), "timer scheduled");
        self.timers.lock().push(request);
        Ok(())
    }
}

#[async_trait]
impl EventEmitter for LocalBus {
    async fn emit(&self, execution_id: &str, events: &[EventEnvelope]) -> Result<(), DispatchError> {
        let mut emitted = self.emitted.lock();
        for event in events {
            emitted.push((execution_id.to_string(), event.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityService for LocalBus {
    async fn request(
        &self,
        execution_id: &str,
        seq: Seq,
        operation: EntityOperation,
    ) -> Result<(), DispatchError> {
        let kind = match self.entities.apply(&operation) {
            Ok(result) => EventKind::EntityRequestSucceeded { seq, result },
            Err(error) => EventKind::EntityRequestFailed {
                seq,
                error: error.error,
                message: error.message,
            },
        };
        self.report(execution_id, kind);
        Ok(())
    }
}

#[async_trait]
impl TransactionService for LocalBus {
    async fn invoke(
        &self,
        execution_id: &str,
        seq: Seq,
        transaction_name: &str,
        input: Value,
    ) -> Result<(), DispatchError> {
        let result = match self.transactions.get(transaction_name) {
            Some(transaction) => transaction(&self.entities, input),
            None => Err(WorkflowError::new(
                error_names::TRANSACTION_NOT_FOUND,
                format!("no transaction named {transaction_name}"),
            )),
        };
        let kind = match result {
            Ok(result) => EventKind::TransactionRequestSucceeded { seq, result },
            Err(error) => EventKind::TransactionRequestFailed {
                seq,
                error: error.error,
                message: error.message,
            },
        };
        self.report(execution_id, kind);
        Ok(())
    }
}
