//! Timer firing
//!
//! Hosts call [`TimerHandler::fire`] when a scheduled [`TimerRequest`] comes
//! due. Payload timers deliver their event; heartbeat monitors check the task
//! record and either report a timeout or schedule the next check.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::clients::{DispatchError, ExecutionQueue, TimerRequest, TimerService};
use crate::clock::{add_duration, Clock};
use crate::persistence::TaskStore;
use crate::workflow::{EventKind, WorkflowEvent};

/// What firing a timer did
#[derive(Debug, Clone, PartialEq)]
pub enum TimerFired {
    /// The payload event was submitted
    Delivered,

    /// The task missed its heartbeat; `TaskHeartbeatTimedOut` was submitted
    HeartbeatTimedOut,

    /// The task heartbeated in time; the next check fires at the given time
    Rescheduled(DateTime<Utc>),
}

pub struct TimerHandler {
    queue: Arc<dyn ExecutionQueue>,
    tasks: Arc<dyn TaskStore>,
    timers: Arc<dyn TimerService>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TimerHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandler").finish_non_exhaustive()
    }
}

impl TimerHandler {
    pub fn new(
        queue: Arc<dyn ExecutionQueue>,
        tasks: Arc<dyn TaskStore>,
        timers: Arc<dyn TimerService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue,
            tasks,
            timers,
            clock,
        }
    }

    #[instrument(skip(self, request), fields(execution_id = %request.execution_id()))]
    pub async fn fire(&self, request: TimerRequest) -> Result<TimerFired, DispatchError> {
        match request {
            TimerRequest::ScheduleEvent {
                execution_id,
                event,
                ..
            } => {
                debug!(event = event.kind.type_name(), "delivering timer event");
                self.queue.submit_events(&execution_id, vec![event]).await?;
                Ok(TimerFired::Delivered)
            }
            TimerRequest::HeartbeatMonitor {
                execution_id,
                seq,
                heartbeat,
                ..
            } => {
                let now = self.clock.now();
                let last = self
                    .tasks
                    .get(&execution_id, seq)
                    .await?
                    .and_then(|record| record.heartbeat_time);

                match last {
                    Some(last) if add_duration(last, heartbeat) > now => {
                        let fire_at = add_duration(last, heartbeat);
                        self.timers
                            .schedule(TimerRequest::HeartbeatMonitor {
                                execution_id,
                                seq,
                                heartbeat,
                                fire_at,
                            })
                            .await?;
                        debug!(seq, %fire_at, "heartbeat received, checking again later");
                        Ok(TimerFired::Rescheduled(fire_at))
                    }
                    _ => {
                        info!(seq, "task heartbeat timed out");
                        self.queue
                            .submit_events(
                                &execution_id,
                                vec![WorkflowEvent::at(
                                    EventKind::TaskHeartbeatTimedOut { seq },
                                    now,
                                )],
                            )
                            .await?;
                        Ok(TimerFired::HeartbeatTimedOut)
                    }
                }
            }
        }
    }
}
