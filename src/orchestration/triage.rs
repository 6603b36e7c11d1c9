//! # Triage
//!
//! Decides what happens to a task once its latest instance stopped being
//! active. Every outcome is a task transition, so the loop driving triage
//! never sees an error for a failed attempt, only for a failed store.
//!
//! | Instance outcome | Attempts remain | Task becomes |
//! |---|---|---|
//! | DONE | - | DONE |
//! | ERROR, UNKNOWN_ERROR, NO_HEARTBEAT, NO_DISTRIBUTOR_ID | yes | ERROR_RECOVERABLE, then QUEUED |
//! | RESOURCE_ERROR | yes | ADJUSTING_RESOURCES with a scaled resources row |
//! | any failure | no | ERROR_FATAL |
//! | KILL_SELF, ERROR_FATAL | - | ERROR_FATAL |

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::errors::SwarmResult;
use crate::database::Store;
use crate::models::{NewTaskResources, ResourceRecordKind, Task, TaskInstance, TaskResources};
use crate::resources::{scale_resources, QueueCatalog, ScaledResources};
use crate::state_machine::{TaskEvent, TaskInstanceStatus, TaskStateMachine};

/// What triage did with one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriageOutcome {
    Completed,
    /// Requeued with identical resources
    Retried,
    /// Resources scaled; the task waits in ADJUSTING_RESOURCES for its next claim
    ResourcesAdjusted { queue: String },
    Fatal { reason: String },
    /// Nothing to decide: the task is not in flight or its instance is still active
    Skipped,
}

#[derive(Debug, Clone)]
pub struct Triage {
    tasks: TaskStateMachine,
    store: Arc<dyn Store>,
    catalog: Arc<QueueCatalog>,
}

impl Triage {
    pub fn new(tasks: TaskStateMachine, catalog: Arc<QueueCatalog>) -> Self {
        let store = tasks.store().clone();
        Self {
            tasks,
            store,
            catalog,
        }
    }

    #[instrument(skip(self, task, instance), fields(task_id = task.task_id, task_instance_id = instance.task_instance_id))]
    pub async fn triage(&self, task: &Task, instance: &TaskInstance) -> SwarmResult<TriageOutcome> {
        if !task.status.is_in_flight() || instance.status.is_active() {
            return Ok(TriageOutcome::Skipped);
        }

        use TaskInstanceStatus as S;
        let outcome = match instance.status {
            S::Done => {
                if !self.apply(task, TaskEvent::Complete).await? {
                    return Ok(TriageOutcome::Skipped);
                }
                TriageOutcome::Completed
            }
            S::KillSelf | S::ErrorFatal => {
                let reason = Self::failure_reason(instance);
                self.fatal(task, reason).await?
            }
            S::ResourceError if task.has_attempts_remaining() => {
                self.adjust_resources(task, instance).await?
            }
            S::Error | S::UnknownError | S::NoHeartbeat | S::NoDistributorId
                if task.has_attempts_remaining() =>
            {
                if !self.apply(task, TaskEvent::RecoverableError).await? {
                    return Ok(TriageOutcome::Skipped);
                }
                self.apply(task, TaskEvent::Retry).await?;
                TriageOutcome::Retried
            }
            _ => {
                let reason = format!(
                    "{} after {} of {} attempts",
                    Self::failure_reason(instance),
                    task.num_attempts,
                    task.max_attempts
                );
                self.fatal(task, reason).await?
            }
        };

        debug!(task_id = task.task_id, outcome = ?outcome, "Task triaged");
        Ok(outcome)
    }

    fn failure_reason(instance: &TaskInstance) -> String {
        match (&instance.error_log, instance.exit_code) {
            (Some(log), _) => log.clone(),
            (None, Some(code)) => format!("{} with exit code {code}", instance.status),
            (None, None) => instance.status.to_string(),
        }
    }

    /// Returns whether the transition was applied
    async fn apply(&self, task: &Task, event: TaskEvent) -> SwarmResult<bool> {
        Ok(self.tasks.transition(task.task_id, event).await?.is_applied())
    }

    async fn fatal(&self, task: &Task, reason: String) -> SwarmResult<TriageOutcome> {
        if !self
            .apply(task, TaskEvent::FatalError(reason.clone()))
            .await?
        {
            return Ok(TriageOutcome::Skipped);
        }
        warn!(task_id = task.task_id, task_name = %task.name, reason = %reason, "Task failed fatally");
        Ok(TriageOutcome::Fatal { reason })
    }

    async fn adjust_resources(
        &self,
        task: &Task,
        instance: &TaskInstance,
    ) -> SwarmResult<TriageOutcome> {
        let history = self.store.list_task_resources(task.task_id).await?;
        let Some(current) = history.last() else {
            return self
                .fatal(task, format!("task {} has no resources row", task.task_id))
                .await;
        };

        let retry = consecutive_adjustments(&history, &current.queue) + 1;
        let scaled = match scale_resources(
            &current.queue,
            &current.values,
            &task.resource_scales,
            &instance.exceeded_resources,
            &task.fallback_queues,
            &self.catalog,
            retry,
        ) {
            Ok(scaled) => scaled,
            Err(err) => return self.fatal(task, err.to_string()).await,
        };

        let ScaledResources {
            queue,
            values,
            adjustments,
            moved_from_queue,
        } = scaled;
        let adjusted = self
            .tasks
            .adjust_resources(
                task,
                NewTaskResources {
                    task_id: task.task_id,
                    kind: ResourceRecordKind::Adjusted,
                    queue: queue.clone(),
                    values,
                    adjustments,
                },
            )
            .await?;
        if adjusted.is_none() {
            return Ok(TriageOutcome::Skipped);
        }

        info!(
            task_id = task.task_id,
            queue = %queue,
            moved_from_queue = ?moved_from_queue,
            retry = retry,
            "Resources scaled after resource error"
        );
        Ok(TriageOutcome::ResourcesAdjusted { queue })
    }
}

/// Adjusted rows at the end of the history that stayed on `queue`; a queue
/// change restarts the count
fn consecutive_adjustments(history: &[TaskResources], queue: &str) -> u32 {
    history
        .iter()
        .rev()
        .take_while(|row| row.kind == ResourceRecordKind::Adjusted && row.queue == queue)
        .count() as u32
}
