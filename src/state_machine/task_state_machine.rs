use std::sync::Arc;

use tracing::{debug, instrument};

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskEvent,
    guards::{AttemptsRemainingGuard, NoActiveInstanceGuard, StateGuard},
    predecessors_for,
    registry::EntityType,
    states::TaskStatus,
    TransitionOutcome,
};
use crate::constants::events;
use crate::database::Store;
use crate::logging::log_task_operation;
use crate::models::{InstanceClaim, NewTaskResources, Task, TaskInstance, TaskResources};
use crate::orchestration::notifier::{StateChange, StateChangeNotifier};

/// Task lifecycle: REGISTERING through DONE / ERROR_FATAL, plus client resets
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn StateChangeNotifier>,
}

impl TaskStateMachine {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn StateChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    /// Transition table; `None` means the event is illegal from `current`
    pub fn target_for(current: TaskStatus, event: &TaskEvent) -> Option<TaskStatus> {
        use TaskStatus::*;
        let target = match (current, event) {
            (Registering, TaskEvent::Queue) => Queued,
            (Queued | AdjustingResources, TaskEvent::Claim) => Instantiating,
            (Instantiating, TaskEvent::Launch) => Launched,
            (Instantiating | Launched, TaskEvent::Run) => Running,
            (Instantiating | Launched | Running, TaskEvent::Complete) => Done,
            (Instantiating | Launched | Running, TaskEvent::RecoverableError) => ErrorRecoverable,
            (Instantiating | Launched | Running, TaskEvent::AdjustResources) => AdjustingResources,
            (Instantiating | Launched | Running, TaskEvent::FatalError(_)) => ErrorFatal,
            (ErrorRecoverable, TaskEvent::Retry) => Queued,
            (Registering, TaskEvent::Reset) => return None,
            (_, TaskEvent::Reset) => Registering,
            (
                Registering | Queued | ErrorRecoverable | AdjustingResources | ErrorFatal,
                TaskEvent::ForceDone,
            ) => Done,
            _ => return None,
        };
        Some(target)
    }

    pub fn determine_target_state(
        current: TaskStatus,
        event: &TaskEvent,
    ) -> StateMachineResult<TaskStatus> {
        Self::target_for(current, event).ok_or_else(|| StateMachineError::InvalidTransition {
            entity: EntityType::Task,
            from: current.to_string(),
            event: event.event_type().to_string(),
        })
    }

    async fn check_guards(&self, task: &Task, event: &TaskEvent) -> StateMachineResult<()> {
        let store = self.store.as_ref();
        match event {
            TaskEvent::Retry => AttemptsRemainingGuard.check(task, store).await?,
            TaskEvent::Reset | TaskEvent::ForceDone => {
                NoActiveInstanceGuard.check(task, store).await?
            }
            _ => {}
        }
        Ok(())
    }

    #[instrument(skip(self, event), fields(event = event.event_type()))]
    pub async fn transition(
        &self,
        task_id: i64,
        event: TaskEvent,
    ) -> StateMachineResult<TransitionOutcome<TaskStatus>> {
        let task = self.store.get_task(task_id).await?;
        let target = Self::determine_target_state(task.status, &event)?;
        self.check_guards(&task, &event).await?;

        let from = predecessors_for(&event, target, Self::target_for);
        let reset_attempts = matches!(event, TaskEvent::Reset);
        let applied = self
            .store
            .transition_task(task_id, &from, target, reset_attempts)
            .await?;

        if !applied {
            let observed = self.store.get_task(task_id).await?.status;
            debug!(
                task_id = task_id,
                expected = %task.status,
                observed = %observed,
                "Task transition superseded"
            );
            return Ok(TransitionOutcome::Superseded { observed });
        }

        log_task_operation(
            event.event_type(),
            Some(task_id),
            Some(&task.name),
            target.name(),
            event.error_message(),
        );
        self.notifier.notify(StateChange::new(
            Self::event_name(&event),
            EntityType::Task,
            task_id,
            Some(task.workflow_id),
            task.status.code(),
            target.code(),
        ));
        Ok(TransitionOutcome::Applied {
            from: task.status,
            to: target,
        })
    }

    /// Claim a new instance for the task: the atomic QUEUED/ADJUSTING_RESOURCES
    /// -> INSTANTIATING edge. `None` when the task was not claimable.
    pub async fn claim(
        &self,
        task: &Task,
        workflow_run_id: i64,
        batch_key: impl Into<String>,
    ) -> StateMachineResult<Option<TaskInstance>> {
        Self::determine_target_state(task.status, &TaskEvent::Claim)?;
        let claimed = self
            .store
            .claim_task_instance(InstanceClaim {
                task_id: task.task_id,
                workflow_run_id,
                batch_key: batch_key.into(),
            })
            .await?;
        if let Some(instance) = &claimed {
            self.notifier.notify(StateChange::new(
                events::INSTANCE_CLAIMED,
                EntityType::Task,
                task.task_id,
                Some(task.workflow_id),
                task.status.code(),
                TaskStatus::Instantiating.code(),
            ));
            debug!(
                task_id = task.task_id,
                task_instance_id = instance.task_instance_id,
                "Instance claimed"
            );
        }
        Ok(claimed)
    }

    /// The in-flight -> ADJUSTING_RESOURCES edge, written together with the
    /// scaled resources row. `None` when another writer moved the task first.
    pub async fn adjust_resources(
        &self,
        task: &Task,
        resources: NewTaskResources,
    ) -> StateMachineResult<Option<TaskResources>> {
        let event = TaskEvent::AdjustResources;
        let target = Self::determine_target_state(task.status, &event)?;
        let from = predecessors_for(&event, target, Self::target_for);
        let inserted = self.store.adjust_task_resources(&from, resources).await?;
        if inserted.is_some() {
            log_task_operation(
                event.event_type(),
                Some(task.task_id),
                Some(&task.name),
                target.name(),
                None,
            );
            self.notifier.notify(StateChange::new(
                Self::event_name(&event),
                EntityType::Task,
                task.task_id,
                Some(task.workflow_id),
                task.status.code(),
                target.code(),
            ));
        }
        Ok(inserted)
    }

    fn event_name(event: &TaskEvent) -> &'static str {
        match event {
            TaskEvent::Queue | TaskEvent::Retry => events::TASK_QUEUED,
            TaskEvent::Reset => events::TASK_RESET,
            _ => events::TASK_TRIAGED,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::table_respects_registry;
    use TaskStatus::*;

    fn all_events() -> Vec<TaskEvent> {
        vec![
            TaskEvent::Queue,
            TaskEvent::Claim,
            TaskEvent::Launch,
            TaskEvent::Run,
            TaskEvent::Complete,
            TaskEvent::RecoverableError,
            TaskEvent::AdjustResources,
            TaskEvent::FatalError("x".into()),
            TaskEvent::Retry,
            TaskEvent::Reset,
            TaskEvent::ForceDone,
        ]
    }

    #[test]
    fn test_table_only_produces_registry_edges() {
        assert!(table_respects_registry(&all_events(), TaskStateMachine::target_for));
    }

    #[test]
    fn test_triage_targets() {
        assert_eq!(
            TaskStateMachine::target_for(Running, &TaskEvent::AdjustResources),
            Some(AdjustingResources)
        );
        assert_eq!(
            TaskStateMachine::target_for(ErrorRecoverable, &TaskEvent::Retry),
            Some(Queued)
        );
        assert_eq!(TaskStateMachine::target_for(Done, &TaskEvent::Retry), None);
        assert_eq!(TaskStateMachine::target_for(Done, &TaskEvent::Reset), Some(Registering));
        assert_eq!(TaskStateMachine::target_for(Running, &TaskEvent::ForceDone), None);
    }

    #[test]
    fn test_invalid_transition_error() {
        let err = TaskStateMachine::determine_target_state(Done, &TaskEvent::Claim).unwrap_err();
        assert!(matches!(
            err,
            StateMachineError::InvalidTransition {
                entity: EntityType::Task,
                ..
            }
        ));
    }

    #[test]
    fn test_predecessors_for_run() {
        let from = predecessors_for(&TaskEvent::Run, Running, TaskStateMachine::target_for);
        assert_eq!(from, vec![Instantiating, Launched]);
    }
}
