use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::TaskInstanceEvent,
    predecessors_for,
    registry::EntityType,
    states::TaskInstanceStatus,
    TransitionOutcome,
};
use crate::constants::events;
use crate::database::Store;
use crate::logging::log_instance_operation;
use crate::models::InstanceUpdate;
use crate::orchestration::notifier::{StateChange, StateChangeNotifier};

/// TaskInstance lifecycle, driven by the distributor, the worker wrapper and the reaper
#[derive(Debug, Clone)]
pub struct TaskInstanceStateMachine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn StateChangeNotifier>,
}

impl TaskInstanceStateMachine {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn StateChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    pub fn target_for(
        current: TaskInstanceStatus,
        event: &TaskInstanceEvent,
    ) -> Option<TaskInstanceStatus> {
        use TaskInstanceEvent as E;
        use TaskInstanceStatus::*;
        let target = match (current, event) {
            (Queued, E::Instantiate) => Instantiated,
            (Instantiated, E::Submit) => SubmittedToBatchDistributor,
            (SubmittedToBatchDistributor, E::Launch { .. }) => Launched,
            (Instantiated | SubmittedToBatchDistributor, E::NoDistributorId { .. }) => {
                NoDistributorId
            }
            (Launched, E::Run { .. }) => Running,
            (Launched | Running, E::BeginTriage) => Triaging,
            (Launched | Running, E::Complete) => Done,
            (Launched | Running | Triaging, E::Error { .. }) => Error,
            (Launched | Running | Triaging, E::ResourceError { .. }) => ResourceError,
            (Launched | Running | Triaging, E::UnknownError { .. }) => UnknownError,
            (Launched | Running | Triaging | KillSelf, E::FatalError { .. }) => ErrorFatal,
            (status, E::NoHeartbeat) if status.is_active() => NoHeartbeat,
            (status, E::KillSelf) if status.is_active() => KillSelf,
            _ => return None,
        };
        Some(target)
    }

    pub fn determine_target_state(
        current: TaskInstanceStatus,
        event: &TaskInstanceEvent,
    ) -> StateMachineResult<TaskInstanceStatus> {
        Self::target_for(current, event).ok_or_else(|| StateMachineError::InvalidTransition {
            entity: EntityType::TaskInstance,
            from: current.to_string(),
            event: event.event_type().to_string(),
        })
    }

    /// Columns written alongside the status change
    fn update_for(event: &TaskInstanceEvent) -> InstanceUpdate {
        use TaskInstanceEvent as E;
        match event {
            E::Launch { distributor_id } => InstanceUpdate {
                distributor_id: Some(distributor_id.clone()),
                ..Default::default()
            },
            E::Run { nodename } => InstanceUpdate {
                nodename: nodename.clone(),
                ..Default::default()
            },
            E::NoDistributorId { reason } => InstanceUpdate {
                error_log: Some(reason.clone()),
                ..Default::default()
            },
            E::Error {
                exit_code,
                error_log,
            } => InstanceUpdate {
                exit_code: *exit_code,
                error_log: error_log.clone(),
                ..Default::default()
            },
            E::ResourceError {
                exceeded,
                error_log,
            } => InstanceUpdate {
                error_log: error_log.clone(),
                exceeded_resources: Some(exceeded.clone()),
                ..Default::default()
            },
            E::UnknownError { error_log } | E::FatalError { error_log } => InstanceUpdate {
                error_log: error_log.clone(),
                ..Default::default()
            },
            _ => InstanceUpdate::default(),
        }
    }

    pub async fn transition(
        &self,
        task_instance_id: i64,
        event: TaskInstanceEvent,
    ) -> StateMachineResult<TransitionOutcome<TaskInstanceStatus>> {
        let instance = self.store.get_task_instance(task_instance_id).await?;
        let target = Self::determine_target_state(instance.status, &event)?;
        let from = predecessors_for(&event, target, Self::target_for);

        let applied = self
            .store
            .transition_task_instance(task_instance_id, &from, target, Self::update_for(&event))
            .await?;
        if !applied {
            let observed = self.store.get_task_instance(task_instance_id).await?.status;
            debug!(
                task_instance_id = task_instance_id,
                expected = %instance.status,
                observed = %observed,
                event = event.event_type(),
                "Instance transition superseded"
            );
            return Ok(TransitionOutcome::Superseded { observed });
        }

        let distributor_id = match &event {
            TaskInstanceEvent::Launch { distributor_id } => Some(distributor_id.as_str()),
            _ => instance.distributor_id.as_deref(),
        };
        log_instance_operation(
            event.event_type(),
            Some(task_instance_id),
            Some(instance.task_id),
            distributor_id,
            target.name(),
            None,
        );
        let name = match event {
            TaskInstanceEvent::Launch { .. } => events::INSTANCE_LAUNCHED,
            TaskInstanceEvent::NoHeartbeat => events::INSTANCE_REAPED,
            _ => events::INSTANCE_TERMINATED,
        };
        self.notifier.notify(StateChange::new(
            name,
            EntityType::TaskInstance,
            task_instance_id,
            Some(instance.workflow_id),
            instance.status.code(),
            target.code(),
        ));
        Ok(TransitionOutcome::Applied {
            from: instance.status,
            to: target,
        })
    }

    /// Liveness ping; false once the instance is no longer active
    pub async fn heartbeat(
        &self,
        task_instance_id: i64,
        at: DateTime<Utc>,
    ) -> StateMachineResult<bool> {
        Ok(self
            .store
            .heartbeat_task_instance(task_instance_id, at)
            .await?)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
}
