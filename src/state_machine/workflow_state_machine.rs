use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::{
    errors::{StateMachineError, StateMachineResult},
    events::{WorkflowEvent, WorkflowRunEvent},
    predecessors_for,
    registry::EntityType,
    states::{WorkflowRunStatus, WorkflowStatus},
    TransitionOutcome,
};
use crate::constants::events;
use crate::database::Store;
use crate::logging::log_workflow_operation;
use crate::orchestration::notifier::{StateChange, StateChangeNotifier};

fn event_label<E: Serialize + std::fmt::Debug>(event: &E) -> String {
    serde_json::to_value(event)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{event:?}"))
}

/// Workflow lifecycle; aggregates task outcomes and resumes
#[derive(Debug, Clone)]
pub struct WorkflowStateMachine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn StateChangeNotifier>,
}

impl WorkflowStateMachine {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn StateChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    pub fn target_for(current: WorkflowStatus, event: &WorkflowEvent) -> Option<WorkflowStatus> {
        use WorkflowStatus::*;
        let target = match (current, event) {
            (Registering, WorkflowEvent::Queue) => Queued,
            (Registering, WorkflowEvent::Abort) => Aborted,
            (Queued, WorkflowEvent::Instantiate) => Instantiating,
            (Instantiating, WorkflowEvent::Launch) => Launched,
            (Launched, WorkflowEvent::Run) => Running,
            (Running, WorkflowEvent::Complete) => Done,
            (Queued | Instantiating | Launched | Running | Halted | Done, WorkflowEvent::Fail) => {
                Failed
            }
            (Queued | Instantiating | Launched | Running, WorkflowEvent::Halt) => Halted,
            (
                Aborted | Instantiating | Launched | Running | Failed | Halted,
                WorkflowEvent::Resume,
            ) => Queued,
            _ => return None,
        };
        Some(target)
    }

    pub fn determine_target_state(
        current: WorkflowStatus,
        event: &WorkflowEvent,
    ) -> StateMachineResult<WorkflowStatus> {
        Self::target_for(current, event).ok_or_else(|| StateMachineError::InvalidTransition {
            entity: EntityType::Workflow,
            from: current.to_string(),
            event: event_label(event),
        })
    }

    pub async fn transition(
        &self,
        workflow_id: i64,
        event: WorkflowEvent,
    ) -> StateMachineResult<TransitionOutcome<WorkflowStatus>> {
        let current = self.store.get_workflow(workflow_id).await?.status;
        let target = Self::determine_target_state(current, &event)?;
        let from = predecessors_for(&event, target, Self::target_for);

        if !self
            .store
            .transition_workflow(workflow_id, &from, target)
            .await?
        {
            let observed = self.store.get_workflow(workflow_id).await?.status;
            debug!(
                workflow_id = workflow_id,
                expected = %current,
                observed = %observed,
                "Workflow transition superseded"
            );
            return Ok(TransitionOutcome::Superseded { observed });
        }

        log_workflow_operation(
            &event_label(&event),
            Some(workflow_id),
            None,
            target.name(),
            None,
        );
        let name = match event {
            WorkflowEvent::Queue => events::WORKFLOW_BOUND,
            WorkflowEvent::Resume => events::WORKFLOW_RESUMED,
            _ => events::WORKFLOW_RUN_TRANSITIONED,
        };
        self.notifier.notify(StateChange::new(
            name,
            EntityType::Workflow,
            workflow_id,
            Some(workflow_id),
            current.code(),
            target.code(),
        ));
        Ok(TransitionOutcome::Applied {
            from: current,
            to: target,
        })
    }

    /// Fire `event` only if it is legal from the current status; a no-op otherwise
    pub async fn transition_if_legal(
        &self,
        workflow_id: i64,
        event: WorkflowEvent,
    ) -> StateMachineResult<Option<TransitionOutcome<WorkflowStatus>>> {
        let current = self.store.get_workflow(workflow_id).await?.status;
        if Self::target_for(current, &event).is_none() {
            return Ok(None);
        }
        self.transition(workflow_id, event).await.map(Some)
    }
}

/// WorkflowRun lifecycle; the controlling run is the single writer for its tasks
#[derive(Debug, Clone)]
pub struct WorkflowRunStateMachine {
    store: Arc<dyn Store>,
    notifier: Arc<dyn StateChangeNotifier>,
}

impl WorkflowRunStateMachine {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn StateChangeNotifier>) -> Self {
        Self { store, notifier }
    }

    pub fn target_for(
        current: WorkflowRunStatus,
        event: &WorkflowRunEvent,
    ) -> Option<WorkflowRunStatus> {
        use WorkflowRunEvent as E;
        use WorkflowRunStatus::*;
        let target = match (current, event) {
            (Registering, E::Bind) => Bound,
            (Registering, E::Abort) => Aborted,
            (Bound, E::Instantiate) => Instantiated,
            (Instantiated, E::Launch) => Launched,
            (Launched, E::Run) => Running,
            (Running, E::Complete) => Done,
            (Bound | Instantiated | Launched | Running, E::Error) => Error,
            (Bound | Instantiated | Launched | Running, E::Stop) => Stopped,
            (status, E::ColdResume) if status.is_controlling() => ColdResume,
            (status, E::HotResume) if status.is_controlling() => HotResume,
            (ColdResume | HotResume, E::Terminate) => Terminated,
            _ => return None,
        };
        Some(target)
    }

    pub fn determine_target_state(
        current: WorkflowRunStatus,
        event: &WorkflowRunEvent,
    ) -> StateMachineResult<WorkflowRunStatus> {
        Self::target_for(current, event).ok_or_else(|| StateMachineError::InvalidTransition {
            entity: EntityType::WorkflowRun,
            from: current.to_string(),
            event: event_label(event),
        })
    }

    pub async fn transition(
        &self,
        workflow_run_id: i64,
        event: WorkflowRunEvent,
    ) -> StateMachineResult<TransitionOutcome<WorkflowRunStatus>> {
        let run = self.store.get_workflow_run(workflow_run_id).await?;
        let target = Self::determine_target_state(run.status, &event)?;
        let from = predecessors_for(&event, target, Self::target_for);

        if !self
            .store
            .transition_workflow_run(workflow_run_id, &from, target)
            .await?
        {
            let observed = self.store.get_workflow_run(workflow_run_id).await?.status;
            debug!(
                workflow_run_id = workflow_run_id,
                expected = %run.status,
                observed = %observed,
                "Workflow run transition superseded"
            );
            return Ok(TransitionOutcome::Superseded { observed });
        }

        log_workflow_operation(
            &event_label(&event),
            Some(run.workflow_id),
            Some(workflow_run_id),
            target.name(),
            None,
        );
        self.notifier.notify(StateChange::new(
            events::WORKFLOW_RUN_TRANSITIONED,
            EntityType::WorkflowRun,
            workflow_run_id,
            Some(run.workflow_id),
            run.status.code(),
            target.code(),
        ));
        Ok(TransitionOutcome::Applied {
            from: run.status,
            to: target,
        })
    }

    /// Walk a freshly bound run through INSTANTIATED and LAUNCHED to RUNNING.
    /// Steps already taken are skipped.
    pub async fn advance_to_running(
        &self,
        workflow_run_id: i64,
    ) -> StateMachineResult<WorkflowRunStatus> {
        let mut status = self.store.get_workflow_run(workflow_run_id).await?.status;
        for (from, event) in [
            (WorkflowRunStatus::Bound, WorkflowRunEvent::Instantiate),
            (WorkflowRunStatus::Instantiated, WorkflowRunEvent::Launch),
            (WorkflowRunStatus::Launched, WorkflowRunEvent::Run),
        ] {
            if status == from {
                status = self.transition(workflow_run_id, event).await?.status();
            }
        }
        Ok(status)
    }

    /// Controller liveness ping; false once the run stopped being controlling
    pub async fn heartbeat(
        &self,
        workflow_run_id: i64,
        at: DateTime<Utc>,
    ) -> StateMachineResult<bool> {
        Ok(self.store.heartbeat_workflow_run(workflow_run_id, at).await?)
    }
}
