// State machines for the four persisted lifecycles.
//
// Each machine reads the current status, maps (status, event) to a target via
// its `determine_target_state` table, runs guards, then writes through a
// conditional store update whose predecessor set is every status from which
// the event reaches the same target. A lost race is not an error: the caller
// gets `TransitionOutcome::Superseded` with the status that won.

pub mod errors;
pub mod events;
pub mod guards;
pub mod registry;
pub mod states;
pub mod task_instance_state_machine;
pub mod task_state_machine;
pub mod workflow_state_machine;

pub use errors::{GuardError, StateMachineError, StateMachineResult};
pub use events::{TaskEvent, TaskInstanceEvent, WorkflowEvent, WorkflowRunEvent};
pub use guards::StateGuard;
pub use registry::{legal_transitions, EntityType, Status};
pub use states::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
pub use task_instance_state_machine::TaskInstanceStateMachine;
pub use task_state_machine::TaskStateMachine;
pub use workflow_state_machine::{WorkflowRunStateMachine, WorkflowStateMachine};

/// Result of a conditional transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome<S> {
    Applied { from: S, to: S },
    /// Another writer moved the entity first
    Superseded { observed: S },
}

impl<S: Copy> TransitionOutcome<S> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Status of the entity after the attempt
    pub fn status(&self) -> S {
        match self {
            Self::Applied { to, .. } => *to,
            Self::Superseded { observed } => *observed,
        }
    }
}

/// Every status from which `event` leads to `target` under `table`
pub(crate) fn predecessors_for<S: Status, E>(
    event: &E,
    target: S,
    table: impl Fn(S, &E) -> Option<S>,
) -> Vec<S> {
    S::all()
        .iter()
        .copied()
        .filter(|status| table(*status, event) == Some(target))
        .collect()
}

/// Every `(from, to)` pair the table can produce for `events` must be a
/// registry edge. Used by the machines' tests.
#[cfg(test)]
pub(crate) fn table_respects_registry<S: Status, E>(
    events: &[E],
    table: impl Fn(S, &E) -> Option<S>,
) -> bool {
    events.iter().all(|event| {
        S::all().iter().all(|from| match table(*from, event) {
            Some(to) => from.can_transition_to(to),
            None => true,
        })
    })
}
