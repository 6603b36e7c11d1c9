//! Status Registry: the legal transition table for each entity type.
//!
//! Pure lookup tables. State machines consult them before any write reaches
//! the store, and the store uses the predecessor sets as the `status IN (...)`
//! guard of its conditional updates.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use super::states::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Workflow,
    WorkflowRun,
    Task,
    TaskInstance,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::WorkflowRun => write!(f, "workflow_run"),
            Self::Task => write!(f, "task"),
            Self::TaskInstance => write!(f, "task_instance"),
        }
    }
}

/// Common surface of the four status enums
pub trait Status: Copy + Eq + Hash + Ord + fmt::Debug + fmt::Display + Send + Sync + 'static {
    const ENTITY: EntityType;

    fn all() -> &'static [Self];
    fn code(&self) -> char;
    fn is_terminal(&self) -> bool;
    fn transitions() -> &'static [(Self, Self)];

    fn can_transition_to(&self, to: Self) -> bool {
        Self::transitions().contains(&(*self, to))
    }

    /// All states with a legal edge into `to`
    fn legal_predecessors(to: Self) -> Vec<Self> {
        Self::transitions()
            .iter()
            .filter(|(_, target)| *target == to)
            .map(|(from, _)| *from)
            .collect()
    }
}

macro_rules! impl_status {
    ($ty:ident, $entity:expr, $table:ident) => {
        impl Status for $ty {
            const ENTITY: EntityType = $entity;

            fn all() -> &'static [Self] {
                $ty::ALL
            }

            fn code(&self) -> char {
                $ty::code(self)
            }

            fn is_terminal(&self) -> bool {
                $ty::is_terminal(self)
            }

            fn transitions() -> &'static [(Self, Self)] {
                $table
            }
        }
    };
}

use TaskInstanceStatus as TI;
use TaskStatus as T;
use WorkflowRunStatus as WR;
use WorkflowStatus as W;

const WORKFLOW_TRANSITIONS: &[(W, W)] = &[
    (W::Registering, W::Queued),
    (W::Registering, W::Aborted),
    (W::Queued, W::Instantiating),
    (W::Instantiating, W::Launched),
    (W::Launched, W::Running),
    (W::Running, W::Done),
    // failure aggregation and reaping
    (W::Queued, W::Failed),
    (W::Instantiating, W::Failed),
    (W::Launched, W::Failed),
    (W::Running, W::Failed),
    (W::Halted, W::Failed),
    (W::Queued, W::Halted),
    (W::Instantiating, W::Halted),
    (W::Launched, W::Halted),
    (W::Running, W::Halted),
    // resume
    (W::Aborted, W::Queued),
    (W::Instantiating, W::Queued),
    (W::Launched, W::Queued),
    (W::Running, W::Queued),
    (W::Failed, W::Queued),
    (W::Halted, W::Queued),
    // a DONE task was reset to REGISTERING
    (W::Done, W::Failed),
];

const WORKFLOW_RUN_TRANSITIONS: &[(WR, WR)] = &[
    (WR::Registering, WR::Bound),
    (WR::Registering, WR::Aborted),
    (WR::Bound, WR::Instantiated),
    (WR::Instantiated, WR::Launched),
    (WR::Launched, WR::Running),
    (WR::Running, WR::Done),
    (WR::Bound, WR::Error),
    (WR::Instantiated, WR::Error),
    (WR::Launched, WR::Error),
    (WR::Running, WR::Error),
    (WR::Bound, WR::Stopped),
    (WR::Instantiated, WR::Stopped),
    (WR::Launched, WR::Stopped),
    (WR::Running, WR::Stopped),
    (WR::Registering, WR::ColdResume),
    (WR::Bound, WR::ColdResume),
    (WR::Instantiated, WR::ColdResume),
    (WR::Launched, WR::ColdResume),
    (WR::Running, WR::ColdResume),
    (WR::Registering, WR::HotResume),
    (WR::Bound, WR::HotResume),
    (WR::Instantiated, WR::HotResume),
    (WR::Launched, WR::HotResume),
    (WR::Running, WR::HotResume),
    (WR::ColdResume, WR::Terminated),
    (WR::HotResume, WR::Terminated),
];

const TASK_TRANSITIONS: &[(T, T)] = &[
    (T::Registering, T::Queued),
    (T::Queued, T::Instantiating),
    (T::AdjustingResources, T::Instantiating),
    (T::Instantiating, T::Launched),
    (T::Instantiating, T::Running),
    (T::Launched, T::Running),
    (T::Instantiating, T::Done),
    (T::Launched, T::Done),
    (T::Running, T::Done),
    (T::Instantiating, T::ErrorRecoverable),
    (T::Launched, T::ErrorRecoverable),
    (T::Running, T::ErrorRecoverable),
    (T::Instantiating, T::AdjustingResources),
    (T::Launched, T::AdjustingResources),
    (T::Running, T::AdjustingResources),
    (T::Instantiating, T::ErrorFatal),
    (T::Launched, T::ErrorFatal),
    (T::Running, T::ErrorFatal),
    (T::ErrorRecoverable, T::Queued),
    // client status reset
    (T::Queued, T::Registering),
    (T::Instantiating, T::Registering),
    (T::Launched, T::Registering),
    (T::Running, T::Registering),
    (T::Done, T::Registering),
    (T::ErrorRecoverable, T::Registering),
    (T::AdjustingResources, T::Registering),
    (T::ErrorFatal, T::Registering),
    // client marks a task DONE by hand
    (T::Registering, T::Done),
    (T::Queued, T::Done),
    (T::ErrorRecoverable, T::Done),
    (T::AdjustingResources, T::Done),
    (T::ErrorFatal, T::Done),
];

const TASK_INSTANCE_TRANSITIONS: &[(TI, TI)] = &[
    (TI::Queued, TI::Instantiated),
    (TI::Instantiated, TI::SubmittedToBatchDistributor),
    (TI::SubmittedToBatchDistributor, TI::Launched),
    (TI::Instantiated, TI::NoDistributorId),
    (TI::SubmittedToBatchDistributor, TI::NoDistributorId),
    (TI::Launched, TI::Running),
    (TI::Launched, TI::Triaging),
    (TI::Running, TI::Triaging),
    (TI::Launched, TI::Done),
    (TI::Running, TI::Done),
    (TI::Launched, TI::Error),
    (TI::Running, TI::Error),
    (TI::Triaging, TI::Error),
    (TI::Launched, TI::ResourceError),
    (TI::Running, TI::ResourceError),
    (TI::Triaging, TI::ResourceError),
    (TI::Launched, TI::UnknownError),
    (TI::Running, TI::UnknownError),
    (TI::Triaging, TI::UnknownError),
    (TI::Launched, TI::ErrorFatal),
    (TI::Running, TI::ErrorFatal),
    (TI::Triaging, TI::ErrorFatal),
    // worker acknowledges a kill request
    (TI::KillSelf, TI::ErrorFatal),
    (TI::Queued, TI::NoHeartbeat),
    (TI::Instantiated, TI::NoHeartbeat),
    (TI::SubmittedToBatchDistributor, TI::NoHeartbeat),
    (TI::Launched, TI::NoHeartbeat),
    (TI::Running, TI::NoHeartbeat),
    (TI::Triaging, TI::NoHeartbeat),
    (TI::Queued, TI::KillSelf),
    (TI::Instantiated, TI::KillSelf),
    (TI::SubmittedToBatchDistributor, TI::KillSelf),
    (TI::Launched, TI::KillSelf),
    (TI::Running, TI::KillSelf),
    (TI::Triaging, TI::KillSelf),
];

impl_status!(WorkflowStatus, EntityType::Workflow, WORKFLOW_TRANSITIONS);
impl_status!(WorkflowRunStatus, EntityType::WorkflowRun, WORKFLOW_RUN_TRANSITIONS);
impl_status!(TaskStatus, EntityType::Task, TASK_TRANSITIONS);
impl_status!(TaskInstanceStatus, EntityType::TaskInstance, TASK_INSTANCE_TRANSITIONS);

fn code_pairs<S: Status>() -> BTreeSet<(char, char)> {
    S::transitions()
        .iter()
        .map(|(from, to)| (from.code(), to.code()))
        .collect()
}

/// Legal `(from, to)` letter-code pairs for an entity type
pub fn legal_transitions(entity: EntityType) -> BTreeSet<(char, char)> {
    match entity {
        EntityType::Workflow => code_pairs::<WorkflowStatus>(),
        EntityType::WorkflowRun => code_pairs::<WorkflowRunStatus>(),
        EntityType::Task => code_pairs::<TaskStatus>(),
        EntityType::TaskInstance => code_pairs::<TaskInstanceStatus>(),
    }
}

fn terminal_by_code<S: Status>(code: char) -> Option<bool> {
    S::all()
        .iter()
        .find(|status| status.code() == code)
        .map(|status| status.is_terminal())
}

/// `None` when the code is not a status of the entity
pub fn is_terminal(entity: EntityType, code: char) -> Option<bool> {
    match entity {
        EntityType::Workflow => terminal_by_code::<WorkflowStatus>(code),
        EntityType::WorkflowRun => terminal_by_code::<WorkflowRunStatus>(code),
        EntityType::Task => terminal_by_code::<TaskStatus>(code),
        EntityType::TaskInstance => terminal_by_code::<TaskInstanceStatus>(code),
    }
}
