//! Status enums for the four stateful entities.
//!
//! Every status carries a stable single-letter code. The code is what the
//! store persists and what serde emits, so external monitoring that reads the
//! status columns keeps working regardless of the Rust variant names.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $( $(#[$vmeta:meta])* $variant:ident => ($code:literal, $display:literal) ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $code)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Persisted single-letter code
            pub fn code(&self) -> char {
                match self {
                    $( Self::$variant => status_code_char($code) ),+
                }
            }

            pub fn as_code_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $code ),+
                }
            }

            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $( $code => Some(Self::$variant), )+
                    _ => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $( Self::$variant => $display ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            /// Accepts either the letter code or the upper-case name
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if let Some(status) = Self::from_code(s) {
                    return Ok(status);
                }
                match s.to_ascii_uppercase().as_str() {
                    $( $display => Ok(Self::$variant), )+
                    _ => Err(format!("Invalid {} status: {s}", $label)),
                }
            }
        }
    };
}

const fn status_code_char(code: &str) -> char {
    code.as_bytes()[0] as char
}

status_enum! {
    /// Workflow status
    WorkflowStatus, "workflow" {
        /// Being bound by a client
        Registering => ("G", "REGISTERING"),
        /// Bound and waiting for a scheduling loop
        Queued => ("Q", "QUEUED"),
        /// Bind never completed
        Aborted => ("A", "ABORTED"),
        Instantiating => ("I", "INSTANTIATING"),
        Launched => ("O", "LAUNCHED"),
        Running => ("R", "RUNNING"),
        Done => ("D", "DONE"),
        /// At least one task exhausted its attempts; resumable
        Failed => ("F", "FAILED"),
        /// Controller lost (no heartbeat); resumable
        Halted => ("H", "HALTED"),
    }
}

impl WorkflowStatus {
    /// No agent advances the workflow further until a client resumes it
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Halted | Self::Aborted)
    }

    pub fn is_resumable(&self) -> bool {
        !matches!(self, Self::Done | Self::Registering)
    }
}

status_enum! {
    /// Workflow run status
    WorkflowRunStatus, "workflow run" {
        Registering => ("G", "REGISTERING"),
        Bound => ("B", "BOUND"),
        Instantiated => ("I", "INSTANTIATED"),
        Launched => ("O", "LAUNCHED"),
        Running => ("R", "RUNNING"),
        /// Superseded by a cold resume; its instances are being killed
        ColdResume => ("C", "COLD_RESUME"),
        /// Superseded by a hot resume; its instances keep running
        HotResume => ("H", "HOT_RESUME"),
        Done => ("D", "DONE"),
        Error => ("E", "ERROR"),
        Stopped => ("S", "STOPPED"),
        Terminated => ("T", "TERMINATED"),
        Aborted => ("A", "ABORTED"),
    }
}

impl WorkflowRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Error | Self::Stopped | Self::Terminated | Self::Aborted
        )
    }

    /// Non-terminal and not superseded by a resume. At most one run per workflow is here.
    pub fn is_controlling(&self) -> bool {
        matches!(
            self,
            Self::Registering | Self::Bound | Self::Instantiated | Self::Launched | Self::Running
        )
    }

    pub const CONTROLLING: &'static [WorkflowRunStatus] = &[
        Self::Registering,
        Self::Bound,
        Self::Instantiated,
        Self::Launched,
        Self::Running,
    ];
}

status_enum! {
    /// Task status
    TaskStatus, "task" {
        Registering => ("G", "REGISTERING"),
        Queued => ("Q", "QUEUED"),
        /// An instance has been claimed for the task
        Instantiating => ("I", "INSTANTIATING"),
        Launched => ("O", "LAUNCHED"),
        Running => ("R", "RUNNING"),
        Done => ("D", "DONE"),
        ErrorRecoverable => ("E", "ERROR_RECOVERABLE"),
        AdjustingResources => ("A", "ADJUSTING_RESOURCES"),
        ErrorFatal => ("F", "ERROR_FATAL"),
    }
}

impl TaskStatus {
    /// Terminal for the current workflow run; ERROR_FATAL is resumable in a later run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::ErrorFatal)
    }

    /// Statuses from which a new instance may be claimed
    pub const CLAIMABLE: &'static [TaskStatus] = &[Self::Queued, Self::AdjustingResources];

    /// Statuses where an instance exists and its outcome is awaited
    pub const IN_FLIGHT: &'static [TaskStatus] =
        &[Self::Instantiating, Self::Launched, Self::Running];

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    pub fn is_schedulable(&self) -> bool {
        matches!(
            self,
            Self::Registering | Self::Queued | Self::AdjustingResources
        )
    }
}

status_enum! {
    /// Task instance status
    TaskInstanceStatus, "task instance" {
        Queued => ("Q", "QUEUED"),
        SubmittedToBatchDistributor => ("B", "SUBMITTED_TO_BATCH_DISTRIBUTOR"),
        Instantiated => ("I", "INSTANTIATED"),
        Launched => ("O", "LAUNCHED"),
        Running => ("R", "RUNNING"),
        Triaging => ("T", "TRIAGING"),
        Done => ("D", "DONE"),
        /// Application error: non-zero exit with no resource signal
        Error => ("E", "ERROR"),
        ErrorFatal => ("F", "ERROR_FATAL"),
        /// Killed by the cluster resource limiter
        ResourceError => ("Z", "RESOURCE_ERROR"),
        NoDistributorId => ("W", "NO_DISTRIBUTOR_ID"),
        NoHeartbeat => ("H", "NO_HEARTBEAT"),
        UnknownError => ("U", "UNKNOWN_ERROR"),
        /// Asked to self-terminate by a cold resume or a status reset
        KillSelf => ("K", "KILL_SELF"),
    }
}

impl TaskInstanceStatus {
    /// KILL_SELF counts as terminal: the instance no longer belongs to any live attempt
    pub fn is_terminal(&self) -> bool {
        !Self::ACTIVE.contains(self)
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub const ACTIVE: &'static [TaskInstanceStatus] = &[
        Self::Queued,
        Self::SubmittedToBatchDistributor,
        Self::Instantiated,
        Self::Launched,
        Self::Running,
        Self::Triaging,
    ];

    /// Statuses that exist on the backend and are polled for progress
    pub const HEARTBEATING: &'static [TaskInstanceStatus] =
        &[Self::Launched, Self::Running, Self::Triaging];
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        Self::Registering
    }
}

impl Default for WorkflowRunStatus {
    fn default() -> Self {
        Self::Registering
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Registering
    }
}

impl Default for TaskInstanceStatus {
    fn default() -> Self {
        Self::Queued
    }
}
