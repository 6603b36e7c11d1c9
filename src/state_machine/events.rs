use serde::{Deserialize, Serialize};

/// Events that can trigger task state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskEvent {
    /// Task is on the fringe and eligible for dispatch
    Queue,
    /// An instance was claimed for the task
    Claim,
    /// The current instance was launched by the distributor
    Launch,
    /// The current instance reported RUNNING
    Run,
    Complete,
    /// Failed with attempts remaining; a retry with identical resources follows
    RecoverableError,
    /// Killed for resources with attempts remaining; scaled resources follow
    AdjustResources,
    /// No attempts remain, or the failure cannot be retried
    FatalError(String),
    /// Leave ERROR_RECOVERABLE for another attempt
    Retry,
    /// Client reset back to REGISTERING
    Reset,
    /// Client marked the task DONE
    ForceDone,
}

impl TaskEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Claim => "claim",
            Self::Launch => "launch",
            Self::Run => "run",
            Self::Complete => "complete",
            Self::RecoverableError => "recoverable_error",
            Self::AdjustResources => "adjust_resources",
            Self::FatalError(_) => "fatal_error",
            Self::Retry => "retry",
            Self::Reset => "reset",
            Self::ForceDone => "force_done",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::FatalError(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that can trigger task instance state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TaskInstanceEvent {
    /// The distributor picked the queued instance up
    Instantiate,
    /// Handed to the backend as part of an array submission
    Submit,
    Launch { distributor_id: String },
    /// The backend never returned an id for the instance
    NoDistributorId { reason: String },
    Run { nodename: Option<String> },
    BeginTriage,
    Complete,
    Error {
        exit_code: Option<i32>,
        error_log: Option<String>,
    },
    ResourceError {
        exceeded: Vec<String>,
        error_log: Option<String>,
    },
    UnknownError { error_log: Option<String> },
    FatalError { error_log: Option<String> },
    NoHeartbeat,
    KillSelf,
}

impl TaskInstanceEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Instantiate => "instantiate",
            Self::Submit => "submit",
            Self::Launch { .. } => "launch",
            Self::NoDistributorId { .. } => "no_distributor_id",
            Self::Run { .. } => "run",
            Self::BeginTriage => "begin_triage",
            Self::Complete => "complete",
            Self::Error { .. } => "error",
            Self::ResourceError { .. } => "resource_error",
            Self::UnknownError { .. } => "unknown_error",
            Self::FatalError { .. } => "fatal_error",
            Self::NoHeartbeat => "no_heartbeat",
            Self::KillSelf => "kill_self",
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::Instantiate | Self::Submit | Self::Launch { .. } | Self::Run { .. } | Self::BeginTriage
        )
    }
}

/// Events that can trigger workflow state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    Queue,
    Abort,
    Instantiate,
    Launch,
    Run,
    Complete,
    Fail,
    Halt,
    Resume,
}

/// Events that can trigger workflow run state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunEvent {
    Bind,
    Abort,
    Instantiate,
    Launch,
    Run,
    Complete,
    Error,
    Stop,
    ColdResume,
    HotResume,
    Terminate,
}
