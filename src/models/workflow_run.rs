use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::state_machine::WorkflowRunStatus;

/// How a resume treats instances still running under the superseded run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeType {
    /// Ask running instances to KILL_SELF and reset their tasks
    Cold,
    /// Leave running instances alone; only the controller changes
    Hot,
}

impl fmt::Display for ResumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cold => write!(f, "cold"),
            Self::Hot => write!(f, "hot"),
        }
    }
}

impl std::str::FromStr for ResumeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cold" => Ok(Self::Cold),
            "hot" => Ok(Self::Hot),
            _ => Err(format!("Invalid resume type: {s}")),
        }
    }
}

/// WorkflowRun is one attempt at executing a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub workflow_run_id: i64,
    pub workflow_id: i64,
    pub user: String,
    pub status: WorkflowRunStatus,
    /// Set when this run was created by a resume
    pub resume_type: Option<ResumeType>,
    pub heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status_date: DateTime<Utc>,
}

/// New WorkflowRun for creation; always starts in REGISTERING
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWorkflowRun {
    pub workflow_id: i64,
    pub user: String,
    pub resume_type: Option<ResumeType>,
}
