//! Error types for the orchestration engine.
//!
//! Each layer owns a narrow error enum (`StoreError`, `StateMachineError`,
//! `DagError`, `ResourceError`, `ConfigurationError`, `SwarmError`); they all convert into
//! [`TaskswarmError`], which is what public entry points return.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::dag::DagError;
use crate::database::StoreError;
use crate::orchestration::errors::SwarmError;
use crate::resources::ResourceError;
use crate::state_machine::errors::StateMachineError;

#[derive(Debug, Error)]
pub enum TaskswarmError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Scheduling error: {0}")]
    Swarm(#[from] SwarmError),

    /// A non-DONE workflow with this identity already exists and `resume` was not requested
    #[error("Workflow {workflow_id} already exists with status {status}; pass resume=true to resume it")]
    WorkflowAlreadyExists { workflow_id: i64, status: String },

    #[error("Workflow {workflow_id} is already DONE")]
    WorkflowAlreadyComplete { workflow_id: i64 },

    #[error("Invalid resume of workflow {workflow_id}: {reason}")]
    InvalidResume { workflow_id: i64, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TaskswarmError {
    /// Structural errors are rejected at the API boundary and never partially applied
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Dag(_)
                | Self::Resource(_)
                | Self::WorkflowAlreadyExists { .. }
                | Self::WorkflowAlreadyComplete { .. }
                | Self::InvalidResume { .. }
                | Self::Validation(_)
                | Self::StateMachine(StateMachineError::InvalidTransition { .. })
        )
    }
}

impl From<serde_json::Error> for TaskswarmError {
    fn from(error: serde_json::Error) -> Self {
        TaskswarmError::Validation(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for TaskswarmError {
    fn from(err: sqlx::Error) -> Self {
        TaskswarmError::Store(StoreError::from(err))
    }
}

pub type Result<T> = std::result::Result<T, TaskswarmError>;
