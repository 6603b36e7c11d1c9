use std::time::Duration;

use thiserror::Error;

use crate::backends::BackendError;
use crate::dag::DagError;
use crate::database::StoreError;
use crate::resources::ResourceError;
use crate::state_machine::errors::StateMachineError;

/// Errors raised by the scheduling loop, the distributor and the reaper
#[derive(Debug, Error)]
pub enum SwarmError {
    /// The client-configured timeout elapsed; nothing was mutated after it did
    #[error("Workflow run {workflow_run_id} timed out after {elapsed:?}")]
    Timeout {
        workflow_run_id: i64,
        elapsed: Duration,
    },

    /// The run was reaped or superseded by a resume while this loop drove it
    #[error("Workflow run {workflow_run_id} is no longer the controlling run")]
    LostControl { workflow_run_id: i64 },

    #[error("Workflow run {workflow_run_id} is {status}, not schedulable")]
    NotSchedulable {
        workflow_run_id: i64,
        status: String,
    },

    /// The co-hosted distributor stopped before the run finished
    #[error("Distributor stopped: {0}")]
    DistributorStopped(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("State machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("DAG error: {0}")]
    Dag(#[from] DagError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),
}

impl SwarmError {
    /// Transient store failures; the agent loops back off and tick again
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) | Self::StateMachine(StateMachineError::Store(err)) => {
                err.is_retryable()
            }
            _ => false,
        }
    }
}

pub type SwarmResult<T> = Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_store_failures_are_retryable() {
        assert!(SwarmError::from(StoreError::LockContention("busy".into())).is_retryable());
        assert!(SwarmError::from(StateMachineError::Store(StoreError::ConnectionLost(
            "reset".into()
        )))
        .is_retryable());
        assert!(!SwarmError::from(StoreError::Conflict("dup".into())).is_retryable());
        assert!(!SwarmError::LostControl { workflow_run_id: 1 }.is_retryable());
        assert!(!SwarmError::DistributorStopped("gone".into()).is_retryable());
    }
}
