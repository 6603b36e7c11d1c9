use thiserror::Error;

use super::registry::EntityType;
use crate::database::StoreError;

/// Error types for state machine operations
#[derive(Error, Debug)]
pub enum StateMachineError {
    #[error("Guard condition failed: {reason}")]
    GuardFailed { reason: String },

    #[error("Invalid {entity} transition from {from} on {event}")]
    InvalidTransition {
        entity: EntityType,
        from: String,
        event: String,
    },

    #[error("Task {task_id} already has active instance {task_instance_id}")]
    ActiveInstanceExists { task_id: i64, task_instance_id: i64 },

    #[error("Persistence operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specific error type for guard condition failures
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Dependencies not satisfied: {reason}")]
    DependenciesNotMet { reason: String },

    #[error("Business rule violation: {rule}")]
    BusinessRuleViolation { rule: String },

    #[error("Task {task_id} already has active instance {task_instance_id}")]
    ActiveInstance { task_id: i64, task_instance_id: i64 },

    #[error("Store query failed: {0}")]
    Store(#[from] StoreError),
}

impl From<GuardError> for StateMachineError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::ActiveInstance {
                task_id,
                task_instance_id,
            } => Self::ActiveInstanceExists {
                task_id,
                task_instance_id,
            },
            GuardError::Store(store) => Self::Store(store),
            other => Self::GuardFailed {
                reason: other.to_string(),
            },
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
pub type GuardResult<T> = Result<T, GuardError>;

pub fn dependencies_not_met(reason: impl Into<String>) -> GuardError {
    GuardError::DependenciesNotMet {
        reason: reason.into(),
    }
}

pub fn business_rule_violation(rule: impl Into<String>) -> GuardError {
    GuardError::BusinessRuleViolation { rule: rule.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_error_conversion() {
        let err: StateMachineError = GuardError::ActiveInstance {
            task_id: 1,
            task_instance_id: 9,
        }
        .into();
        assert!(matches!(
            err,
            StateMachineError::ActiveInstanceExists { task_id: 1, task_instance_id: 9 }
        ));

        let err: StateMachineError = dependencies_not_met("upstream 3 not DONE").into();
        assert!(err.to_string().contains("upstream 3 not DONE"));
    }
}
