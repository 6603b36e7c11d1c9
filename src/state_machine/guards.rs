use async_trait::async_trait;

use super::errors::{business_rule_violation, GuardError, GuardResult};
use crate::database::Store;
use crate::models::Task;

/// Trait for implementing state transition guards
#[async_trait]
pub trait StateGuard<T>: Send + Sync {
    /// Check if a transition is allowed
    async fn check(&self, entity: &T, store: &dyn Store) -> GuardResult<()>;

    /// Get a description of this guard for logging
    fn description(&self) -> &'static str;
}

/// A retry may only be scheduled while attempts remain
pub struct AttemptsRemainingGuard;

#[async_trait]
impl StateGuard<Task> for AttemptsRemainingGuard {
    async fn check(&self, task: &Task, _store: &dyn Store) -> GuardResult<()> {
        if task.has_attempts_remaining() {
            Ok(())
        } else {
            Err(business_rule_violation(format!(
                "Task {} used {}/{} attempts",
                task.task_id, task.num_attempts, task.max_attempts
            )))
        }
    }

    fn description(&self) -> &'static str {
        "Task must have attempts remaining"
    }
}

/// Status overrides (reset, force-done) must not bypass a live instance
pub struct NoActiveInstanceGuard;

#[async_trait]
impl StateGuard<Task> for NoActiveInstanceGuard {
    async fn check(&self, task: &Task, store: &dyn Store) -> GuardResult<()> {
        let instances = store.list_task_instances(task.task_id).await?;
        match instances.iter().find(|instance| instance.status.is_active()) {
            Some(active) => Err(GuardError::ActiveInstance {
                task_id: task.task_id,
                task_instance_id: active.task_instance_id,
            }),
            None => Ok(()),
        }
    }

    fn description(&self) -> &'static str {
        "Task must have no active instance"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryStore;
    use crate::state_machine::TaskStatus;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn task(num_attempts: u32, max_attempts: u32) -> Task {
        Task {
            task_id: 1,
            workflow_id: 1,
            node_id: 1,
            task_hash: "h".into(),
            name: "t".into(),
            command: "true".into(),
            task_template_version_id: 1,
            status: TaskStatus::ErrorRecoverable,
            max_attempts,
            num_attempts,
            resource_scales: BTreeMap::new(),
            fallback_queues: vec![],
            status_date: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_attempts_remaining_guard() {
        let store = InMemoryStore::new();
        assert!(AttemptsRemainingGuard.check(&task(1, 3), &store).await.is_ok());
        let err = AttemptsRemainingGuard
            .check(&task(3, 3), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::BusinessRuleViolation { .. }));
    }

    #[tokio::test]
    async fn test_no_active_instance_guard_without_instances() {
        let store = InMemoryStore::new();
        assert!(NoActiveInstanceGuard.check(&task(0, 1), &store).await.is_ok());
        assert_eq!(
            NoActiveInstanceGuard.description(),
            "Task must have no active instance"
        );
    }
}
