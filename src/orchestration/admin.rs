//! Operator surface: resume, manual task status changes and concurrency limits.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::binder::{task_graph, Binder};
use super::swarm::{run_workflow, SwarmRunSummary};
use super::SwarmContext;
use crate::backends::ClusterBackend;
use crate::dag::downstream_closure;
use crate::error::{Result, TaskswarmError};
use crate::logging::{log_task_operation, log_workflow_operation};
use crate::models::Task;
use crate::state_machine::{
    StateMachineError, TaskEvent, TaskInstanceEvent, TaskInstanceStatus, TaskStatus, WorkflowEvent,
    WorkflowStatus,
};

/// Status an operator may put tasks into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatusTarget {
    /// Mark done; downstream tasks become runnable on the next tick
    Done,
    /// Reset the tasks and everything downstream for a rerun
    Registered,
}

impl std::str::FromStr for TaskStatusTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "D" | "DONE" => Ok(Self::Done),
            "G" | "REGISTERING" | "REGISTERED" => Ok(Self::Registered),
            other => Err(format!("Unsupported target status {other}; use DONE or REGISTERING")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Admin {
    ctx: SwarmContext,
}

impl Admin {
    pub fn new(ctx: SwarmContext) -> Self {
        Self { ctx }
    }

    /// Resume a workflow and drive it to completion in this process
    #[instrument(skip(self, backend))]
    pub async fn resume_workflow(
        &self,
        workflow_id: i64,
        reset_running_jobs: bool,
        timeout: Option<Duration>,
        backend: Arc<dyn ClusterBackend>,
        user: &str,
    ) -> Result<SwarmRunSummary> {
        let run = Binder::new(self.ctx.clone())
            .resume(workflow_id, reset_running_jobs, user)
            .await?;
        info!(
            workflow_id = workflow_id,
            workflow_run_id = run.workflow_run_id,
            resume_type = ?run.resume_type,
            "Workflow resumed"
        );
        Ok(run_workflow(self.ctx.clone(), backend, run.workflow_run_id, timeout).await?)
    }

    /// Force tasks into `target`; returns the resulting status of every task touched
    #[instrument(skip(self))]
    pub async fn set_task_status(
        &self,
        task_ids: &[i64],
        target: TaskStatusTarget,
    ) -> Result<Vec<(i64, TaskStatus)>> {
        if task_ids.is_empty() {
            return Err(TaskswarmError::Validation("no task ids given".to_string()));
        }
        let mut tasks = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            tasks.push(self.ctx.store.get_task(*task_id).await?);
        }
        let workflow_id = tasks[0].workflow_id;
        if tasks.iter().any(|task| task.workflow_id != workflow_id) {
            return Err(TaskswarmError::Validation(
                "tasks must belong to the same workflow".to_string(),
            ));
        }

        match target {
            TaskStatusTarget::Done => self.force_done(&tasks).await,
            TaskStatusTarget::Registered => self.reset(workflow_id, &tasks).await,
        }
    }

    async fn force_done(&self, tasks: &[Task]) -> Result<Vec<(i64, TaskStatus)>> {
        let mut updated = Vec::with_capacity(tasks.len());
        for task in tasks {
            let status = if task.status == TaskStatus::Done {
                TaskStatus::Done
            } else {
                self.ctx
                    .tasks
                    .transition(task.task_id, TaskEvent::ForceDone)
                    .await?
                    .status()
            };
            log_task_operation(
                "set_task_status",
                Some(task.task_id),
                Some(&task.name),
                status.name(),
                Some("operator"),
            );
            updated.push((task.task_id, status));
        }
        Ok(updated)
    }

    async fn reset(&self, workflow_id: i64, tasks: &[Task]) -> Result<Vec<(i64, TaskStatus)>> {
        let workflow = self.ctx.store.get_workflow(workflow_id).await?;
        let all_tasks = self.ctx.store.list_tasks(workflow_id).await?;
        let edges = self.ctx.store.list_dag_edges(workflow.dag_id).await?;
        let graph = task_graph(&all_tasks, &edges)?;
        let closure: BTreeSet<i64> =
            downstream_closure(&graph, tasks.iter().map(|task| task.task_id));

        let active = self
            .ctx
            .store
            .list_workflow_instances(workflow_id, TaskInstanceStatus::ACTIVE)
            .await?;
        for instance in active
            .iter()
            .filter(|instance| closure.contains(&instance.task_id))
        {
            if let Err(err) = self
                .ctx
                .instances
                .transition(instance.task_instance_id, TaskInstanceEvent::KillSelf)
                .await
            {
                warn!(
                    task_instance_id = instance.task_instance_id,
                    error = %err,
                    "Could not kill instance of reset task"
                );
            }
        }

        let by_id: HashMap<i64, &Task> = all_tasks.iter().map(|task| (task.task_id, task)).collect();
        let mut updated = Vec::with_capacity(closure.len());
        for task_id in closure {
            let status = match self.ctx.tasks.transition(task_id, TaskEvent::Reset).await {
                Ok(outcome) => outcome.status(),
                Err(StateMachineError::InvalidTransition { .. }) => TaskStatus::Registering,
                Err(err) => return Err(err.into()),
            };
            if let Some(task) = by_id.get(&task_id) {
                log_task_operation(
                    "set_task_status",
                    Some(task_id),
                    Some(&task.name),
                    status.name(),
                    Some("operator reset"),
                );
            }
            updated.push((task_id, status));
        }

        // a DONE workflow with unfinished tasks must become resumable again
        if workflow.status == WorkflowStatus::Done {
            self.ctx
                .workflows
                .transition_if_legal(workflow_id, WorkflowEvent::Fail)
                .await?;
        }
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn set_max_concurrently_running(&self, workflow_id: i64, limit: u32) -> Result<()> {
        if limit == 0 {
            return Err(TaskswarmError::Validation(
                "max_concurrently_running must be at least 1".to_string(),
            ));
        }
        self.ctx.store.set_workflow_concurrency(workflow_id, limit).await?;
        log_workflow_operation(
            "set_max_concurrently_running",
            Some(workflow_id),
            None,
            "updated",
            Some(&limit.to_string()),
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn set_template_concurrency(
        &self,
        workflow_id: i64,
        task_template_version_id: i64,
        limit: u32,
    ) -> Result<()> {
        if limit == 0 {
            return Err(TaskswarmError::Validation(
                "template concurrency must be at least 1".to_string(),
            ));
        }
        self.ctx
            .store
            .set_template_concurrency(workflow_id, task_template_version_id, limit)
            .await?;
        log_workflow_operation(
            "set_template_concurrency",
            Some(workflow_id),
            None,
            "updated",
            Some(&format!("template {task_template_version_id} -> {limit}")),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{DummyBackend, ScriptedBackend, ScriptedOutcome};
    use crate::config::SwarmConfig;
    use crate::database::{InMemoryStore, Store};
    use crate::orchestration::notifier::PollingNotifier;
    use crate::orchestration::{BindOptions, BoundWorkflow, TaskSpec, WorkflowSpec};
    use crate::state_machine::WorkflowRunStatus;

    fn context() -> (Arc<InMemoryStore>, SwarmContext) {
        let store = Arc::new(InMemoryStore::new());
        let mut config = SwarmConfig::default();
        config.scheduler.debounce_ms = 0;
        config.scheduler.poll_interval_ms = 5;
        config.distributor.poll_interval_ms = 5;
        let ctx = SwarmContext::new(store.clone(), Arc::new(PollingNotifier), config);
        (store, ctx)
    }

    fn chain() -> WorkflowSpec {
        WorkflowSpec {
            tool_version_id: 1,
            name: "admin".into(),
            tasks: vec![
                TaskSpec::new("a", 1, "echo a").with_node_arg("step", "a"),
                TaskSpec::new("b", 1, "echo b")
                    .with_node_arg("step", "b")
                    .with_upstream("a"),
                TaskSpec::new("c", 1, "echo c")
                    .with_node_arg("step", "c")
                    .with_upstream("b"),
            ],
            ..Default::default()
        }
    }

    async fn bind(ctx: &SwarmContext) -> BoundWorkflow {
        Binder::new(ctx.clone())
            .bind(&chain(), &BindOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_force_done_unblocks_downstream() {
        let (store, ctx) = context();
        let bound = bind(&ctx).await;
        let admin = Admin::new(ctx);

        let updated = admin
            .set_task_status(&[bound.tasks[0].task_id], TaskStatusTarget::Done)
            .await
            .unwrap();
        assert_eq!(updated, vec![(bound.tasks[0].task_id, TaskStatus::Done)]);
        assert_eq!(
            store.get_task(bound.tasks[0].task_id).await.unwrap().status,
            TaskStatus::Done
        );
    }

    #[tokio::test]
    async fn test_reset_of_done_workflow_resets_downstream_and_reopens() {
        let (store, ctx) = context();
        let bound = bind(&ctx).await;
        let summary = run_workflow(
            ctx.clone(),
            Arc::new(DummyBackend),
            bound.workflow_run.workflow_run_id,
            Some(Duration::from_secs(10)),
        )
        .await
        .unwrap();
        assert_eq!(summary.status, WorkflowRunStatus::Done);

        let admin = Admin::new(ctx);
        let updated = admin
            .set_task_status(&[bound.tasks[1].task_id], TaskStatusTarget::Registered)
            .await
            .unwrap();
        let reset: BTreeSet<i64> = updated.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            reset,
            BTreeSet::from([bound.tasks[1].task_id, bound.tasks[2].task_id])
        );
        assert_eq!(
            store.get_task(bound.tasks[0].task_id).await.unwrap().status,
            TaskStatus::Done
        );
        let workflow = store.get_workflow(bound.workflow.workflow_id).await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Failed);
    }

    #[tokio::test]
    async fn test_resume_after_failure_reruns_only_failed_tasks() {
        let (store, ctx) = context();
        let spec = WorkflowSpec {
            tasks: chain()
                .tasks
                .into_iter()
                .map(|task| task.with_max_attempts(1))
                .collect(),
            ..chain()
        };
        let bound = Binder::new(ctx.clone())
            .bind(&spec, &BindOptions::default())
            .await
            .unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("b", [ScriptedOutcome::fail(1)]);

        let first = run_workflow(
            ctx.clone(),
            backend.clone(),
            bound.workflow_run.workflow_run_id,
            Some(Duration::from_secs(10)),
        )
        .await
        .unwrap();
        assert_eq!(first.status, WorkflowRunStatus::Error);
        assert_eq!(first.workflow_status, WorkflowStatus::Failed);

        let resumed = Admin::new(ctx)
            .resume_workflow(
                bound.workflow.workflow_id,
                false,
                Some(Duration::from_secs(10)),
                backend.clone(),
                "operator",
            )
            .await
            .unwrap();
        assert_eq!(resumed.status, WorkflowRunStatus::Done);
        assert_eq!(resumed.workflow_status, WorkflowStatus::Done);
        assert_eq!(backend.submitted_count("a"), 1);
        assert_eq!(backend.submitted_count("b"), 2);
        assert_eq!(backend.submitted_count("c"), 1);
        assert!(store
            .list_tasks(bound.workflow.workflow_id)
            .await
            .unwrap()
            .iter()
            .all(|task| task.status == TaskStatus::Done));
    }

    #[tokio::test]
    async fn test_concurrency_limits() {
        let (store, ctx) = context();
        let bound = bind(&ctx).await;
        let admin = Admin::new(ctx);
        let workflow_id = bound.workflow.workflow_id;

        admin.set_max_concurrently_running(workflow_id, 2).await.unwrap();
        admin.set_template_concurrency(workflow_id, 1, 1).await.unwrap();
        let workflow = store.get_workflow(workflow_id).await.unwrap();
        assert_eq!(workflow.max_concurrently_running, 2);
        assert_eq!(workflow.template_limit(1), Some(1));

        let err = admin.set_max_concurrently_running(workflow_id, 0).await.unwrap_err();
        assert!(matches!(err, TaskswarmError::Validation(_)));
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("done".parse::<TaskStatusTarget>(), Ok(TaskStatusTarget::Done));
        assert_eq!("G".parse::<TaskStatusTarget>(), Ok(TaskStatusTarget::Registered));
        assert!("running".parse::<TaskStatusTarget>().is_err());
    }
}
