//! # Reaper
//!
//! Out-of-band liveness sweep. Every write is a compare-and-swap on status and
//! heartbeat age, so a sweep racing a live heartbeat loses and leaves the
//! entity alone.
//!
//! - Stale controlling runs go to ERROR, their workflow to HALTED and their
//!   active instances to NO_HEARTBEAT
//! - Stale REGISTERING runs (a bind that never finished) go to ABORTED
//! - Stale COLD_RESUME/HOT_RESUME runs (a resume that never finished) go to
//!   TERMINATED; the workflow is FAILED when no controlling run is left
//! - Active instances whose heartbeat went stale go to NO_HEARTBEAT and reach
//!   triage through the scheduling loop. That covers launched instances whose
//!   worker died as well as QUEUED / INSTANTIATED ones no distributor picked
//!   up. KILL_SELF is not active and is left to the distributor.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::errors::SwarmResult;
use super::SwarmContext;
use crate::constants::events;
use crate::database::with_retry;
use crate::logging::{log_instance_operation, log_workflow_operation};
use crate::models::{TaskInstance, WorkflowRun};
use crate::orchestration::notifier::StateChange;
use crate::state_machine::{
    EntityType, TaskInstanceEvent, TaskInstanceStatus, WorkflowEvent, WorkflowRunStatus,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub runs_reaped: usize,
    pub runs_aborted: usize,
    pub runs_terminated: usize,
    pub instances_reaped: usize,
    pub dry_run: bool,
}

impl SweepSummary {
    pub fn total(&self) -> usize {
        self.runs_reaped + self.runs_aborted + self.runs_terminated + self.instances_reaped
    }
}

#[derive(Debug, Clone)]
pub struct Reaper {
    ctx: SwarmContext,
}

impl Reaper {
    pub fn new(ctx: SwarmContext) -> Self {
        Self { ctx }
    }

    /// Sweep every `sweep_interval` until `shutdown` flips to true
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SwarmResult<()> {
        let interval = self.ctx.config.reaper.sweep_interval();
        info!(
            interval_seconds = interval.as_secs(),
            dry_run = self.ctx.config.reaper.dry_run,
            "Reaper started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let summary = self.sweep().await?;
            if summary.total() > 0 {
                info!(summary = ?summary, "Reaper sweep");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Reaper stopped");
        Ok(())
    }

    pub async fn sweep(&self) -> SwarmResult<SweepSummary> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SwarmResult<SweepSummary> {
        let config = &self.ctx.config.reaper;
        let mut summary = SweepSummary {
            dry_run: config.dry_run,
            ..Default::default()
        };

        let store = &self.ctx.store;
        let retry = &self.ctx.config.retry;

        let run_cutoff = now - chrono_from(config.workflow_run_timeout());
        let stale_runs = with_retry(retry, "find_stale_workflow_runs", || {
            store.find_stale_workflow_runs(run_cutoff, config.batch_size)
        })
        .await?;
        for run in stale_runs {
            self.reap_run(&run, run_cutoff, &mut summary).await?;
        }

        let instance_cutoff = now - chrono_from(config.heartbeat_timeout());
        let stale_instances = with_retry(retry, "find_stale_task_instances", || {
            store.find_stale_task_instances(
                TaskInstanceStatus::ACTIVE,
                instance_cutoff,
                config.batch_size,
            )
        })
        .await?;
        for instance in stale_instances {
            if self.reap_instance(&instance, instance_cutoff).await? {
                summary.instances_reaped += 1;
            }
        }

        Ok(summary)
    }

    async fn reap_run(
        &self,
        run: &WorkflowRun,
        cutoff: DateTime<Utc>,
        summary: &mut SweepSummary,
    ) -> SwarmResult<()> {
        use WorkflowRunStatus::*;
        let (from, to): (&[WorkflowRunStatus], WorkflowRunStatus) = match run.status {
            Registering => (&[Registering], Aborted),
            Bound | Instantiated | Launched | Running => {
                (&[Bound, Instantiated, Launched, Running], Error)
            }
            ColdResume | HotResume => (&[ColdResume, HotResume], Terminated),
            _ => return Ok(()),
        };

        if self.ctx.config.reaper.dry_run {
            info!(
                workflow_run_id = run.workflow_run_id,
                status = %run.status,
                target = %to,
                "Dry run: would reap workflow run"
            );
            count_run(summary, to);
            return Ok(());
        }

        if !self
            .ctx
            .store
            .reap_workflow_run_if_stale(run.workflow_run_id, from, to, cutoff)
            .await?
        {
            debug!(
                workflow_run_id = run.workflow_run_id,
                "Workflow run heartbeat refreshed before reap"
            );
            return Ok(());
        }
        count_run(summary, to);

        log_workflow_operation(
            "reap",
            Some(run.workflow_id),
            Some(run.workflow_run_id),
            to.name(),
            Some("no heartbeat"),
        );
        self.ctx.notifier.notify(StateChange::new(
            events::WORKFLOW_RUN_REAPED,
            EntityType::WorkflowRun,
            run.workflow_run_id,
            Some(run.workflow_id),
            run.status.code(),
            to.code(),
        ));

        match to {
            Error => {
                self.ctx
                    .workflows
                    .transition_if_legal(run.workflow_id, WorkflowEvent::Halt)
                    .await?;
                self.orphan_instances(run).await?;
            }
            Aborted => {
                self.ctx
                    .workflows
                    .transition_if_legal(run.workflow_id, WorkflowEvent::Abort)
                    .await?;
            }
            Terminated => {
                let runs = self.ctx.store.list_workflow_runs(run.workflow_id).await?;
                if !runs.iter().any(|other| other.status.is_controlling()) {
                    self.ctx
                        .workflows
                        .transition_if_legal(run.workflow_id, WorkflowEvent::Fail)
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Active instances of a reaped run have nobody left to triage them
    async fn orphan_instances(&self, run: &WorkflowRun) -> SwarmResult<()> {
        let active = self
            .ctx
            .store
            .list_workflow_instances(run.workflow_id, TaskInstanceStatus::ACTIVE)
            .await?;
        for instance in active
            .iter()
            .filter(|instance| instance.workflow_run_id == run.workflow_run_id)
        {
            match self
                .ctx
                .instances
                .transition(instance.task_instance_id, TaskInstanceEvent::NoHeartbeat)
                .await
            {
                Ok(outcome) if outcome.is_applied() => {
                    log_instance_operation(
                        "reap",
                        Some(instance.task_instance_id),
                        Some(instance.task_id),
                        instance.distributor_id.as_deref(),
                        TaskInstanceStatus::NoHeartbeat.name(),
                        Some("workflow run reaped"),
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(
                    task_instance_id = instance.task_instance_id,
                    error = %err,
                    "Could not orphan instance of reaped run"
                ),
            }
        }
        Ok(())
    }

    async fn reap_instance(
        &self,
        instance: &TaskInstance,
        cutoff: DateTime<Utc>,
    ) -> SwarmResult<bool> {
        if self.ctx.config.reaper.dry_run {
            info!(
                task_instance_id = instance.task_instance_id,
                status = %instance.status,
                heartbeat_at = %instance.heartbeat_at,
                "Dry run: would reap task instance"
            );
            return Ok(true);
        }

        if !self
            .ctx
            .store
            .reap_task_instance_if_stale(
                instance.task_instance_id,
                TaskInstanceStatus::ACTIVE,
                cutoff,
            )
            .await?
        {
            debug!(
                task_instance_id = instance.task_instance_id,
                "Instance moved on before reap"
            );
            return Ok(false);
        }

        log_instance_operation(
            "reap",
            Some(instance.task_instance_id),
            Some(instance.task_id),
            instance.distributor_id.as_deref(),
            TaskInstanceStatus::NoHeartbeat.name(),
            Some("no heartbeat"),
        );
        self.ctx.notifier.notify(StateChange::new(
            events::INSTANCE_REAPED,
            EntityType::TaskInstance,
            instance.task_instance_id,
            Some(instance.workflow_id),
            instance.status.code(),
            TaskInstanceStatus::NoHeartbeat.code(),
        ));
        Ok(true)
    }
}

fn count_run(summary: &mut SweepSummary, to: WorkflowRunStatus) {
    match to {
        WorkflowRunStatus::Aborted => summary.runs_aborted += 1,
        WorkflowRunStatus::Terminated => summary.runs_terminated += 1,
        _ => summary.runs_reaped += 1,
    }
}

fn chrono_from(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ScriptedBackend, ScriptedOutcome};
    use crate::config::SwarmConfig;
    use crate::database::{InMemoryStore, Store};
    use crate::orchestration::notifier::PollingNotifier;
    use crate::orchestration::{
        BindOptions, Binder, BoundWorkflow, Distributor, Swarm, SwarmError, TaskSpec, WorkflowSpec,
    };
    use crate::state_machine::WorkflowStatus;
    use std::sync::Arc;

    struct Running {
        store: Arc<InMemoryStore>,
        ctx: SwarmContext,
        swarm: Swarm,
        instance_id: i64,
    }

    /// A started run whose single task has a QUEUED instance nobody distributed
    async fn queued_workflow(dry_run: bool) -> (Running, BoundWorkflow) {
        let store = Arc::new(InMemoryStore::new());
        let mut config = SwarmConfig::default();
        config.scheduler.debounce_ms = 0;
        config.reaper.dry_run = dry_run;
        let ctx = SwarmContext::new(store.clone(), Arc::new(PollingNotifier), config);

        let spec = WorkflowSpec {
            tool_version_id: 1,
            name: "reaped".into(),
            tasks: vec![TaskSpec::new("long", 1, "sleep 3600")],
            ..Default::default()
        };
        let bound = Binder::new(ctx.clone())
            .bind(&spec, &BindOptions::default())
            .await
            .unwrap();
        let swarm = Swarm::attach(ctx.clone(), bound.workflow_run.workflow_run_id)
            .await
            .unwrap();
        swarm.start().await.unwrap();
        swarm.tick().await.unwrap();

        let instance_id = store
            .list_task_instances(bound.tasks[0].task_id)
            .await
            .unwrap()[0]
            .task_instance_id;
        let running = Running {
            store,
            ctx,
            swarm,
            instance_id,
        };
        (running, bound)
    }

    async fn running_workflow(dry_run: bool) -> Running {
        let (Running { store, ctx, swarm, .. }, bound) = queued_workflow(dry_run).await;

        let backend = Arc::new(ScriptedBackend::new());
        backend.script("long", [ScriptedOutcome::Succeed { polls: 1_000 }]);
        Distributor::new(ctx.clone(), backend, bound.workflow.workflow_id)
            .tick()
            .await
            .unwrap();

        let instance_id = store
            .list_task_instances(bound.tasks[0].task_id)
            .await
            .unwrap()[0]
            .task_instance_id;
        Running {
            store,
            ctx,
            swarm,
            instance_id,
        }
    }

    fn long_ago() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::days(1)
    }

    #[tokio::test]
    async fn test_stale_run_is_reaped_with_its_instances() {
        let running = running_workflow(false).await;
        let run_id = running.swarm.workflow_run_id();
        assert!(running.store.backdate_run_heartbeat(run_id, long_ago()));

        let summary = Reaper::new(running.ctx.clone()).sweep().await.unwrap();
        assert_eq!(summary.runs_reaped, 1);

        let run = running.store.get_workflow_run(run_id).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Error);
        let workflow = running
            .store
            .get_workflow(running.swarm.workflow_id())
            .await
            .unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Halted);
        let instance = running.store.get_task_instance(running.instance_id).await.unwrap();
        assert_eq!(instance.status, TaskInstanceStatus::NoHeartbeat);

        // the loop that lost its run notices on its next heartbeat
        let err = running.swarm.heartbeat().await.unwrap_err();
        assert!(matches!(err, SwarmError::LostControl { .. }));
    }

    #[tokio::test]
    async fn test_live_heartbeat_wins_over_sweep() {
        let running = running_workflow(false).await;
        let run_id = running.swarm.workflow_run_id();
        assert!(running.store.backdate_run_heartbeat(run_id, long_ago()));
        assert!(running
            .store
            .backdate_instance_heartbeat(running.instance_id, long_ago()));

        // the reaper read the stale rows; both heartbeats land before its writes
        let reaper = Reaper::new(running.ctx.clone());
        let cutoff = Utc::now() - ChronoDuration::minutes(5);
        let stale_run = running.store.get_workflow_run(run_id).await.unwrap();
        let stale_instance = running.store.get_task_instance(running.instance_id).await.unwrap();
        running.swarm.heartbeat().await.unwrap();
        assert!(running
            .ctx
            .instances
            .heartbeat(running.instance_id, Utc::now())
            .await
            .unwrap());

        let mut summary = SweepSummary::default();
        reaper.reap_run(&stale_run, cutoff, &mut summary).await.unwrap();
        assert!(!reaper.reap_instance(&stale_instance, cutoff).await.unwrap());
        assert_eq!(summary.total(), 0);

        let run = running.store.get_workflow_run(run_id).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Running);
        let instance = running.store.get_task_instance(running.instance_id).await.unwrap();
        assert_eq!(instance.status, TaskInstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_silent_worker_is_reaped_and_retried() {
        let running = running_workflow(false).await;
        assert!(running
            .store
            .backdate_instance_heartbeat(running.instance_id, long_ago()));

        let summary = Reaper::new(running.ctx.clone()).sweep().await.unwrap();
        assert_eq!(summary.instances_reaped, 1);
        assert_eq!(summary.runs_reaped, 0);

        let tick = running.swarm.tick().await.unwrap();
        assert_eq!(tick.triaged, 1);
        let instances = running
            .store
            .list_task_instances(
                running
                    .store
                    .get_task_instance(running.instance_id)
                    .await
                    .unwrap()
                    .task_id,
            )
            .await
            .unwrap();
        // reaped attempt plus the retry claimed in the same tick
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].status, TaskInstanceStatus::NoHeartbeat);
        assert_eq!(instances[1].status, TaskInstanceStatus::Queued);
    }

    #[tokio::test]
    async fn test_dry_run_reports_without_writing() {
        let running = running_workflow(true).await;
        let run_id = running.swarm.workflow_run_id();
        assert!(running.store.backdate_run_heartbeat(run_id, long_ago()));
        assert!(running
            .store
            .backdate_instance_heartbeat(running.instance_id, long_ago()));

        let summary = Reaper::new(running.ctx.clone()).sweep().await.unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.runs_reaped, 1);
        assert_eq!(summary.instances_reaped, 1);
        let run = running.store.get_workflow_run(run_id).await.unwrap();
        assert_eq!(run.status, WorkflowRunStatus::Running);
    }

    #[tokio::test]
    async fn test_undistributed_queued_instance_is_reaped_and_retried() {
        let (running, bound) = queued_workflow(false).await;
        let queued = running.store.get_task_instance(running.instance_id).await.unwrap();
        assert_eq!(queued.status, TaskInstanceStatus::Queued);
        assert!(running
            .store
            .backdate_instance_heartbeat(running.instance_id, long_ago()));

        let summary = Reaper::new(running.ctx.clone()).sweep().await.unwrap();
        assert_eq!(summary.instances_reaped, 1);
        assert_eq!(
            running.store.get_task_instance(running.instance_id).await.unwrap().status,
            TaskInstanceStatus::NoHeartbeat
        );

        let tick = running.swarm.tick().await.unwrap();
        assert_eq!(tick.triaged, 1);
        let instances = running
            .store
            .list_task_instances(bound.tasks[0].task_id)
            .await
            .unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[1].status, TaskInstanceStatus::Queued);
    }

    #[tokio::test]
    async fn test_kill_self_instance_is_left_to_the_distributor() {
        let running = running_workflow(false).await;
        running
            .ctx
            .instances
            .transition(running.instance_id, TaskInstanceEvent::KillSelf)
            .await
            .unwrap();
        assert!(running
            .store
            .backdate_instance_heartbeat(running.instance_id, long_ago()));

        let summary = Reaper::new(running.ctx.clone()).sweep().await.unwrap();
        assert_eq!(summary.instances_reaped, 0);
        assert_eq!(
            running.store.get_task_instance(running.instance_id).await.unwrap().status,
            TaskInstanceStatus::KillSelf
        );
    }
}
