//! # Swarm
//!
//! The scheduling loop of one workflow run. Each [`Swarm::tick`] recomputes
//! everything from store reads (no fringe is cached between iterations), so a
//! restarted loop picks up exactly where the store says the run is:
//!
//! 1. mirror instance progress onto tasks (LAUNCHED, RUNNING)
//! 2. triage tasks whose latest instance finished
//! 3. finish the run when every task is DONE, or fail it when nothing can run
//! 4. queue the fringe and claim instances for it, within the concurrency
//!    limits, batched by template and resources
//!
//! The claim is the only way an instance comes into existence and it refuses
//! tasks that already have an active instance, so a restarted or duplicated
//! loop cannot launch a task twice.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::batcher::batch_tasks;
use super::binder::task_graph;
use super::distributor::Distributor;
use super::errors::{SwarmError, SwarmResult};
use super::triage::{Triage, TriageOutcome};
use super::SwarmContext;
use crate::backends::ClusterBackend;
use crate::dag::{compute_fringe, DagGraph};
use crate::database::LoopBackoff;
use crate::models::{Task, TaskInstance};
use crate::state_machine::{
    StateMachineError, TaskEvent, TaskInstanceStatus, TaskStatus, WorkflowEvent, WorkflowRunEvent,
    WorkflowRunStatus, WorkflowStatus,
};

/// What one scheduling iteration did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickSummary {
    pub dispatched: usize,
    pub triaged: usize,
    pub active_instances: usize,
    pub done: usize,
    pub fatal: usize,
    /// Dispatch is held because a task failed under fail-fast
    pub halted_dispatch: bool,
    /// Set once the run reached DONE or ERROR
    pub finished: Option<WorkflowRunStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmRunSummary {
    pub workflow_run_id: i64,
    pub workflow_id: i64,
    pub status: WorkflowRunStatus,
    pub workflow_status: WorkflowStatus,
    pub ticks: u64,
    pub tasks_done: usize,
    pub tasks_failed: usize,
    /// Instances claimed by this loop
    pub instances_launched: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct Swarm {
    ctx: SwarmContext,
    triage: Triage,
    workflow_run_id: i64,
    workflow_id: i64,
    graph: DagGraph<i64>,
    fail_fast: bool,
}

impl Swarm {
    /// Attach to a controlling run and load its DAG
    pub async fn attach(ctx: SwarmContext, workflow_run_id: i64) -> SwarmResult<Self> {
        let run = ctx.store.get_workflow_run(workflow_run_id).await?;
        if !run.status.is_controlling() || run.status == WorkflowRunStatus::Registering {
            return Err(SwarmError::NotSchedulable {
                workflow_run_id,
                status: run.status.to_string(),
            });
        }
        let workflow = ctx.store.get_workflow(run.workflow_id).await?;
        let tasks = ctx.store.list_tasks(workflow.workflow_id).await?;
        let edges = ctx.store.list_dag_edges(workflow.dag_id).await?;
        let graph = task_graph(&tasks, &edges)?;

        Ok(Self {
            triage: ctx.triage(),
            fail_fast: ctx.config.scheduler.fail_fast,
            ctx,
            workflow_run_id,
            workflow_id: workflow.workflow_id,
            graph,
        })
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn workflow_run_id(&self) -> i64 {
        self.workflow_run_id
    }

    pub fn workflow_id(&self) -> i64 {
        self.workflow_id
    }

    /// Move the run to RUNNING and the workflow with it
    pub async fn start(&self) -> SwarmResult<()> {
        let status = self.ctx.runs.advance_to_running(self.workflow_run_id).await?;
        if status != WorkflowRunStatus::Running {
            return Err(SwarmError::NotSchedulable {
                workflow_run_id: self.workflow_run_id,
                status: status.to_string(),
            });
        }
        for event in [
            WorkflowEvent::Instantiate,
            WorkflowEvent::Launch,
            WorkflowEvent::Run,
        ] {
            self.ctx
                .workflows
                .transition_if_legal(self.workflow_id, event)
                .await?;
        }
        info!(
            workflow_id = self.workflow_id,
            workflow_run_id = self.workflow_run_id,
            tasks = self.graph.len(),
            "Scheduling loop started"
        );
        Ok(())
    }

    /// Drive the run until it finishes, loses control or times out.
    ///
    /// The timeout is checked before every iteration; once it elapses the loop
    /// returns [`SwarmError::Timeout`] without writing anything further, and
    /// launched instances keep running.
    #[instrument(skip(self), fields(workflow_run_id = self.workflow_run_id))]
    pub async fn run(&self, timeout: Option<Duration>) -> SwarmResult<SwarmRunSummary> {
        let started = Instant::now();
        let scheduler = &self.ctx.config.scheduler;
        let heartbeat_interval = scheduler.heartbeat_interval();
        let poll_interval = scheduler.poll_interval();

        self.start().await?;
        let mut last_heartbeat = Instant::now();
        let mut ticks = 0u64;
        let mut instances_launched = 0;
        let mut backoff = LoopBackoff::new(self.ctx.config.retry.clone());

        loop {
            if let Some(limit) = timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    warn!(
                        workflow_run_id = self.workflow_run_id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Scheduling loop timed out; launched instances keep running"
                    );
                    return Err(SwarmError::Timeout {
                        workflow_run_id: self.workflow_run_id,
                        elapsed,
                    });
                }
            }

            let summary = match self.step(&mut last_heartbeat, heartbeat_interval).await {
                Ok(summary) => {
                    backoff.reset();
                    summary
                }
                Err(err) if err.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            workflow_run_id = self.workflow_run_id,
                            failures = backoff.failures(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient store error; retrying tick"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            };
            ticks += 1;
            instances_launched += summary.dispatched;
            if let Some(status) = summary.finished {
                let workflow = self.ctx.store.get_workflow(self.workflow_id).await?;
                return Ok(SwarmRunSummary {
                    workflow_run_id: self.workflow_run_id,
                    workflow_id: self.workflow_id,
                    status,
                    workflow_status: workflow.status,
                    ticks,
                    tasks_done: summary.done,
                    tasks_failed: summary.fatal,
                    instances_launched,
                    elapsed: started.elapsed(),
                });
            }

            self.ctx.notifier.wait(poll_interval).await;
        }
    }

    /// Heartbeat when due, then tick
    async fn step(
        &self,
        last_heartbeat: &mut Instant,
        heartbeat_interval: Duration,
    ) -> SwarmResult<TickSummary> {
        if last_heartbeat.elapsed() >= heartbeat_interval {
            self.heartbeat().await?;
            *last_heartbeat = Instant::now();
        }
        self.tick().await
    }

    /// Controller liveness ping; fails once the run was reaped or superseded
    pub async fn heartbeat(&self) -> SwarmResult<()> {
        if !self
            .ctx
            .runs
            .heartbeat(self.workflow_run_id, Utc::now())
            .await?
        {
            return Err(SwarmError::LostControl {
                workflow_run_id: self.workflow_run_id,
            });
        }
        Ok(())
    }

    /// One scheduling iteration
    pub async fn tick(&self) -> SwarmResult<TickSummary> {
        let run = self.ctx.store.get_workflow_run(self.workflow_run_id).await?;
        if !run.status.is_controlling() {
            return Err(SwarmError::LostControl {
                workflow_run_id: self.workflow_run_id,
            });
        }

        let store = &self.ctx.store;
        let mut summary = TickSummary::default();

        let latest: HashMap<i64, TaskInstance> = store
            .latest_task_instances(self.workflow_id)
            .await?
            .into_iter()
            .map(|instance| (instance.task_id, instance))
            .collect();

        for task in store.list_tasks(self.workflow_id).await? {
            let Some(instance) = latest.get(&task.task_id) else {
                continue;
            };
            if !task.status.is_in_flight() {
                continue;
            }
            if instance.status.is_active() {
                self.mirror_progress(&task, instance).await?;
            } else if self.triage.triage(&task, instance).await? != TriageOutcome::Skipped {
                summary.triaged += 1;
            }
        }

        let tasks = store.list_tasks(self.workflow_id).await?;
        for task in tasks
            .iter()
            .filter(|task| task.status == TaskStatus::ErrorRecoverable)
        {
            self.retry_stranded(task).await?;
        }
        let tasks = store.list_tasks(self.workflow_id).await?;

        let active: Vec<TaskInstance> = store
            .list_workflow_instances(self.workflow_id, TaskInstanceStatus::ACTIVE)
            .await?;
        let done: BTreeSet<i64> = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Done)
            .map(|task| task.task_id)
            .collect();
        let fatal: Vec<&Task> = tasks
            .iter()
            .filter(|task| task.status == TaskStatus::ErrorFatal)
            .collect();
        let in_flight = tasks.iter().filter(|task| task.status.is_in_flight()).count();
        summary.active_instances = active.len();
        summary.done = done.len();
        summary.fatal = fatal.len();
        let busy = in_flight > 0 || !active.is_empty();

        if done.len() == tasks.len() {
            self.finish(WorkflowRunEvent::Complete, WorkflowEvent::Complete)
                .await?;
            summary.finished = Some(WorkflowRunStatus::Done);
            return Ok(summary);
        }

        if self.fail_fast && self.has_fail_fast_trigger(&fatal, &latest) {
            summary.halted_dispatch = true;
            if !busy {
                self.finish(WorkflowRunEvent::Error, WorkflowEvent::Fail)
                    .await?;
                summary.finished = Some(WorkflowRunStatus::Error);
            }
            return Ok(summary);
        }

        let any_fatal = !fatal.is_empty();
        let fringe = compute_fringe(&self.graph, &done);
        let mut candidates: Vec<Task> = tasks
            .iter()
            .filter(|task| fringe.contains(&task.task_id) && task.status.is_schedulable())
            .cloned()
            .collect();

        if candidates.is_empty() {
            if !busy && any_fatal {
                self.finish(WorkflowRunEvent::Error, WorkflowEvent::Fail)
                    .await?;
                summary.finished = Some(WorkflowRunStatus::Error);
            }
            return Ok(summary);
        }

        for task in candidates
            .iter_mut()
            .filter(|task| task.status == TaskStatus::Registering)
        {
            task.status = self
                .ctx
                .tasks
                .transition(task.task_id, TaskEvent::Queue)
                .await?
                .status();
        }
        candidates.retain(|task| TaskStatus::CLAIMABLE.contains(&task.status));

        let selected = self.within_limits(candidates, &active).await?;
        summary.dispatched = self.claim(selected).await?;

        debug!(
            workflow_run_id = self.workflow_run_id,
            dispatched = summary.dispatched,
            triaged = summary.triaged,
            active = summary.active_instances,
            done = summary.done,
            "Scheduling tick"
        );
        Ok(summary)
    }

    /// A fatal task triggers fail-fast unless it died of resource errors
    fn has_fail_fast_trigger(
        &self,
        fatal: &[&Task],
        latest: &HashMap<i64, TaskInstance>,
    ) -> bool {
        fatal.iter().any(|task| {
            latest
                .get(&task.task_id)
                .map_or(true, |instance| instance.status != TaskInstanceStatus::ResourceError)
        })
    }

    async fn mirror_progress(&self, task: &Task, instance: &TaskInstance) -> SwarmResult<()> {
        use TaskInstanceStatus as S;
        let event = match (task.status, instance.status) {
            (TaskStatus::Instantiating, S::Launched | S::Triaging) => TaskEvent::Launch,
            (TaskStatus::Instantiating | TaskStatus::Launched, S::Running) => TaskEvent::Run,
            _ => return Ok(()),
        };
        self.ctx.tasks.transition(task.task_id, event).await?;
        Ok(())
    }

    /// A task left in ERROR_RECOVERABLE by an interrupted triage
    async fn retry_stranded(&self, task: &Task) -> SwarmResult<()> {
        match self.ctx.tasks.transition(task.task_id, TaskEvent::Retry).await {
            Ok(_) => Ok(()),
            Err(StateMachineError::GuardFailed { reason }) => {
                self.ctx
                    .tasks
                    .transition(task.task_id, TaskEvent::FatalError(reason))
                    .await
                    .map(|_| ())
                    .or_else(|err| match err {
                        StateMachineError::InvalidTransition { .. } => Ok(()),
                        other => Err(other.into()),
                    })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn within_limits(
        &self,
        candidates: Vec<Task>,
        active: &[TaskInstance],
    ) -> SwarmResult<Vec<Task>> {
        // re-read so limit changes apply on the next iteration
        let workflow = self.ctx.store.get_workflow(self.workflow_id).await?;
        let templates: HashMap<i64, i64> = self
            .ctx
            .store
            .list_tasks(self.workflow_id)
            .await?
            .into_iter()
            .map(|task| (task.task_id, task.task_template_version_id))
            .collect();

        let mut per_template: HashMap<i64, u32> = HashMap::new();
        for instance in active {
            if let Some(template) = templates.get(&instance.task_id) {
                *per_template.entry(*template).or_default() += 1;
            }
        }

        let mut available = workflow
            .max_concurrently_running
            .saturating_sub(active.len() as u32);
        let mut selected = Vec::new();
        for task in candidates {
            if available == 0 {
                break;
            }
            let running = per_template
                .entry(task.task_template_version_id)
                .or_default();
            if let Some(limit) = workflow.template_limit(task.task_template_version_id) {
                if *running >= limit {
                    continue;
                }
            }
            *running += 1;
            available -= 1;
            selected.push(task);
        }
        Ok(selected)
    }

    async fn claim(&self, selected: Vec<Task>) -> SwarmResult<usize> {
        if selected.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = selected.iter().map(|task| task.task_id).collect();
        let resources = self.ctx.store.latest_task_resources(&ids).await?;
        let by_id: HashMap<i64, &Task> = selected.iter().map(|task| (task.task_id, task)).collect();

        let mut claimed = 0;
        for batch in batch_tasks(
            self.workflow_run_id,
            &selected,
            &resources,
            self.ctx.config.scheduler.max_batch_size,
        ) {
            for task_id in &batch.task_ids {
                let Some(task) = by_id.get(task_id) else {
                    continue;
                };
                if self
                    .ctx
                    .tasks
                    .claim(task, self.workflow_run_id, batch.batch_key.clone())
                    .await?
                    .is_some()
                {
                    claimed += 1;
                }
            }
        }
        Ok(claimed)
    }

    async fn finish(
        &self,
        run_event: WorkflowRunEvent,
        workflow_event: WorkflowEvent,
    ) -> SwarmResult<()> {
        let outcome = self
            .ctx
            .runs
            .transition(self.workflow_run_id, run_event)
            .await?;
        if !outcome.is_applied() {
            return Err(SwarmError::LostControl {
                workflow_run_id: self.workflow_run_id,
            });
        }
        self.ctx
            .workflows
            .transition_if_legal(self.workflow_id, workflow_event)
            .await?;
        info!(
            workflow_id = self.workflow_id,
            workflow_run_id = self.workflow_run_id,
            status = %outcome.status(),
            "Workflow run finished"
        );
        Ok(())
    }
}

/// Run a workflow in this process: the scheduling loop in the foreground and
/// a distributor for the same workflow in a background task. A distributor
/// failure ends the scheduling loop with that error; the run stays controlling
/// and can be resumed, as after a timeout.
pub async fn run_workflow(
    ctx: SwarmContext,
    backend: Arc<dyn ClusterBackend>,
    workflow_run_id: i64,
    timeout: Option<Duration>,
) -> SwarmResult<SwarmRunSummary> {
    let swarm = Swarm::attach(ctx.clone(), workflow_run_id).await?;
    let distributor = Distributor::new(ctx, backend, swarm.workflow_id());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handle = tokio::spawn(async move { distributor.run(shutdown_rx).await });

    tokio::select! {
        result = swarm.run(timeout) => {
            // the receiver may already be gone if the distributor stopped with an error
            let _ = shutdown_tx.send(true);
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(
                    workflow_run_id = workflow_run_id,
                    error = %err,
                    "Distributor stopped with error"
                ),
                Err(err) => warn!(
                    workflow_run_id = workflow_run_id,
                    error = %err,
                    "Distributor task panicked"
                ),
            }
            result
        }
        joined = &mut handle => {
            let err = match joined {
                Ok(Ok(())) => {
                    SwarmError::DistributorStopped("exited before the run finished".into())
                }
                Ok(Err(err)) => err,
                Err(err) => SwarmError::DistributorStopped(err.to_string()),
            };
            error!(
                workflow_run_id = workflow_run_id,
                error = %err,
                "Distributor stopped; scheduling loop abandoned"
            );
            Err(err)
        }
    }
}
