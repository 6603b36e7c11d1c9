//! # Distributor
//!
//! Bridges claimed instances and a [`ClusterBackend`]. Each tick:
//!
//! 1. submits QUEUED instances as array batches once their debounce window
//!    closed (or the batch is full)
//! 2. terminates KILL_SELF instances that reached the backend
//! 3. polls launched instances and writes their backend state back
//!
//! The backend's report maps onto instance events one to one; a resource
//! kill stays distinct from an application failure all the way to triage.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::errors::SwarmResult;
use super::SwarmContext;
use crate::backends::{BackendJobState, ClusterBackend, JobReport, JobSpec, SubmissionBatch};
use crate::database::LoopBackoff;
use crate::logging::log_error;
use crate::models::{Task, TaskInstance};
use crate::state_machine::{StateMachineError, TaskInstanceEvent, TaskInstanceStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributorTickSummary {
    pub batches_submitted: usize,
    pub launched: usize,
    pub without_distributor_id: usize,
    pub polled: usize,
    pub finished: usize,
    pub terminated: usize,
}

#[derive(Debug)]
pub struct Distributor {
    ctx: SwarmContext,
    backend: Arc<dyn ClusterBackend>,
    workflow_id: i64,
    /// Distributor ids already asked to terminate
    terminated: Mutex<HashSet<String>>,
}

impl Distributor {
    pub fn new(ctx: SwarmContext, backend: Arc<dyn ClusterBackend>, workflow_id: i64) -> Self {
        Self {
            ctx,
            backend,
            workflow_id,
            terminated: Mutex::new(HashSet::new()),
        }
    }

    /// Tick until `shutdown` flips to true
    #[instrument(skip(self, shutdown), fields(workflow_id = self.workflow_id, backend = self.backend.name()))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SwarmResult<()> {
        let poll_interval = self.ctx.config.distributor.poll_interval();
        let mut backoff = LoopBackoff::new(self.ctx.config.retry.clone());
        info!(workflow_id = self.workflow_id, "Distributor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = match self.tick().await {
                Ok(_) => {
                    backoff.reset();
                    poll_interval
                }
                Err(err) if err.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            workflow_id = self.workflow_id,
                            failures = backoff.failures(),
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Transient store error; retrying distributor tick"
                        );
                        delay
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            };
            tokio::select! {
                _ = self.ctx.notifier.wait(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(workflow_id = self.workflow_id, "Distributor stopped");
        Ok(())
    }

    pub async fn tick(&self) -> SwarmResult<DistributorTickSummary> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> SwarmResult<DistributorTickSummary> {
        let mut summary = DistributorTickSummary::default();
        let tasks: HashMap<i64, Task> = self
            .ctx
            .store
            .list_tasks(self.workflow_id)
            .await?
            .into_iter()
            .map(|task| (task.task_id, task))
            .collect();

        self.submit_ready(now, &tasks, &mut summary).await?;
        self.terminate_killed(&mut summary).await?;
        self.poll_launched(now, &mut summary).await?;

        if summary != DistributorTickSummary::default() {
            debug!(workflow_id = self.workflow_id, summary = ?summary, "Distributor tick");
        }
        Ok(summary)
    }

    async fn submit_ready(
        &self,
        now: DateTime<Utc>,
        tasks: &HashMap<i64, Task>,
        summary: &mut DistributorTickSummary,
    ) -> SwarmResult<()> {
        let queued = self
            .ctx
            .store
            .list_workflow_instances(self.workflow_id, &[TaskInstanceStatus::Queued])
            .await?;
        if queued.is_empty() {
            return Ok(());
        }

        let max_batch_size = self.ctx.config.scheduler.max_batch_size.max(1);
        let debounce = ChronoDuration::milliseconds(
            i64::try_from(self.ctx.config.scheduler.debounce_ms).unwrap_or(i64::MAX),
        );

        let mut groups: BTreeMap<String, Vec<TaskInstance>> = BTreeMap::new();
        for instance in queued {
            groups
                .entry(instance.batch_key.clone())
                .or_default()
                .push(instance);
        }

        for (batch_key, mut instances) in groups {
            let newest = instances
                .iter()
                .map(|instance| instance.created_at)
                .max()
                .unwrap_or(now);
            if instances.len() < max_batch_size && newest + debounce > now {
                self.refresh_held(&instances, now).await?;
                continue;
            }
            instances.sort_by_key(|instance| instance.task_instance_id);
            for chunk in instances.chunks(max_batch_size) {
                self.submit_chunk(&batch_key, chunk, tasks, summary).await?;
            }
        }
        Ok(())
    }

    /// Heartbeat QUEUED instances held back by the debounce window, so the
    /// reaper only sees queued work nobody is distributing
    async fn refresh_held(&self, held: &[TaskInstance], now: DateTime<Utc>) -> SwarmResult<()> {
        let interval = ChronoDuration::from_std(self.ctx.config.distributor.heartbeat_interval())
            .unwrap_or_else(|_| ChronoDuration::seconds(30));
        for instance in held
            .iter()
            .filter(|instance| now - instance.heartbeat_at >= interval)
        {
            self.ctx
                .instances
                .heartbeat(instance.task_instance_id, now)
                .await?;
        }
        Ok(())
    }

    async fn submit_chunk(
        &self,
        batch_key: &str,
        chunk: &[TaskInstance],
        tasks: &HashMap<i64, Task>,
        summary: &mut DistributorTickSummary,
    ) -> SwarmResult<()> {
        let mut picked = Vec::with_capacity(chunk.len());
        for instance in chunk {
            if self
                .apply(instance.task_instance_id, TaskInstanceEvent::Instantiate)
                .await?
                && self
                    .apply(instance.task_instance_id, TaskInstanceEvent::Submit)
                    .await?
            {
                picked.push(instance);
            }
        }
        if picked.is_empty() {
            return Ok(());
        }

        let task_ids: Vec<i64> = picked.iter().map(|instance| instance.task_id).collect();
        let resources = self.ctx.store.latest_task_resources(&task_ids).await?;
        let (queue, values) = resources
            .get(&picked[0].task_id)
            .map(|row| (row.queue.clone(), row.values.clone()))
            .unwrap_or_else(|| (self.ctx.config.resources.default_queue.clone(), BTreeMap::new()));

        let jobs = picked
            .iter()
            .map(|instance| {
                let task = tasks.get(&instance.task_id);
                JobSpec {
                    task_instance_id: instance.task_instance_id,
                    task_id: instance.task_id,
                    name: task.map(|task| task.name.clone()).unwrap_or_default(),
                    command: task.map(|task| task.command.clone()).unwrap_or_default(),
                }
            })
            .collect();
        let batch = SubmissionBatch {
            batch_key: batch_key.to_string(),
            queue,
            resources: values,
            jobs,
        };

        match self.backend.submit(&batch).await {
            Ok(receipt) => {
                summary.batches_submitted += 1;
                for (index, instance) in picked.iter().enumerate() {
                    let event = match receipt.job_ids.get(index).cloned().flatten() {
                        Some(distributor_id) => {
                            summary.launched += 1;
                            TaskInstanceEvent::Launch { distributor_id }
                        }
                        None => {
                            summary.without_distributor_id += 1;
                            TaskInstanceEvent::NoDistributorId {
                                reason: format!(
                                    "batch {} returned no id for the job",
                                    receipt.distributor_batch_id
                                ),
                            }
                        }
                    };
                    self.apply(instance.task_instance_id, event).await?;
                }
                info!(
                    batch_key = batch_key,
                    distributor_batch_id = %receipt.distributor_batch_id,
                    jobs = picked.len(),
                    "Batch submitted"
                );
            }
            Err(err) => {
                log_error("distributor", "submit", &err.to_string(), Some(batch_key));
                for instance in &picked {
                    summary.without_distributor_id += 1;
                    self.apply(
                        instance.task_instance_id,
                        TaskInstanceEvent::NoDistributorId {
                            reason: err.to_string(),
                        },
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn terminate_killed(&self, summary: &mut DistributorTickSummary) -> SwarmResult<()> {
        let killed = self
            .ctx
            .store
            .list_workflow_instances(self.workflow_id, &[TaskInstanceStatus::KillSelf])
            .await?;
        let killed_ids: HashSet<String> = killed
            .into_iter()
            .filter_map(|instance| instance.distributor_id)
            .collect();
        let ids: Vec<String> = {
            let mut terminated = self.terminated.lock();
            // forget jobs whose instance left KILL_SELF
            terminated.retain(|id| killed_ids.contains(id));
            let mut ids: Vec<String> = killed_ids
                .into_iter()
                .filter(|id| !terminated.contains(id))
                .collect();
            ids.sort();
            ids
        };
        if ids.is_empty() {
            return Ok(());
        }

        match self.backend.terminate(&ids).await {
            Ok(()) => {
                summary.terminated += ids.len();
                self.terminated.lock().extend(ids);
            }
            Err(err) => {
                warn!(
                    workflow_id = self.workflow_id,
                    error = %err,
                    "Terminate failed; retrying next tick"
                );
            }
        }
        Ok(())
    }

    async fn poll_launched(
        &self,
        now: DateTime<Utc>,
        summary: &mut DistributorTickSummary,
    ) -> SwarmResult<()> {
        let launched = self
            .ctx
            .store
            .list_workflow_instances(self.workflow_id, TaskInstanceStatus::HEARTBEATING)
            .await?;
        let by_distributor_id: HashMap<String, TaskInstance> = launched
            .into_iter()
            .filter_map(|instance| Some((instance.distributor_id.clone()?, instance)))
            .collect();
        if by_distributor_id.is_empty() {
            return Ok(());
        }

        let mut ids: Vec<String> = by_distributor_id.keys().cloned().collect();
        ids.sort();
        let reports = match self.backend.poll(&ids).await {
            Ok(reports) => reports,
            Err(err) => {
                error!(workflow_id = self.workflow_id, error = %err, "Backend poll failed");
                return Ok(());
            }
        };

        summary.polled += reports.len();
        for report in reports {
            let Some(instance) = by_distributor_id.get(&report.distributor_id) else {
                continue;
            };
            if self.record(instance, report, now).await? {
                summary.finished += 1;
            }
        }
        Ok(())
    }

    /// Write one backend report; true when the instance reached a terminal state
    async fn record(
        &self,
        instance: &TaskInstance,
        report: JobReport,
        now: DateTime<Utc>,
    ) -> SwarmResult<bool> {
        let id = instance.task_instance_id;
        let JobReport {
            state, error_log, ..
        } = report;
        let event = match state {
            BackendJobState::Pending => {
                self.ctx.instances.heartbeat(id, now).await?;
                return Ok(false);
            }
            BackendJobState::Running { nodename } => {
                if instance.status == TaskInstanceStatus::Launched {
                    self.apply(id, TaskInstanceEvent::Run { nodename }).await?;
                }
                self.ctx.instances.heartbeat(id, now).await?;
                return Ok(false);
            }
            BackendJobState::Done => TaskInstanceEvent::Complete,
            BackendJobState::Failed { exit_code } => TaskInstanceEvent::Error {
                exit_code,
                error_log,
            },
            BackendJobState::ResourceKilled { exceeded } => TaskInstanceEvent::ResourceError {
                exceeded,
                error_log,
            },
            BackendJobState::Lost => TaskInstanceEvent::UnknownError {
                error_log: Some(
                    error_log.unwrap_or_else(|| "backend has no record of the job".to_string()),
                ),
            },
        };
        self.apply(id, event).await
    }

    /// Apply an instance event. Another writer (worker wrapper, reaper, resume)
    /// may have moved the instance first; that is not an error.
    async fn apply(&self, task_instance_id: i64, event: TaskInstanceEvent) -> SwarmResult<bool> {
        match self.ctx.instances.transition(task_instance_id, event).await {
            Ok(outcome) => Ok(outcome.is_applied()),
            Err(StateMachineError::InvalidTransition { from, event, .. }) => {
                debug!(
                    task_instance_id = task_instance_id,
                    from = %from,
                    event = %event,
                    "Instance already moved on"
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{ScriptedBackend, ScriptedOutcome};
    use crate::config::SwarmConfig;
    use crate::database::{InMemoryStore, Store};
    use crate::models::{
        InstanceClaim, NewDag, NewNode, NewTask, NewTaskResources, NewWorkflow, ResourceRecordKind,
    };
    use crate::orchestration::notifier::PollingNotifier;
    use crate::state_machine::TaskStatus;

    struct Fixture {
        store: Arc<InMemoryStore>,
        ctx: SwarmContext,
        workflow_id: i64,
        instance_ids: Vec<i64>,
    }

    async fn setup(names: &[&str], debounce_ms: u64) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let mut config = SwarmConfig::default();
        config.scheduler.debounce_ms = debounce_ms;
        let ctx = SwarmContext::new(store.clone(), Arc::new(PollingNotifier), config);

        let nodes: Vec<NewNode> = names
            .iter()
            .map(|name| NewNode::new(1, BTreeMap::from([("name".to_string(), name.to_string())])))
            .collect();
        let dag = store
            .insert_dag(&NewDag {
                dag_hash: "d".into(),
                nodes: nodes.clone(),
                edges: vec![],
            })
            .await
            .unwrap();
        let workflow = store
            .insert_workflow(NewWorkflow {
                workflow_hash: "w".into(),
                tool_version_id: 1,
                dag_id: dag.dag.dag_id,
                name: "distributor".into(),
                workflow_args: BTreeMap::new(),
                max_concurrently_running: 100,
                template_concurrency: BTreeMap::new(),
            })
            .await
            .unwrap();
        let tasks = store
            .insert_tasks(
                names
                    .iter()
                    .zip(&nodes)
                    .map(|(name, node)| NewTask {
                        workflow_id: workflow.workflow_id,
                        node_id: dag.node_ids[&node.node_hash],
                        task_hash: name.to_string(),
                        name: name.to_string(),
                        command: format!("run {name}"),
                        task_template_version_id: 1,
                        max_attempts: 3,
                        resource_scales: BTreeMap::new(),
                        fallback_queues: vec![],
                    })
                    .collect(),
            )
            .await
            .unwrap();

        let mut instance_ids = Vec::new();
        for task in &tasks {
            store
                .insert_task_resources(NewTaskResources {
                    task_id: task.task_id,
                    kind: ResourceRecordKind::Validated,
                    queue: "all.q".into(),
                    values: BTreeMap::from([("memory".to_string(), 2.0)]),
                    adjustments: vec![],
                })
                .await
                .unwrap();
            store
                .transition_task(task.task_id, &[TaskStatus::Registering], TaskStatus::Queued, false)
                .await
                .unwrap();
            let instance = store
                .claim_task_instance(InstanceClaim {
                    task_id: task.task_id,
                    workflow_run_id: 1,
                    batch_key: "batch".into(),
                })
                .await
                .unwrap()
                .unwrap();
            instance_ids.push(instance.task_instance_id);
        }
        Fixture {
            store,
            ctx,
            workflow_id: workflow.workflow_id,
            instance_ids,
        }
    }

    #[tokio::test]
    async fn test_batches_launch_and_report_outcomes() {
        let Fixture {
            store,
            ctx,
            workflow_id,
            instance_ids: ids,
        } = setup(&["a", "b", "c"], 0).await;
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("b", [ScriptedOutcome::fail(2)]);
        backend.script(
            "c",
            [ScriptedOutcome::ResourceKill {
                exceeded: vec!["memory".into()],
            }],
        );
        let distributor = Distributor::new(ctx, backend.clone(), workflow_id);

        let first = distributor.tick().await.unwrap();
        assert_eq!(first.batches_submitted, 1);
        assert_eq!(first.launched, 3);
        assert_eq!(backend.submissions()[0].jobs.len(), 3);
        assert_eq!(first.finished, 3);

        let status = |i: usize| {
            let store = store.clone();
            let id = ids[i];
            async move { store.get_task_instance(id).await.unwrap() }
        };
        assert_eq!(status(0).await.status, TaskInstanceStatus::Done);
        let failed = status(1).await;
        assert_eq!(failed.status, TaskInstanceStatus::Error);
        assert_eq!(failed.exit_code, Some(2));
        let killed = status(2).await;
        assert_eq!(killed.status, TaskInstanceStatus::ResourceError);
        assert_eq!(killed.exceeded_resources, vec!["memory".to_string()]);
    }

    #[tokio::test]
    async fn test_debounce_holds_fresh_batches() {
        let Fixture {
            store,
            ctx,
            workflow_id,
            instance_ids: ids,
        } = setup(&["a"], 60_000).await;
        let backend = Arc::new(ScriptedBackend::new());
        let distributor = Distributor::new(ctx, backend.clone(), workflow_id);

        let held = distributor.tick().await.unwrap();
        assert_eq!(held.batches_submitted, 0);
        let instance = store.get_task_instance(ids[0]).await.unwrap();
        assert_eq!(instance.status, TaskInstanceStatus::Queued);

        let later = Utc::now() + ChronoDuration::minutes(2);
        let released = distributor.tick_at(later).await.unwrap();
        assert_eq!(released.batches_submitted, 1);
    }

    #[tokio::test]
    async fn test_missing_distributor_id() {
        let Fixture {
            store,
            ctx,
            workflow_id,
            instance_ids: ids,
        } = setup(&["ghost"], 0).await;
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("ghost", [ScriptedOutcome::NoId]);
        let distributor = Distributor::new(ctx, backend, workflow_id);

        let summary = distributor.tick().await.unwrap();
        assert_eq!(summary.without_distributor_id, 1);
        let instance = store.get_task_instance(ids[0]).await.unwrap();
        assert_eq!(instance.status, TaskInstanceStatus::NoDistributorId);
    }

    #[tokio::test]
    async fn test_kill_self_is_terminated_once() {
        let Fixture {
            store,
            ctx,
            workflow_id,
            instance_ids: ids,
        } = setup(&["slow"], 0).await;
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("slow", [ScriptedOutcome::Succeed { polls: 100 }]);
        let distributor = Distributor::new(ctx.clone(), backend.clone(), workflow_id);
        distributor.tick().await.unwrap();

        ctx.instances
            .transition(ids[0], TaskInstanceEvent::KillSelf)
            .await
            .unwrap();
        let first = distributor.tick().await.unwrap();
        let second = distributor.tick().await.unwrap();
        assert_eq!(first.terminated, 1);
        assert_eq!(second.terminated, 0);
        assert_eq!(backend.terminated_ids().len(), 1);
        assert_eq!(
            store.get_task_instance(ids[0]).await.unwrap().status,
            TaskInstanceStatus::KillSelf
        );
    }

    #[tokio::test]
    async fn test_terminated_ids_are_forgotten_once_instance_leaves_kill_self() {
        let Fixture {
            store,
            ctx,
            workflow_id,
            instance_ids: ids,
        } = setup(&["slow"], 0).await;
        let backend = Arc::new(ScriptedBackend::new());
        backend.script("slow", [ScriptedOutcome::Succeed { polls: 100 }]);
        let distributor = Distributor::new(ctx.clone(), backend.clone(), workflow_id);
        distributor.tick().await.unwrap();

        ctx.instances
            .transition(ids[0], TaskInstanceEvent::KillSelf)
            .await
            .unwrap();
        distributor.tick().await.unwrap();
        assert_eq!(distributor.terminated.lock().len(), 1);

        store
            .transition_task_instance(
                ids[0],
                &[TaskInstanceStatus::KillSelf],
                TaskInstanceStatus::ErrorFatal,
                Default::default(),
            )
            .await
            .unwrap();
        distributor.tick().await.unwrap();
        assert!(distributor.terminated.lock().is_empty());
    }
}
