//! # Binder
//!
//! Persists a client's workflow description and hands back a BOUND workflow
//! run for the scheduling loop.
//!
//! Identity is content-addressed: the node hash covers template and node
//! arguments, the task hash adds task arguments, and the workflow hash covers
//! the tool version, the DAG hash and the workflow arguments. Binding a
//! description whose workflow hash already exists is a resume, allowed only
//! when the caller opts in and only when the task set is identical.
//!
//! Everything that can be rejected (cycles, unknown upstreams, invalid
//! resources, a mismatched resume) is checked before the first write.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::SwarmContext;
use crate::constants::{defaults, system};
use crate::dag::{downstream_closure, DagError, DagGraph};
use crate::database::StoreError;
use crate::error::{Result, TaskswarmError};
use crate::models::{
    identity, NewBoundTask, NewDag, NewEdge, NewNode, NewTask, NewTaskResources, NewWorkflow,
    NewWorkflowBundle, NewWorkflowRun, ResourceRecordKind, ResumeType, Task, Workflow, WorkflowRun,
};
use crate::resources::{resolve_resources, ResourceLayer, ResourceRequest};
use crate::state_machine::{
    StateMachineError, TaskEvent, TaskInstanceEvent, TaskInstanceStatus, TaskStatus, WorkflowEvent,
    WorkflowRunEvent, WorkflowRunStatus, WorkflowStatus,
};

/// One task as described by the client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSpec {
    /// Unique within the workflow; edges refer to tasks by name
    pub name: String,
    pub task_template_version_id: i64,
    /// Arguments that define the DAG shape
    pub node_args: BTreeMap<String, String>,
    /// Arguments that vary between otherwise identical workflows
    pub task_args: BTreeMap<String, String>,
    pub command: String,
    pub max_attempts: Option<u32>,
    pub resources: ResourceLayer,
    /// Names of the tasks this one depends on
    pub upstream: Vec<String>,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        task_template_version_id: i64,
        command: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            task_template_version_id,
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_node_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.node_args.insert(key.into(), value.into());
        self
    }

    pub fn with_task_arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.task_args.insert(key.into(), value.into());
        self
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream.push(upstream.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_resources(mut self, resources: ResourceLayer) -> Self {
        self.resources = resources;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSpec {
    pub tool_version_id: i64,
    pub name: String,
    pub workflow_args: BTreeMap<String, String>,
    /// Workflow layer of the resource resolution
    pub default_resources: ResourceLayer,
    /// Template layer, keyed by task template version
    pub template_resources: BTreeMap<i64, ResourceLayer>,
    pub max_concurrently_running: Option<u32>,
    pub template_concurrency: BTreeMap<i64, u32>,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindOptions {
    /// Resume an existing, unfinished workflow with the same identity
    pub resume: bool,
    /// On resume, ask running instances of the previous run to kill themselves
    pub reset_running_jobs: bool,
    pub user: String,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            resume: false,
            reset_running_jobs: false,
            user: std::env::var("USER").unwrap_or_else(|_| "taskswarm".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundWorkflow {
    pub workflow: Workflow,
    pub workflow_run: WorkflowRun,
    pub tasks: Vec<Task>,
    pub resumed: bool,
}

/// Hashes and resolved resources for one task, computed before any write
#[derive(Debug, Clone)]
struct CompiledTask {
    node: NewNode,
    task_hash: String,
    request: ResourceRequest,
    validated: BTreeMap<String, f64>,
}

#[derive(Debug, Clone)]
struct CompiledWorkflow {
    dag: NewDag,
    workflow_hash: String,
    tasks: Vec<CompiledTask>,
}

#[derive(Debug, Clone)]
pub struct Binder {
    ctx: SwarmContext,
}

impl Binder {
    pub fn new(ctx: SwarmContext) -> Self {
        Self { ctx }
    }

    /// Bind a new workflow or resume the existing one with the same identity
    #[instrument(skip(self, spec, options), fields(workflow = %spec.name, tasks = spec.tasks.len()))]
    pub async fn bind(&self, spec: &WorkflowSpec, options: &BindOptions) -> Result<BoundWorkflow> {
        let compiled = self.compile(spec)?;

        match self
            .ctx
            .store
            .find_workflow_by_hash(&compiled.workflow_hash)
            .await?
        {
            Some(existing) => self.bind_existing(existing, &compiled, options).await,
            None => match self.bind_new(spec, &compiled, options).await {
                // Another client bound the same workflow first
                Err(TaskswarmError::Store(StoreError::Conflict(_))) => {
                    let existing = self
                        .ctx
                        .store
                        .find_workflow_by_hash(&compiled.workflow_hash)
                        .await?
                        .ok_or_else(|| {
                            TaskswarmError::Internal("workflow vanished after conflict".into())
                        })?;
                    self.bind_existing(existing, &compiled, options).await
                }
                other => other,
            },
        }
    }

    fn compile(&self, spec: &WorkflowSpec) -> Result<CompiledWorkflow> {
        if spec.tasks.is_empty() {
            return Err(TaskswarmError::Validation(format!(
                "workflow '{}' has no tasks",
                spec.name
            )));
        }
        if spec.tasks.len() > system::MAX_TASKS_PER_WORKFLOW {
            return Err(TaskswarmError::Validation(format!(
                "workflow '{}' has {} tasks, more than {}",
                spec.name,
                spec.tasks.len(),
                system::MAX_TASKS_PER_WORKFLOW
            )));
        }

        let edges: Vec<(String, String)> = spec
            .tasks
            .iter()
            .flat_map(|task| {
                task.upstream
                    .iter()
                    .map(move |upstream| (upstream.clone(), task.name.clone()))
            })
            .collect();
        DagGraph::build(
            spec.tasks.iter().map(|task| task.name.clone()),
            edges.iter().cloned(),
        )?;

        let resources = &self.ctx.config.resources;
        let mut node_hash_by_name: HashMap<&str, String> = HashMap::new();
        let mut owner_by_node: HashMap<String, &str> = HashMap::new();
        let mut tasks = Vec::with_capacity(spec.tasks.len());

        for task in &spec.tasks {
            let node = NewNode::new(task.task_template_version_id, task.node_args.clone());
            if let Some(other) = owner_by_node.insert(node.node_hash.clone(), &task.name) {
                return Err(TaskswarmError::Validation(format!(
                    "tasks '{other}' and '{}' share template and node arguments",
                    task.name
                )));
            }

            let template_layer = spec
                .template_resources
                .get(&task.task_template_version_id)
                .cloned()
                .unwrap_or_default();
            let request = resolve_resources(
                &[&task.resources, &template_layer, &spec.default_resources],
                resources,
            );
            let validated = self.ctx.catalog.validate(&request.queue, &request.values)?;
            for queue in &request.fallback_queues {
                self.ctx.catalog.get(queue)?;
            }

            node_hash_by_name.insert(&task.name, node.node_hash.clone());
            tasks.push(CompiledTask {
                task_hash: identity::task_hash(&node.node_hash, &task.task_args),
                node,
                request,
                validated,
            });
        }

        let mut new_edges = Vec::with_capacity(edges.len());
        for (upstream, downstream) in &edges {
            let (Some(up), Some(down)) = (
                node_hash_by_name.get(upstream.as_str()),
                node_hash_by_name.get(downstream.as_str()),
            ) else {
                return Err(DagError::UnknownNode(upstream.clone()).into());
            };
            new_edges.push(NewEdge {
                upstream_node_hash: up.clone(),
                downstream_node_hash: down.clone(),
            });
        }

        let dag_hash = identity::dag_hash(
            tasks.iter().map(|task| task.node.node_hash.as_str()),
            new_edges.iter().map(|edge| {
                (
                    edge.upstream_node_hash.as_str(),
                    edge.downstream_node_hash.as_str(),
                )
            }),
        );
        let workflow_hash =
            identity::workflow_hash(spec.tool_version_id, &dag_hash, &spec.workflow_args);

        Ok(CompiledWorkflow {
            dag: NewDag {
                dag_hash,
                nodes: tasks.iter().map(|task| task.node.clone()).collect(),
                edges: new_edges,
            },
            workflow_hash,
            tasks,
        })
    }

    async fn bind_new(
        &self,
        spec: &WorkflowSpec,
        compiled: &CompiledWorkflow,
        options: &BindOptions,
    ) -> Result<BoundWorkflow> {
        let store = &self.ctx.store;
        let dag = store.insert_dag(&compiled.dag).await?;

        let mut tasks = Vec::with_capacity(compiled.tasks.len());
        for (task_spec, task) in spec.tasks.iter().zip(&compiled.tasks) {
            let node_id = dag.node_ids.get(&task.node.node_hash).copied().ok_or_else(|| {
                TaskswarmError::Internal(format!("node {} was not stored", task.node.node_hash))
            })?;
            tasks.push(NewBoundTask {
                task: NewTask {
                    workflow_id: 0,
                    node_id,
                    task_hash: task.task_hash.clone(),
                    name: task_spec.name.clone(),
                    command: task_spec.command.clone(),
                    task_template_version_id: task_spec.task_template_version_id,
                    max_attempts: task_spec.max_attempts.unwrap_or(defaults::MAX_ATTEMPTS).max(1),
                    resource_scales: task.request.scales.clone(),
                    fallback_queues: task.request.fallback_queues.clone(),
                },
                resources: initial_resources(task),
            });
        }

        let inserted = store
            .insert_workflow_bundle(NewWorkflowBundle {
                workflow: NewWorkflow {
                    workflow_hash: compiled.workflow_hash.clone(),
                    tool_version_id: spec.tool_version_id,
                    dag_id: dag.dag.dag_id,
                    name: spec.name.clone(),
                    workflow_args: spec.workflow_args.clone(),
                    max_concurrently_running: spec
                        .max_concurrently_running
                        .unwrap_or(self.ctx.config.scheduler.default_max_concurrently_running),
                    template_concurrency: spec.template_concurrency.clone(),
                },
                tasks,
                user: options.user.clone(),
            })
            .await?;
        let workflow_id = inserted.workflow.workflow_id;

        let workflow_run = self.mark_bound(&inserted.workflow_run).await?;
        self.ctx
            .workflows
            .transition(workflow_id, WorkflowEvent::Queue)
            .await?;

        info!(
            workflow_id = workflow_id,
            workflow_run_id = workflow_run.workflow_run_id,
            tasks = inserted.tasks.len(),
            "Workflow bound"
        );
        Ok(BoundWorkflow {
            workflow: store.get_workflow(workflow_id).await?,
            workflow_run,
            tasks: inserted.tasks,
            resumed: false,
        })
    }

    async fn bind_existing(
        &self,
        existing: Workflow,
        compiled: &CompiledWorkflow,
        options: &BindOptions,
    ) -> Result<BoundWorkflow> {
        let workflow_id = existing.workflow_id;
        if existing.status == WorkflowStatus::Done {
            return Err(TaskswarmError::WorkflowAlreadyComplete { workflow_id });
        }
        if !options.resume {
            return Err(TaskswarmError::WorkflowAlreadyExists {
                workflow_id,
                status: existing.status.to_string(),
            });
        }

        let stored: BTreeSet<String> = self
            .ctx
            .store
            .list_tasks(workflow_id)
            .await?
            .into_iter()
            .map(|task| task.task_hash)
            .collect();
        let requested: BTreeSet<String> =
            compiled.tasks.iter().map(|task| task.task_hash.clone()).collect();
        if stored != requested {
            return Err(TaskswarmError::InvalidResume {
                workflow_id,
                reason: format!(
                    "task set differs from the bound workflow ({} stored, {} requested, {} in common)",
                    stored.len(),
                    requested.len(),
                    stored.intersection(&requested).count()
                ),
            });
        }

        let workflow_run = self
            .resume(workflow_id, options.reset_running_jobs, &options.user)
            .await?;
        Ok(BoundWorkflow {
            workflow: self.ctx.store.get_workflow(workflow_id).await?,
            tasks: self.ctx.store.list_tasks(workflow_id).await?,
            workflow_run,
            resumed: true,
        })
    }

    /// Replace the controlling run of a workflow with a new BOUND run.
    ///
    /// Tasks that are DONE stay DONE. ERROR_FATAL and REGISTERING tasks and
    /// everything downstream of them go back to REGISTERING with a fresh
    /// attempt budget. A cold resume also kills the previous run's active
    /// instances and resets every unfinished task; a hot resume leaves
    /// launched work running.
    #[instrument(skip(self, user))]
    pub async fn resume(
        &self,
        workflow_id: i64,
        reset_running_jobs: bool,
        user: &str,
    ) -> Result<WorkflowRun> {
        let workflow = self.ctx.store.get_workflow(workflow_id).await?;
        if workflow.status == WorkflowStatus::Done {
            return Err(TaskswarmError::WorkflowAlreadyComplete { workflow_id });
        }
        let resume_type = if reset_running_jobs {
            ResumeType::Cold
        } else {
            ResumeType::Hot
        };

        self.supersede_controlling_runs(workflow_id, resume_type)
            .await?;
        self.reset_unfinished_tasks(&workflow, resume_type).await?;

        match workflow.status {
            WorkflowStatus::Registering => {
                self.ctx
                    .workflows
                    .transition(workflow_id, WorkflowEvent::Queue)
                    .await?;
            }
            WorkflowStatus::Queued => {}
            _ => {
                self.ctx
                    .workflows
                    .transition_if_legal(workflow_id, WorkflowEvent::Resume)
                    .await?;
            }
        }

        let run = self.open_run(&workflow, user, Some(resume_type)).await?;
        info!(
            workflow_id = workflow_id,
            workflow_run_id = run.workflow_run_id,
            resume_type = %resume_type,
            "Workflow resumed"
        );
        Ok(run)
    }

    async fn supersede_controlling_runs(
        &self,
        workflow_id: i64,
        resume_type: ResumeType,
    ) -> Result<()> {
        let runs = self.ctx.store.list_workflow_runs(workflow_id).await?;
        for run in runs.iter().filter(|run| run.status.is_controlling()) {
            let run_id = run.workflow_run_id;
            if run.status == WorkflowRunStatus::Registering {
                self.ctx.runs.transition(run_id, WorkflowRunEvent::Abort).await?;
                continue;
            }
            let event = match resume_type {
                ResumeType::Cold => WorkflowRunEvent::ColdResume,
                ResumeType::Hot => WorkflowRunEvent::HotResume,
            };
            if !self.ctx.runs.transition(run_id, event).await?.is_applied() {
                continue;
            }
            if resume_type == ResumeType::Cold {
                self.kill_active_instances(workflow_id).await?;
            }
            self.ctx
                .runs
                .transition(run_id, WorkflowRunEvent::Terminate)
                .await?;
            debug!(workflow_run_id = run_id, resume_type = %resume_type, "Previous run superseded");
        }
        Ok(())
    }

    async fn kill_active_instances(&self, workflow_id: i64) -> Result<()> {
        let active = self
            .ctx
            .store
            .list_workflow_instances(workflow_id, TaskInstanceStatus::ACTIVE)
            .await?;
        for instance in active {
            self.ctx
                .instances
                .transition(instance.task_instance_id, TaskInstanceEvent::KillSelf)
                .await?;
        }
        Ok(())
    }

    async fn reset_unfinished_tasks(
        &self,
        workflow: &Workflow,
        resume_type: ResumeType,
    ) -> Result<()> {
        let tasks = self.ctx.store.list_tasks(workflow.workflow_id).await?;
        let edges = self.ctx.store.list_dag_edges(workflow.dag_id).await?;
        let graph = task_graph(&tasks, &edges)?;
        let by_id: HashMap<i64, &Task> = tasks.iter().map(|task| (task.task_id, task)).collect();

        let seeds = tasks.iter().filter(|task| match resume_type {
            ResumeType::Cold => task.status != TaskStatus::Done,
            ResumeType::Hot => matches!(
                task.status,
                TaskStatus::ErrorFatal | TaskStatus::Registering | TaskStatus::ErrorRecoverable
            ),
        });
        let closure = downstream_closure(&graph, seeds.map(|task| task.task_id));

        for task_id in closure {
            let Some(task) = by_id.get(&task_id) else {
                continue;
            };
            if task.status == TaskStatus::Done {
                continue;
            }
            if resume_type == ResumeType::Hot && task.status.is_in_flight() {
                continue;
            }
            match self.ctx.tasks.transition(task_id, TaskEvent::Reset).await {
                Ok(_) => {}
                // Registering tasks are already where a reset would put them
                Err(StateMachineError::InvalidTransition { .. }) => {}
                Err(StateMachineError::ActiveInstanceExists {
                    task_instance_id, ..
                }) => {
                    warn!(
                        task_id = task_id,
                        task_instance_id = task_instance_id,
                        "Task left running through resume"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    async fn open_run(
        &self,
        workflow: &Workflow,
        user: &str,
        resume_type: Option<ResumeType>,
    ) -> Result<WorkflowRun> {
        let run = self
            .ctx
            .store
            .insert_workflow_run(NewWorkflowRun {
                workflow_id: workflow.workflow_id,
                user: user.to_string(),
                resume_type,
            })
            .await?;
        self.mark_bound(&run).await
    }

    async fn mark_bound(&self, run: &WorkflowRun) -> Result<WorkflowRun> {
        self.ctx
            .runs
            .transition(run.workflow_run_id, WorkflowRunEvent::Bind)
            .await?;
        Ok(self.ctx.store.get_workflow_run(run.workflow_run_id).await?)
    }
}

/// ORIGINAL and VALIDATED rows written at first bind
fn initial_resources(task: &CompiledTask) -> Vec<NewTaskResources> {
    [
        (ResourceRecordKind::Original, &task.request.values),
        (ResourceRecordKind::Validated, &task.validated),
    ]
    .into_iter()
    .map(|(kind, values)| NewTaskResources {
        task_id: 0,
        kind,
        queue: task.request.queue.clone(),
        values: values.clone(),
        adjustments: Vec::new(),
    })
    .collect()
}

/// Task-level view of the stored DAG: node edges mapped onto the tasks bound to them
pub(crate) fn task_graph(
    tasks: &[Task],
    edges: &[crate::models::Edge],
) -> std::result::Result<DagGraph<i64>, DagError> {
    let task_by_node: HashMap<i64, i64> = tasks
        .iter()
        .map(|task| (task.node_id, task.task_id))
        .collect();
    let task_edges = edges.iter().filter_map(|edge| {
        Some((
            *task_by_node.get(&edge.upstream_node_id)?,
            *task_by_node.get(&edge.downstream_node_id)?,
        ))
    });
    DagGraph::build(tasks.iter().map(|task| task.task_id), task_edges)
}
