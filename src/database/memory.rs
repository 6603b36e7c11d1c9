//! In-memory [`Store`] implementation.
//!
//! Every table lives behind a single `parking_lot::Mutex`, so each trait method
//! is one critical section and the conditional updates are trivially atomic.
//! The lock is never held across an await point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{Store, StoreError, StoreResult};
use crate::models::{
    BoundDag, Dag, Edge, InsertedWorkflow, InstanceClaim, InstanceUpdate, NewDag, NewTask,
    NewTaskResources, NewWorkflow, NewWorkflowBundle, NewWorkflowRun, Node, Task, TaskInstance,
    TaskResources, Workflow, WorkflowRun,
};
use crate::state_machine::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    nodes: BTreeMap<i64, Node>,
    node_ids_by_hash: HashMap<String, i64>,
    dags: BTreeMap<i64, Dag>,
    dag_ids_by_hash: HashMap<String, i64>,
    edges: BTreeMap<i64, Vec<Edge>>,
    workflows: BTreeMap<i64, Workflow>,
    workflow_runs: BTreeMap<i64, WorkflowRun>,
    tasks: BTreeMap<i64, Task>,
    task_instances: BTreeMap<i64, TaskInstance>,
    task_resources: BTreeMap<i64, TaskResources>,
}

impl Tables {
    /// Ids are shared across tables and strictly increasing, so id order is creation order
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_workflow(&mut self, workflow: NewWorkflow) -> StoreResult<Workflow> {
        if self
            .workflows
            .values()
            .any(|existing| existing.workflow_hash == workflow.workflow_hash)
        {
            return Err(StoreError::Conflict(format!(
                "workflow hash {} already bound",
                workflow.workflow_hash
            )));
        }
        let now = Utc::now();
        let workflow_id = self.allocate_id();
        let record = Workflow {
            workflow_id,
            workflow_hash: workflow.workflow_hash,
            tool_version_id: workflow.tool_version_id,
            dag_id: workflow.dag_id,
            name: workflow.name,
            workflow_args: workflow.workflow_args,
            status: WorkflowStatus::Registering,
            max_concurrently_running: workflow.max_concurrently_running,
            template_concurrency: workflow.template_concurrency,
            created_at: now,
            status_date: now,
        };
        self.workflows.insert(workflow_id, record.clone());
        Ok(record)
    }

    fn insert_workflow_run(&mut self, run: NewWorkflowRun) -> StoreResult<WorkflowRun> {
        if !self.workflows.contains_key(&run.workflow_id) {
            return Err(StoreError::not_found("workflow", run.workflow_id));
        }
        if let Some(existing) = self
            .workflow_runs
            .values()
            .find(|existing| existing.workflow_id == run.workflow_id && existing.status.is_controlling())
        {
            return Err(StoreError::Conflict(format!(
                "workflow {} is controlled by run {}",
                run.workflow_id, existing.workflow_run_id
            )));
        }
        let now = Utc::now();
        let workflow_run_id = self.allocate_id();
        let record = WorkflowRun {
            workflow_run_id,
            workflow_id: run.workflow_id,
            user: run.user,
            status: WorkflowRunStatus::Registering,
            resume_type: run.resume_type,
            heartbeat_at: now,
            created_at: now,
            status_date: now,
        };
        self.workflow_runs.insert(workflow_run_id, record.clone());
        Ok(record)
    }

    /// Returns the existing row when `(workflow_id, task_hash)` is taken
    fn insert_task(&mut self, task: NewTask) -> Task {
        if let Some(existing) = self.tasks.values().find(|existing| {
            existing.workflow_id == task.workflow_id && existing.task_hash == task.task_hash
        }) {
            return existing.clone();
        }
        let task_id = self.allocate_id();
        let record = Task {
            task_id,
            workflow_id: task.workflow_id,
            node_id: task.node_id,
            task_hash: task.task_hash,
            name: task.name,
            command: task.command,
            task_template_version_id: task.task_template_version_id,
            status: TaskStatus::Registering,
            max_attempts: task.max_attempts,
            num_attempts: 0,
            resource_scales: task.resource_scales,
            fallback_queues: task.fallback_queues,
            status_date: Utc::now(),
        };
        self.tasks.insert(task_id, record.clone());
        record
    }

    fn insert_task_resources(&mut self, resources: NewTaskResources) -> StoreResult<TaskResources> {
        if !self.tasks.contains_key(&resources.task_id) {
            return Err(StoreError::not_found("task", resources.task_id));
        }
        let task_resources_id = self.allocate_id();
        let record = TaskResources {
            task_resources_id,
            task_id: resources.task_id,
            kind: resources.kind,
            queue: resources.queue,
            values: resources.values,
            adjustments: resources.adjustments,
            created_at: Utc::now(),
        };
        self.task_resources.insert(task_resources_id, record.clone());
        Ok(record)
    }

    fn latest_resources(&self, task_id: i64) -> Option<&TaskResources> {
        self.task_resources
            .values()
            .rev()
            .find(|resources| resources.task_id == task_id)
    }

    fn has_active_instance(&self, task_id: i64) -> bool {
        self.task_instances
            .values()
            .any(|instance| instance.task_id == task_id && instance.status.is_active())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a task instance heartbeat without any status check.
    /// Lets tests age a heartbeat past the reaper threshold.
    pub fn backdate_instance_heartbeat(&self, task_instance_id: i64, at: DateTime<Utc>) -> bool {
        let mut tables = self.tables.lock();
        match tables.task_instances.get_mut(&task_instance_id) {
            Some(instance) => {
                instance.heartbeat_at = at;
                true
            }
            None => false,
        }
    }

    /// Overwrite a workflow run heartbeat without any status check
    pub fn backdate_run_heartbeat(&self, workflow_run_id: i64, at: DateTime<Utc>) -> bool {
        let mut tables = self.tables.lock();
        match tables.workflow_runs.get_mut(&workflow_run_id) {
            Some(run) => {
                run.heartbeat_at = at;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_dag(&self, dag: &NewDag) -> StoreResult<BoundDag> {
        let mut tables = self.tables.lock();
        let now = Utc::now();

        let mut node_ids = HashMap::with_capacity(dag.nodes.len());
        for node in &dag.nodes {
            let node_id = match tables.node_ids_by_hash.get(&node.node_hash) {
                Some(id) => *id,
                None => {
                    let id = tables.allocate_id();
                    tables.nodes.insert(
                        id,
                        Node {
                            node_id: id,
                            node_hash: node.node_hash.clone(),
                            task_template_version_id: node.task_template_version_id,
                            node_args: node.node_args.clone(),
                        },
                    );
                    tables.node_ids_by_hash.insert(node.node_hash.clone(), id);
                    id
                }
            };
            node_ids.insert(node.node_hash.clone(), node_id);
        }

        if let Some(dag_id) = tables.dag_ids_by_hash.get(&dag.dag_hash).copied() {
            let existing = tables
                .dags
                .get(&dag_id)
                .cloned()
                .ok_or_else(|| StoreError::not_found("dag", dag_id))?;
            return Ok(BoundDag {
                dag: existing,
                node_ids,
            });
        }

        let mut edges = Vec::with_capacity(dag.edges.len());
        let dag_id = tables.allocate_id();
        for edge in &dag.edges {
            let upstream = node_ids
                .get(&edge.upstream_node_hash)
                .copied()
                .ok_or_else(|| StoreError::not_found("node", &edge.upstream_node_hash))?;
            let downstream = node_ids
                .get(&edge.downstream_node_hash)
                .copied()
                .ok_or_else(|| StoreError::not_found("node", &edge.downstream_node_hash))?;
            edges.push(Edge {
                dag_id,
                upstream_node_id: upstream,
                downstream_node_id: downstream,
            });
        }
        edges.sort();
        edges.dedup();

        let record = Dag {
            dag_id,
            dag_hash: dag.dag_hash.clone(),
            created_at: now,
        };
        tables.dags.insert(dag_id, record.clone());
        tables.dag_ids_by_hash.insert(dag.dag_hash.clone(), dag_id);
        tables.edges.insert(dag_id, edges);

        Ok(BoundDag {
            dag: record,
            node_ids,
        })
    }

    async fn list_dag_edges(&self, dag_id: i64) -> StoreResult<Vec<Edge>> {
        let tables = self.tables.lock();
        if !tables.dags.contains_key(&dag_id) {
            return Err(StoreError::not_found("dag", dag_id));
        }
        Ok(tables.edges.get(&dag_id).cloned().unwrap_or_default())
    }

    async fn find_workflow_by_hash(&self, workflow_hash: &str) -> StoreResult<Option<Workflow>> {
        let tables = self.tables.lock();
        Ok(tables
            .workflows
            .values()
            .find(|workflow| workflow.workflow_hash == workflow_hash)
            .cloned())
    }

    async fn insert_workflow(&self, workflow: NewWorkflow) -> StoreResult<Workflow> {
        self.tables.lock().insert_workflow(workflow)
    }

    async fn insert_workflow_bundle(
        &self,
        bundle: NewWorkflowBundle,
    ) -> StoreResult<InsertedWorkflow> {
        let mut tables = self.tables.lock();
        // the only fallible insert comes first, so a conflict writes nothing
        let workflow = tables.insert_workflow(bundle.workflow)?;
        let mut tasks = Vec::with_capacity(bundle.tasks.len());
        for bound in bundle.tasks {
            let task = tables.insert_task(NewTask {
                workflow_id: workflow.workflow_id,
                ..bound.task
            });
            for resources in bound.resources {
                tables.insert_task_resources(NewTaskResources {
                    task_id: task.task_id,
                    ..resources
                })?;
            }
            tasks.push(task);
        }
        let workflow_run = tables.insert_workflow_run(NewWorkflowRun {
            workflow_id: workflow.workflow_id,
            user: bundle.user,
            resume_type: None,
        })?;
        Ok(InsertedWorkflow {
            workflow,
            tasks,
            workflow_run,
        })
    }

    async fn get_workflow(&self, workflow_id: i64) -> StoreResult<Workflow> {
        self.tables
            .lock()
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workflow", workflow_id))
    }

    async fn transition_workflow(
        &self,
        workflow_id: i64,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let workflow = tables
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| StoreError::not_found("workflow", workflow_id))?;
        if !from.contains(&workflow.status) {
            return Ok(false);
        }
        workflow.status = to;
        workflow.status_date = Utc::now();
        Ok(true)
    }

    async fn set_workflow_concurrency(&self, workflow_id: i64, limit: u32) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let workflow = tables
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| StoreError::not_found("workflow", workflow_id))?;
        workflow.max_concurrently_running = limit;
        Ok(())
    }

    async fn set_template_concurrency(
        &self,
        workflow_id: i64,
        task_template_version_id: i64,
        limit: u32,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock();
        let workflow = tables
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| StoreError::not_found("workflow", workflow_id))?;
        workflow
            .template_concurrency
            .insert(task_template_version_id, limit);
        Ok(())
    }

    async fn insert_workflow_run(&self, run: NewWorkflowRun) -> StoreResult<WorkflowRun> {
        self.tables.lock().insert_workflow_run(run)
    }

    async fn get_workflow_run(&self, workflow_run_id: i64) -> StoreResult<WorkflowRun> {
        self.tables
            .lock()
            .workflow_runs
            .get(&workflow_run_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("workflow_run", workflow_run_id))
    }

    async fn list_workflow_runs(&self, workflow_id: i64) -> StoreResult<Vec<WorkflowRun>> {
        let tables = self.tables.lock();
        Ok(tables
            .workflow_runs
            .values()
            .filter(|run| run.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn transition_workflow_run(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let run = tables
            .workflow_runs
            .get_mut(&workflow_run_id)
            .ok_or_else(|| StoreError::not_found("workflow_run", workflow_run_id))?;
        if !from.contains(&run.status) {
            return Ok(false);
        }
        let now = Utc::now();
        run.status = to;
        run.status_date = now;
        if !to.is_terminal() {
            run.heartbeat_at = now;
        }
        Ok(true)
    }

    async fn heartbeat_workflow_run(
        &self,
        workflow_run_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let run = tables
            .workflow_runs
            .get_mut(&workflow_run_id)
            .ok_or_else(|| StoreError::not_found("workflow_run", workflow_run_id))?;
        if !run.status.is_controlling() {
            return Ok(false);
        }
        run.heartbeat_at = at;
        Ok(true)
    }

    async fn find_stale_workflow_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<WorkflowRun>> {
        let tables = self.tables.lock();
        Ok(tables
            .workflow_runs
            .values()
            .filter(|run| !run.status.is_terminal() && run.heartbeat_at < older_than)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reap_workflow_run_if_stale(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let run = tables
            .workflow_runs
            .get_mut(&workflow_run_id)
            .ok_or_else(|| StoreError::not_found("workflow_run", workflow_run_id))?;
        if !from.contains(&run.status) || run.heartbeat_at >= older_than {
            return Ok(false);
        }
        run.status = to;
        run.status_date = Utc::now();
        Ok(true)
    }

    async fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        let mut tables = self.tables.lock();
        Ok(tasks.into_iter().map(|task| tables.insert_task(task)).collect())
    }

    async fn get_task(&self, task_id: i64) -> StoreResult<Task> {
        self.tables
            .lock()
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    async fn list_tasks(&self, workflow_id: i64) -> StoreResult<Vec<Task>> {
        let tables = self.tables.lock();
        Ok(tables
            .tasks
            .values()
            .filter(|task| task.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn transition_task(
        &self,
        task_id: i64,
        from: &[TaskStatus],
        to: TaskStatus,
        reset_attempts: bool,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        if !from.contains(&task.status) {
            return Ok(false);
        }
        task.status = to;
        task.status_date = Utc::now();
        if reset_attempts {
            task.num_attempts = 0;
        }
        Ok(true)
    }

    async fn adjust_task_resources(
        &self,
        from: &[TaskStatus],
        resources: NewTaskResources,
    ) -> StoreResult<Option<TaskResources>> {
        let mut tables = self.tables.lock();
        let task = tables
            .tasks
            .get_mut(&resources.task_id)
            .ok_or_else(|| StoreError::not_found("task", resources.task_id))?;
        if !from.contains(&task.status) {
            return Ok(None);
        }
        task.status = TaskStatus::AdjustingResources;
        task.status_date = Utc::now();
        tables.insert_task_resources(resources).map(Some)
    }

    async fn claim_task_instance(
        &self,
        claim: InstanceClaim,
    ) -> StoreResult<Option<TaskInstance>> {
        let mut tables = self.tables.lock();
        let task = tables
            .tasks
            .get(&claim.task_id)
            .ok_or_else(|| StoreError::not_found("task", claim.task_id))?;
        if !TaskStatus::CLAIMABLE.contains(&task.status) || tables.has_active_instance(claim.task_id)
        {
            return Ok(None);
        }
        let workflow_id = task.workflow_id;
        let task_resources_id = tables
            .latest_resources(claim.task_id)
            .map(|resources| resources.task_resources_id)
            .ok_or_else(|| StoreError::not_found("task_resources", claim.task_id))?;

        let now = Utc::now();
        let task_instance_id = tables.allocate_id();
        let instance = TaskInstance {
            task_instance_id,
            task_id: claim.task_id,
            workflow_id,
            workflow_run_id: claim.workflow_run_id,
            task_resources_id,
            status: TaskInstanceStatus::Queued,
            batch_key: claim.batch_key,
            distributor_id: None,
            nodename: None,
            exit_code: None,
            error_log: None,
            exceeded_resources: Vec::new(),
            heartbeat_at: now,
            created_at: now,
            status_date: now,
        };
        tables
            .task_instances
            .insert(task_instance_id, instance.clone());

        if let Some(task) = tables.tasks.get_mut(&claim.task_id) {
            task.status = TaskStatus::Instantiating;
            task.num_attempts += 1;
            task.status_date = now;
        }
        Ok(Some(instance))
    }

    async fn get_task_instance(&self, task_instance_id: i64) -> StoreResult<TaskInstance> {
        self.tables
            .lock()
            .task_instances
            .get(&task_instance_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task_instance", task_instance_id))
    }

    async fn list_task_instances(&self, task_id: i64) -> StoreResult<Vec<TaskInstance>> {
        let tables = self.tables.lock();
        Ok(tables
            .task_instances
            .values()
            .filter(|instance| instance.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn list_workflow_instances(
        &self,
        workflow_id: i64,
        statuses: &[TaskInstanceStatus],
    ) -> StoreResult<Vec<TaskInstance>> {
        let tables = self.tables.lock();
        Ok(tables
            .task_instances
            .values()
            .filter(|instance| {
                instance.workflow_id == workflow_id
                    && (statuses.is_empty() || statuses.contains(&instance.status))
            })
            .cloned()
            .collect())
    }

    async fn latest_task_instances(&self, workflow_id: i64) -> StoreResult<Vec<TaskInstance>> {
        let tables = self.tables.lock();
        let mut latest: BTreeMap<i64, &TaskInstance> = BTreeMap::new();
        for instance in tables
            .task_instances
            .values()
            .filter(|instance| instance.workflow_id == workflow_id)
        {
            latest.insert(instance.task_id, instance);
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn transition_task_instance(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        to: TaskInstanceStatus,
        update: InstanceUpdate,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let instance = tables
            .task_instances
            .get_mut(&task_instance_id)
            .ok_or_else(|| StoreError::not_found("task_instance", task_instance_id))?;
        if !from.contains(&instance.status) {
            return Ok(false);
        }
        let now = Utc::now();
        instance.status = to;
        instance.status_date = now;
        if to.is_active() {
            instance.heartbeat_at = now;
        }
        if let Some(distributor_id) = update.distributor_id {
            instance.distributor_id = Some(distributor_id);
        }
        if let Some(nodename) = update.nodename {
            instance.nodename = Some(nodename);
        }
        if let Some(exit_code) = update.exit_code {
            instance.exit_code = Some(exit_code);
        }
        if let Some(error_log) = update.error_log {
            instance.error_log = Some(error_log);
        }
        if let Some(exceeded) = update.exceeded_resources {
            instance.exceeded_resources = exceeded;
        }
        Ok(true)
    }

    async fn heartbeat_task_instance(
        &self,
        task_instance_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let instance = tables
            .task_instances
            .get_mut(&task_instance_id)
            .ok_or_else(|| StoreError::not_found("task_instance", task_instance_id))?;
        if !instance.status.is_active() {
            return Ok(false);
        }
        instance.heartbeat_at = at;
        Ok(true)
    }

    async fn find_stale_task_instances(
        &self,
        statuses: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TaskInstance>> {
        let tables = self.tables.lock();
        Ok(tables
            .task_instances
            .values()
            .filter(|instance| {
                statuses.contains(&instance.status) && instance.heartbeat_at < older_than
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reap_task_instance_if_stale(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock();
        let instance = tables
            .task_instances
            .get_mut(&task_instance_id)
            .ok_or_else(|| StoreError::not_found("task_instance", task_instance_id))?;
        if !from.contains(&instance.status) || instance.heartbeat_at >= older_than {
            return Ok(false);
        }
        instance.status = TaskInstanceStatus::NoHeartbeat;
        instance.status_date = Utc::now();
        Ok(true)
    }

    async fn insert_task_resources(
        &self,
        resources: NewTaskResources,
    ) -> StoreResult<TaskResources> {
        self.tables.lock().insert_task_resources(resources)
    }

    async fn list_task_resources(&self, task_id: i64) -> StoreResult<Vec<TaskResources>> {
        let tables = self.tables.lock();
        Ok(tables
            .task_resources
            .values()
            .filter(|resources| resources.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn latest_task_resources(
        &self,
        task_ids: &[i64],
    ) -> StoreResult<HashMap<i64, TaskResources>> {
        let tables = self.tables.lock();
        Ok(task_ids
            .iter()
            .filter_map(|task_id| {
                tables
                    .latest_resources(*task_id)
                    .map(|resources| (*task_id, resources.clone()))
            })
            .collect())
    }
}
