//! A [`Store`] that delegates to an [`InMemoryStore`] and fails chosen calls.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use taskswarm::database::{InMemoryStore, Store, StoreError, StoreResult};
use taskswarm::models::{
    BoundDag, Edge, InsertedWorkflow, InstanceClaim, InstanceUpdate, NewDag, NewTask,
    NewTaskResources, NewWorkflow, NewWorkflowBundle, NewWorkflowRun, Task, TaskInstance,
    TaskResources, Workflow, WorkflowRun,
};
use taskswarm::state_machine::{
    TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus,
};

#[derive(Debug)]
pub struct FlakyStore {
    inner: Arc<InMemoryStore>,
    faults: Mutex<HashMap<&'static str, VecDeque<StoreError>>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `count` calls of `operation` with `error()`
    pub fn fail_next(&self, operation: &'static str, count: usize, error: impl Fn() -> StoreError) {
        self.faults
            .lock()
            .entry(operation)
            .or_default()
            .extend((0..count).map(|_| error()));
    }

    /// Failures queued for `operation` that no call has consumed yet
    pub fn pending(&self, operation: &str) -> usize {
        self.faults.lock().get(operation).map_or(0, VecDeque::len)
    }

    fn trip(&self, operation: &'static str) -> StoreResult<()> {
        match self
            .faults
            .lock()
            .get_mut(operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub fn lock_contention() -> StoreError {
    StoreError::LockContention("could not obtain lock on row".into())
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_dag(&self, dag: &NewDag) -> StoreResult<BoundDag> {
        self.trip("insert_dag")?;
        self.inner.insert_dag(dag).await
    }

    async fn list_dag_edges(&self, dag_id: i64) -> StoreResult<Vec<Edge>> {
        self.trip("list_dag_edges")?;
        self.inner.list_dag_edges(dag_id).await
    }

    async fn find_workflow_by_hash(&self, workflow_hash: &str) -> StoreResult<Option<Workflow>> {
        self.trip("find_workflow_by_hash")?;
        self.inner.find_workflow_by_hash(workflow_hash).await
    }

    async fn insert_workflow(&self, workflow: NewWorkflow) -> StoreResult<Workflow> {
        self.trip("insert_workflow")?;
        self.inner.insert_workflow(workflow).await
    }

    async fn insert_workflow_bundle(
        &self,
        bundle: NewWorkflowBundle,
    ) -> StoreResult<InsertedWorkflow> {
        self.trip("insert_workflow_bundle")?;
        self.inner.insert_workflow_bundle(bundle).await
    }

    async fn get_workflow(&self, workflow_id: i64) -> StoreResult<Workflow> {
        self.trip("get_workflow")?;
        self.inner.get_workflow(workflow_id).await
    }

    async fn transition_workflow(
        &self,
        workflow_id: i64,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> StoreResult<bool> {
        self.trip("transition_workflow")?;
        self.inner.transition_workflow(workflow_id, from, to).await
    }

    async fn set_workflow_concurrency(&self, workflow_id: i64, limit: u32) -> StoreResult<()> {
        self.trip("set_workflow_concurrency")?;
        self.inner.set_workflow_concurrency(workflow_id, limit).await
    }

    async fn set_template_concurrency(
        &self,
        workflow_id: i64,
        task_template_version_id: i64,
        limit: u32,
    ) -> StoreResult<()> {
        self.trip("set_template_concurrency")?;
        self.inner
            .set_template_concurrency(workflow_id, task_template_version_id, limit)
            .await
    }

    async fn insert_workflow_run(&self, run: NewWorkflowRun) -> StoreResult<WorkflowRun> {
        self.trip("insert_workflow_run")?;
        self.inner.insert_workflow_run(run).await
    }

    async fn get_workflow_run(&self, workflow_run_id: i64) -> StoreResult<WorkflowRun> {
        self.trip("get_workflow_run")?;
        self.inner.get_workflow_run(workflow_run_id).await
    }

    async fn list_workflow_runs(&self, workflow_id: i64) -> StoreResult<Vec<WorkflowRun>> {
        self.trip("list_workflow_runs")?;
        self.inner.list_workflow_runs(workflow_id).await
    }

    async fn transition_workflow_run(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> StoreResult<bool> {
        self.trip("transition_workflow_run")?;
        self.inner
            .transition_workflow_run(workflow_run_id, from, to)
            .await
    }

    async fn heartbeat_workflow_run(
        &self,
        workflow_run_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.trip("heartbeat_workflow_run")?;
        self.inner.heartbeat_workflow_run(workflow_run_id, at).await
    }

    async fn find_stale_workflow_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<WorkflowRun>> {
        self.trip("find_stale_workflow_runs")?;
        self.inner.find_stale_workflow_runs(older_than, limit).await
    }

    async fn reap_workflow_run_if_stale(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.trip("reap_workflow_run_if_stale")?;
        self.inner
            .reap_workflow_run_if_stale(workflow_run_id, from, to, older_than)
            .await
    }

    async fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        self.trip("insert_tasks")?;
        self.inner.insert_tasks(tasks).await
    }

    async fn get_task(&self, task_id: i64) -> StoreResult<Task> {
        self.trip("get_task")?;
        self.inner.get_task(task_id).await
    }

    async fn list_tasks(&self, workflow_id: i64) -> StoreResult<Vec<Task>> {
        self.trip("list_tasks")?;
        self.inner.list_tasks(workflow_id).await
    }

    async fn transition_task(
        &self,
        task_id: i64,
        from: &[TaskStatus],
        to: TaskStatus,
        reset_attempts: bool,
    ) -> StoreResult<bool> {
        self.trip("transition_task")?;
        self.inner
            .transition_task(task_id, from, to, reset_attempts)
            .await
    }

    async fn adjust_task_resources(
        &self,
        from: &[TaskStatus],
        resources: NewTaskResources,
    ) -> StoreResult<Option<TaskResources>> {
        self.trip("adjust_task_resources")?;
        self.inner.adjust_task_resources(from, resources).await
    }

    async fn claim_task_instance(
        &self,
        claim: InstanceClaim,
    ) -> StoreResult<Option<TaskInstance>> {
        self.trip("claim_task_instance")?;
        self.inner.claim_task_instance(claim).await
    }

    async fn get_task_instance(&self, task_instance_id: i64) -> StoreResult<TaskInstance> {
        self.trip("get_task_instance")?;
        self.inner.get_task_instance(task_instance_id).await
    }

    async fn list_task_instances(&self, task_id: i64) -> StoreResult<Vec<TaskInstance>> {
        self.trip("list_task_instances")?;
        self.inner.list_task_instances(task_id).await
    }

    async fn list_workflow_instances(
        &self,
        workflow_id: i64,
        statuses: &[TaskInstanceStatus],
    ) -> StoreResult<Vec<TaskInstance>> {
        self.trip("list_workflow_instances")?;
        self.inner
            .list_workflow_instances(workflow_id, statuses)
            .await
    }

    async fn latest_task_instances(&self, workflow_id: i64) -> StoreResult<Vec<TaskInstance>> {
        self.trip("latest_task_instances")?;
        self.inner.latest_task_instances(workflow_id).await
    }

    async fn transition_task_instance(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        to: TaskInstanceStatus,
        update: InstanceUpdate,
    ) -> StoreResult<bool> {
        self.trip("transition_task_instance")?;
        self.inner
            .transition_task_instance(task_instance_id, from, to, update)
            .await
    }

    async fn heartbeat_task_instance(
        &self,
        task_instance_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.trip("heartbeat_task_instance")?;
        self.inner.heartbeat_task_instance(task_instance_id, at).await
    }

    async fn find_stale_task_instances(
        &self,
        statuses: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TaskInstance>> {
        self.trip("find_stale_task_instances")?;
        self.inner
            .find_stale_task_instances(statuses, older_than, limit)
            .await
    }

    async fn reap_task_instance_if_stale(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.trip("reap_task_instance_if_stale")?;
        self.inner
            .reap_task_instance_if_stale(task_instance_id, from, older_than)
            .await
    }

    async fn insert_task_resources(
        &self,
        resources: NewTaskResources,
    ) -> StoreResult<TaskResources> {
        self.trip("insert_task_resources")?;
        self.inner.insert_task_resources(resources).await
    }

    async fn list_task_resources(&self, task_id: i64) -> StoreResult<Vec<TaskResources>> {
        self.trip("list_task_resources")?;
        self.inner.list_task_resources(task_id).await
    }

    async fn latest_task_resources(
        &self,
        task_ids: &[i64],
    ) -> StoreResult<HashMap<i64, TaskResources>> {
        self.trip("latest_task_resources")?;
        self.inner.latest_task_resources(task_ids).await
    }
}
