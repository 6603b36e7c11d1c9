//! # Persistent Store Adapter
//!
//! The store is the only shared mutable resource between agents. Every state
//! write is a conditional update of the form
//! `SET status = X WHERE id = I AND status IN (S)` and reports whether it was
//! applied, so concurrent writers fail closed and the loser simply observes
//! the new state on its next read.
//!
//! ## Key Components
//!
//! - [`Store`] - the adapter contract
//! - [`memory::InMemoryStore`] - all tables behind one mutex; used by tests and local runs
//! - [`postgres::PgStore`] - sqlx + migrations, `SELECT ... FOR UPDATE` row locks
//! - [`retry::with_retry`] - exponential backoff for retryable [`StoreError`]s

pub mod errors;
pub mod memory;
pub mod postgres;
pub mod retry;

pub use errors::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use retry::{with_retry, LoopBackoff};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::{
    BoundDag, Edge, InsertedWorkflow, InstanceClaim, InstanceUpdate, NewDag, NewTask,
    NewTaskResources, NewWorkflow, NewWorkflowBundle, NewWorkflowRun, Task, TaskInstance,
    TaskResources, Workflow, WorkflowRun,
};
use crate::state_machine::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};

#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    // DAGs -----------------------------------------------------------------

    /// Insert nodes, DAG and edges; idempotent on the DAG hash and node hashes
    async fn insert_dag(&self, dag: &NewDag) -> StoreResult<BoundDag>;

    async fn list_dag_edges(&self, dag_id: i64) -> StoreResult<Vec<Edge>>;

    // Workflows ------------------------------------------------------------

    async fn find_workflow_by_hash(&self, workflow_hash: &str) -> StoreResult<Option<Workflow>>;

    /// Fails with [`StoreError::Conflict`] when the hash already exists
    async fn insert_workflow(&self, workflow: NewWorkflow) -> StoreResult<Workflow>;

    /// Insert a workflow, its tasks and resources and its first run in one
    /// transaction. Fails with [`StoreError::Conflict`] without writing
    /// anything when the hash already exists.
    async fn insert_workflow_bundle(
        &self,
        bundle: NewWorkflowBundle,
    ) -> StoreResult<InsertedWorkflow>;

    async fn get_workflow(&self, workflow_id: i64) -> StoreResult<Workflow>;

    async fn transition_workflow(
        &self,
        workflow_id: i64,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> StoreResult<bool>;

    async fn set_workflow_concurrency(&self, workflow_id: i64, limit: u32) -> StoreResult<()>;

    async fn set_template_concurrency(
        &self,
        workflow_id: i64,
        task_template_version_id: i64,
        limit: u32,
    ) -> StoreResult<()>;

    // Workflow runs ----------------------------------------------------------

    /// Creates the run in REGISTERING. Fails with [`StoreError::Conflict`] while
    /// another run of the workflow is controlling.
    async fn insert_workflow_run(&self, run: NewWorkflowRun) -> StoreResult<WorkflowRun>;

    async fn get_workflow_run(&self, workflow_run_id: i64) -> StoreResult<WorkflowRun>;

    async fn list_workflow_runs(&self, workflow_id: i64) -> StoreResult<Vec<WorkflowRun>>;

    async fn transition_workflow_run(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> StoreResult<bool>;

    /// Applied only while the run is controlling
    async fn heartbeat_workflow_run(
        &self,
        workflow_run_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Non-terminal runs whose heartbeat is older than `older_than`
    async fn find_stale_workflow_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<WorkflowRun>>;

    /// Compare-and-swap on status and heartbeat age
    async fn reap_workflow_run_if_stale(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // Tasks ----------------------------------------------------------------

    /// Insert tasks; rows whose `(workflow_id, task_hash)` already exist are
    /// returned unchanged
    async fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>>;

    async fn get_task(&self, task_id: i64) -> StoreResult<Task>;

    async fn list_tasks(&self, workflow_id: i64) -> StoreResult<Vec<Task>>;

    /// `reset_attempts` zeroes the attempt counter together with the status change
    async fn transition_task(
        &self,
        task_id: i64,
        from: &[TaskStatus],
        to: TaskStatus,
        reset_attempts: bool,
    ) -> StoreResult<bool>;

    /// Atomically move the task from one of `from` to ADJUSTING_RESOURCES and
    /// append `resources`. `None` when the status no longer matched.
    async fn adjust_task_resources(
        &self,
        from: &[TaskStatus],
        resources: NewTaskResources,
    ) -> StoreResult<Option<TaskResources>>;

    /// Atomically: lock the task, require QUEUED or ADJUSTING_RESOURCES and no
    /// active instance, insert a QUEUED instance on the latest resources row,
    /// move the task to INSTANTIATING and count the attempt. `None` when the
    /// task is not claimable.
    async fn claim_task_instance(&self, claim: InstanceClaim)
        -> StoreResult<Option<TaskInstance>>;

    // Task instances ---------------------------------------------------------

    async fn get_task_instance(&self, task_instance_id: i64) -> StoreResult<TaskInstance>;

    /// All instances of a task, oldest first
    async fn list_task_instances(&self, task_id: i64) -> StoreResult<Vec<TaskInstance>>;

    /// Instances of a workflow (any run) in the given statuses; empty means all
    async fn list_workflow_instances(
        &self,
        workflow_id: i64,
        statuses: &[TaskInstanceStatus],
    ) -> StoreResult<Vec<TaskInstance>>;

    /// The newest instance of every task of the workflow that has one
    async fn latest_task_instances(&self, workflow_id: i64) -> StoreResult<Vec<TaskInstance>>;

    async fn transition_task_instance(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        to: TaskInstanceStatus,
        update: InstanceUpdate,
    ) -> StoreResult<bool>;

    /// Applied only while the instance is active
    async fn heartbeat_task_instance(
        &self,
        task_instance_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn find_stale_task_instances(
        &self,
        statuses: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TaskInstance>>;

    /// Compare-and-swap to NO_HEARTBEAT on status and heartbeat age
    async fn reap_task_instance_if_stale(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // Task resources -----------------------------------------------------------

    /// Append-only: rows are never updated
    async fn insert_task_resources(&self, resources: NewTaskResources)
        -> StoreResult<TaskResources>;

    /// Resource history of a task, oldest first
    async fn list_task_resources(&self, task_id: i64) -> StoreResult<Vec<TaskResources>>;

    /// Newest resources row per task
    async fn latest_task_resources(
        &self,
        task_ids: &[i64],
    ) -> StoreResult<HashMap<i64, TaskResources>>;
}
