//! PostgreSQL [`Store`] implementation.
//!
//! Conditional updates are single `UPDATE ... WHERE status = ANY($n)` statements;
//! the claim path locks the task row with `SELECT ... FOR UPDATE`. Partial unique
//! indexes back the one-controlling-run and one-active-instance invariants.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, instrument};

use super::{Store, StoreError, StoreResult};
use crate::config::DatabaseConfig;
use crate::models::{
    BoundDag, Dag, Edge, InsertedWorkflow, InstanceClaim, InstanceUpdate, NewDag, NewTask,
    NewTaskResources, NewWorkflow, NewWorkflowBundle, NewWorkflowRun, ResumeType, Task,
    TaskInstance, TaskResources, Workflow, WorkflowRun,
};
use crate::resources::{AdjustmentRecord, ResourceScale};
use crate::state_machine::registry::Status;
use crate::state_machine::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

const WORKFLOW_COLUMNS: &str = "workflow_id, workflow_hash, tool_version_id, dag_id, name, \
     workflow_args, status, max_concurrently_running, template_concurrency, created_at, status_date";
const RUN_COLUMNS: &str =
    "workflow_run_id, workflow_id, \"user\", status, resume_type, heartbeat_at, created_at, status_date";
const TASK_COLUMNS: &str = "task_id, workflow_id, node_id, task_hash, name, command, \
     task_template_version_id, status, max_attempts, num_attempts, resource_scales, \
     fallback_queues, status_date";
const INSTANCE_COLUMNS: &str = "task_instance_id, task_id, workflow_id, workflow_run_id, \
     task_resources_id, status, batch_key, distributor_id, nodename, exit_code, error_log, \
     exceeded_resources, heartbeat_at, created_at, status_date";
const RESOURCES_COLUMNS: &str =
    "task_resources_id, task_id, kind, queue, resource_values, adjustments, created_at";

fn codes<S: Status>(statuses: &[S]) -> Vec<String> {
    statuses.iter().map(|status| status.code().to_string()).collect()
}

fn parse_status<S: Status>(code: &str) -> StoreResult<S> {
    S::all()
        .iter()
        .copied()
        .find(|status| code.len() == 1 && code.starts_with(status.code()))
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown {} status {code}", S::ENTITY)))
}

fn to_u32(value: i32, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::CorruptRow(format!("{column} = {value}")))
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    workflow_id: i64,
    workflow_hash: String,
    tool_version_id: i64,
    dag_id: i64,
    name: String,
    workflow_args: Json<BTreeMap<String, String>>,
    status: String,
    max_concurrently_running: i32,
    template_concurrency: Json<BTreeMap<i64, u32>>,
    created_at: DateTime<Utc>,
    status_date: DateTime<Utc>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = StoreError;

    fn try_from(row: WorkflowRow) -> StoreResult<Self> {
        Ok(Self {
            workflow_id: row.workflow_id,
            workflow_hash: row.workflow_hash,
            tool_version_id: row.tool_version_id,
            dag_id: row.dag_id,
            name: row.name,
            workflow_args: row.workflow_args.0,
            status: parse_status(&row.status)?,
            max_concurrently_running: to_u32(
                row.max_concurrently_running,
                "max_concurrently_running",
            )?,
            template_concurrency: row.template_concurrency.0,
            created_at: row.created_at,
            status_date: row.status_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    workflow_run_id: i64,
    workflow_id: i64,
    user: String,
    status: String,
    resume_type: Option<String>,
    heartbeat_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    status_date: DateTime<Utc>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> StoreResult<Self> {
        let resume_type = row
            .resume_type
            .map(|value| value.parse::<ResumeType>().map_err(StoreError::CorruptRow))
            .transpose()?;
        Ok(Self {
            workflow_run_id: row.workflow_run_id,
            workflow_id: row.workflow_id,
            user: row.user,
            status: parse_status(&row.status)?,
            resume_type,
            heartbeat_at: row.heartbeat_at,
            created_at: row.created_at,
            status_date: row.status_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    task_id: i64,
    workflow_id: i64,
    node_id: i64,
    task_hash: String,
    name: String,
    command: String,
    task_template_version_id: i64,
    status: String,
    max_attempts: i32,
    num_attempts: i32,
    resource_scales: Json<BTreeMap<String, ResourceScale>>,
    fallback_queues: Vec<String>,
    status_date: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> StoreResult<Self> {
        Ok(Self {
            task_id: row.task_id,
            workflow_id: row.workflow_id,
            node_id: row.node_id,
            task_hash: row.task_hash,
            name: row.name,
            command: row.command,
            task_template_version_id: row.task_template_version_id,
            status: parse_status(&row.status)?,
            max_attempts: to_u32(row.max_attempts, "max_attempts")?,
            num_attempts: to_u32(row.num_attempts, "num_attempts")?,
            resource_scales: row.resource_scales.0,
            fallback_queues: row.fallback_queues,
            status_date: row.status_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    task_instance_id: i64,
    task_id: i64,
    workflow_id: i64,
    workflow_run_id: i64,
    task_resources_id: i64,
    status: String,
    batch_key: String,
    distributor_id: Option<String>,
    nodename: Option<String>,
    exit_code: Option<i32>,
    error_log: Option<String>,
    exceeded_resources: Vec<String>,
    heartbeat_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    status_date: DateTime<Utc>,
}

impl TryFrom<InstanceRow> for TaskInstance {
    type Error = StoreError;

    fn try_from(row: InstanceRow) -> StoreResult<Self> {
        Ok(Self {
            task_instance_id: row.task_instance_id,
            task_id: row.task_id,
            workflow_id: row.workflow_id,
            workflow_run_id: row.workflow_run_id,
            task_resources_id: row.task_resources_id,
            status: parse_status(&row.status)?,
            batch_key: row.batch_key,
            distributor_id: row.distributor_id,
            nodename: row.nodename,
            exit_code: row.exit_code,
            error_log: row.error_log,
            exceeded_resources: row.exceeded_resources,
            heartbeat_at: row.heartbeat_at,
            created_at: row.created_at,
            status_date: row.status_date,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResourcesRow {
    task_resources_id: i64,
    task_id: i64,
    kind: String,
    queue: String,
    resource_values: Json<BTreeMap<String, f64>>,
    adjustments: Json<Vec<AdjustmentRecord>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ResourcesRow> for TaskResources {
    type Error = StoreError;

    fn try_from(row: ResourcesRow) -> StoreResult<Self> {
        Ok(Self {
            task_resources_id: row.task_resources_id,
            task_id: row.task_id,
            kind: row.kind.parse().map_err(StoreError::CorruptRow)?,
            queue: row.queue,
            values: row.resource_values.0,
            adjustments: row.adjustments.0,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(err.into()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> StoreResult<bool> {
        let value: i32 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(value == 1)
    }

    /// Turn a zero-row conditional update into `Ok(false)` or `NotFound`
    async fn applied_or_missing(
        &self,
        rows_affected: u64,
        table: &str,
        id_column: &str,
        entity: &'static str,
        id: i64,
    ) -> StoreResult<bool> {
        if rows_affected > 0 {
            return Ok(true);
        }
        let exists: Option<i64> =
            sqlx::query_scalar(&format!("SELECT {id_column} FROM {table} WHERE {id_column} = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::not_found(entity, id)),
        }
    }

    async fn upsert_node_ids(
        tx: &mut Transaction<'_, Postgres>,
        dag: &NewDag,
    ) -> StoreResult<HashMap<String, i64>> {
        let mut node_ids = HashMap::with_capacity(dag.nodes.len());
        for node in &dag.nodes {
            let node_id: i64 = sqlx::query_scalar(
                "INSERT INTO nodes (node_hash, task_template_version_id, node_args) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (node_hash) DO UPDATE SET node_hash = EXCLUDED.node_hash \
                 RETURNING node_id",
            )
            .bind(&node.node_hash)
            .bind(node.task_template_version_id)
            .bind(Json(&node.node_args))
            .fetch_one(&mut **tx)
            .await?;
            node_ids.insert(node.node_hash.clone(), node_id);
        }
        Ok(node_ids)
    }

    async fn insert_workflow_row(
        conn: &mut PgConnection,
        workflow: &NewWorkflow,
    ) -> StoreResult<Workflow> {
        let row: WorkflowRow = sqlx::query_as(&format!(
            "INSERT INTO workflows (workflow_hash, tool_version_id, dag_id, name, workflow_args, \
             max_concurrently_running, template_concurrency) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {WORKFLOW_COLUMNS}"
        ))
        .bind(&workflow.workflow_hash)
        .bind(workflow.tool_version_id)
        .bind(workflow.dag_id)
        .bind(&workflow.name)
        .bind(Json(&workflow.workflow_args))
        .bind(workflow.max_concurrently_running as i32)
        .bind(Json(&workflow.template_concurrency))
        .fetch_one(&mut *conn)
        .await?;
        row.try_into()
    }

    async fn insert_run_row(
        conn: &mut PgConnection,
        run: &NewWorkflowRun,
    ) -> StoreResult<WorkflowRun> {
        let row: RunRow = sqlx::query_as(&format!(
            "INSERT INTO workflow_runs (workflow_id, \"user\", resume_type) \
             VALUES ($1, $2, $3) RETURNING {RUN_COLUMNS}"
        ))
        .bind(run.workflow_id)
        .bind(&run.user)
        .bind(run.resume_type.map(|resume| resume.to_string()))
        .fetch_one(&mut *conn)
        .await?;
        row.try_into()
    }

    /// Returns the existing row when `(workflow_id, task_hash)` is taken
    async fn insert_task_row(conn: &mut PgConnection, task: &NewTask) -> StoreResult<Task> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "INSERT INTO tasks (workflow_id, node_id, task_hash, name, command, \
             task_template_version_id, max_attempts, resource_scales, fallback_queues) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (workflow_id, task_hash) DO NOTHING RETURNING {TASK_COLUMNS}"
        ))
        .bind(task.workflow_id)
        .bind(task.node_id)
        .bind(&task.task_hash)
        .bind(&task.name)
        .bind(&task.command)
        .bind(task.task_template_version_id)
        .bind(task.max_attempts as i32)
        .bind(Json(&task.resource_scales))
        .bind(&task.fallback_queues)
        .fetch_optional(&mut *conn)
        .await?;
        let row = match row {
            Some(row) => row,
            None => {
                sqlx::query_as(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE workflow_id = $1 AND task_hash = $2"
                ))
                .bind(task.workflow_id)
                .bind(&task.task_hash)
                .fetch_one(&mut *conn)
                .await?
            }
        };
        row.try_into()
    }

    async fn insert_resources_row(
        conn: &mut PgConnection,
        resources: &NewTaskResources,
    ) -> StoreResult<TaskResources> {
        let row: ResourcesRow = sqlx::query_as(&format!(
            "INSERT INTO task_resources (task_id, kind, queue, resource_values, adjustments) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {RESOURCES_COLUMNS}"
        ))
        .bind(resources.task_id)
        .bind(resources.kind.to_string())
        .bind(&resources.queue)
        .bind(Json(&resources.values))
        .bind(Json(&resources.adjustments))
        .fetch_one(&mut *conn)
        .await?;
        row.try_into()
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, dag), fields(dag_hash = %dag.dag_hash))]
    async fn insert_dag(&self, dag: &NewDag) -> StoreResult<BoundDag> {
        let mut tx = self.pool.begin().await?;
        let node_ids = Self::upsert_node_ids(&mut tx, dag).await?;

        let inserted: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
            "INSERT INTO dags (dag_hash) VALUES ($1) \
             ON CONFLICT (dag_hash) DO NOTHING RETURNING dag_id, created_at",
        )
        .bind(&dag.dag_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let (dag_id, created_at) = match inserted {
            Some(row) => {
                for edge in &dag.edges {
                    let upstream = node_ids
                        .get(&edge.upstream_node_hash)
                        .copied()
                        .ok_or_else(|| StoreError::not_found("node", &edge.upstream_node_hash))?;
                    let downstream = node_ids
                        .get(&edge.downstream_node_hash)
                        .copied()
                        .ok_or_else(|| {
                            StoreError::not_found("node", &edge.downstream_node_hash)
                        })?;
                    sqlx::query(
                        "INSERT INTO edges (dag_id, upstream_node_id, downstream_node_id) \
                         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                    )
                    .bind(row.0)
                    .bind(upstream)
                    .bind(downstream)
                    .execute(&mut *tx)
                    .await?;
                }
                row
            }
            None => {
                sqlx::query_as("SELECT dag_id, created_at FROM dags WHERE dag_hash = $1")
                    .bind(&dag.dag_hash)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };
        tx.commit().await?;

        debug!(dag_id = dag_id, nodes = node_ids.len(), "DAG bound");
        Ok(BoundDag {
            dag: Dag {
                dag_id,
                dag_hash: dag.dag_hash.clone(),
                created_at,
            },
            node_ids,
        })
    }

    async fn list_dag_edges(&self, dag_id: i64) -> StoreResult<Vec<Edge>> {
        let rows: Vec<(i64, i64, i64)> = sqlx::query_as(
            "SELECT dag_id, upstream_node_id, downstream_node_id FROM edges \
             WHERE dag_id = $1 ORDER BY upstream_node_id, downstream_node_id",
        )
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(dag_id, upstream_node_id, downstream_node_id)| Edge {
                dag_id,
                upstream_node_id,
                downstream_node_id,
            })
            .collect())
    }

    async fn find_workflow_by_hash(&self, workflow_hash: &str) -> StoreResult<Option<Workflow>> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE workflow_hash = $1"
        ))
        .bind(workflow_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Workflow::try_from).transpose()
    }

    async fn insert_workflow(&self, workflow: NewWorkflow) -> StoreResult<Workflow> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_workflow_row(&mut conn, &workflow).await
    }

    #[instrument(skip(self, bundle), fields(workflow_hash = %bundle.workflow.workflow_hash, tasks = bundle.tasks.len()))]
    async fn insert_workflow_bundle(
        &self,
        bundle: NewWorkflowBundle,
    ) -> StoreResult<InsertedWorkflow> {
        let mut tx = self.pool.begin().await?;
        let workflow = Self::insert_workflow_row(&mut tx, &bundle.workflow).await?;
        let mut tasks = Vec::with_capacity(bundle.tasks.len());
        for bound in bundle.tasks {
            let task = Self::insert_task_row(
                &mut tx,
                &NewTask {
                    workflow_id: workflow.workflow_id,
                    ..bound.task
                },
            )
            .await?;
            for resources in bound.resources {
                Self::insert_resources_row(
                    &mut tx,
                    &NewTaskResources {
                        task_id: task.task_id,
                        ..resources
                    },
                )
                .await?;
            }
            tasks.push(task);
        }
        let workflow_run = Self::insert_run_row(
            &mut tx,
            &NewWorkflowRun {
                workflow_id: workflow.workflow_id,
                user: bundle.user,
                resume_type: None,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(InsertedWorkflow {
            workflow,
            tasks,
            workflow_run,
        })
    }

    async fn get_workflow(&self, workflow_id: i64) -> StoreResult<Workflow> {
        let row: Option<WorkflowRow> = sqlx::query_as(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE workflow_id = $1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found("workflow", workflow_id))?
            .try_into()
    }

    async fn transition_workflow(
        &self,
        workflow_id: i64,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflows SET status = $1, status_date = now() \
             WHERE workflow_id = $2 AND status = ANY($3)",
        )
        .bind(to.code().to_string())
        .bind(workflow_id)
        .bind(codes(from))
        .execute(&self.pool)
        .await?;
        self.applied_or_missing(
            result.rows_affected(),
            "workflows",
            "workflow_id",
            "workflow",
            workflow_id,
        )
        .await
    }

    async fn set_workflow_concurrency(&self, workflow_id: i64, limit: u32) -> StoreResult<()> {
        let result =
            sqlx::query("UPDATE workflows SET max_concurrently_running = $1 WHERE workflow_id = $2")
                .bind(limit as i32)
                .bind(workflow_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("workflow", workflow_id));
        }
        Ok(())
    }

    async fn set_template_concurrency(
        &self,
        workflow_id: i64,
        task_template_version_id: i64,
        limit: u32,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE workflows \
             SET template_concurrency = template_concurrency || jsonb_build_object($1::text, $2::int) \
             WHERE workflow_id = $3",
        )
        .bind(task_template_version_id.to_string())
        .bind(limit as i32)
        .bind(workflow_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("workflow", workflow_id));
        }
        Ok(())
    }

    async fn insert_workflow_run(&self, run: NewWorkflowRun) -> StoreResult<WorkflowRun> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_run_row(&mut conn, &run).await
    }

    async fn get_workflow_run(&self, workflow_run_id: i64) -> StoreResult<WorkflowRun> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_run_id = $1"
        ))
        .bind(workflow_run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found("workflow_run", workflow_run_id))?
            .try_into()
    }

    async fn list_workflow_runs(&self, workflow_id: i64) -> StoreResult<Vec<WorkflowRun>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = $1 ORDER BY workflow_run_id"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn transition_workflow_run(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = $1, status_date = now(), \
             heartbeat_at = CASE WHEN $4 THEN now() ELSE heartbeat_at END \
             WHERE workflow_run_id = $2 AND status = ANY($3)",
        )
        .bind(to.code().to_string())
        .bind(workflow_run_id)
        .bind(codes(from))
        .bind(!to.is_terminal())
        .execute(&self.pool)
        .await?;
        self.applied_or_missing(
            result.rows_affected(),
            "workflow_runs",
            "workflow_run_id",
            "workflow_run",
            workflow_run_id,
        )
        .await
    }

    async fn heartbeat_workflow_run(
        &self,
        workflow_run_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET heartbeat_at = $1 \
             WHERE workflow_run_id = $2 AND status = ANY($3)",
        )
        .bind(at)
        .bind(workflow_run_id)
        .bind(codes(WorkflowRunStatus::CONTROLLING))
        .execute(&self.pool)
        .await?;
        self.applied_or_missing(
            result.rows_affected(),
            "workflow_runs",
            "workflow_run_id",
            "workflow_run",
            workflow_run_id,
        )
        .await
    }

    async fn find_stale_workflow_runs(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<WorkflowRun>> {
        let non_terminal: Vec<WorkflowRunStatus> = WorkflowRunStatus::ALL
            .iter()
            .copied()
            .filter(|status| !status.is_terminal())
            .collect();
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs \
             WHERE status = ANY($1) AND heartbeat_at < $2 \
             ORDER BY heartbeat_at LIMIT $3"
        ))
        .bind(codes(&non_terminal))
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn reap_workflow_run_if_stale(
        &self,
        workflow_run_id: i64,
        from: &[WorkflowRunStatus],
        to: WorkflowRunStatus,
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = $1, status_date = now() \
             WHERE workflow_run_id = $2 AND status = ANY($3) AND heartbeat_at < $4",
        )
        .bind(to.code().to_string())
        .bind(workflow_run_id)
        .bind(codes(from))
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_tasks(&self, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(tasks.len());
        for task in &tasks {
            inserted.push(Self::insert_task_row(&mut tx, task).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_task(&self, task_id: i64) -> StoreResult<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = $1"))
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| StoreError::not_found("task", task_id))?
            .try_into()
    }

    async fn list_tasks(&self, workflow_id: i64) -> StoreResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE workflow_id = $1 ORDER BY task_id"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn transition_task(
        &self,
        task_id: i64,
        from: &[TaskStatus],
        to: TaskStatus,
        reset_attempts: bool,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE tasks SET status = $1, status_date = now(), \
             num_attempts = CASE WHEN $4 THEN 0 ELSE num_attempts END \
             WHERE task_id = $2 AND status = ANY($3)",
        )
        .bind(to.code().to_string())
        .bind(task_id)
        .bind(codes(from))
        .bind(reset_attempts)
        .execute(&self.pool)
        .await?;
        self.applied_or_missing(result.rows_affected(), "tasks", "task_id", "task", task_id)
            .await
    }

    async fn adjust_task_resources(
        &self,
        from: &[TaskStatus],
        resources: NewTaskResources,
    ) -> StoreResult<Option<TaskResources>> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE tasks SET status = $1, status_date = now() \
             WHERE task_id = $2 AND status = ANY($3)",
        )
        .bind(TaskStatus::AdjustingResources.code().to_string())
        .bind(resources.task_id)
        .bind(codes(from))
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            self.applied_or_missing(0, "tasks", "task_id", "task", resources.task_id)
                .await?;
            return Ok(None);
        }
        let row = Self::insert_resources_row(&mut tx, &resources).await?;
        tx.commit().await?;
        Ok(Some(row))
    }

    #[instrument(skip(self, claim), fields(task_id = claim.task_id, workflow_run_id = claim.workflow_run_id))]
    async fn claim_task_instance(
        &self,
        claim: InstanceClaim,
    ) -> StoreResult<Option<TaskInstance>> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<(String, i64)> =
            sqlx::query_as("SELECT status, workflow_id FROM tasks WHERE task_id = $1 FOR UPDATE")
                .bind(claim.task_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (status, workflow_id) =
            locked.ok_or_else(|| StoreError::not_found("task", claim.task_id))?;
        let status: TaskStatus = parse_status(&status)?;
        if !TaskStatus::CLAIMABLE.contains(&status) {
            return Ok(None);
        }

        let active: Option<i64> = sqlx::query_scalar(
            "SELECT task_instance_id FROM task_instances \
             WHERE task_id = $1 AND status = ANY($2) LIMIT 1",
        )
        .bind(claim.task_id)
        .bind(codes(TaskInstanceStatus::ACTIVE))
        .fetch_optional(&mut *tx)
        .await?;
        if active.is_some() {
            return Ok(None);
        }

        let task_resources_id: Option<i64> = sqlx::query_scalar(
            "SELECT task_resources_id FROM task_resources WHERE task_id = $1 \
             ORDER BY task_resources_id DESC LIMIT 1",
        )
        .bind(claim.task_id)
        .fetch_optional(&mut *tx)
        .await?;
        let task_resources_id = task_resources_id
            .ok_or_else(|| StoreError::not_found("task_resources", claim.task_id))?;

        let row: InstanceRow = sqlx::query_as(&format!(
            "INSERT INTO task_instances (task_id, workflow_id, workflow_run_id, task_resources_id, \
             status, batch_key) VALUES ($1, $2, $3, $4, $5, $6) RETURNING {INSTANCE_COLUMNS}"
        ))
        .bind(claim.task_id)
        .bind(workflow_id)
        .bind(claim.workflow_run_id)
        .bind(task_resources_id)
        .bind(TaskInstanceStatus::Queued.code().to_string())
        .bind(&claim.batch_key)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tasks SET status = $1, num_attempts = num_attempts + 1, status_date = now() \
             WHERE task_id = $2",
        )
        .bind(TaskStatus::Instantiating.code().to_string())
        .bind(claim.task_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(row.try_into()?))
    }

    async fn get_task_instance(&self, task_instance_id: i64) -> StoreResult<TaskInstance> {
        let row: Option<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE task_instance_id = $1"
        ))
        .bind(task_instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::not_found("task_instance", task_instance_id))?
            .try_into()
    }

    async fn list_task_instances(&self, task_id: i64) -> StoreResult<Vec<TaskInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE task_id = $1 \
             ORDER BY task_instance_id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_workflow_instances(
        &self,
        workflow_id: i64,
        statuses: &[TaskInstanceStatus],
    ) -> StoreResult<Vec<TaskInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances \
             WHERE workflow_id = $1 AND (cardinality($2::text[]) = 0 OR status = ANY($2)) \
             ORDER BY task_instance_id"
        ))
        .bind(workflow_id)
        .bind(codes(statuses))
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn latest_task_instances(&self, workflow_id: i64) -> StoreResult<Vec<TaskInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT DISTINCT ON (task_id) {INSTANCE_COLUMNS} FROM task_instances \
             WHERE workflow_id = $1 ORDER BY task_id, task_instance_id DESC"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn transition_task_instance(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        to: TaskInstanceStatus,
        update: InstanceUpdate,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE task_instances SET status = $1, status_date = now(), \
             heartbeat_at = CASE WHEN $4 THEN now() ELSE heartbeat_at END, \
             distributor_id = COALESCE($5, distributor_id), \
             nodename = COALESCE($6, nodename), \
             exit_code = COALESCE($7, exit_code), \
             error_log = COALESCE($8, error_log), \
             exceeded_resources = COALESCE($9, exceeded_resources) \
             WHERE task_instance_id = $2 AND status = ANY($3)",
        )
        .bind(to.code().to_string())
        .bind(task_instance_id)
        .bind(codes(from))
        .bind(to.is_active())
        .bind(update.distributor_id)
        .bind(update.nodename)
        .bind(update.exit_code)
        .bind(update.error_log)
        .bind(update.exceeded_resources)
        .execute(&self.pool)
        .await?;
        self.applied_or_missing(
            result.rows_affected(),
            "task_instances",
            "task_instance_id",
            "task_instance",
            task_instance_id,
        )
        .await
    }

    async fn heartbeat_task_instance(
        &self,
        task_instance_id: i64,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE task_instances SET heartbeat_at = $1 \
             WHERE task_instance_id = $2 AND status = ANY($3)",
        )
        .bind(at)
        .bind(task_instance_id)
        .bind(codes(TaskInstanceStatus::ACTIVE))
        .execute(&self.pool)
        .await?;
        self.applied_or_missing(
            result.rows_affected(),
            "task_instances",
            "task_instance_id",
            "task_instance",
            task_instance_id,
        )
        .await
    }

    async fn find_stale_task_instances(
        &self,
        statuses: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<TaskInstance>> {
        let rows: Vec<InstanceRow> = sqlx::query_as(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances \
             WHERE status = ANY($1) AND heartbeat_at < $2 ORDER BY heartbeat_at LIMIT $3"
        ))
        .bind(codes(statuses))
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn reap_task_instance_if_stale(
        &self,
        task_instance_id: i64,
        from: &[TaskInstanceStatus],
        older_than: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE task_instances SET status = $1, status_date = now() \
             WHERE task_instance_id = $2 AND status = ANY($3) AND heartbeat_at < $4",
        )
        .bind(TaskInstanceStatus::NoHeartbeat.code().to_string())
        .bind(task_instance_id)
        .bind(codes(from))
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_task_resources(
        &self,
        resources: NewTaskResources,
    ) -> StoreResult<TaskResources> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_resources_row(&mut conn, &resources).await
    }

    async fn list_task_resources(&self, task_id: i64) -> StoreResult<Vec<TaskResources>> {
        let rows: Vec<ResourcesRow> = sqlx::query_as(&format!(
            "SELECT {RESOURCES_COLUMNS} FROM task_resources WHERE task_id = $1 \
             ORDER BY task_resources_id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn latest_task_resources(
        &self,
        task_ids: &[i64],
    ) -> StoreResult<HashMap<i64, TaskResources>> {
        let rows: Vec<ResourcesRow> = sqlx::query_as(&format!(
            "SELECT DISTINCT ON (task_id) {RESOURCES_COLUMNS} FROM task_resources \
             WHERE task_id = ANY($1) ORDER BY task_id, task_resources_id DESC"
        ))
        .bind(task_ids)
        .fetch_all(&self.pool)
        .await?;
        let resources: Vec<TaskResources> = convert_all(rows)?;
        Ok(resources
            .into_iter()
            .map(|resources| (resources.task_id, resources))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NewNode, ResourceRecordKind};

    async fn seed(store: &PgStore) -> (WorkflowRun, Task) {
        let node = NewNode::new(1, BTreeMap::new());
        let bound = store
            .insert_dag(&NewDag {
                dag_hash: "pg-dag".into(),
                nodes: vec![node.clone()],
                edges: vec![],
            })
            .await
            .unwrap();
        let workflow = store
            .insert_workflow(NewWorkflow {
                workflow_hash: "pg-wf".into(),
                tool_version_id: 1,
                dag_id: bound.dag.dag_id,
                name: "pg".into(),
                workflow_args: BTreeMap::new(),
                max_concurrently_running: 5,
                template_concurrency: BTreeMap::new(),
            })
            .await
            .unwrap();
        let run = store
            .insert_workflow_run(NewWorkflowRun {
                workflow_id: workflow.workflow_id,
                user: "pg".into(),
                resume_type: None,
            })
            .await
            .unwrap();
        let task = store
            .insert_tasks(vec![NewTask {
                workflow_id: workflow.workflow_id,
                node_id: bound.node_ids[&node.node_hash],
                task_hash: "pg-task".into(),
                name: "pg-task".into(),
                command: "true".into(),
                task_template_version_id: 1,
                max_attempts: 2,
                resource_scales: BTreeMap::from([(
                    "memory".to_string(),
                    ResourceScale::Multiplicative(0.5),
                )]),
                fallback_queues: vec!["long.q".into()],
            }])
            .await
            .unwrap()
            .remove(0);
        store
            .insert_task_resources(NewTaskResources {
                task_id: task.task_id,
                kind: ResourceRecordKind::Validated,
                queue: "all.q".into(),
                values: BTreeMap::from([("memory".to_string(), 1.0)]),
                adjustments: vec![],
            })
            .await
            .unwrap();
        (run, task)
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_claim_and_conditional_update(pool: PgPool) {
        let store = PgStore::new(pool);
        let (run, task) = seed(&store).await;
        assert_eq!(task.fallback_queues, vec!["long.q".to_string()]);

        assert!(store
            .transition_task(task.task_id, &[TaskStatus::Registering], TaskStatus::Queued, false)
            .await
            .unwrap());
        let claim = InstanceClaim {
            task_id: task.task_id,
            workflow_run_id: run.workflow_run_id,
            batch_key: "b".into(),
        };
        let instance = store.claim_task_instance(claim.clone()).await.unwrap().unwrap();
        assert!(store.claim_task_instance(claim).await.unwrap().is_none());

        assert!(!store
            .transition_task_instance(
                instance.task_instance_id,
                &[TaskInstanceStatus::Running],
                TaskInstanceStatus::Done,
                InstanceUpdate::default(),
            )
            .await
            .unwrap());
        assert!(store
            .transition_task_instance(
                instance.task_instance_id,
                &[TaskInstanceStatus::Queued],
                TaskInstanceStatus::Instantiated,
                InstanceUpdate {
                    distributor_id: Some("job-9".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap());
        let stored = store.get_task_instance(instance.task_instance_id).await.unwrap();
        assert_eq!(stored.distributor_id.as_deref(), Some("job-9"));
        assert_eq!(store.get_task(task.task_id).await.unwrap().num_attempts, 1);
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_one_controlling_run_per_workflow(pool: PgPool) {
        let store = PgStore::new(pool);
        let (run, _) = seed(&store).await;
        let err = store
            .insert_workflow_run(NewWorkflowRun {
                workflow_id: run.workflow_id,
                user: "second".into(),
                resume_type: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_conflicting_bundle_rolls_back(pool: PgPool) {
        let store = PgStore::new(pool);
        let (run, task) = seed(&store).await;
        let workflow = store.get_workflow(run.workflow_id).await.unwrap();
        let bundle = NewWorkflowBundle {
            workflow: NewWorkflow {
                workflow_hash: workflow.workflow_hash.clone(),
                tool_version_id: 1,
                dag_id: workflow.dag_id,
                name: "pg".into(),
                workflow_args: BTreeMap::new(),
                max_concurrently_running: 5,
                template_concurrency: BTreeMap::new(),
            },
            tasks: vec![crate::models::NewBoundTask {
                task: NewTask {
                    workflow_id: 0,
                    node_id: task.node_id,
                    task_hash: "pg-other".into(),
                    name: "pg-other".into(),
                    command: "true".into(),
                    task_template_version_id: 1,
                    max_attempts: 1,
                    resource_scales: BTreeMap::new(),
                    fallback_queues: vec![],
                },
                resources: vec![],
            }],
            user: "pg".into(),
        };
        let err = store.insert_workflow_bundle(bundle).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.list_tasks(workflow.workflow_id).await.unwrap().len(), 1);
    }

    #[sqlx::test(migrator = "MIGRATOR")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_adjust_resources_requires_in_flight_status(pool: PgPool) {
        let store = PgStore::new(pool);
        let (_, task) = seed(&store).await;
        let adjusted = NewTaskResources {
            task_id: task.task_id,
            kind: ResourceRecordKind::Adjusted,
            queue: "all.q".into(),
            values: BTreeMap::from([("memory".to_string(), 1.5)]),
            adjustments: vec![],
        };
        // still REGISTERING
        let missed = store
            .adjust_task_resources(TaskStatus::IN_FLIGHT, adjusted.clone())
            .await
            .unwrap();
        assert!(missed.is_none());
        assert_eq!(store.list_task_resources(task.task_id).await.unwrap().len(), 1);

        let applied = store
            .adjust_task_resources(&[TaskStatus::Registering], adjusted)
            .await
            .unwrap();
        assert!(applied.is_some());
        assert_eq!(
            store.get_task(task.task_id).await.unwrap().status,
            TaskStatus::AdjustingResources
        );
    }
}
