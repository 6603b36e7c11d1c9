use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{NewTask, NewTaskResources, Task, WorkflowRun};
use crate::state_machine::WorkflowStatus;

/// Workflow is the durable intent to run a DAG's tasks to completion
///
/// One row per unique (tool version, DAG, workflow args); resumes reuse it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: i64,
    pub workflow_hash: String,
    pub tool_version_id: i64,
    pub dag_id: i64,
    pub name: String,
    pub workflow_args: BTreeMap<String, String>,
    pub status: WorkflowStatus,
    pub max_concurrently_running: u32,
    /// Per task-template limits on simultaneously active instances
    pub template_concurrency: BTreeMap<i64, u32>,
    pub created_at: DateTime<Utc>,
    pub status_date: DateTime<Utc>,
}

impl Workflow {
    pub fn template_limit(&self, task_template_version_id: i64) -> Option<u32> {
        self.template_concurrency
            .get(&task_template_version_id)
            .copied()
    }
}

/// New Workflow for creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub workflow_hash: String,
    pub tool_version_id: i64,
    pub dag_id: i64,
    pub name: String,
    pub workflow_args: BTreeMap<String, String>,
    pub max_concurrently_running: u32,
    pub template_concurrency: BTreeMap<i64, u32>,
}

/// A task to insert together with its initial resource rows. The store fills
/// in `task.workflow_id` and every row's `task_id`.
#[derive(Debug, Clone)]
pub struct NewBoundTask {
    pub task: NewTask,
    pub resources: Vec<NewTaskResources>,
}

/// Everything a first bind writes: the workflow, its tasks with their
/// resources, and a REGISTERING run. Inserted all or nothing.
#[derive(Debug, Clone)]
pub struct NewWorkflowBundle {
    pub workflow: NewWorkflow,
    pub tasks: Vec<NewBoundTask>,
    pub user: String,
}

#[derive(Debug, Clone)]
pub struct InsertedWorkflow {
    pub workflow: Workflow,
    pub tasks: Vec<Task>,
    pub workflow_run: WorkflowRun,
}
