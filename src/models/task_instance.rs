use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::TaskInstanceStatus;

/// TaskInstance represents one concrete execution attempt of a task
///
/// A retry always creates a new row; at most one row per task is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub task_instance_id: i64,
    pub task_id: i64,
    pub workflow_id: i64,
    pub workflow_run_id: i64,
    pub task_resources_id: i64,
    pub status: TaskInstanceStatus,
    /// Groups instances the scheduling loop wants submitted together
    pub batch_key: String,
    pub distributor_id: Option<String>,
    pub nodename: Option<String>,
    pub exit_code: Option<i32>,
    pub error_log: Option<String>,
    /// Resource dimensions the cluster reported as exceeded
    pub exceeded_resources: Vec<String>,
    pub heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status_date: DateTime<Utc>,
}

/// Claim request for a new instance of a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceClaim {
    pub task_id: i64,
    pub workflow_run_id: i64,
    pub batch_key: String,
}

/// Optional columns written together with an instance status change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceUpdate {
    pub distributor_id: Option<String>,
    pub nodename: Option<String>,
    pub exit_code: Option<i32>,
    pub error_log: Option<String>,
    pub exceeded_resources: Option<Vec<String>>,
}
