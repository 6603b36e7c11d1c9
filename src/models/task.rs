use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resources::ResourceScale;
use crate::state_machine::TaskStatus;

/// Task represents one fully-specified command within a workflow
///
/// Created at bind time and never deleted. Status transitions come from the
/// scheduling loop and from client resets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: i64,
    pub workflow_id: i64,
    pub node_id: i64,
    pub task_hash: String,
    pub name: String,
    pub command: String,
    pub task_template_version_id: i64,
    pub status: TaskStatus,
    pub max_attempts: u32,
    /// Instances claimed in the current resume epoch
    pub num_attempts: u32,
    /// Per-dimension scaling applied after a resource kill, resolved at bind
    pub resource_scales: BTreeMap<String, ResourceScale>,
    pub fallback_queues: Vec<String>,
    pub status_date: DateTime<Utc>,
}

impl Task {
    pub fn has_attempts_remaining(&self) -> bool {
        self.num_attempts < self.max_attempts
    }
}

/// New Task for creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub workflow_id: i64,
    pub node_id: i64,
    pub task_hash: String,
    pub name: String,
    pub command: String,
    pub task_template_version_id: i64,
    pub max_attempts: u32,
    pub resource_scales: BTreeMap<String, ResourceScale>,
    pub fallback_queues: Vec<String>,
}
