use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::identity;

/// Node represents one vertex of a DAG: a task template version with node arguments
///
/// Nodes are content-addressed and immutable, so the same node row is shared by every
/// DAG that contains it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: i64,
    pub node_hash: String,
    pub task_template_version_id: i64,
    pub node_args: BTreeMap<String, String>,
}

/// New Node for creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNode {
    pub node_hash: String,
    pub task_template_version_id: i64,
    pub node_args: BTreeMap<String, String>,
}

impl NewNode {
    pub fn new(task_template_version_id: i64, node_args: BTreeMap<String, String>) -> Self {
        Self {
            node_hash: identity::node_hash(task_template_version_id, &node_args),
            task_template_version_id,
            node_args,
        }
    }
}
