use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::edge::NewEdge;
use super::node::NewNode;

/// Dag is the immutable record of one node/edge set, identified by its hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dag {
    pub dag_id: i64,
    pub dag_hash: String,
    pub created_at: DateTime<Utc>,
}

/// New DAG for creation; insertion is idempotent on `dag_hash`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDag {
    pub dag_hash: String,
    pub nodes: Vec<NewNode>,
    pub edges: Vec<NewEdge>,
}

/// Result of binding a DAG: the row plus the id assigned to every node hash
#[derive(Debug, Clone)]
pub struct BoundDag {
    pub dag: Dag,
    pub node_ids: HashMap<String, i64>,
}
