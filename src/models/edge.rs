use serde::{Deserialize, Serialize};

/// Edge represents one dependency of a DAG: `downstream` runs only after `upstream` is DONE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Edge {
    pub dag_id: i64,
    pub upstream_node_id: i64,
    pub downstream_node_id: i64,
}

/// Edge keyed by node hash, used before node ids are assigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NewEdge {
    pub upstream_node_hash: String,
    pub downstream_node_hash: String,
}
