//! DAG Model: dependency graph over a workflow's tasks.
//!
//! [`DagGraph`] is built once from a node and edge set and rejects cycles at
//! construction. Readiness questions are answered by the pure functions in
//! [`fringe`], recomputed from store reads on every scheduling iteration.

pub mod fringe;
pub mod graph;

pub use fringe::{compute_fringe, downstream_closure};
pub use graph::DagGraph;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("Cycle detected among nodes: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },

    #[error("Edge references unknown node '{0}'")]
    UnknownNode(String),

    #[error("Duplicate node '{0}'")]
    DuplicateNode(String),
}
