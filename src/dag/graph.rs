use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Display;

use super::DagError;

/// Internal node structure: stores immediate upstreams and downstreams.
#[derive(Debug, Clone)]
struct DagNode<K> {
    /// Direct dependencies: nodes that must be DONE before this one can run.
    upstream: BTreeSet<K>,
    /// Direct dependents: nodes that depend on this one.
    downstream: BTreeSet<K>,
}

/// In-memory DAG keyed by any ordered id (task ids in the scheduler, task names at bind).
///
/// Adjacency is kept in ordered collections so every traversal visits nodes in
/// key order, whatever order the nodes and edges were supplied in.
#[derive(Debug, Clone)]
pub struct DagGraph<K: Ord> {
    nodes: BTreeMap<K, DagNode<K>>,
}

impl<K> DagGraph<K>
where
    K: Ord + Clone + Display,
{
    /// Build a DAG from its nodes and `(upstream, downstream)` edges.
    ///
    /// Fails on a duplicate node, an edge naming an unknown node, or a cycle.
    pub fn build(
        nodes: impl IntoIterator<Item = K>,
        edges: impl IntoIterator<Item = (K, K)>,
    ) -> Result<Self, DagError> {
        let mut graph: BTreeMap<K, DagNode<K>> = BTreeMap::new();

        for key in nodes {
            if graph.contains_key(&key) {
                return Err(DagError::DuplicateNode(key.to_string()));
            }
            graph.insert(
                key,
                DagNode {
                    upstream: BTreeSet::new(),
                    downstream: BTreeSet::new(),
                },
            );
        }

        for (upstream, downstream) in edges {
            if !graph.contains_key(&upstream) {
                return Err(DagError::UnknownNode(upstream.to_string()));
            }
            match graph.get_mut(&downstream) {
                Some(node) => {
                    node.upstream.insert(upstream.clone());
                }
                None => return Err(DagError::UnknownNode(downstream.to_string())),
            }
            if let Some(node) = graph.get_mut(&upstream) {
                node.downstream.insert(downstream);
            }
        }

        let dag = Self { nodes: graph };
        dag.reject_cycles()?;
        Ok(dag)
    }

    /// Kahn's algorithm; whatever cannot be ordered sits on or behind a cycle
    fn reject_cycles(&self) -> Result<(), DagError> {
        let ordered = self.topological_order();
        if ordered.len() == self.nodes.len() {
            return Ok(());
        }
        let ordered: BTreeSet<&K> = ordered.iter().collect();
        let stuck = self
            .nodes
            .keys()
            .filter(|key| !ordered.contains(key))
            .map(|key| key.to_string())
            .collect();
        Err(DagError::CycleDetected { nodes: stuck })
    }

    /// Nodes in dependency order, ties broken by key order.
    ///
    /// On a graph with a cycle only the acyclic prefix is returned; `build` never
    /// produces such a graph.
    pub fn topological_order(&self) -> Vec<K> {
        let mut in_degree: BTreeMap<&K, usize> = self
            .nodes
            .iter()
            .map(|(key, node)| (key, node.upstream.len()))
            .collect();
        let mut ready: VecDeque<&K> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(key, _)| *key)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(key) = ready.pop_front() {
            order.push(key.clone());
            for child in self.downstream_of(key) {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(child);
                    }
                }
            }
        }
        order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.nodes.contains_key(key)
    }

    /// All node keys in key order.
    pub fn nodes(&self) -> impl Iterator<Item = &K> {
        self.nodes.keys()
    }

    /// Immediate upstream dependencies of a node.
    pub fn upstream_of(&self, key: &K) -> impl Iterator<Item = &K> {
        self.nodes
            .get(key)
            .into_iter()
            .flat_map(|node| node.upstream.iter())
    }

    /// Immediate downstream dependents of a node.
    pub fn downstream_of(&self, key: &K) -> impl Iterator<Item = &K> {
        self.nodes
            .get(key)
            .into_iter()
            .flat_map(|node| node.downstream.iter())
    }
}
