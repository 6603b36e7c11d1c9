//! Content hashes that identify nodes, tasks, DAGs and workflows.
//!
//! Hashes are blake3 over a length-prefixed canonical encoding, so they are
//! stable across processes, machines and compiler versions. Argument maps are
//! `BTreeMap`s and are therefore encoded in key order.

use std::collections::BTreeMap;

struct IdentityHasher(blake3::Hasher);

impl IdentityHasher {
    fn new(domain: &str) -> Self {
        let mut hasher = Self(blake3::Hasher::new());
        hasher.field(domain);
        hasher
    }

    fn field(&mut self, value: &str) -> &mut Self {
        self.0.update(&(value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }

    fn int(&mut self, value: i64) -> &mut Self {
        self.0.update(&value.to_le_bytes());
        self
    }

    fn args(&mut self, args: &BTreeMap<String, String>) -> &mut Self {
        self.int(args.len() as i64);
        for (key, value) in args {
            self.field(key).field(value);
        }
        self
    }

    fn finish(&self) -> String {
        self.0.finalize().to_hex().to_string()
    }
}

/// Node identity: template version plus node-argument values
pub fn node_hash(task_template_version_id: i64, node_args: &BTreeMap<String, String>) -> String {
    IdentityHasher::new("node")
        .int(task_template_version_id)
        .args(node_args)
        .finish()
}

/// Task identity: node hash plus task-argument values
pub fn task_hash(node_hash: &str, task_args: &BTreeMap<String, String>) -> String {
    IdentityHasher::new("task")
        .field(node_hash)
        .args(task_args)
        .finish()
}

/// DAG identity over the full node and edge set, independent of input order
pub fn dag_hash<'a>(
    node_hashes: impl IntoIterator<Item = &'a str>,
    edges: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> String {
    let mut nodes: Vec<&str> = node_hashes.into_iter().collect();
    nodes.sort_unstable();
    nodes.dedup();
    let mut edges: Vec<(&str, &str)> = edges.into_iter().collect();
    edges.sort_unstable();
    edges.dedup();

    let mut hasher = IdentityHasher::new("dag");
    hasher.int(nodes.len() as i64);
    for node in &nodes {
        hasher.field(node);
    }
    hasher.int(edges.len() as i64);
    for (upstream, downstream) in &edges {
        hasher.field(upstream).field(downstream);
    }
    hasher.finish()
}

/// Workflow identity: tool version, DAG hash and workflow-argument values
pub fn workflow_hash(
    tool_version_id: i64,
    dag_hash: &str,
    workflow_args: &BTreeMap<String, String>,
) -> String {
    IdentityHasher::new("workflow")
        .int(tool_version_id)
        .field(dag_hash)
        .args(workflow_args)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_node_hash_depends_on_template_and_args() {
        let a = node_hash(1, &args(&[("location", "102")]));
        assert_eq!(a, node_hash(1, &args(&[("location", "102")])));
        assert_ne!(a, node_hash(2, &args(&[("location", "102")])));
        assert_ne!(a, node_hash(1, &args(&[("location", "103")])));
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        assert_ne!(
            node_hash(1, &args(&[("ab", "c")])),
            node_hash(1, &args(&[("a", "bc")]))
        );
    }

    #[test]
    fn test_dag_hash_is_order_independent() {
        let one = dag_hash(["n1", "n2", "n3"], [("n1", "n2"), ("n2", "n3")]);
        let two = dag_hash(["n3", "n1", "n2"], [("n2", "n3"), ("n1", "n2")]);
        assert_eq!(one, two);
        assert_ne!(one, dag_hash(["n1", "n2", "n3"], [("n1", "n3"), ("n2", "n3")]));
    }

    #[test]
    fn test_workflow_hash_changes_with_args() {
        let dag = dag_hash(["n1"], Vec::<(&str, &str)>::new());
        assert_ne!(
            workflow_hash(7, &dag, &args(&[("release", "1")])),
            workflow_hash(7, &dag, &args(&[("release", "2")]))
        );
        assert_ne!(
            task_hash("n1", &BTreeMap::new()),
            task_hash("n1", &args(&[("draws", "100")]))
        );
    }
}
