//! Pure readiness functions over a [`DagGraph`].
//!
//! `(graph, done) -> fringe` has no hidden state: concurrent schedulers that read
//! the same DONE set compute the same fringe.

use std::collections::BTreeSet;
use std::fmt::Display;

use super::DagGraph;

/// Tasks that are not DONE and whose every upstream is DONE
pub fn compute_fringe<K>(graph: &DagGraph<K>, done: &BTreeSet<K>) -> BTreeSet<K>
where
    K: Ord + Clone + Display,
{
    graph
        .nodes()
        .filter(|key| !done.contains(*key))
        .filter(|key| graph.upstream_of(key).all(|up| done.contains(up)))
        .cloned()
        .collect()
}

/// The seeds plus everything reachable downstream of them
pub fn downstream_closure<K>(graph: &DagGraph<K>, seeds: impl IntoIterator<Item = K>) -> BTreeSet<K>
where
    K: Ord + Clone + Display,
{
    let mut closure = BTreeSet::new();
    let mut stack: Vec<K> = seeds.into_iter().filter(|key| graph.contains(key)).collect();

    while let Some(key) = stack.pop() {
        if closure.contains(&key) {
            continue;
        }
        stack.extend(graph.downstream_of(&key).cloned());
        closure.insert(key);
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn diamond() -> DagGraph<i64> {
        // 1 -> 2 -> 4, 1 -> 3 -> 4, 5 independent
        DagGraph::build([1, 2, 3, 4, 5], [(1, 2), (1, 3), (2, 4), (3, 4)]).unwrap()
    }

    #[test]
    fn test_fringe_of_fresh_graph_is_roots() {
        let fringe = compute_fringe(&diamond(), &BTreeSet::new());
        assert_eq!(fringe, BTreeSet::from([1, 5]));
    }

    #[test]
    fn test_fringe_waits_for_every_upstream() {
        let graph = diamond();
        assert_eq!(
            compute_fringe(&graph, &BTreeSet::from([1, 2, 5])),
            BTreeSet::from([3])
        );
        assert_eq!(
            compute_fringe(&graph, &BTreeSet::from([1, 2, 3, 5])),
            BTreeSet::from([4])
        );
        assert!(compute_fringe(&graph, &BTreeSet::from([1, 2, 3, 4, 5])).is_empty());
    }

    #[test]
    fn test_downstream_closure() {
        let graph = diamond();
        assert_eq!(downstream_closure(&graph, [2]), BTreeSet::from([2, 4]));
        assert_eq!(downstream_closure(&graph, [1]), BTreeSet::from([1, 2, 3, 4]));
        assert_eq!(downstream_closure(&graph, [5, 42]), BTreeSet::from([5]));
    }

    /// Random DAG: edges only point from lower to higher ids, so it is acyclic
    fn arb_dag() -> impl Strategy<Value = (Vec<i64>, Vec<(i64, i64)>, Vec<i64>)> {
        (2usize..24).prop_flat_map(|n| {
            let edges = proptest::collection::vec((0..n as i64, 0..n as i64), 0..n * 2);
            let done = proptest::collection::vec(0..n as i64, 0..n);
            (Just((0..n as i64).collect::<Vec<_>>()), edges, done)
        })
        .prop_map(|(nodes, edges, done)| {
            let edges = edges
                .into_iter()
                .filter(|(a, b)| a < b)
                .collect::<Vec<_>>();
            (nodes, edges, done)
        })
    }

    proptest! {
        #[test]
        fn prop_fringe_is_independent_of_input_order((nodes, edges, done) in arb_dag()) {
            let forward = DagGraph::build(nodes.clone(), edges.clone()).unwrap();
            let reversed = DagGraph::build(
                nodes.iter().rev().copied(),
                edges.iter().rev().copied(),
            )
            .unwrap();
            let done: BTreeSet<i64> = done.into_iter().collect();

            prop_assert_eq!(compute_fringe(&forward, &done), compute_fringe(&reversed, &done));
        }

        #[test]
        fn prop_fringe_members_have_done_upstreams((nodes, edges, done) in arb_dag()) {
            let graph = DagGraph::build(nodes, edges).unwrap();
            let done: BTreeSet<i64> = done.into_iter().collect();
            for key in compute_fringe(&graph, &done) {
                prop_assert!(!done.contains(&key));
                prop_assert!(graph.upstream_of(&key).all(|up| done.contains(up)));
            }
        }
    }
}
