//! Property tests over randomly shaped workflows with scripted failures.

mod common;

use std::collections::HashMap;

use common::{duplicate_active, task, workflow, Harness};
use proptest::prelude::*;
use taskswarm::backends::ScriptedOutcome;
use taskswarm::state_machine::{TaskStatus, WorkflowRunStatus};
use taskswarm::TaskSpec;

#[derive(Debug, Clone)]
struct Shape {
    /// Application failures before the task's first success
    failures: Vec<u32>,
    max_attempts: Vec<u32>,
    /// `(upstream, downstream)` with upstream < downstream, so always acyclic
    edges: Vec<(usize, usize)>,
}

fn shape() -> impl Strategy<Value = Shape> {
    (1usize..7).prop_flat_map(|size| {
        let pairs: Vec<(usize, usize)> = (0..size)
            .flat_map(|up| (up + 1..size).map(move |down| (up, down)))
            .collect();
        let edge_count = pairs.len();
        (
            prop::collection::vec(0u32..3, size),
            prop::collection::vec(1u32..4, size),
            prop::collection::vec(any::<bool>(), edge_count),
        )
            .prop_map(move |(failures, max_attempts, keep)| Shape {
                failures,
                max_attempts,
                edges: pairs
                    .iter()
                    .zip(keep)
                    .filter(|(_, keep)| *keep)
                    .map(|(pair, _)| *pair)
                    .collect(),
            })
    })
}

fn name(index: usize) -> String {
    format!("t{index}")
}

/// Which tasks must end DONE: enough attempts, and every upstream done
fn expected_done(shape: &Shape) -> Vec<bool> {
    let mut done = vec![false; shape.failures.len()];
    for index in 0..done.len() {
        let succeeds = shape.failures[index] < shape.max_attempts[index];
        let upstream_done = shape
            .edges
            .iter()
            .filter(|(_, down)| *down == index)
            .all(|(up, _)| done[*up]);
        done[index] = succeeds && upstream_done;
    }
    done
}

fn run_shape(shape: &Shape) -> Result<(), TestCaseError> {
    tokio_test::block_on(async {
        let harness = Harness::new();
        let tasks: Vec<TaskSpec> = (0..shape.failures.len())
            .map(|index| {
                harness.script(
                    &name(index),
                    (0..shape.failures[index]).map(|_| ScriptedOutcome::fail(1)),
                );
                let mut spec = task(&name(index)).with_max_attempts(shape.max_attempts[index]);
                for (up, _) in shape.edges.iter().filter(|(_, down)| *down == index) {
                    spec = spec.with_upstream(name(*up));
                }
                spec
            })
            .collect();
        let bound = harness.bind(&workflow("property", tasks)).await;
        let agents = harness.agents(bound.workflow_run.workflow_run_id).await;

        let mut duplicates = Vec::new();
        let last = harness
            .drive_with(&agents, |_, instances| {
                duplicates.extend(duplicate_active(instances));
            })
            .await;
        prop_assert!(duplicates.is_empty(), "duplicate active instances: {duplicates:?}");

        let by_name = harness.tasks_by_name(bound.workflow.workflow_id).await;
        let by_id: HashMap<i64, TaskStatus> = by_name
            .values()
            .map(|task| (task.task_id, task.status))
            .collect();
        let expected = expected_done(shape);

        for (index, should_finish) in expected.iter().enumerate() {
            let task = &by_name[&name(index)];
            let instances = harness.instances_of(task.task_id).await;
            prop_assert!(instances.len() as u32 <= shape.max_attempts[index]);
            prop_assert_eq!(task.status == TaskStatus::Done, *should_finish, "{}", task.name);
            if !should_finish {
                prop_assert!(
                    task.status == TaskStatus::ErrorFatal || instances.is_empty(),
                    "{} ended {} with {} instances",
                    task.name,
                    task.status,
                    instances.len()
                );
            }
            if task.status == TaskStatus::Done {
                for (up, _) in shape.edges.iter().filter(|(_, down)| *down == index) {
                    let upstream = &by_name[&name(*up)];
                    prop_assert_eq!(by_id[&upstream.task_id], TaskStatus::Done);
                }
            }
        }

        let any_fatal = by_id.values().any(|status| *status == TaskStatus::ErrorFatal);
        let expected_run = if any_fatal {
            WorkflowRunStatus::Error
        } else {
            WorkflowRunStatus::Done
        };
        prop_assert_eq!(last.finished, Some(expected_run));
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_random_workflows_respect_lifecycle_invariants(shape in shape()) {
        run_shape(&shape)?;
    }
}
