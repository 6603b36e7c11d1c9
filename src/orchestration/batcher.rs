//! Groups dispatchable tasks into array submissions.
//!
//! Tasks share a batch when they come from the same task template and request
//! identical resources; each group is cut into chunks of at most
//! `max_batch_size`. Output order is deterministic: groups sort by key and
//! tasks keep their input order.

use std::collections::{BTreeMap, HashMap};

use crate::models::{Task, TaskResources};

/// One array submission worth of tasks
#[derive(Debug, Clone, PartialEq)]
pub struct TaskBatch {
    pub batch_key: String,
    pub task_template_version_id: i64,
    pub queue: String,
    pub task_ids: Vec<i64>,
}

pub fn batch_key(workflow_run_id: i64, task_template_version_id: i64, signature: &str) -> String {
    let digest = blake3::hash(signature.as_bytes()).to_hex();
    format!(
        "wr{workflow_run_id}-tt{task_template_version_id}-{}",
        &digest.as_str()[..12]
    )
}

/// Tasks without a resources row are left out; they cannot be claimed.
pub fn batch_tasks<'a>(
    workflow_run_id: i64,
    tasks: impl IntoIterator<Item = &'a Task>,
    resources: &HashMap<i64, TaskResources>,
    max_batch_size: usize,
) -> Vec<TaskBatch> {
    let mut groups: BTreeMap<(i64, String), (String, Vec<i64>)> = BTreeMap::new();
    for task in tasks {
        let Some(row) = resources.get(&task.task_id) else {
            continue;
        };
        groups
            .entry((task.task_template_version_id, row.signature()))
            .or_insert_with(|| (row.queue.clone(), Vec::new()))
            .1
            .push(task.task_id);
    }

    let size = max_batch_size.max(1);
    groups
        .into_iter()
        .flat_map(|((template, signature), (queue, task_ids))| {
            let key = batch_key(workflow_run_id, template, &signature);
            task_ids
                .chunks(size)
                .enumerate()
                .map(|(chunk, ids)| TaskBatch {
                    batch_key: if chunk == 0 {
                        key.clone()
                    } else {
                        format!("{key}.{chunk}")
                    },
                    task_template_version_id: template,
                    queue: queue.clone(),
                    task_ids: ids.to_vec(),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceRecordKind;
    use crate::state_machine::TaskStatus;
    use chrono::Utc;

    fn task(task_id: i64, template: i64) -> Task {
        Task {
            task_id,
            workflow_id: 1,
            node_id: task_id,
            task_hash: format!("h{task_id}"),
            name: format!("t{task_id}"),
            command: "true".into(),
            task_template_version_id: template,
            status: TaskStatus::Queued,
            max_attempts: 3,
            num_attempts: 0,
            resource_scales: BTreeMap::new(),
            fallback_queues: vec![],
            status_date: Utc::now(),
        }
    }

    fn resources(task_id: i64, memory: f64) -> (i64, TaskResources) {
        (
            task_id,
            TaskResources {
                task_resources_id: task_id * 10,
                task_id,
                kind: ResourceRecordKind::Validated,
                queue: "all.q".into(),
                values: BTreeMap::from([("memory".to_string(), memory)]),
                adjustments: vec![],
                created_at: Utc::now(),
            },
        )
    }

    #[test]
    fn test_groups_by_template_and_resources() {
        let tasks = vec![task(1, 7), task(2, 7), task(3, 7), task(4, 8)];
        let rows = HashMap::from([
            resources(1, 1.0),
            resources(2, 1.0),
            resources(3, 2.0),
            resources(4, 1.0),
        ]);

        let batches = batch_tasks(5, &tasks, &rows, 100);
        assert_eq!(batches.len(), 3);
        let sizes: Vec<usize> = batches.iter().map(|b| b.task_ids.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 4);
        assert!(batches.iter().any(|b| b.task_ids == vec![1, 2]));
        assert!(batches.iter().all(|b| b.batch_key.starts_with("wr5-tt")));
    }

    #[test]
    fn test_chunks_respect_max_batch_size() {
        let tasks: Vec<Task> = (1..=5).map(|id| task(id, 1)).collect();
        let rows: HashMap<i64, TaskResources> = (1..=5).map(|id| resources(id, 1.0)).collect();

        let batches = batch_tasks(1, &tasks, &rows, 2);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].task_ids, vec![5]);
        assert_ne!(batches[0].batch_key, batches[1].batch_key);
    }

    #[test]
    fn test_tasks_without_resources_are_skipped() {
        let tasks = vec![task(1, 1), task(2, 1)];
        let rows = HashMap::from([resources(1, 1.0)]);
        let batches = batch_tasks(1, &tasks, &rows, 10);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].task_ids, vec![1]);
    }
}
