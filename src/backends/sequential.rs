//! Local backend: runs each submitted batch's commands one after another in a
//! background task, every job under a [`WorkerWrapper`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    BackendJobState, BackendResult, ClusterBackend, JobReport, JobSpec, SubmissionBatch,
    SubmissionReceipt,
};
use crate::constants::resource_keys;
use crate::state_machine::{TaskInstanceStateMachine, TaskInstanceStatus};
use crate::worker::{WorkerOutcome, WorkerWrapper};

/// How long a job waits for the distributor to record its launch
const LAUNCH_WAIT: Duration = Duration::from_secs(30);
const LAUNCH_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct JobEntry {
    state: BackendJobState,
    terminated: bool,
}

#[derive(Debug)]
pub struct SequentialBackend {
    instances: TaskInstanceStateMachine,
    heartbeat_interval: Duration,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
    next_batch: AtomicU64,
}

impl SequentialBackend {
    pub fn new(instances: TaskInstanceStateMachine, heartbeat_interval: Duration) -> Self {
        Self {
            instances,
            heartbeat_interval,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            next_batch: AtomicU64::new(1),
        }
    }

    fn runtime_budget(batch: &SubmissionBatch) -> Option<Duration> {
        batch
            .resources
            .get(resource_keys::RUNTIME_SECONDS)
            .filter(|seconds| seconds.is_finite() && **seconds > 0.0)
            .map(|seconds| Duration::from_secs_f64(*seconds))
    }
}

/// Runs the jobs of one batch in order
struct BatchRunner {
    instances: TaskInstanceStateMachine,
    heartbeat_interval: Duration,
    runtime_budget: Option<Duration>,
    jobs: Arc<Mutex<HashMap<String, JobEntry>>>,
}

impl BatchRunner {
    async fn run(self, jobs: Vec<(String, JobSpec)>) {
        for (distributor_id, job) in jobs {
            if self.is_terminated(&distributor_id) {
                continue;
            }
            let state = match self.wait_for_launch(job.task_instance_id).await {
                Some(TaskInstanceStatus::Launched) => {
                    self.set_state(&distributor_id, BackendJobState::Running { nodename: None });
                    self.run_job(&job).await
                }
                _ => BackendJobState::Lost,
            };
            debug!(distributor_id = %distributor_id, state = ?state, "Local job finished");
            self.set_state(&distributor_id, state);
        }
    }

    async fn run_job(&self, job: &JobSpec) -> BackendJobState {
        let outcome = WorkerWrapper::new(self.instances.clone(), job.task_instance_id, &job.command)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_runtime_budget(self.runtime_budget)
            .run()
            .await;
        match outcome {
            Ok(WorkerOutcome::Done) => BackendJobState::Done,
            Ok(WorkerOutcome::Failed { exit_code }) => BackendJobState::Failed { exit_code },
            Ok(WorkerOutcome::ResourceKilled { exceeded }) => {
                BackendJobState::ResourceKilled { exceeded }
            }
            Ok(WorkerOutcome::Killed) => BackendJobState::Failed { exit_code: Some(143) },
            Ok(WorkerOutcome::NotStarted { .. } | WorkerOutcome::Superseded { .. }) => {
                BackendJobState::Lost
            }
            Err(err) => {
                warn!(task_instance_id = job.task_instance_id, error = %err, "Worker failed");
                BackendJobState::Lost
            }
        }
    }

    /// Status once the instance left SUBMITTED_TO_BATCH_DISTRIBUTOR, or `None` on timeout
    async fn wait_for_launch(&self, task_instance_id: i64) -> Option<TaskInstanceStatus> {
        let started = tokio::time::Instant::now();
        while started.elapsed() < LAUNCH_WAIT {
            match self.instances.store().get_task_instance(task_instance_id).await {
                Ok(instance)
                    if instance.status != TaskInstanceStatus::SubmittedToBatchDistributor =>
                {
                    return Some(instance.status);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(task_instance_id = task_instance_id, error = %err, "Could not read instance");
                    return None;
                }
            }
            tokio::time::sleep(LAUNCH_POLL).await;
        }
        None
    }

    fn is_terminated(&self, distributor_id: &str) -> bool {
        self.jobs
            .lock()
            .get(distributor_id)
            .is_some_and(|entry| entry.terminated)
    }

    fn set_state(&self, distributor_id: &str, state: BackendJobState) {
        if let Some(entry) = self.jobs.lock().get_mut(distributor_id) {
            entry.state = state;
        }
    }
}

#[async_trait]
impl ClusterBackend for SequentialBackend {
    fn name(&self) -> &str {
        "sequential"
    }

    async fn submit(&self, batch: &SubmissionBatch) -> BackendResult<SubmissionReceipt> {
        let batch_id = self.next_batch.fetch_add(1, Ordering::SeqCst);
        let jobs: Vec<(String, JobSpec)> = batch
            .jobs
            .iter()
            .enumerate()
            .map(|(index, job)| (format!("local-{batch_id}.{}", index + 1), job.clone()))
            .collect();
        {
            let mut table = self.jobs.lock();
            for (distributor_id, _) in &jobs {
                table.insert(
                    distributor_id.clone(),
                    JobEntry {
                        state: BackendJobState::Pending,
                        terminated: false,
                    },
                );
            }
        }
        let job_ids = jobs.iter().map(|(id, _)| Some(id.clone())).collect();

        let runner = BatchRunner {
            instances: self.instances.clone(),
            heartbeat_interval: self.heartbeat_interval,
            runtime_budget: Self::runtime_budget(batch),
            jobs: self.jobs.clone(),
        };
        tokio::spawn(runner.run(jobs));

        Ok(SubmissionReceipt {
            distributor_batch_id: format!("local-{batch_id}"),
            job_ids,
        })
    }

    async fn poll(&self, distributor_ids: &[String]) -> BackendResult<Vec<JobReport>> {
        let table = self.jobs.lock();
        Ok(distributor_ids
            .iter()
            .map(|id| JobReport {
                distributor_id: id.clone(),
                state: table
                    .get(id)
                    .map(|entry| entry.state.clone())
                    .unwrap_or(BackendJobState::Lost),
                error_log: None,
            })
            .collect())
    }

    /// Pending jobs are skipped; a running job stops through its wrapper
    /// observing KILL_SELF
    async fn terminate(&self, distributor_ids: &[String]) -> BackendResult<()> {
        let mut table = self.jobs.lock();
        for id in distributor_ids {
            if let Some(entry) = table.get_mut(id) {
                entry.terminated = true;
            }
        }
        Ok(())
    }
}
