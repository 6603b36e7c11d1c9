//! Deterministic backend for tests and dry runs.
//!
//! Each task name owns a queue of [`ScriptedOutcome`]s; every submitted job of
//! that task takes the next one. Tasks without a script succeed.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    BackendJobState, BackendResult, ClusterBackend, JobReport, SubmissionBatch, SubmissionReceipt,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    /// Run for `polls` polls, then succeed
    Succeed { polls: u32 },
    /// Run for `polls` polls, then exit non-zero
    Fail { polls: u32, exit_code: i32 },
    /// Killed by the resource limiter on the first poll
    ResourceKill { exceeded: Vec<String> },
    /// Backend forgets the job
    Lose,
    /// Accepted without a distributor id
    NoId,
}

impl ScriptedOutcome {
    pub fn succeed() -> Self {
        Self::Succeed { polls: 0 }
    }

    pub fn fail(exit_code: i32) -> Self {
        Self::Fail {
            polls: 0,
            exit_code,
        }
    }
}

#[derive(Debug)]
struct ScriptedJob {
    task_name: String,
    outcome: ScriptedOutcome,
    polls_seen: u32,
    terminated: bool,
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    jobs: Mutex<HashMap<String, ScriptedJob>>,
    submissions: Mutex<Vec<SubmissionBatch>>,
    next_batch: AtomicU64,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append outcomes for successive attempts of `task_name`
    pub fn script(
        &self,
        task_name: impl Into<String>,
        outcomes: impl IntoIterator<Item = ScriptedOutcome>,
    ) {
        self.scripts
            .lock()
            .entry(task_name.into())
            .or_default()
            .extend(outcomes);
    }

    /// Every batch submitted so far
    pub fn submissions(&self) -> Vec<SubmissionBatch> {
        self.submissions.lock().clone()
    }

    /// How many jobs of `task_name` were submitted
    pub fn submitted_count(&self, task_name: &str) -> usize {
        self.submissions
            .lock()
            .iter()
            .flat_map(|batch| batch.jobs.iter())
            .filter(|job| job.name == task_name)
            .count()
    }

    pub fn terminated_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .lock()
            .iter()
            .filter(|(_, job)| job.terminated)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn report(id: &str, job: &mut ScriptedJob) -> JobReport {
        job.polls_seen += 1;
        let running = BackendJobState::Running {
            nodename: Some("scripted-node".to_string()),
        };
        let (state, error_log) = if job.terminated {
            (
                BackendJobState::Failed { exit_code: Some(143) },
                Some("terminated".to_string()),
            )
        } else {
            match &job.outcome {
                ScriptedOutcome::Succeed { polls } if job.polls_seen > *polls => {
                    (BackendJobState::Done, None)
                }
                ScriptedOutcome::Fail { polls, exit_code } if job.polls_seen > *polls => (
                    BackendJobState::Failed {
                        exit_code: Some(*exit_code),
                    },
                    Some(format!("{} exited with {exit_code}", job.task_name)),
                ),
                ScriptedOutcome::Succeed { .. } | ScriptedOutcome::Fail { .. } => (running, None),
                ScriptedOutcome::ResourceKill { exceeded } => (
                    BackendJobState::ResourceKilled {
                        exceeded: exceeded.clone(),
                    },
                    Some(format!("{} killed by resource limiter", job.task_name)),
                ),
                ScriptedOutcome::Lose | ScriptedOutcome::NoId => (BackendJobState::Lost, None),
            }
        };
        JobReport {
            distributor_id: id.to_string(),
            state,
            error_log,
        }
    }
}

#[async_trait]
impl ClusterBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit(&self, batch: &SubmissionBatch) -> BackendResult<SubmissionReceipt> {
        let batch_id = self.next_batch.fetch_add(1, Ordering::SeqCst) + 1;
        let mut scripts = self.scripts.lock();
        let mut jobs = self.jobs.lock();
        let mut job_ids = Vec::with_capacity(batch.jobs.len());

        for (index, spec) in batch.jobs.iter().enumerate() {
            let outcome = scripts
                .get_mut(&spec.name)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(ScriptedOutcome::succeed);
            if outcome == ScriptedOutcome::NoId {
                job_ids.push(None);
                continue;
            }
            let id = format!("{batch_id}.{}", index + 1);
            jobs.insert(
                id.clone(),
                ScriptedJob {
                    task_name: spec.name.clone(),
                    outcome,
                    polls_seen: 0,
                    terminated: false,
                },
            );
            job_ids.push(Some(id));
        }
        drop(jobs);
        drop(scripts);

        self.submissions.lock().push(batch.clone());
        Ok(SubmissionReceipt {
            distributor_batch_id: batch_id.to_string(),
            job_ids,
        })
    }

    async fn poll(&self, distributor_ids: &[String]) -> BackendResult<Vec<JobReport>> {
        let mut jobs = self.jobs.lock();
        Ok(distributor_ids
            .iter()
            .map(|id| match jobs.get_mut(id) {
                Some(job) => Self::report(id, job),
                None => JobReport {
                    distributor_id: id.clone(),
                    state: BackendJobState::Lost,
                    error_log: None,
                },
            })
            .collect())
    }

    async fn terminate(&self, distributor_ids: &[String]) -> BackendResult<()> {
        let mut jobs = self.jobs.lock();
        for id in distributor_ids {
            if let Some(job) = jobs.get_mut(id) {
                job.terminated = true;
            }
        }
        Ok(())
    }
}
