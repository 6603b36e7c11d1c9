//! # Cluster Backends
//!
//! The one API boundary of the core: anything that can `submit` a batch,
//! `poll` job states and `terminate` jobs can run tasks. A backend must report
//! a resource-limiter kill distinctly from an application non-zero exit, since
//! triage treats them differently.
//!
//! - [`DummyBackend`]: every job succeeds on first poll
//! - [`ScriptedBackend`]: per-task scripted outcomes for deterministic tests
//! - [`SequentialBackend`]: runs commands locally through the worker wrapper

pub mod dummy;
pub mod scripted;
pub mod sequential;

pub use dummy::DummyBackend;
pub use scripted::{ScriptedBackend, ScriptedOutcome};
pub use sequential::SequentialBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Submission of batch {batch_key} failed: {reason}")]
    SubmissionFailed { batch_key: String, reason: String },

    #[error("Poll failed: {0}")]
    PollFailed(String),

    #[error("Terminate failed: {0}")]
    TerminateFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// One job of an array submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub task_instance_id: i64,
    pub task_id: i64,
    pub name: String,
    pub command: String,
}

/// Same-template, same-resources jobs submitted as one array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionBatch {
    pub batch_key: String,
    pub queue: String,
    pub resources: BTreeMap<String, f64>,
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub distributor_batch_id: String,
    /// Distributor id per job, in `jobs` order; `None` when the backend
    /// accepted the batch but assigned no id to that job
    pub job_ids: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackendJobState {
    Pending,
    Running { nodename: Option<String> },
    Done,
    Failed { exit_code: Option<i32> },
    /// Killed by the resource limiter; `exceeded` names the dimensions when known
    ResourceKilled { exceeded: Vec<String> },
    /// The backend has no record of the job
    Lost,
}

impl BackendJobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub distributor_id: String,
    pub state: BackendJobState,
    pub error_log: Option<String>,
}

#[async_trait]
pub trait ClusterBackend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn submit(&self, batch: &SubmissionBatch) -> BackendResult<SubmissionReceipt>;

    /// Current state of each distributor id, in input order
    async fn poll(&self, distributor_ids: &[String]) -> BackendResult<Vec<JobReport>>;

    async fn terminate(&self, distributor_ids: &[String]) -> BackendResult<()>;
}
