//! # Orchestration Engine
//!
//! The agents that move workflows through their lifecycle. They share nothing
//! but the [`Store`]; every agent can run in its own process.
//!
//! ## Core Components
//!
//! - **Binder**: turns a client's workflow description into persisted rows, or
//!   resumes the existing workflow with the same identity
//! - **Swarm**: the scheduling loop of the controlling workflow run. Computes the
//!   fringe, claims instances in batches and feeds finished instances to triage
//! - **Triage**: maps the outcome of an instance onto the next task status
//! - **Distributor**: submits claimed instances to a [`ClusterBackend`] and
//!   mirrors backend job states into the store
//! - **Reaper**: out-of-band liveness sweep over heartbeats
//! - **Admin**: operator surface (resume, status resets, concurrency limits)
//!
//! [`ClusterBackend`]: crate::backends::ClusterBackend

pub mod admin;
pub mod batcher;
pub mod binder;
pub mod distributor;
pub mod errors;
pub mod notifier;
pub mod reaper;
pub mod swarm;
pub mod triage;

pub use admin::{Admin, TaskStatusTarget};
pub use batcher::{batch_tasks, TaskBatch};
pub use binder::{BindOptions, BoundWorkflow, Binder, TaskSpec, WorkflowSpec};
pub use distributor::{Distributor, DistributorTickSummary};
pub use errors::{SwarmError, SwarmResult};
pub use notifier::{BroadcastNotifier, PollingNotifier, StateChange, StateChangeNotifier};
pub use reaper::{Reaper, SweepSummary};
pub use swarm::{run_workflow, Swarm, SwarmRunSummary, TickSummary};
pub use triage::{Triage, TriageOutcome};

use std::sync::Arc;

use crate::config::SwarmConfig;
use crate::database::Store;
use crate::resources::QueueCatalog;
use crate::state_machine::{
    TaskInstanceStateMachine, TaskStateMachine, WorkflowRunStateMachine, WorkflowStateMachine,
};

/// Store, notifier, configuration and the four state machines, shared by every agent
#[derive(Debug, Clone)]
pub struct SwarmContext {
    pub store: Arc<dyn Store>,
    pub notifier: Arc<dyn StateChangeNotifier>,
    pub config: Arc<SwarmConfig>,
    pub catalog: Arc<QueueCatalog>,
    pub tasks: TaskStateMachine,
    pub instances: TaskInstanceStateMachine,
    pub workflows: WorkflowStateMachine,
    pub runs: WorkflowRunStateMachine,
}

impl SwarmContext {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn StateChangeNotifier>,
        config: SwarmConfig,
    ) -> Self {
        let catalog = Arc::new(QueueCatalog::from_config(&config.resources));
        Self {
            tasks: TaskStateMachine::new(store.clone(), notifier.clone()),
            instances: TaskInstanceStateMachine::new(store.clone(), notifier.clone()),
            workflows: WorkflowStateMachine::new(store.clone(), notifier.clone()),
            runs: WorkflowRunStateMachine::new(store.clone(), notifier.clone()),
            store,
            notifier,
            config: Arc::new(config),
            catalog,
        }
    }

    pub fn triage(&self) -> Triage {
        Triage::new(self.tasks.clone(), self.catalog.clone())
    }
}
