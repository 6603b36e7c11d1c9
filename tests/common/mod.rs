//! Shared harness for the integration tests: an in-memory store, a scripted
//! backend and a driver that interleaves scheduling ticks with distributor
//! ticks deterministically.

#![allow(dead_code)]

pub mod flaky;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use taskswarm::backends::{ScriptedBackend, ScriptedOutcome};
use taskswarm::config::SwarmConfig;
use taskswarm::database::{InMemoryStore, Store};
use taskswarm::models::{Task, TaskInstance};
use taskswarm::orchestration::{
    BindOptions, Binder, BoundWorkflow, Distributor, PollingNotifier, Swarm, SwarmContext,
    TaskSpec, TickSummary, WorkflowSpec,
};
use taskswarm::state_machine::TaskInstanceStatus;

use flaky::FlakyStore;

/// More than any test workflow needs to finish
pub const MAX_TICKS: usize = 200;

pub fn test_config() -> SwarmConfig {
    let mut config = SwarmConfig::default();
    config.scheduler.debounce_ms = 0;
    config.scheduler.poll_interval_ms = 5;
    config.distributor.poll_interval_ms = 5;
    config
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub ctx: SwarmContext,
    pub backend: Arc<ScriptedBackend>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: SwarmConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let ctx = SwarmContext::new(store.clone(), Arc::new(PollingNotifier), config);
        Self {
            store,
            ctx,
            backend: Arc::new(ScriptedBackend::new()),
        }
    }

    /// Agents write through a [`FlakyStore`]; `store` still reads the rows directly
    pub fn with_flaky_store() -> (Self, Arc<FlakyStore>) {
        let store = Arc::new(InMemoryStore::new());
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let mut config = test_config();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 10;
        let ctx = SwarmContext::new(flaky.clone(), Arc::new(PollingNotifier), config);
        let harness = Self {
            store,
            ctx,
            backend: Arc::new(ScriptedBackend::new()),
        };
        (harness, flaky)
    }

    pub fn script(&self, task: &str, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.backend.script(task, outcomes);
    }

    pub async fn bind(&self, spec: &WorkflowSpec) -> BoundWorkflow {
        Binder::new(self.ctx.clone())
            .bind(spec, &BindOptions::default())
            .await
            .expect("bind")
    }

    pub async fn rebind(&self, spec: &WorkflowSpec, options: &BindOptions) -> BoundWorkflow {
        Binder::new(self.ctx.clone())
            .bind(spec, options)
            .await
            .expect("rebind")
    }

    /// Scheduling loop and distributor for `workflow_run_id`, started
    pub async fn agents(&self, workflow_run_id: i64) -> Agents {
        let swarm = Swarm::attach(self.ctx.clone(), workflow_run_id)
            .await
            .expect("attach");
        swarm.start().await.expect("start");
        let distributor =
            Distributor::new(self.ctx.clone(), self.backend.clone(), swarm.workflow_id());
        Agents { swarm, distributor }
    }

    /// Tick both agents until the run finishes; `check` runs after every swarm tick
    pub async fn drive_with<F>(&self, agents: &Agents, mut check: F) -> TickSummary
    where
        F: FnMut(&TickSummary, &[TaskInstance]),
    {
        for _ in 0..MAX_TICKS {
            let tick = agents.swarm.tick().await.expect("swarm tick");
            let instances = self
                .store
                .list_workflow_instances(agents.swarm.workflow_id(), &[])
                .await
                .expect("instances");
            check(&tick, &instances);
            if tick.finished.is_some() {
                return tick;
            }
            agents.distributor.tick().await.expect("distributor tick");
        }
        panic!("workflow run did not finish within {MAX_TICKS} ticks");
    }

    pub async fn drive(&self, agents: &Agents) -> TickSummary {
        self.drive_with(agents, |_, _| {}).await
    }

    pub async fn tasks_by_name(&self, workflow_id: i64) -> HashMap<String, Task> {
        self.store
            .list_tasks(workflow_id)
            .await
            .expect("tasks")
            .into_iter()
            .map(|task| (task.name.clone(), task))
            .collect()
    }

    pub async fn instances_of(&self, task_id: i64) -> Vec<TaskInstance> {
        self.store
            .list_task_instances(task_id)
            .await
            .expect("instances")
    }
}

pub struct Agents {
    pub swarm: Swarm,
    pub distributor: Distributor,
}

/// Tasks with more than one active instance
pub fn duplicate_active(instances: &[TaskInstance]) -> Vec<i64> {
    let mut active: BTreeMap<i64, usize> = BTreeMap::new();
    for instance in instances
        .iter()
        .filter(|instance| TaskInstanceStatus::ACTIVE.contains(&instance.status))
    {
        *active.entry(instance.task_id).or_default() += 1;
    }
    active
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(task_id, _)| task_id)
        .collect()
}

pub fn task(name: &str) -> TaskSpec {
    TaskSpec::new(name, 1, format!("run {name}")).with_node_arg("name", name)
}

pub fn workflow(name: &str, tasks: Vec<TaskSpec>) -> WorkflowSpec {
    WorkflowSpec {
        tool_version_id: 1,
        name: name.to_string(),
        workflow_args: BTreeMap::from([("test".to_string(), name.to_string())]),
        tasks,
        ..Default::default()
    }
}
