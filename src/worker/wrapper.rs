use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::constants::{defaults, resource_keys, RESOURCE_KILL_EXIT_CODE};
use crate::orchestration::SwarmResult;
use crate::state_machine::{
    StateMachineError, TaskInstanceEvent, TaskInstanceStateMachine, TaskInstanceStatus,
};

/// Lines of stderr kept for the instance's error log
const STDERR_TAIL_LINES: usize = 50;

/// What the wrapper observed and reported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Done,
    Failed { exit_code: Option<i32> },
    ResourceKilled { exceeded: Vec<String> },
    /// KILL_SELF observed; the command was killed and ERROR_FATAL reported
    Killed,
    /// The instance was not in a state the wrapper may start from
    NotStarted { status: TaskInstanceStatus },
    /// Another writer (the reaper) finished the instance while the command ran
    Superseded { status: TaskInstanceStatus },
}

#[derive(Debug, Clone)]
pub struct WorkerWrapper {
    instances: TaskInstanceStateMachine,
    task_instance_id: i64,
    command: String,
    heartbeat_interval: Duration,
    runtime_budget: Option<Duration>,
    nodename: Option<String>,
}

enum Exit {
    Status(ExitStatus),
    OverBudget,
    KillRequested,
    Superseded(TaskInstanceStatus),
    WaitFailed(String),
}

impl WorkerWrapper {
    pub fn new(
        instances: TaskInstanceStateMachine,
        task_instance_id: i64,
        command: impl Into<String>,
    ) -> Self {
        Self {
            instances,
            task_instance_id,
            command: command.into(),
            heartbeat_interval: Duration::from_secs(defaults::HEARTBEAT_INTERVAL_SECONDS),
            runtime_budget: None,
            nodename: std::env::var("HOSTNAME").ok(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Kill the command and report RESOURCE_ERROR once it ran this long
    pub fn with_runtime_budget(mut self, budget: Option<Duration>) -> Self {
        self.runtime_budget = budget;
        self
    }

    pub fn with_nodename(mut self, nodename: impl Into<String>) -> Self {
        self.nodename = Some(nodename.into());
        self
    }

    #[instrument(skip(self), fields(task_instance_id = self.task_instance_id))]
    pub async fn run(&self) -> SwarmResult<WorkerOutcome> {
        let id = self.task_instance_id;
        let instance = self.instances.store().get_task_instance(id).await?;
        match instance.status {
            TaskInstanceStatus::Launched => {
                self.apply(TaskInstanceEvent::Run {
                    nodename: self.nodename.clone(),
                })
                .await?;
            }
            TaskInstanceStatus::Running => {}
            TaskInstanceStatus::KillSelf => {
                self.apply(TaskInstanceEvent::FatalError {
                    error_log: Some("killed before start".to_string()),
                })
                .await?;
                return Ok(WorkerOutcome::Killed);
            }
            status => return Ok(WorkerOutcome::NotStarted { status }),
        }

        let mut child = match self.spawn() {
            Ok(child) => child,
            Err(err) => {
                let error_log = Some(format!("failed to start command: {err}"));
                self.apply(TaskInstanceEvent::Error {
                    exit_code: None,
                    error_log,
                })
                .await?;
                return Ok(WorkerOutcome::Failed { exit_code: None });
            }
        };
        let stderr_tail = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail: Vec<String> = Vec::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(line);
                }
                tail.join("\n")
            })
        });
        info!(task_instance_id = id, command = %self.command, "Command started");

        let exit = self.supervise(&mut child).await?;
        if matches!(exit, Exit::OverBudget | Exit::KillRequested | Exit::Superseded(_)) {
            if let Err(err) = child.kill().await {
                warn!(task_instance_id = id, error = %err, "Could not kill command");
            }
        }
        let error_log = collect_tail(stderr_tail).await;

        let outcome = match exit {
            Exit::Status(status) => {
                let outcome = classify(&status);
                self.report(&outcome, error_log).await?;
                outcome
            }
            Exit::OverBudget => {
                let outcome = WorkerOutcome::ResourceKilled {
                    exceeded: vec![resource_keys::RUNTIME_SECONDS.to_string()],
                };
                self.report(&outcome, error_log).await?;
                outcome
            }
            Exit::KillRequested => {
                self.apply(TaskInstanceEvent::FatalError {
                    error_log: Some("terminated on KILL_SELF".to_string()),
                })
                .await?;
                WorkerOutcome::Killed
            }
            Exit::Superseded(status) => WorkerOutcome::Superseded { status },
            Exit::WaitFailed(reason) => {
                let outcome = WorkerOutcome::Failed { exit_code: None };
                let error_log = Some(format!("lost track of command: {reason}"));
                self.report(&outcome, error_log).await?;
                outcome
            }
        };
        info!(task_instance_id = id, outcome = ?outcome, "Command finished");
        Ok(outcome)
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command.spawn()
    }

    /// Wait for the command while heartbeating; stops early on KILL_SELF or
    /// an exhausted runtime budget
    async fn supervise(&self, child: &mut Child) -> SwarmResult<Exit> {
        let deadline = self.runtime_budget.map(|budget| Instant::now() + budget);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                status = child.wait() => {
                    return Ok(match status {
                        Ok(status) => Exit::Status(status),
                        Err(err) => Exit::WaitFailed(err.to_string()),
                    });
                }
                _ = heartbeat.tick() => {
                    if let Some(exit) = self.heartbeat().await? {
                        return Ok(exit);
                    }
                }
                _ = sleep_until(deadline) => {
                    return Ok(Exit::OverBudget);
                }
            }
        }
    }

    async fn heartbeat(&self) -> SwarmResult<Option<Exit>> {
        let id = self.task_instance_id;
        if self.instances.heartbeat(id, Utc::now()).await? {
            return Ok(None);
        }
        let status = self.instances.store().get_task_instance(id).await?.status;
        Ok(Some(if status == TaskInstanceStatus::KillSelf {
            Exit::KillRequested
        } else {
            Exit::Superseded(status)
        }))
    }

    async fn report(&self, outcome: &WorkerOutcome, error_log: Option<String>) -> SwarmResult<()> {
        let event = match outcome {
            WorkerOutcome::Done => TaskInstanceEvent::Complete,
            WorkerOutcome::Failed { exit_code } => TaskInstanceEvent::Error {
                exit_code: *exit_code,
                error_log,
            },
            WorkerOutcome::ResourceKilled { exceeded } => TaskInstanceEvent::ResourceError {
                exceeded: exceeded.clone(),
                error_log,
            },
            _ => return Ok(()),
        };
        self.apply(event).await
    }

    async fn apply(&self, event: TaskInstanceEvent) -> SwarmResult<()> {
        match self.instances.transition(self.task_instance_id, event).await {
            Ok(_) => Ok(()),
            Err(StateMachineError::InvalidTransition { from, event, .. }) => {
                debug!(
                    task_instance_id = self.task_instance_id,
                    from = %from,
                    event = %event,
                    "Instance already moved on"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn classify(status: &ExitStatus) -> WorkerOutcome {
    if status.success() {
        return WorkerOutcome::Done;
    }
    if status.code() == Some(RESOURCE_KILL_EXIT_CODE) || killed_by_sigkill(status) {
        return WorkerOutcome::ResourceKilled { exceeded: vec![] };
    }
    WorkerOutcome::Failed {
        exit_code: status.code(),
    }
}

#[cfg(unix)]
fn killed_by_sigkill(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(9)
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: &ExitStatus) -> bool {
    false
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn collect_tail(handle: Option<JoinHandle<String>>) -> Option<String> {
    let handle = handle?;
    match tokio::time::timeout(Duration::from_secs(1), handle).await {
        Ok(Ok(tail)) if !tail.is_empty() => Some(tail),
        _ => None,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::SwarmConfig;
    use crate::database::{InMemoryStore, Store};
    use crate::orchestration::notifier::PollingNotifier;
    use crate::orchestration::{BindOptions, Binder, Swarm, SwarmContext, TaskSpec, WorkflowSpec};
    use std::sync::Arc;

    async fn launched(command: &str) -> (Arc<InMemoryStore>, SwarmContext, i64) {
        let store = Arc::new(InMemoryStore::new());
        let ctx = SwarmContext::new(store.clone(), Arc::new(PollingNotifier), SwarmConfig::default());
        let spec = WorkflowSpec {
            tool_version_id: 1,
            name: format!("worker {command}"),
            tasks: vec![TaskSpec::new("job", 1, command)],
            ..Default::default()
        };
        let bound = Binder::new(ctx.clone())
            .bind(&spec, &BindOptions::default())
            .await
            .unwrap();
        let swarm = Swarm::attach(ctx.clone(), bound.workflow_run.workflow_run_id)
            .await
            .unwrap();
        swarm.start().await.unwrap();
        swarm.tick().await.unwrap();

        let id = store
            .list_task_instances(bound.tasks[0].task_id)
            .await
            .unwrap()[0]
            .task_instance_id;
        for event in [
            TaskInstanceEvent::Instantiate,
            TaskInstanceEvent::Submit,
            TaskInstanceEvent::Launch {
                distributor_id: "local.1".into(),
            },
        ] {
            ctx.instances.transition(id, event).await.unwrap();
        }
        (store, ctx, id)
    }

    fn wrapper(ctx: &SwarmContext, id: i64, command: &str) -> WorkerWrapper {
        WorkerWrapper::new(ctx.instances.clone(), id, command)
            .with_heartbeat_interval(Duration::from_millis(20))
            .with_nodename("node-1")
    }

    #[tokio::test]
    async fn test_success_reports_done() {
        let (store, ctx, id) = launched("true").await;
        let outcome = wrapper(&ctx, id, "true").run().await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Done);

        let instance = store.get_task_instance(id).await.unwrap();
        assert_eq!(instance.status, TaskInstanceStatus::Done);
        assert_eq!(instance.nodename.as_deref(), Some("node-1"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_error_with_stderr() {
        let command = "echo boom >&2; exit 3";
        let (store, ctx, id) = launched(command).await;
        let outcome = wrapper(&ctx, id, command).run().await.unwrap();
        assert_eq!(outcome, WorkerOutcome::Failed { exit_code: Some(3) });

        let instance = store.get_task_instance(id).await.unwrap();
        assert_eq!(instance.status, TaskInstanceStatus::Error);
        assert_eq!(instance.exit_code, Some(3));
        assert_eq!(instance.error_log.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_resource_kill_exit_code() {
        let (store, ctx, id) = launched("exit 137").await;
        let outcome = wrapper(&ctx, id, "exit 137").run().await.unwrap();
        assert!(matches!(outcome, WorkerOutcome::ResourceKilled { .. }));
        assert_eq!(
            store.get_task_instance(id).await.unwrap().status,
            TaskInstanceStatus::ResourceError
        );
    }

    #[tokio::test]
    async fn test_runtime_budget_kills_command() {
        let (store, ctx, id) = launched("sleep 5").await;
        let outcome = wrapper(&ctx, id, "sleep 5")
            .with_runtime_budget(Some(Duration::from_millis(100)))
            .run()
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WorkerOutcome::ResourceKilled {
                exceeded: vec![resource_keys::RUNTIME_SECONDS.to_string()]
            }
        );
        let instance = store.get_task_instance(id).await.unwrap();
        assert_eq!(instance.status, TaskInstanceStatus::ResourceError);
        assert_eq!(instance.exceeded_resources, vec!["runtime".to_string()]);
    }

    #[tokio::test]
    async fn test_kill_self_terminates_and_reports_fatal() {
        let (store, ctx, id) = launched("sleep 5").await;
        let worker = wrapper(&ctx, id, "sleep 5");
        let handle = tokio::spawn(async move { worker.run().await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        ctx.instances
            .transition(id, TaskInstanceEvent::KillSelf)
            .await
            .unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WorkerOutcome::Killed);
        assert_eq!(
            store.get_task_instance(id).await.unwrap().status,
            TaskInstanceStatus::ErrorFatal
        );
    }

    #[tokio::test]
    async fn test_refuses_instance_not_launched() {
        let (_store, ctx, id) = launched("true").await;
        ctx.instances
            .transition(id, TaskInstanceEvent::NoHeartbeat)
            .await
            .unwrap();
        let outcome = wrapper(&ctx, id, "true").run().await.unwrap();
        assert_eq!(
            outcome,
            WorkerOutcome::NotStarted {
                status: TaskInstanceStatus::NoHeartbeat
            }
        );
    }
}
