//! # System Constants
//!
//! Core constants that define the operational boundaries of the orchestration
//! engine: lifecycle event names, default tunables and status groupings that
//! several components need to agree on.

/// Lifecycle events published through the [`crate::orchestration::notifier`]
pub mod events {
    pub const WORKFLOW_BOUND: &str = "workflow.bound";
    pub const WORKFLOW_RESUMED: &str = "workflow.resumed";
    pub const WORKFLOW_RUN_TRANSITIONED: &str = "workflow_run.transitioned";
    pub const WORKFLOW_RUN_REAPED: &str = "workflow_run.reaped";

    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_TRIAGED: &str = "task.triaged";
    pub const TASK_RESET: &str = "task.reset";

    pub const INSTANCE_CLAIMED: &str = "task_instance.claimed";
    pub const INSTANCE_LAUNCHED: &str = "task_instance.launched";
    pub const INSTANCE_TERMINATED: &str = "task_instance.terminated";
    pub const INSTANCE_REAPED: &str = "task_instance.reaped";
}

/// Default values shared between configuration and the orchestration core
pub mod defaults {
    /// Resource scale applied per retry after a resource kill (0.5 => x1.5)
    pub const RESOURCE_SCALE_FACTOR: f64 = 0.5;
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const MAX_CONCURRENTLY_RUNNING: u32 = 10_000;
    pub const MAX_BATCH_SIZE: usize = 500;
    pub const DEBOUNCE_MS: u64 = 250;
    pub const SCHEDULER_POLL_INTERVAL_MS: u64 = 1_000;
    pub const DISTRIBUTOR_POLL_INTERVAL_MS: u64 = 1_000;
    pub const HEARTBEAT_INTERVAL_SECONDS: u64 = 30;
    pub const REAPER_SWEEP_INTERVAL_SECONDS: u64 = 60;
    pub const HEARTBEAT_TIMEOUT_SECONDS: u64 = 300;
    pub const DEFAULT_QUEUE: &str = "all.q";
}

/// Well-known resource dimension names
pub mod resource_keys {
    pub const MEMORY_GB: &str = "memory";
    pub const RUNTIME_SECONDS: &str = "runtime";
    pub const CORES: &str = "cores";

    /// Dimensions scaled after a resource kill when a task configures no scales
    pub const DEFAULT_SCALED: [&str; 2] = [MEMORY_GB, RUNTIME_SECONDS];
}

/// Exit code the worker wrapper and local backends use for a resource-limiter kill
pub const RESOURCE_KILL_EXIT_CODE: i32 = 137;

/// System-level constants
pub mod system {
    /// Current crate version
    pub const TASKSWARM_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Upper bound on tasks per workflow accepted at bind time
    pub const MAX_TASKS_PER_WORKFLOW: usize = 1_000_000;
}
