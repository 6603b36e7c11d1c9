#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Taskswarm Core
//!
//! Workflow orchestration core: clients submit a dependency graph of commands,
//! and independent agents drive every task to completion through a shared
//! transactional store.
//!
//! ## Architecture
//!
//! Agents never talk to each other. The scheduling loop, the distributor, the
//! worker wrapper and the reaper each read state from the [`database::Store`]
//! and write back through conditional updates, so concurrent writers fail
//! closed and the loser of a race observes the winner's state on its next read.
//!
//! ## Key Features
//!
//! - **Four state machines**: Workflow, WorkflowRun, Task and TaskInstance,
//!   each a closed transition table checked against the status registry
//! - **DAG-driven scheduling**: the fringe of ready tasks is recomputed from
//!   store reads every iteration; dispatch respects global and per-template
//!   concurrency limits and goes out in same-resource batches
//! - **Resource-adaptive retries**: a resource kill scales the request before
//!   the retry, with fallback queues when a queue is outgrown
//! - **Idempotent resume**: rebinding the same workflow resumes it; cold resume
//!   kills running work, hot resume keeps it
//! - **Liveness reaping**: stale runs and instances are reclaimed with
//!   compare-and-swap on heartbeat age
//!
//! ## Module Organization
//!
//! - [`state_machine`] - status registry and the four lifecycles
//! - [`dag`] - dependency graph and fringe computation
//! - [`models`] - persisted records and identity hashing
//! - [`database`] - the store contract, in-memory and PostgreSQL stores
//! - [`resources`] - resource resolution, queues and scaling
//! - [`orchestration`] - binder, scheduling loop, triage, distributor, reaper, admin
//! - [`backends`] - the cluster backend contract and local backends
//! - [`worker`] - the wrapper around a task's command
//! - [`config`] - configuration management
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taskswarm::backends::DummyBackend;
//! use taskswarm::config::SwarmConfig;
//! use taskswarm::database::InMemoryStore;
//! use taskswarm::orchestration::{
//!     run_workflow, BindOptions, Binder, PollingNotifier, SwarmContext, TaskSpec, WorkflowSpec,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = SwarmContext::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(PollingNotifier),
//!     SwarmConfig::default(),
//! );
//! let spec = WorkflowSpec {
//!     tool_version_id: 1,
//!     name: "hello".into(),
//!     tasks: vec![
//!         TaskSpec::new("fetch", 1, "echo fetch"),
//!         TaskSpec::new("report", 2, "echo report").with_upstream("fetch"),
//!     ],
//!     ..Default::default()
//! };
//! let bound = Binder::new(ctx.clone()).bind(&spec, &BindOptions::default()).await?;
//! let summary = run_workflow(ctx, Arc::new(DummyBackend), bound.workflow_run.workflow_run_id, None).await?;
//! println!("finished with {}", summary.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! Unit tests run against [`database::InMemoryStore`]; the PostgreSQL store
//! tests need `DATABASE_URL`:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod dag;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod resources;
pub mod state_machine;
pub mod worker;

pub use config::{ConfigManager, SwarmConfig};
pub use constants::events as system_events;
pub use database::{InMemoryStore, PgStore, Store, StoreError};
pub use error::{Result, TaskswarmError};
pub use orchestration::{
    run_workflow, Admin, BindOptions, Binder, Reaper, Swarm, SwarmContext, SwarmError,
    SwarmRunSummary, TaskSpec, WorkflowSpec,
};
pub use state_machine::{TaskInstanceStatus, TaskStatus, WorkflowRunStatus, WorkflowStatus};
