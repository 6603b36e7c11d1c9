//! # taskswarm
//!
//! Operator CLI against the PostgreSQL store: resume workflows, force task
//! statuses, change concurrency limits and run the reaper as its own process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};

use taskswarm::backends::{ClusterBackend, DummyBackend, SequentialBackend};
use taskswarm::config::ConfigManager;
use taskswarm::database::{with_retry, PgStore};
use taskswarm::logging::init_structured_logging;
use taskswarm::orchestration::{Admin, PollingNotifier, Reaper, SwarmContext, TaskStatusTarget};

#[derive(Parser)]
#[command(name = "taskswarm")]
#[command(about = "Operate taskswarm workflows")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: ./config)
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Environment overlay to load (development, test, production)
    #[arg(short, long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resume a workflow and drive it to completion from this process
    Resume {
        #[arg(short, long)]
        workflow_id: i64,

        /// Kill running instances of the previous run and rerun every unfinished task
        #[arg(long)]
        cold: bool,

        /// Stop scheduling after this many seconds
        #[arg(long)]
        timeout_seconds: Option<u64>,

        #[arg(long, value_enum, default_value_t = BackendKind::Sequential)]
        backend: BackendKind,
    },

    /// Force tasks to DONE, or reset them and everything downstream to REGISTERING
    SetTaskStatus {
        /// Task ids, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        task_ids: Vec<i64>,

        /// DONE or REGISTERING
        #[arg(short, long)]
        status: TaskStatusTarget,
    },

    /// Change a workflow's concurrency limit, or one template's limit within it
    Concurrency {
        #[arg(short, long)]
        workflow_id: i64,

        #[arg(short, long)]
        limit: u32,

        #[arg(long)]
        template_id: Option<i64>,
    },

    /// Run the liveness sweep
    Reaper {
        /// Sweep once and exit
        #[arg(long)]
        once: bool,

        /// Log what would be reaped without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Apply pending database migrations
    Migrate,

    /// Load and validate configuration, then print it
    ValidateConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    Dummy,
    Sequential,
}

#[tokio::main]
async fn main() {
    init_structured_logging();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(error = %format!("{err:#}"), "Command failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let manager = match &cli.environment {
        Some(environment) => {
            ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), environment)
        }
        None => ConfigManager::load_from_directory(cli.config_dir.clone()),
    }
    .context("loading configuration")?;

    if let Commands::ValidateConfig = cli.command {
        println!("environment: {}", manager.environment());
        println!("directory:   {}", manager.config_directory().display());
        println!("{}", serde_json::to_string_pretty(manager.config())?);
        return Ok(());
    }

    let mut config = manager.config().clone();
    if let Commands::Reaper { dry_run: true, .. } = cli.command {
        config.reaper.dry_run = true;
    }

    let store = with_retry(&config.retry, "connect", || PgStore::connect(&config.database))
        .await
        .context("connecting to the store")?;
    if let Commands::Migrate = cli.command {
        store.migrate().await.context("running migrations")?;
        info!("Migrations applied");
        return Ok(());
    }

    let ctx = SwarmContext::new(Arc::new(store), Arc::new(PollingNotifier), config);
    let admin = Admin::new(ctx.clone());

    match cli.command {
        Commands::Resume {
            workflow_id,
            cold,
            timeout_seconds,
            backend,
        } => {
            let backend: Arc<dyn ClusterBackend> = match backend {
                BackendKind::Dummy => Arc::new(DummyBackend),
                BackendKind::Sequential => Arc::new(SequentialBackend::new(
                    ctx.instances.clone(),
                    ctx.config.distributor.heartbeat_interval(),
                )),
            };
            let timeout = timeout_seconds
                .map(Duration::from_secs)
                .or_else(|| ctx.config.scheduler.timeout());
            let user = std::env::var("USER").unwrap_or_else(|_| "taskswarm".to_string());
            let summary = admin
                .resume_workflow(workflow_id, cold, timeout, backend, &user)
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::SetTaskStatus { task_ids, status } => {
            for (task_id, status) in admin.set_task_status(&task_ids, status).await? {
                println!("{task_id}\t{status}");
            }
        }
        Commands::Concurrency {
            workflow_id,
            limit,
            template_id,
        } => match template_id {
            Some(template_id) => {
                admin
                    .set_template_concurrency(workflow_id, template_id, limit)
                    .await?
            }
            None => admin.set_max_concurrently_running(workflow_id, limit).await?,
        },
        Commands::Reaper { once, .. } => {
            let reaper = Reaper::new(ctx);
            if once {
                let summary = reaper.sweep().await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Shutdown requested");
                        let _ = shutdown_tx.send(true);
                    }
                });
                reaper.run(shutdown_rx).await?;
            }
        }
        Commands::Migrate | Commands::ValidateConfig => bail!("handled above"),
    }
    Ok(())
}
