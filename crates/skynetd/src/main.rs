//! skynetd, the Skynet control plane binary.
//!
//! # Usage
//!
//! ```text
//! skynetd run --config skynet.toml
//! skynetd enqueue --action '{"action":"uptime"}' --requires shell
//! skynetd tasks --status queued
//! skynetd cancel t1 --reason "wrong target"
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use skynet_placement::{ScoringWeights, Selector};
use skynet_state::TaskStatus;
use skynetd::commands::{self, EnqueueOptions};
use skynetd::daemon;
use skynetd::logging::{self, LogFormat};

#[derive(Parser)]
#[command(name = "skynetd", about = "Skynet task scheduler control plane", version, propagate_version = true)]
struct Cli {
    /// Control plane configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State store path. Overrides [store].path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loops, reaper, and health monitor until Ctrl-C.
    Run {
        /// Dispatch to an in-memory gateway instead of HTTP endpoints.
        #[arg(long)]
        dry_run: bool,
    },
    /// Add a task to the queue.
    Enqueue {
        /// Action payload, usually JSON.
        #[arg(long)]
        action: String,
        /// Task id (generated when omitted).
        #[arg(long)]
        id: Option<String>,
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
        /// Resource key held exclusively while the task runs.
        #[arg(long = "file")]
        files: Vec<String>,
        /// Capability the executing gateway must offer.
        #[arg(long)]
        requires: Vec<String>,
        /// Capability that raises a gateway's score.
        #[arg(long)]
        prefers: Vec<String>,
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        priority: i32,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Pin the task to a gateway when it is eligible.
        #[arg(long)]
        gateway: Option<String>,
    },
    /// List tasks.
    Tasks {
        #[arg(long)]
        status: Option<TaskStatus>,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show a task with its diagnosis and events.
    Show { task_id: String },
    /// Show which task would be claimed next, without claiming it.
    Next {
        #[arg(long)]
        agent: Option<String>,
    },
    /// Claim owners, gateways, and workers.
    Agents,
    /// Held resource locks.
    Locks,
    /// Read the event stream.
    Events {
        #[arg(long, default_value = "0")]
        cursor: u64,
        #[arg(long, default_value = "100")]
        limit: usize,
        /// Only this task's history.
        #[arg(long)]
        task: Option<String>,
    },
    /// Aggregate counts of tasks, gateways, workers, and locks.
    State,
    /// Score every gateway for a task.
    Explain { task_id: String },
    /// Register or update a gateway.
    RegisterGateway {
        gateway_id: String,
        endpoint: String,
        #[arg(long = "capability")]
        capabilities: Vec<String>,
        #[arg(long, default_value = "4")]
        capacity: u32,
    },
    /// Remove a gateway from the registry.
    DeregisterGateway { gateway_id: String },
    /// Register or update a worker.
    RegisterWorker {
        worker_id: String,
        #[arg(long)]
        gateway: Option<String>,
        #[arg(long = "capability")]
        capabilities: Vec<String>,
    },
    /// Cancel a claimed or running task.
    Cancel {
        task_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Lock an extra resource for a claimed or running task.
    ClaimResource { task_id: String, resource: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    let config = daemon::load_config(cli.config.as_deref())?;
    let state = daemon::open_store(&config, cli.db.as_deref())?;

    let output = match cli.command {
        Command::Run { dry_run } => {
            info!(instances = config.scheduler.instances, dry_run, "Skynet daemon starting");
            let client = daemon::build_client(&config, dry_run)?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                }
                let _ = shutdown_tx.send(true);
            });

            daemon::serve(&config, state, client, shutdown_rx).await?;
            info!("Skynet daemon stopped");
            return Ok(());
        }
        Command::Enqueue {
            action,
            id,
            depends_on,
            files,
            requires,
            prefers,
            priority,
            max_retries,
            gateway,
        } => commands::enqueue(
            &state,
            EnqueueOptions {
                task_id: id,
                action,
                depends_on,
                files,
                requires,
                prefers,
                priority,
                max_retries,
                gateway,
            },
        )?,
        Command::Tasks { status, owner } => commands::tasks(&state, status, owner)?,
        Command::Show { task_id } => commands::show(&state, &task_id)?,
        Command::Next { agent } => commands::next(&state, agent.as_deref())?,
        Command::Agents => commands::agents(&state)?,
        Command::Locks => commands::locks(&state)?,
        Command::Events { cursor, limit, task } => commands::events(&state, cursor, limit, task.as_deref())?,
        Command::State => commands::system_state(&state)?,
        Command::Explain { task_id } => {
            let selector = Selector::new(ScoringWeights::from(&config.scoring));
            commands::explain(&state, &selector, &task_id)?
        }
        Command::RegisterGateway {
            gateway_id,
            endpoint,
            capabilities,
            capacity,
        } => commands::register_gateway(&state, &gateway_id, &endpoint, capabilities, capacity)?,
        Command::DeregisterGateway { gateway_id } => commands::deregister_gateway(&state, &gateway_id)?,
        Command::RegisterWorker {
            worker_id,
            gateway,
            capabilities,
        } => commands::register_worker(&state, &worker_id, gateway.as_deref(), capabilities)?,
        Command::Cancel { task_id, reason } => commands::cancel(&state, &task_id, &reason)?,
        Command::ClaimResource { task_id, resource } => commands::claim_resource(&state, &task_id, &resource)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
