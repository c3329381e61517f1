mod board_file;
mod config;
mod ledger_cmd;
mod lease_cmd;
mod rpc;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use board_file::FileBoard;
use config::MarcusConfig;
use marcus_core::coordinator::Coordinator;
use marcus_core::events::EventBus;
use marcus_core::infer::DependencyInferer;
use marcus_core::lease::LeaseManager;
use marcus_core::reconcile::{Reconciler, ReversionCounts};
use marcus_db::cache::DependencyCache;
use marcus_db::ledger::AssignmentLedger;

#[derive(Parser)]
#[command(name = "marcus", about = "Assignment coordination core for autonomous coding agents")]
struct Cli {
    /// Path to the marcus config file (overrides the XDG default)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Data directory for the ledger, cache, and file-backed board
    /// (overrides `MARCUS_DATA_DIR` and the config file)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a marcus config file and create the data directory
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the JSON-RPC-over-stdio coordination server
    Serve,
    /// Inspect or clear the assignment ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// Force-release a stuck lease
    Lease {
        #[command(subcommand)]
        command: LeaseCommands,
    },
    /// Run one reconciliation pass against the board and exit
    Reconcile,
}

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// Print every active assignment
    Show,
    /// Remove every assignment from the ledger (does not touch the board)
    Clear,
}

#[derive(Subcommand)]
pub enum LeaseCommands {
    /// Force-release the lease held on a task, regardless of holder
    ForceRelease {
        task_id: String,
        /// Reason recorded in the LEASE_FORCED_RELEASE event
        #[arg(long, default_value = "operator request")]
        reason: String,
    },
}

/// `marcus init`: write a config file, no data directory contents required.
fn cmd_init(config_path_override: Option<&str>, data_dir_override: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config_path_override.map(std::path::PathBuf::from).unwrap_or_else(config::config_path);
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let data_dir = data_dir_override.map(std::path::PathBuf::from).unwrap_or_else(config::default_data_dir);

    let mut cfg = config::ConfigFile::default();
    cfg.core.data_dir = Some(data_dir.display().to_string());
    config::save_config_to(&path, &cfg)?;

    std::fs::create_dir_all(&data_dir).with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    println!("Config written to {}", path.display());
    println!("Data directory: {}", data_dir.display());
    println!();
    println!("Next: run `marcus serve` to start the coordination server.");
    Ok(())
}

/// Build the `Coordinator`, `Reconciler`, and a standalone `LeaseManager`
/// handle (for the expiry-sweep loop) from a resolved config. Used by
/// `serve`, `reconcile`, and the admin subcommands so every entry point
/// sees the same wiring. `LeaseManager` is cheap to construct twice: it
/// is a thin wrapper over the shared ledger/event-bus `Arc`s, not an
/// owner of its own state.
struct Runtime {
    coordinator: Arc<Coordinator>,
    reconciler: Arc<Reconciler>,
    lease_manager: LeaseManager,
    check_interval: std::time::Duration,
}

fn build_runtime(cfg: &MarcusConfig) -> Runtime {
    let board = Arc::new(FileBoard::open(&cfg.data_dir, false));
    let ledger = Arc::new(AssignmentLedger::open(&cfg.data_dir, false));
    let events = Arc::new(EventBus::new(cfg.event_queue_max));
    let cache = Arc::new(DependencyCache::open(&cfg.data_dir, false));
    let reversions = Arc::new(ReversionCounts::new());

    let lease_manager = LeaseManager::new(ledger.clone(), events.clone(), cfg.lease_config);
    let tick_lease_manager = LeaseManager::new(ledger.clone(), events.clone(), cfg.lease_config);
    let inferer = DependencyInferer::new(cfg.infer_config.clone(), None, cache);
    let coordinator = Arc::new(Coordinator::new(
        board.clone(),
        None,
        ledger.clone(),
        lease_manager,
        events.clone(),
        inferer,
        cfg.coordinator_config,
    ));
    let reconciler = Arc::new(Reconciler::new(board, ledger, events, reversions, cfg.check_interval_seconds));

    Runtime {
        coordinator,
        reconciler,
        lease_manager: tick_lease_manager,
        check_interval: std::time::Duration::from_secs(cfg.check_interval_seconds),
    }
}

/// Periodic expiry sweep (§4.4): `LeaseManager::tick` clears expired
/// leases from the ledger; the reconciler then reverts each task on the
/// board so a future `request_next_task` can see it again (S4).
async fn run_lease_expiry_loop(lease_manager: LeaseManager, reconciler: Arc<Reconciler>, period: std::time::Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match lease_manager.tick().await {
                    Ok(expired) => {
                        for task_id in expired {
                            reconciler.heal_expired_lease(&task_id).await;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "lease expiry sweep failed, retrying next cycle"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn cmd_serve(cfg: &MarcusConfig) -> anyhow::Result<()> {
    let runtime = build_runtime(cfg);

    let report = runtime.reconciler.reconcile_on_startup().await;
    tracing::info!(
        removed = report.removed,
        restored = report.restored,
        verified = report.verified,
        errors = report.errors,
        "startup reconciliation complete"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_reconciler = runtime.reconciler.clone();
    let monitor_handle = tokio::spawn(async move { monitor_reconciler.run_monitor(shutdown_rx).await });

    let (lease_shutdown_tx, lease_shutdown_rx) = tokio::sync::watch::channel(false);
    let lease_manager = runtime.lease_manager;
    let lease_reconciler = runtime.reconciler.clone();
    let check_interval = runtime.check_interval;
    let lease_handle = tokio::spawn(async move { run_lease_expiry_loop(lease_manager, lease_reconciler, check_interval, lease_shutdown_rx).await });

    let serve_result = rpc::serve(runtime.coordinator).await;

    let _ = shutdown_tx.send(true);
    let _ = lease_shutdown_tx.send(true);
    let _ = monitor_handle.await;
    let _ = lease_handle.await;

    serve_result
}

async fn cmd_reconcile(cfg: &MarcusConfig) -> anyhow::Result<()> {
    let runtime = build_runtime(cfg);
    let report = runtime.reconciler.reconcile_on_startup().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(cli.config.as_deref(), cli.data_dir.as_deref(), force)?;
        }
        Commands::Serve => {
            let cfg = MarcusConfig::resolve_with_config_path(cli.data_dir.as_deref(), cli.config.as_deref())?;
            cmd_serve(&cfg).await?;
        }
        Commands::Ledger { command } => {
            let cfg = MarcusConfig::resolve_with_config_path(cli.data_dir.as_deref(), cli.config.as_deref())?;
            ledger_cmd::run(&cfg, command).await?;
        }
        Commands::Lease { command } => {
            let cfg = MarcusConfig::resolve_with_config_path(cli.data_dir.as_deref(), cli.config.as_deref())?;
            lease_cmd::run(&cfg, command).await?;
        }
        Commands::Reconcile => {
            let cfg = MarcusConfig::resolve_with_config_path(cli.data_dir.as_deref(), cli.config.as_deref())?;
            cmd_reconcile(&cfg).await?;
        }
    }

    Ok(())
}
