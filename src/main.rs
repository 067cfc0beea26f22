#![forbid(unsafe_code)]

//! `fleet-review` — review fleet orchestrator binary.
//!
//! Bootstraps configuration, wires the governor, session monitor,
//! state store, and action ledger together, and drives the fleet
//! until it drains or the process is interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleet_review::driver::process::ProcessDriver;
use fleet_review::governor::Governor;
use fleet_review::host::GhCliHost;
use fleet_review::ledger::ActionLedger;
use fleet_review::models::checkpoint::RunMode;
use fleet_review::monitor::SessionMonitor;
use fleet_review::orchestrator::Orchestrator;
use fleet_review::store::{FileStateStore, StateStore};
use fleet_review::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fleet-review", about = "Review fleet orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Resume the interrupted run recorded in the checkpoint file.
    #[arg(long)]
    resume: bool,

    /// Ledger plan actions as skipped without touching the host.
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the governor snapshot and store summary as JSON.
    Status,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format);
    info!("fleet-review bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config_text = std::fs::read_to_string(&args.config)
        .map_err(|err| AppError::Config(format!("cannot read config: {err}")))?;
    let config = Arc::new(GlobalConfig::from_toml_str(&config_text)?);
    info!("configuration loaded");

    let lock_timeout = Duration::from_secs(config.timeouts.lock_seconds);
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(
        config.state_path(),
        config.checkpoint_path(),
        lock_timeout,
    ));
    let ledger = Arc::new(ActionLedger::new(config.ledger_path(), lock_timeout));
    let governor = Arc::new(Governor::new(&config.governor));
    let monitor = Arc::new(SessionMonitor::new(config.monitor.clone()));
    let host = Arc::new(GhCliHost::new(config.host_cli.clone()));

    if let Some(Commands::Status) = args.command {
        return status(&governor, host.as_ref(), monitor.as_ref(), store.as_ref()).await;
    }

    let driver = Arc::new(ProcessDriver::new(
        config.agent_cli.clone(),
        config.agent_cli_args.clone(),
    ));

    let mode = if args.dry_run {
        RunMode::DryRun
    } else {
        RunMode::Review
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping workers");
            signal_cancel.cancel();
        }
    });

    let orchestrator = Orchestrator::new(
        config,
        governor,
        monitor,
        store,
        ledger,
        driver,
        host,
        mode,
        args.resume,
    );
    let summary = orchestrator.run(cancel).await?;

    let rendered = serde_json::to_string_pretty(&summary)
        .map_err(|err| AppError::Io(format!("cannot render summary: {err}")))?;
    println!("{rendered}");

    if summary.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}

/// Refresh the governor once and print its snapshot plus a store
/// summary.
async fn status(
    governor: &Governor,
    host: &GhCliHost,
    monitor: &SessionMonitor,
    store: &dyn StateStore,
) -> Result<()> {
    governor.refresh(host, monitor).await;

    let (repos_recorded, items_recorded) = match store.load() {
        Ok(doc) => (doc.repos.len(), doc.items.len()),
        Err(AppError::NotFound(_)) => (0, 0),
        Err(err) => return Err(err),
    };

    let payload = serde_json::json!({
        "governor": governor.status(),
        "repos_recorded": repos_recorded,
        "items_recorded": items_recorded,
    });
    let rendered = serde_json::to_string_pretty(&payload)
        .map_err(|err| AppError::Io(format!("cannot render status: {err}")))?;
    println!("{rendered}");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
}
