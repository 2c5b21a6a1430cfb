//! Reminder daemon.
//!
//! Opens the SQLite store, attaches the Web Push transport when VAPID keys
//! are configured, and runs the scheduler until Ctrl+C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ticktock::scheduler::LeaderLease;
use ticktock::{NotifierConfig, NotifyError, Scheduler, SqliteStore, StoreHandles, WebPushTransport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ticktockd", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop until interrupted.
    Run,

    /// Run a single tick and exit.
    Once,

    /// Send a test notification to every subscription of an owner.
    TestPush {
        /// Owner whose subscriptions receive the test payload.
        owner: String,
    },

    /// Write the default configuration file and exit.
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ticktock=info,ticktockd=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(NotifierConfig::default_config_path);

    let command = cli.command.unwrap_or(Command::Run);
    if let Command::InitConfig = command {
        NotifierConfig::default().save_to_file(&config_path)?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    let mut config = NotifierConfig::load_or_default(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let scheduler = build_scheduler(&config)?;

    match command {
        Command::Run => run_daemon(scheduler).await,
        Command::Once => run_once(scheduler).await,
        Command::TestPush { owner } => send_test(&scheduler, &owner).await,
        Command::InitConfig => Ok(()),
    }
}

fn build_scheduler(config: &NotifierConfig) -> anyhow::Result<Scheduler> {
    let store = Arc::new(SqliteStore::open(&config.store.database_path)?);
    info!(path = %config.store.database_path.display(), "opened reminder store");

    let mut scheduler = Scheduler::new(StoreHandles::unified(store), config)?;

    match WebPushTransport::from_config(&config.push) {
        Ok(transport) => scheduler = scheduler.with_transport(Arc::new(transport)),
        Err(NotifyError::ConfigurationMissing(reason)) => {
            warn!("push delivery disabled: {reason}");
        }
        Err(e) => return Err(e.into()),
    }

    if config.lease.enabled {
        let lease = LeaderLease::from_config(&config.lease);
        info!(instance = lease.instance_id(), "leader lease enabled");
        scheduler = scheduler.with_leader_lease(lease);
    }

    Ok(scheduler)
}

async fn run_daemon(scheduler: Scheduler) -> anyhow::Result<()> {
    println!("ticktockd v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let handle = scheduler.run(cancel.clone());

    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });

    handle.await?;
    info!("ticktockd shut down cleanly");
    Ok(())
}

async fn run_once(mut scheduler: Scheduler) -> anyhow::Result<()> {
    let now = chrono::Utc::now();
    if !scheduler.should_execute_tick(now) {
        info!("another instance holds the scheduler lease; nothing to do");
        return Ok(());
    }
    let report = scheduler.tick_at(now).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.scan_failed {
        anyhow::bail!("task scan failed");
    }
    Ok(())
}

async fn send_test(scheduler: &Scheduler, owner: &str) -> anyhow::Result<()> {
    let summary = scheduler.send_test_notification(owner).await?;
    println!(
        "delivered: {}, transient failures: {}, removed: {}",
        summary.delivered,
        summary.transient,
        summary.pruned.len()
    );
    Ok(())
}
