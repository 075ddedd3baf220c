//! fleetd, the orchestrator daemon.
//!
//! Loads configuration, opens the store, wires the orchestration core and
//! runs the background workers until SIGINT/SIGTERM.

use clap::Parser;
use fleet_orchestrator::{LocalWorkspaceManager, Orchestrator, Store};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod executor_client;

use config::FleetConfig;
use executor_client::HttpLlmExecutor;

#[derive(Debug, Parser)]
#[command(name = "fleetd", about = "Agent fleet orchestration daemon")]
struct Cli {
    /// Path to a JSON configuration file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FleetConfig::load(path)?,
        None => FleetConfig::default(),
    };
    info!(?config, "fleetd starting");

    let store = match &config.snapshot_path {
        Some(path) => Arc::new(Store::open(path).await?),
        None => Arc::new(Store::new()),
    };
    let workspaces = Arc::new(LocalWorkspaceManager::new(config.workspace_root.clone()));
    let executor = Arc::new(HttpLlmExecutor::new(config.executor_url.clone()));
    let orchestrator = Orchestrator::new(
        config.orchestrator_config(),
        store.clone(),
        executor,
        workspaces,
    );

    let cancel = CancellationToken::new();
    let mut handles = orchestrator.spawn_background(&cancel);

    // Periodic snapshot persistence.
    if config.snapshot_path.is_some() {
        let snapshot_store = store.clone();
        let snapshot_cancel = cancel.clone();
        let interval = std::time::Duration::from_secs(config.snapshot_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = snapshot_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = snapshot_store.save_snapshot().await {
                            warn!(error = %e, "periodic snapshot failed");
                        }
                        let stats = snapshot_store.stats().await;
                        info!(
                            pending = stats.agents_pending,
                            executing = stats.agents_executing,
                            completed = stats.agents_completed,
                            failed = stats.agents_failed,
                            workflows = stats.workflows_running,
                            tokens = stats.tokens_used,
                            "orchestrator stats"
                        );
                    }
                }
            }
        }));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping background workers");
    cancel.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    store.save_snapshot().await?;
    info!("fleetd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("sigterm handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
