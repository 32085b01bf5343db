//! `tradeflow-sync`: keeps the local offline queue flushed against the API.
//!
//! `tradeflow-sync --recover-corrupted` moves an unreadable queue record aside
//! and exits.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tradeflow_offline::{AppState, OfflineConfig, SqliteJobQueue};

#[derive(Debug, Parser)]
#[command(name = "tradeflow-sync")]
#[command(about = "Replay queued offline mutations against the tradeflow API")]
#[command(version)]
struct Cli {
    /// Move an unreadable queue record aside, start an empty queue and exit
    #[arg(long)]
    recover_corrupted: bool,

    /// Queue database file (overrides TRADEFLOW_QUEUE_DB)
    #[arg(long, value_name = "PATH")]
    queue_db: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tradeflow_observability::init();

    let mut config = OfflineConfig::from_env().context("invalid configuration")?;
    if let Some(path) = cli.queue_db {
        config.queue_db = Some(path);
    }

    if cli.recover_corrupted {
        return recover(&config).await;
    }

    tracing::info!(
        api_url = %config.api_url,
        probe_interval_secs = config.probe_interval.as_secs(),
        max_attempts = ?config.replay_policy.max_attempts,
        max_age_secs = ?config.replay_policy.max_age.map(|d| d.as_secs()),
        "starting tradeflow-sync"
    );

    let state = AppState::from_config(&config)?;

    match state.pending_jobs().await {
        Ok(jobs) => tracing::info!(pending = jobs.len(), "offline queue opened"),
        Err(err) => tracing::error!(
            error = %err,
            "offline queue is unreadable; run with --recover-corrupted to move it aside"
        ),
    }

    let background = state.start_background(config.probe_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    background.shutdown().await;
    tracing::info!("tradeflow-sync stopped");
    Ok(())
}

async fn recover(config: &OfflineConfig) -> anyhow::Result<()> {
    let queue = match &config.queue_db {
        Some(path) => SqliteJobQueue::at_path(path),
        None => SqliteJobQueue::at_default_path()?,
    };

    match queue.recover_corrupted().await? {
        Some(backup_key) => {
            tracing::info!(backup_key = %backup_key, "recovery complete; queue reset")
        }
        None => tracing::info!("queue record is readable; nothing to recover"),
    }
    Ok(())
}
