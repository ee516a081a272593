pub mod cache;
pub mod cli;
pub mod download;
pub mod error;
pub mod io_util;
pub mod logging;
pub mod metrics;
pub mod settings;
pub mod state;
pub mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::info;

use crate::{
    cache::CacheCoordinator,
    cli::Command,
    download::{DownloadOutcome, Downloader, LocalFileFetcher},
    settings::Settings,
};

/// Executes one CLI command against the caches described by `settings` and
/// prints its JSON result to stdout.
pub async fn run(settings: Settings, command: Command) -> Result<()> {
    let coordinator = CacheCoordinator::open(&settings, None).await;
    let output = execute(&settings, &coordinator, command).await;
    coordinator.shutdown().await;

    if let Some(value) = output? {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}

async fn execute(
    settings: &Settings,
    coordinator: &CacheCoordinator,
    command: Command,
) -> Result<Option<Value>> {
    let value = match command {
        Command::Stats => serde_json::to_value(coordinator.stats().await)?,
        Command::Sweep { trigger, if_due } => {
            if if_due && !coordinator.should_sweep() {
                json!({ "trigger": trigger, "skipped": true })
            } else {
                serde_json::to_value(coordinator.sweep_all(trigger).await?)?
            }
        }
        Command::Purge => serde_json::to_value(coordinator.purge_all().await?)?,
        Command::Import { category, source } => {
            let source = tokio::fs::canonicalize(&source)
                .await
                .with_context(|| format!("failed to resolve {}", source.display()))?;
            let downloader =
                Downloader::new(coordinator.clone(), Arc::new(LocalFileFetcher), settings);
            let outcome = downloader
                .download(category, &source.to_string_lossy())
                .await?;
            describe_outcome(&outcome)
        }
        Command::Run => {
            serve(settings, coordinator).await?;
            return Ok(None);
        }
    };
    Ok(Some(value))
}

fn describe_outcome(outcome: &DownloadOutcome) -> Value {
    match outcome {
        DownloadOutcome::Hit(path) => json!({ "outcome": outcome.label(), "path": path }),
        DownloadOutcome::Stored { path, bytes } => {
            json!({ "outcome": outcome.label(), "path": path, "bytes": bytes })
        }
        DownloadOutcome::Bypassed { reason, .. } | DownloadOutcome::Uncached { reason } => {
            json!({ "outcome": outcome.label(), "reason": reason.to_string(), "kind": reason.kind() })
        }
    }
}

/// Keeps the coordinator alive with its scheduler until interrupted.
async fn serve(settings: &Settings, coordinator: &CacheCoordinator) -> Result<()> {
    if let Some(result) = coordinator.on_startup().await? {
        info!(
            deleted = result.total_deleted_count,
            cleaned_bytes = result.total_cleaned_bytes,
            "startup sweep finished"
        );
    }
    coordinator.spawn_scheduler(settings.scheduler_check_interval())?;
    spawn_low_memory_task(coordinator.clone());
    info!("cache coordinator running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    coordinator.on_shutdown().await;
    Ok(())
}

#[cfg(unix)]
fn spawn_low_memory_task(coordinator: CacheCoordinator) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGUSR1 handler");
                return;
            }
        };

        while usr1.recv().await.is_some() {
            tracing::info!("received SIGUSR1; running low-memory sweep");
            if let Err(err) = coordinator.on_low_memory() {
                tracing::warn!(error = %err, "low-memory sweep not queued");
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_low_memory_task(_coordinator: CacheCoordinator) {
    tracing::info!("SIGUSR1 low-memory sweeps are not supported on this platform");
}
