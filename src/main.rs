use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod config;
mod db;
mod error;
mod ingest;
mod provider;
mod sink;
#[cfg(test)]
mod testing;

use config::Config;
use db::Database;
use ingest::{IngestionEngine, SseSource, SubscriptionState, SyncSummary};
use provider::squiggle::normalize_base_url;
use provider::SquiggleClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)?;
    info!(
        "Database opened: {} ({} fixtures)",
        config.database_path,
        db.count_fixtures()?
    );

    let base_url = normalize_base_url(&config.provider_url)?;
    let provider = SquiggleClient::new(&base_url, &config.user_agent, config.request_timeout())?;
    let source = SseSource::new(&base_url, &config.user_agent, config.request_timeout())?;
    info!("Provider: {}", base_url);

    let engine = Arc::new(IngestionEngine::new(
        Arc::new(provider),
        Arc::new(source),
        Arc::new(db.clone()),
        config.subscriber_options(),
        config.sync_options(),
    ));
    engine.initialize().await;

    // Bulk sync: once at startup, then on the refresh interval if enabled.
    // Each refresh also revives a stream subscription that gave up.
    let sync_engine = Arc::clone(&engine);
    let sync_db = db.clone();
    let sync_config = config.clone();
    let sync_task = tokio::spawn(async move {
        if sync_config.sync_on_start {
            run_sync(&sync_engine, &sync_db, sync_config.sync_year()).await;
        }
        let Some(period) = sync_config.sync_interval() else {
            return;
        };
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            if sync_engine.stream_state() == SubscriptionState::Stopped {
                warn!("Event stream subscription is down, restarting it");
                sync_engine.initialize().await;
            }
            run_sync(&sync_engine, &sync_db, sync_config.sync_year()).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown(&engine, sync_task).await;

    Ok(())
}

/// Stop background syncing, then the engine. The sync task is awaited after
/// the abort so none of its writes land once this returns.
async fn shutdown(engine: &IngestionEngine, sync_task: JoinHandle<()>) {
    sync_task.abort();
    let _ = sync_task.await;
    engine.shutdown().await;
}

async fn run_sync(engine: &IngestionEngine, db: &Database, year: i32) {
    match engine.sync_up_to_latest_completed_round(year).await {
        Ok(summary) => log_summary(&summary, db),
        Err(e) => error!("Bulk sync for {} failed: {}", year, e),
    }
}

fn log_summary(summary: &SyncSummary, db: &Database) {
    let stored = db.count_fixtures().unwrap_or(-1);
    match summary.synced_year {
        Some(year) if summary.is_partial() => warn!(
            "Bulk sync {} partial: {} rounds ok, {} failed, {} fixtures written ({} stored)",
            year, summary.rounds_succeeded, summary.rounds_failed, summary.fixtures_written, stored
        ),
        Some(year) => info!(
            "Bulk sync {} done: rounds 0..={} ({} fixtures written, {} stored)",
            year,
            summary.highest_completed_round.unwrap_or(0),
            summary.fixtures_written,
            stored
        ),
        None => info!(
            "Bulk sync for {}: no completed rounds within {} season(s)",
            summary.requested_year,
            summary.fallback_depth + 1
        ),
    }
}
