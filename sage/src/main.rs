//! 🧠 Sage Service - Bayesian Pool Management
//!
//! Keeps a Normal-Inverse-Gamma posterior per tracked trader, selects the
//! Alpha Pool by seeded Thompson sampling, computes pairwise trader
//! correlations, and writes the daily shadow-ledger snapshot with FDR
//! qualification.

mod api;
mod config;
mod consumers;
mod correlation;
mod metrics;
mod posterior;
mod selection;
mod snapshot;
mod thompson;

use anyhow::{Context, Result};
use common::bus::Bus;
use common::db::Db;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::correlation::CorrelationJob;
use crate::selection::Selector;
use crate::snapshot::SnapshotJob;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    config.validate()?;
    info!("✅ Configuration: loaded");

    let db = Arc::new(Db::connect(&config.infra.database_url).await?);
    db.run_migrations().await?;
    let bus = Arc::new(Bus::connect(&config.infra.nats_url).await?);

    let selector = Arc::new(Selector::new(db.clone(), bus.clone(), config.pool.clone()).await?);
    let snapshot = Arc::new(SnapshotJob::new(db.clone(), config.jobs.clone()));
    let correlation = Arc::new(CorrelationJob::new(db.clone(), config.jobs.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Bus consumers.
    tokio::spawn(consumers::run_outcome_consumer(
        db.clone(),
        bus.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(consumers::run_candidate_consumer(
        db.clone(),
        bus,
        shutdown_rx.clone(),
    ));

    // Fresh-install detection: empty pool refreshes immediately.
    if selector.pool_is_empty().await.unwrap_or(false) {
        info!("🏆 empty pool detected, running initial refresh");
        if let Err(e) = selector.refresh_pool(None).await {
            warn!("❌ initial pool refresh failed: {e:#}");
        }
    }

    // Pool refresh cadence.
    {
        let selector = selector.clone();
        let hours = config.jobs.pool_refresh_hours.max(1);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3_600));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = selector.refresh_pool(None).await {
                            warn!("❌ scheduled pool refresh failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Daily correlation job.
    {
        let correlation = correlation.clone();
        let hours = config.jobs.correlation_hours.max(1);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3_600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = correlation.run_once().await {
                            warn!("❌ correlation job failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Daily shadow-ledger snapshot.
    {
        let snapshot = snapshot.clone();
        let selector = selector.clone();
        let hours = config.jobs.snapshot_hours.max(1);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(hours * 3_600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let date = chrono::Utc::now().date_naive();
                        let version = selector.current_version();
                        if let Err(e) = snapshot.run_once(date, version).await {
                            metrics::get().snapshot_failures.inc();
                            warn!("❌ snapshot job failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // HTTP surface.
    let app = api::router(api::ApiState {
        db,
        selector,
        snapshot,
    });
    let addr = format!("0.0.0.0:{}", config.infra.http_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("✅ HTTP: listening on {addr}");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("❌ HTTP server error: {e}");
        }
    });

    info!("🚀 Sage service started");

    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown signal received");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Sage shut down complete");
    Ok(())
}
