//! 🔭 Scout Service - Candidate Selection
//!
//! Ingests the venue leaderboard once per UTC day (and on demand), scores and
//! filters candidates through seven quality gates, publishes one candidate
//! event per kept address, and hosts the pinned-account registry.

mod api;
mod config;
mod leaderboard;
mod metrics;
mod pinned;
mod scoring;

use anyhow::{Context, Result};
use common::bus::Bus;
use common::db::Db;
use common::hyperliquid::HlClient;
use common::ratelimit::RateLimiter;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::leaderboard::Refresher;
use crate::pinned::PinnedRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    config.validate()?;
    info!("✅ Configuration: loaded");
    print_banner(&config);

    let db = Arc::new(Db::connect(&config.infra.database_url).await?);
    db.run_migrations().await?;

    let bus = Arc::new(Bus::connect(&config.infra.nats_url).await?);

    let limiter = Arc::new(RateLimiter::new(config.infra.venue_calls_per_sec));
    let hl = Arc::new(HlClient::new(&config.infra.venue_api_base, limiter)?);

    let refresher = Arc::new(Refresher::new(db.clone(), bus, hl, config.clone()));
    let pinned = Arc::new(PinnedRegistry::new(db));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Daily refresh loop (fires immediately on a fresh install).
    let loop_refresher = refresher.clone();
    let loop_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        leaderboard::run_refresh_loop(loop_refresher, loop_shutdown).await;
    });

    // HTTP surface.
    let app = api::router(api::ApiState { refresher, pinned });
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

    info!("🚀 Scout service started");

    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown signal received");
    let _ = shutdown_tx.send(true);
    // Give background loops a beat to observe the signal.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("Scout shut down complete");
    Ok(())
}

fn print_banner(config: &Config) {
    info!("======================================================");
    info!("🔭 SCOUT SERVICE - CANDIDATE SELECTION");
    info!("   period: {}d | top-K: {}", config.refresh.period_days, config.refresh.top_k);
    info!("   refresh every {}h", config.refresh.refresh_interval_hours);
    info!("   metrics: http://localhost:{}/metrics", config.infra.http_port);
    info!("======================================================");
}
