//! 📡 Stream Service - Live Fill Ingestion & Fan-out
//!
//! Keeps a live view of the dynamic watchlist (pinned ∪ alpha pool ∪
//! custom), normalizes and publishes every fill, repairs position-chain
//! gaps, streams events to dashboard subscribers, and writes minute bars
//! with ATR for the decision core.

mod api;
mod chain;
mod config;
mod fanout;
mod fills;
mod metrics;
mod price_feed;
mod subscriptions;
mod tracker;

use anyhow::{Context, Result};
use common::bus::Bus;
use common::db::Db;
use common::hyperliquid::HlClient;
use common::ratelimit::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::chain::ChainValidator;
use crate::config::Config;
use crate::fanout::EventRing;
use crate::fills::FillIngestor;
use crate::price_feed::PriceCache;
use crate::subscriptions::{SourceLabel, SubscriptionManager};
use crate::tracker::{PositionCache, TrackerSupervisor};

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

    let limiter = Arc::new(RateLimiter::new(config.infra.venue_calls_per_sec));
    let hl = Arc::new(HlClient::new(&config.infra.venue_api_base, limiter)?);

    let ring = Arc::new(EventRing::new(config.feed.event_ring_capacity));
    let prices = Arc::new(PriceCache::new());
    let positions: Arc<PositionCache> = Arc::new(PositionCache::new());
    let manager = Arc::new(SubscriptionManager::new(config.subs.websocket_slots));
    let ingestor = Arc::new(FillIngestor::new(db.clone(), bus, ring.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Watchlist sync: pinned + alpha pool from the shared DB.
    {
        let db = db.clone();
        let manager = manager.clone();
        let sync_secs = config.subs.watchlist_sync_secs;
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(sync_secs.max(5)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sync_watchlist(&db, &manager).await {
                            warn!("⚠️ watchlist sync failed: {e:#}");
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Tracker supervisor.
    {
        let supervisor = TrackerSupervisor::new(
            manager.clone(),
            hl.clone(),
            ingestor.clone(),
            positions.clone(),
            config.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            supervisor.run(shutdown).await;
        });
    }

    // Price feed + minute bars.
    {
        let hl = hl.clone();
        let db = db.clone();
        let prices = prices.clone();
        let poll = config.feed.price_poll_secs;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            price_feed::run_price_feed(hl, db, prices, poll, shutdown).await;
        });
    }

    // Chain validator sweep.
    {
        let validator = Arc::new(ChainValidator::new(db.clone(), hl, ingestor));
        let secs = config.subs.chain_check_secs;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            chain::run_chain_loop(validator, secs, shutdown).await;
        });
    }

    // HTTP surface (including /ws fan-out).
    let app = api::router(api::ApiState {
        ring,
        prices,
        positions,
        manager,
        feed_config: config.feed.clone(),
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

    info!("🚀 Stream service started");

    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown signal received");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("Stream shut down complete");
    Ok(())
}

/// Pull the pinned registry and alpha pool into the subscription manager.
async fn sync_watchlist(db: &Db, manager: &SubscriptionManager) -> Result<()> {
    let client = db.lock().await;

    let pinned: Vec<String> = client
        .query("SELECT address FROM pinned_accounts", &[])
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();

    let pool: Vec<String> = client
        .query("SELECT address FROM alpha_pool WHERE is_active", &[])
        .await?
        .into_iter()
        .map(|r| r.get(0))
        .collect();
    drop(client);

    manager.sync_source(SourceLabel::Pinned, &pinned);
    manager.sync_source(SourceLabel::AlphaPool, &pool);
    Ok(())
}
