//! ⚖️ Decide Service - The Decision Core
//!
//! Reconstructs position episodes from the fill stream, runs the five-gate
//! consensus state machine, applies the risk governor and Kelly sizing,
//! routes accepted signals to the best execution venue, and manages stops.
//! Every evaluation — signal or not — lands in the decision log with its
//! reasoning.

mod api;
mod config;
mod consensus;
mod consumers;
mod decision_log;
mod episodes;
mod execution;
mod market;
mod metrics;
mod regime;
mod risk;
mod sizing;

use anyhow::{Context, Result};
use common::bus::Bus;
use common::db::Db;
use common::hyperliquid::HlClient;
use common::ratelimit::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::consensus::{ConsensusEngine, SignalRegistry, TraderDirectory};
use crate::consumers::FillPipeline;
use crate::decision_log::DecisionLogger;
use crate::episodes::{EpisodeBook, EpisodeStore};
use crate::execution::adapter::{AdapterManager, ExchangeAdapter};
use crate::execution::providers::CostProviders;
use crate::execution::Executor;
use crate::market::MarketData;
use crate::risk::{CircuitBreakers, KillSwitch, RiskGovernor};

/// Funding intervals a position is expected to span (hourly funding, ~8h
/// median hold).
const EXPECTED_HOLD_INTERVALS: f64 = 8.0;

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
    let hl_info = Arc::new(HlClient::new(&config.infra.venue_api_base, limiter)?);

    // Venue adapters, keyed by the configured venue list.
    let account_address = common::env::get_env_string("HL_ACCOUNT_ADDRESS", "");
    let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::new();
    for venue in &config.execution.venues {
        match venue.as_str() {
            "hyperliquid" => adapters.push(Arc::new(execution::hyperliquid::HyperliquidAdapter::new(
                hl_info.clone(),
                &config.infra.venue_api_base,
                &account_address,
                config.execution.hl_api_key.clone(),
                config.execution.hl_api_secret.clone(),
            )?)),
            "aster" => adapters.push(Arc::new(execution::aster::AsterAdapter::new(
                &common::env::get_env_string("ASTER_API_BASE", "https://fapi.asterdex.com"),
                config.execution.aster_api_key.clone(),
                config.execution.aster_api_secret.clone(),
            )?)),
            "bybit" => adapters.push(Arc::new(execution::bybit::BybitAdapter::new(
                &common::env::get_env_string("BYBIT_API_BASE", "https://api.bybit.com"),
                config.execution.bybit_api_key.clone(),
                config.execution.bybit_api_secret.clone(),
            )?)),
            other => warn!("⚠️ unknown venue in EXECUTION_VENUES: {other}"),
        }
    }
    let adapters = Arc::new(AdapterManager::new(
        adapters,
        config.execution.health_stagger_ms,
    ));

    let kill_switch = Arc::new(KillSwitch::load(db.clone()).await?);
    let breakers = Arc::new(CircuitBreakers::new(config.breakers.clone()));
    let governor = Arc::new(RiskGovernor::new(
        config.risk.clone(),
        kill_switch.clone(),
        breakers.clone(),
    ));

    let executor = Arc::new(Executor::new(
        db.clone(),
        adapters.clone(),
        breakers,
        config.execution.clone(),
        config.risk.max_leverage,
    ));
    let providers = Arc::new(CostProviders::new(adapters.clone(), EXPECTED_HOLD_INTERVALS));
    let market = Arc::new(MarketData::new(db.clone(), config.atr.clone()));
    let logger = Arc::new(DecisionLogger::new(db.clone()));

    let directory: Arc<TraderDirectory> = Arc::new(TraderDirectory::new());
    let signals: Arc<SignalRegistry> = Arc::new(SignalRegistry::new());

    // Episode state, restored from the store.
    let store = Arc::new(EpisodeStore::new(db.clone()));
    let mut book = EpisodeBook::new();
    for ep in store.load_open().await? {
        book.restore(ep);
    }
    let book = Arc::new(tokio::sync::Mutex::new(book));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (consensus_tx, consensus_rx) = tokio::sync::mpsc::channel(1_024);

    // Consensus actor.
    {
        let engine = ConsensusEngine::new(
            config.clone(),
            db.clone(),
            bus.clone(),
            market.clone(),
            governor,
            executor.clone(),
            providers,
            logger,
            signals.clone(),
        );
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            engine.run(consensus_rx, shutdown).await;
        });
    }

    // Fill pipeline: consumer + timeout sweep.
    let pipeline = Arc::new(FillPipeline {
        bus: bus.clone(),
        store,
        book,
        market,
        directory: directory.clone(),
        signals,
        consensus_tx,
        config: config.clone(),
    });
    tokio::spawn(consumers::run_fill_consumer(
        pipeline.clone(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(consumers::run_timeout_sweep(
        pipeline,
        shutdown_rx.clone(),
    ));
    tokio::spawn(consumers::run_score_consumer(
        bus,
        directory,
        shutdown_rx.clone(),
    ));

    // Stop manager (polling stops + position timeouts).
    tokio::spawn(executor.clone().run_stop_loop(shutdown_rx.clone()));

    // Periodic venue health checks, staggered inside the manager.
    {
        let adapters = adapters.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let health = adapters.health_check_all().await;
                        for (venue, ok) in health {
                            if !ok {
                                warn!("⚠️ venue health check failed: {venue}");
                            }
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
        executor,
        kill_switch,
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

    info!("🚀 Decide service started");

    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown signal received");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("Decide shut down complete");
    Ok(())
}

fn print_banner(config: &Config) {
    info!("======================================================");
    info!("⚖️ DECIDE SERVICE - DECISION CORE");
    info!(
        "   gates: ≥{} traders, ≥{:.0}% majority, effK ≥{:.1}, drift ≤{:.2}R, EV ≥{:.2}R",
        config.consensus.min_traders,
        config.consensus.min_majority_pct * 100.0,
        config.consensus.min_effective_k,
        config.consensus.max_price_drift_r,
        config.consensus.min_ev_r,
    );
    info!(
        "   execution: {} (venues: {})",
        if config.execution.real_execution_enabled { "LIVE-capable" } else { "dry-run" },
        config.execution.venues.join(", ")
    );
    info!("   metrics: http://localhost:{}/metrics", config.infra.http_port);
    info!("======================================================");
}
