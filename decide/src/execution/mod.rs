//! ⚡ Executor: dual-gated order placement and stop management.
//!
//! Execution is live only when BOTH the `REAL_EXECUTION_ENABLED`
//! environment flag and the stored `execution_config.enabled` row are
//! true; otherwise every accepted signal is a dry run (fully logged, no
//! order). Live entries place a native SL/TP pair when the venue supports
//! it and native stops are enabled, else fall into the polling-stop loop.
//! Any position older than the configured maximum is closed, native stops
//! cancelled first.

pub mod adapter;
pub mod aster;
pub mod bybit;
pub mod hyperliquid;
pub mod providers;
pub mod signing;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::assets::{Asset, Direction};
use common::bus::SignalEvent;
use common::db::Db;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::metrics;
use crate::risk::CircuitBreakers;
use adapter::{AdapterManager, StopPair, Venue};

#[derive(Debug, Clone, Serialize)]
pub struct ManagedPosition {
    pub id: Uuid,
    pub signal_id: Uuid,
    pub asset: Asset,
    pub direction: Direction,
    pub size: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub take_profit_price: f64,
    pub venue: Venue,
    pub opened_at: DateTime<Utc>,
    #[serde(skip)]
    pub native_stops: Option<StopPair>,
}

#[derive(Debug, Clone)]
pub enum ExecutionResult {
    DryRun { notional_usd: f64 },
    Live { position_id: Uuid, avg_price: f64 },
}

impl ExecutionResult {
    pub fn status_str(&self) -> &'static str {
        match self {
            ExecutionResult::DryRun { .. } => "dry_run",
            ExecutionResult::Live { .. } => "live",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StoredExecConfig {
    enabled: bool,
    use_native_stops: bool,
}

const STORED_CONFIG_TTL: Duration = Duration::from_secs(10);

pub struct Executor {
    db: Arc<Db>,
    pub adapters: Arc<AdapterManager>,
    breakers: Arc<CircuitBreakers>,
    config: ExecutionConfig,
    max_leverage: f64,
    positions: Mutex<HashMap<Asset, ManagedPosition>>,
    stored_cache: Mutex<Option<(Instant, StoredExecConfig)>>,
}

impl Executor {
    pub fn new(
        db: Arc<Db>,
        adapters: Arc<AdapterManager>,
        breakers: Arc<CircuitBreakers>,
        config: ExecutionConfig,
        max_leverage: f64,
    ) -> Self {
        Self {
            db,
            adapters,
            breakers,
            config,
            max_leverage,
            positions: Mutex::new(HashMap::new()),
            stored_cache: Mutex::new(None),
        }
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.lock().len()
    }

    pub fn positions_on(&self, asset: Asset) -> usize {
        self.positions.lock().contains_key(&asset) as usize
    }

    pub fn open_positions(&self) -> Vec<ManagedPosition> {
        self.positions.lock().values().cloned().collect()
    }

    async fn stored_config(&self) -> StoredExecConfig {
        if let Some((at, cfg)) = *self.stored_cache.lock() {
            if at.elapsed() < STORED_CONFIG_TTL {
                return cfg;
            }
        }
        let cfg = {
            let client = self.db.lock().await;
            match client
                .query_one(
                    "SELECT enabled, use_native_stops FROM execution_config WHERE singleton",
                    &[],
                )
                .await
            {
                Ok(row) => StoredExecConfig {
                    enabled: row.get(0),
                    use_native_stops: row.get(1),
                },
                Err(e) => {
                    // Unreadable config fails towards dry-run.
                    warn!("⚠️ execution config unreadable ({e}); treating as disabled");
                    StoredExecConfig {
                        enabled: false,
                        use_native_stops: true,
                    }
                }
            }
        };
        *self.stored_cache.lock() = Some((Instant::now(), cfg));
        cfg
    }

    /// Dual gate: environment flag AND stored config.
    pub async fn live_enabled(&self) -> bool {
        self.config.real_execution_enabled && self.stored_config().await.enabled
    }

    /// Execute an accepted, sized signal.
    pub async fn execute(
        &self,
        signal: &SignalEvent,
        size_base: f64,
        notional_usd: f64,
    ) -> Result<ExecutionResult> {
        let venue = Venue::from_str(&signal.target_exchange)
            .map_err(|e| anyhow::anyhow!("signal names unknown venue: {e}"))?;

        if !self.live_enabled().await {
            metrics::get().executions_dry_run.inc();
            info!(
                "🧪 DRY RUN: {} {} {:.6} @ ~{:.2} on {} (${:.0})",
                signal.direction, signal.asset, size_base, signal.entry_price, venue, notional_usd
            );
            return Ok(ExecutionResult::DryRun {
                notional_usd,
            });
        }

        let adapter = self
            .adapters
            .get(venue)
            .context("no adapter configured for target venue")?;

        if let Err(e) = adapter.set_leverage(signal.asset, self.max_leverage).await {
            // Leverage setup is advisory; the venue keeps its last setting.
            warn!("⚠️ leverage update failed on {venue}: {e:#}");
        }

        let fill = match adapter
            .open_market(
                signal.asset,
                signal.direction,
                size_base,
                self.config.slippage_tolerance_pct,
            )
            .await
        {
            Ok(fill) => fill,
            Err(e) => {
                self.breakers.record_api_error(Utc::now());
                return Err(e.context("market order failed"));
            }
        };
        metrics::get().executions_live.inc();

        let entry = if fill.avg_price > 0.0 {
            fill.avg_price
        } else {
            signal.entry_price
        };
        let stop_distance = (signal.entry_price - signal.stop_price).abs();
        let (stop_price, take_profit_price) = match signal.direction {
            Direction::Long => (
                entry - stop_distance,
                entry + self.config.rr_ratio * stop_distance,
            ),
            Direction::Short => (
                entry + stop_distance,
                entry - self.config.rr_ratio * stop_distance,
            ),
        };

        let mut position = ManagedPosition {
            id: Uuid::new_v4(),
            signal_id: signal.id,
            asset: signal.asset,
            direction: signal.direction,
            size: fill.filled_size,
            entry_price: entry,
            stop_price,
            take_profit_price,
            venue,
            opened_at: Utc::now(),
            native_stops: None,
        };

        let stored = self.stored_config().await;
        if venue.supports_native_stops() && self.config.use_native_stops && stored.use_native_stops
        {
            match adapter
                .place_stop_pair(
                    signal.asset,
                    signal.direction,
                    position.size,
                    stop_price,
                    take_profit_price,
                )
                .await
            {
                Ok(pair) => {
                    self.persist_stop_pair(&position, &pair).await?;
                    metrics::get().stops_placed.inc();
                    position.native_stops = Some(pair);
                }
                Err(e) => {
                    // Native placement failed: polling mode covers the
                    // position instead.
                    warn!("⚠️ native stop placement failed, using polling stops: {e:#}");
                }
            }
        }

        info!(
            "⚡ LIVE ENTRY: {} {} {:.6} @ {:.2} on {} (stop {:.2}, tp {:.2})",
            position.direction,
            position.asset,
            position.size,
            position.entry_price,
            venue,
            stop_price,
            take_profit_price
        );

        let id = position.id;
        self.positions.lock().insert(signal.asset, position);
        metrics::get()
            .open_positions
            .set(self.open_position_count() as i64);
        Ok(ExecutionResult::Live {
            position_id: id,
            avg_price: entry,
        })
    }

    async fn persist_stop_pair(&self, position: &ManagedPosition, pair: &StopPair) -> Result<()> {
        let client = self.db.lock().await;
        // One pair per (address, asset): replace any stale registration.
        client
            .execute(
                "INSERT INTO active_stops
                   (position_id, address, asset, stop_price, take_profit_price, size,
                    native_sl_order_id, native_tp_order_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (position_id) DO NOTHING",
                &[
                    &position.id,
                    &self.config.default_exchange,
                    &position.asset.as_str(),
                    &position.stop_price,
                    &position.take_profit_price,
                    &position.size,
                    &pair.sl_order_id,
                    &pair.tp_order_id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn remove_stop_row(&self, position_id: Uuid) {
        let client = self.db.lock().await;
        if let Err(e) = client
            .execute("DELETE FROM active_stops WHERE position_id = $1", &[&position_id])
            .await
        {
            warn!("⚠️ failed to remove stop registration: {e}");
        }
    }

    /// Close a managed position at market and settle its outcome.
    async fn close_and_settle(&self, position: ManagedPosition, reason: &str) {
        if let Some(adapter) = self.adapters.get(position.venue) {
            // Cancel native stops before any close (timeout path included).
            if let Some(pair) = &position.native_stops {
                match adapter.cancel_stop_pair(position.asset, pair).await {
                    Ok(()) => metrics::get().stops_cancelled.inc(),
                    Err(e) => warn!("⚠️ stop cancellation failed: {e:#}"),
                }
            }

            let exit_price = match adapter
                .close_market(position.asset, position.direction, position.size)
                .await
            {
                Ok(fill) if fill.avg_price > 0.0 => fill.avg_price,
                Ok(_) => adapter
                    .mark_price(position.asset)
                    .await
                    .unwrap_or(position.entry_price),
                Err(e) => {
                    self.breakers.record_api_error(Utc::now());
                    warn!("❌ close failed for {}: {e:#}", position.asset);
                    // Leave the position registered; the next poll retries.
                    self.positions.lock().insert(position.asset, position);
                    return;
                }
            };

            self.settle(&position, exit_price, reason).await;
        }
        self.remove_stop_row(position.id).await;
        metrics::get()
            .open_positions
            .set(self.open_position_count() as i64);
    }

    async fn settle(&self, position: &ManagedPosition, exit_price: f64, reason: &str) {
        let pnl = (exit_price - position.entry_price)
            * position.size
            * position.direction.sign();
        let risk = (position.entry_price - position.stop_price).abs() * position.size;
        let realized_r = if risk > 0.0 { pnl / risk } else { 0.0 };

        info!(
            "🏁 position closed ({reason}): {} {} pnl ${:.2} ({:+.2}R)",
            position.direction, position.asset, pnl, realized_r
        );
        self.breakers.record_outcome(pnl > 0.0, Utc::now());

        let client = self.db.lock().await;
        if let Err(e) = client
            .execute(
                "UPDATE consensus_signals SET outcome = $2, realized_r = $3 WHERE id = $1",
                &[&position.signal_id, &reason, &realized_r],
            )
            .await
        {
            warn!("⚠️ signal outcome update failed: {e}");
        }
        if let Err(e) = client
            .execute(
                "UPDATE decision_log SET outcome_pnl = $2, outcome_r = $3 WHERE signal_id = $1",
                &[&position.signal_id, &pnl, &realized_r],
            )
            .await
        {
            warn!("⚠️ decision log outcome update failed: {e}");
        }
    }

    /// Polling-stop + timeout loop.
    pub async fn run_stop_loop(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.stop_poll_interval_secs.max(1)));
        info!(
            "⚡ stop manager started ({}s poll, {}h max hold)",
            self.config.stop_poll_interval_secs, self.config.max_position_hours
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_positions().await,
                _ = shutdown.changed() => {
                    info!("⚡ stop manager stopping");
                    return;
                }
            }
        }
    }

    async fn poll_positions(&self) {
        let now = Utc::now();
        let max_age = ChronoDuration::hours(self.config.max_position_hours);
        let snapshot: Vec<ManagedPosition> = self.positions.lock().values().cloned().collect();

        for position in snapshot {
            // Timeout close applies to every position, native stops or not.
            if now - position.opened_at > max_age {
                if self.positions.lock().remove(&position.asset).is_some() {
                    info!("⏱️ position timeout: {} {}", position.direction, position.asset);
                    self.close_and_settle(position, "timeout").await;
                }
                continue;
            }

            // Price-threshold polling only for positions without native stops.
            if position.native_stops.is_some() {
                continue;
            }
            let Some(adapter) = self.adapters.get(position.venue) else {
                continue;
            };
            let mark = match adapter.mark_price(position.asset).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("⚠️ mark price poll failed: {e:#}");
                    continue;
                }
            };

            let stop_hit = match position.direction {
                Direction::Long => mark <= position.stop_price,
                Direction::Short => mark >= position.stop_price,
            };
            let tp_hit = match position.direction {
                Direction::Long => mark >= position.take_profit_price,
                Direction::Short => mark <= position.take_profit_price,
            };
            if stop_hit || tp_hit {
                let reason = if stop_hit { "stop_loss" } else { "take_profit" };
                if self.positions.lock().remove(&position.asset).is_some() {
                    self.close_and_settle(position, reason).await;
                }
            }
        }
    }
}
