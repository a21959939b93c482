//! 🔌 Venue adapter abstraction.
//!
//! One object-safe trait for everything the executor needs from a venue:
//! balances, positions, market orders, native stop pairs, mark price, the
//! orderbook for slippage walks, and size formatting. A factory maps the
//! venue enum to a constructor; the manager routes by the signal's
//! `target_exchange` and staggers health checks so venues are not probed
//! in lockstep.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::assets::{Asset, Direction};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::metrics;
use crate::risk::CircuitBreakers;

pub const ACCOUNT_FETCH_RETRIES: u32 = 3;
pub const ACCOUNT_FETCH_BASE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Hyperliquid,
    Aster,
    Bybit,
}

impl Venue {
    pub fn as_str(&self) -> &'static str {
        match self {
            Venue::Hyperliquid => "hyperliquid",
            Venue::Aster => "aster",
            Venue::Bybit => "bybit",
        }
    }

    /// Default pairwise correlation assumed for traders observed on this
    /// venue when no measured ρ exists.
    pub fn default_correlation(&self, hl_default: f64, non_hl_default: f64) -> f64 {
        match self {
            Venue::Hyperliquid => hl_default,
            _ => non_hl_default,
        }
    }

    pub fn supports_native_stops(&self) -> bool {
        // All three currently do; the capability hook stays because the
        // polling fallback must exist anyway.
        true
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hyperliquid" | "hl" => Ok(Venue::Hyperliquid),
            "aster" => Ok(Venue::Aster),
            "bybit" => Ok(Venue::Bybit),
            other => Err(format!("unknown venue: {other}")),
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct VenuePosition {
    pub asset: Asset,
    /// Signed size (long positive).
    pub size: f64,
    pub entry_price: f64,
    pub notional_usd: f64,
}

/// Account state the risk governor gates on. USDT balances are treated
/// 1:1 as USD.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub equity_usd: f64,
    pub maintenance_margin_usd: f64,
    pub total_notional_usd: f64,
    pub positions: Vec<VenuePosition>,
}

#[derive(Debug, Clone)]
pub struct OrderFill {
    pub order_id: String,
    pub avg_price: f64,
    pub filled_size: f64,
}

#[derive(Debug, Clone)]
pub struct StopPair {
    pub sl_order_id: String,
    pub tp_order_id: String,
}

/// One side of the book as (price, size) levels, best first.
#[derive(Debug, Clone)]
pub struct Orderbook {
    pub mid: f64,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

// ── The trait ────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> Venue;

    /// Cheap liveness probe.
    async fn connect(&self) -> Result<()>;

    async fn account(&self) -> Result<AccountSnapshot>;

    async fn mark_price(&self, asset: Asset) -> Result<f64>;

    async fn orderbook(&self, asset: Asset) -> Result<Orderbook>;

    /// Funding rate per interval in bps (positive = longs pay).
    async fn funding_rate_bps(&self, asset: Asset) -> Result<f64>;

    /// Round-trip taker fees in bps.
    fn taker_fees_bps(&self) -> f64;

    async fn open_market(
        &self,
        asset: Asset,
        direction: Direction,
        size: f64,
        slippage_tolerance_pct: f64,
    ) -> Result<OrderFill>;

    async fn close_market(&self, asset: Asset, direction: Direction, size: f64) -> Result<OrderFill>;

    async fn set_leverage(&self, asset: Asset, leverage: f64) -> Result<()>;

    /// Place the SL/TP pair atomically (both or neither).
    async fn place_stop_pair(
        &self,
        asset: Asset,
        direction: Direction,
        size: f64,
        stop_price: f64,
        take_profit_price: f64,
    ) -> Result<StopPair>;

    async fn cancel_stop_pair(&self, asset: Asset, pair: &StopPair) -> Result<()>;

    /// Round a size to the venue's lot step.
    fn format_size(&self, asset: Asset, size: f64) -> f64;
}

// ── Factory + manager ────────────────────────────────────────────────────────

pub struct AdapterManager {
    adapters: HashMap<Venue, Arc<dyn ExchangeAdapter>>,
    health_stagger: Duration,
}

impl AdapterManager {
    pub fn new(adapters: Vec<Arc<dyn ExchangeAdapter>>, health_stagger_ms: u64) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.venue(), a)).collect(),
            health_stagger: Duration::from_millis(health_stagger_ms),
        }
    }

    pub fn get(&self, venue: Venue) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(&venue).cloned()
    }

    pub fn venues(&self) -> Vec<Venue> {
        let mut v: Vec<Venue> = self.adapters.keys().copied().collect();
        v.sort_by_key(|v| v.as_str());
        v
    }

    /// Probe every venue, staggered so health checks never align.
    pub async fn health_check_all(&self) -> HashMap<Venue, bool> {
        let mut out = HashMap::new();
        for venue in self.venues() {
            if let Some(adapter) = self.get(venue) {
                out.insert(venue, adapter.connect().await.is_ok());
            }
            tokio::time::sleep(self.health_stagger).await;
        }
        out
    }

    /// Account snapshot with bounded retries; on exhaustion this is a
    /// fail-closed condition: the caller blocks the signal and the
    /// `safety_block{guard=account_state}` counter increments exactly once.
    pub async fn account_with_retries(
        &self,
        venue: Venue,
        breakers: &CircuitBreakers,
    ) -> Option<AccountSnapshot> {
        let adapter = match self.get(venue) {
            Some(a) => a,
            None => {
                metrics::get()
                    .safety_blocks
                    .with_label_values(&["account_state"])
                    .inc();
                return None;
            }
        };

        for attempt in 0..ACCOUNT_FETCH_RETRIES {
            match adapter.account().await {
                Ok(snapshot) => return Some(snapshot),
                Err(e) => {
                    breakers.record_api_error(Utc::now());
                    let backoff = ACCOUNT_FETCH_BASE_MS * (1 << attempt);
                    warn!(
                        "⚠️ account fetch failed on {venue} (attempt {}/{ACCOUNT_FETCH_RETRIES}): {e:#}",
                        attempt + 1
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }

        metrics::get()
            .safety_blocks
            .with_label_values(&["account_state"])
            .inc();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_parsing_round_trips() {
        for venue in [Venue::Hyperliquid, Venue::Aster, Venue::Bybit] {
            assert_eq!(venue.as_str().parse::<Venue>().unwrap(), venue);
        }
        assert_eq!("HL".parse::<Venue>().unwrap(), Venue::Hyperliquid);
        assert!("mtgox".parse::<Venue>().is_err());
    }

    #[test]
    fn default_correlation_by_venue() {
        assert_eq!(Venue::Hyperliquid.default_correlation(0.3, 0.5), 0.3);
        assert_eq!(Venue::Bybit.default_correlation(0.3, 0.5), 0.5);
        assert_eq!(Venue::Aster.default_correlation(0.3, 0.5), 0.5);
    }
}
