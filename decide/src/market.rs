//! 📉 Market state for gating: latest price and ATR per asset.
//!
//! Reads the minute bars Stream writes. ATR staleness is enforced here:
//! in strict mode a stale ATR makes the price-band gate fail closed
//! (`safety_block{guard=atr}`) rather than gate on dead volatility data.

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::assets::Asset;
use common::db::Db;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AtrConfig;

#[derive(Debug, Clone, Copy)]
pub struct MarketView {
    pub price: f64,
    pub atr: f64,
    pub bar_ts: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("no minute bars for {0}")]
    NoData(Asset),
    #[error("ATR stale for {asset} ({age_secs}s old)")]
    Stale { asset: Asset, age_secs: i64 },
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

const CACHE_TTL: Duration = Duration::from_secs(5);

pub struct MarketData {
    db: Arc<Db>,
    atr_config: AtrConfig,
    cache: RwLock<HashMap<Asset, (Instant, MarketView)>>,
}

impl MarketData {
    pub fn new(db: Arc<Db>, atr_config: AtrConfig) -> Self {
        Self {
            db,
            atr_config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn atr_multiplier(&self, asset: Asset) -> f64 {
        match asset {
            Asset::Btc => self.atr_config.multiplier_btc,
            Asset::Eth => self.atr_config.multiplier_eth,
        }
    }

    /// Latest price + ATR, enforcing staleness policy.
    pub async fn view(&self, asset: Asset) -> Result<MarketView, MarketError> {
        if let Some((at, view)) = self.cache.read().get(&asset).copied() {
            if at.elapsed() < CACHE_TTL {
                return self.check_staleness(asset, view);
            }
        }

        let row = {
            let client = self.db.lock().await;
            client
                .query_opt(
                    "SELECT mid_price, atr14, minute_ts FROM minute_bars
                     WHERE asset = $1 AND atr14 IS NOT NULL
                     ORDER BY minute_ts DESC LIMIT 1",
                    &[&asset.as_str()],
                )
                .await
                .map_err(anyhow::Error::from)?
        };

        let Some(row) = row else {
            return Err(MarketError::NoData(asset));
        };
        let view = MarketView {
            price: row.get(0),
            atr: row.get(1),
            bar_ts: row.get(2),
        };
        self.cache.write().insert(asset, (Instant::now(), view));
        self.check_staleness(asset, view)
    }

    fn check_staleness(&self, asset: Asset, view: MarketView) -> Result<MarketView, MarketError> {
        let age = (Utc::now() - view.bar_ts).num_seconds();
        if age > self.atr_config.max_staleness_secs && self.atr_config.strict_mode {
            return Err(MarketError::Stale {
                asset,
                age_secs: age,
            });
        }
        Ok(view)
    }

    /// Stop distance in price units: ATR × per-asset multiplier.
    pub fn stop_distance(&self, asset: Asset, view: &MarketView, regime_stop_mult: f64) -> f64 {
        view.atr * self.atr_multiplier(asset) * regime_stop_mult
    }

    /// Stop fraction of price, clamped to the allowed band.
    pub fn stop_fraction(&self, asset: Asset, view: &MarketView, regime_stop_mult: f64) -> f64 {
        if view.price <= 0.0 {
            return common::assets::STOP_FRACTION_MIN;
        }
        Asset::clamp_stop_fraction(self.stop_distance(asset, view, regime_stop_mult) / view.price)
    }
}
