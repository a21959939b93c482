//! 💵 Mid-price feed and minute bars.
//!
//! One task polls mids every few seconds and caches the latest value; once a
//! minute the samples collapse into a bar `(asset, minute_ts, mid)` with a
//! Wilder-smoothed ATR(14), upserted so late or duplicate minutes are
//! harmless.

use anyhow::Result;
use chrono::{DateTime, DurationRound, TimeZone, Utc};
use common::assets::Asset;
use common::db::Db;
use common::hyperliquid::HlClient;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::metrics;

pub const ATR_PERIOD: f64 = 14.0;

/// Last known mids, shared with the fan-out and the HTTP surface.
pub struct PriceCache {
    prices: RwLock<HashMap<Asset, f64>>,
    last_update: RwLock<Option<DateTime<Utc>>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            last_update: RwLock::new(None),
        }
    }

    pub fn set(&self, asset: Asset, mid: f64) {
        self.prices.write().insert(asset, mid);
        *self.last_update.write() = Some(Utc::now());
    }

    pub fn get(&self, asset: Asset) -> Option<f64> {
        self.prices.read().get(&asset).copied()
    }

    /// (btc, eth) pair for the fan-out hello/price messages.
    pub fn snapshot(&self) -> (Option<f64>, Option<f64>) {
        let prices = self.prices.read();
        (prices.get(&Asset::Btc).copied(), prices.get(&Asset::Eth).copied())
    }

    /// Age of the newest sample; `None` before the first poll succeeds.
    pub fn staleness_secs(&self) -> Option<i64> {
        self.last_update
            .read()
            .map(|t| (Utc::now() - t).num_seconds())
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

// ── Minute bar assembly ──────────────────────────────────────────────────────

/// A finished bar ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedBar {
    pub asset: Asset,
    pub minute_ts: DateTime<Utc>,
    pub mid_price: f64,
    pub atr14: Option<f64>,
}

/// Collapses mid samples into minute bars and maintains the Wilder ATR.
///
/// True range uses the within-minute sample high/low against the previous
/// close; the first bar seeds the ATR with its own range.
pub struct MinuteBarBuilder {
    asset: Asset,
    current_minute: Option<DateTime<Utc>>,
    high: f64,
    low: f64,
    last: f64,
    prev_close: Option<f64>,
    atr: Option<f64>,
    bars_seen: u32,
}

impl MinuteBarBuilder {
    pub fn new(asset: Asset) -> Self {
        Self {
            asset,
            current_minute: None,
            high: f64::MIN,
            low: f64::MAX,
            last: 0.0,
            prev_close: None,
            atr: None,
            bars_seen: 0,
        }
    }

    /// Feed one mid sample; returns the finished bar when the minute rolls.
    pub fn on_sample(&mut self, ts: DateTime<Utc>, mid: f64) -> Option<FinishedBar> {
        let minute = floor_to_minute(ts);
        let mut finished = None;

        match self.current_minute {
            Some(current) if minute > current => {
                finished = Some(self.finish_bar(current));
                self.current_minute = Some(minute);
                self.high = mid;
                self.low = mid;
            }
            Some(_) => {
                self.high = self.high.max(mid);
                self.low = self.low.min(mid);
            }
            None => {
                self.current_minute = Some(minute);
                self.high = mid;
                self.low = mid;
            }
        }
        self.last = mid;
        finished
    }

    fn finish_bar(&mut self, minute: DateTime<Utc>) -> FinishedBar {
        let close = self.last;
        let tr = match self.prev_close {
            Some(prev) => (self.high - self.low)
                .max((self.high - prev).abs())
                .max((self.low - prev).abs()),
            None => self.high - self.low,
        };

        self.atr = Some(match self.atr {
            Some(prev_atr) => (prev_atr * (ATR_PERIOD - 1.0) + tr) / ATR_PERIOD,
            None => tr,
        });
        self.prev_close = Some(close);
        self.bars_seen += 1;

        FinishedBar {
            asset: self.asset,
            minute_ts: minute,
            mid_price: close,
            // ATR is only meaningful once the smoothing has warmed up.
            atr14: if self.bars_seen as f64 >= ATR_PERIOD {
                self.atr
            } else {
                None
            },
        }
    }
}

pub fn floor_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::minutes(1)).unwrap_or(ts)
}

// ── Feed loop ────────────────────────────────────────────────────────────────

/// Warm a builder's ATR from historical minute candles so the first live
/// bars already carry a usable ATR instead of waiting out the smoothing
/// window.
async fn seed_builder(hl: &HlClient, asset: Asset, builder: &mut MinuteBarBuilder) {
    let end = Utc::now().timestamp_millis() as u64;
    let start = end.saturating_sub(2 * 3_600 * 1_000);
    match hl.candle_snapshot(asset.hl_coin(), "1m", start, end).await {
        Ok(candles) => {
            let n = candles.len();
            for c in candles {
                let Some(ts) = Utc.timestamp_millis_opt(c.t as i64).single() else {
                    continue;
                };
                // Replay the candle's range through the sampler.
                builder.on_sample(ts, common::hyperliquid::fnum(&c.h));
                builder.on_sample(ts, common::hyperliquid::fnum(&c.l));
                builder.on_sample(ts, common::hyperliquid::fnum(&c.c));
            }
            info!("💵 ATR seeded for {asset} from {n} historical candles");
        }
        Err(e) => warn!("⚠️ ATR seeding failed for {asset}: {e:#}"),
    }
}

pub async fn run_price_feed(
    hl: Arc<HlClient>,
    db: Arc<Db>,
    cache: Arc<PriceCache>,
    poll_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut builders: HashMap<Asset, MinuteBarBuilder> = Asset::ALL
        .iter()
        .map(|a| (*a, MinuteBarBuilder::new(*a)))
        .collect();
    for (asset, builder) in builders.iter_mut() {
        seed_builder(&hl, *asset, builder).await;
    }

    let mut ticker = interval(Duration::from_secs(poll_secs.max(1)));
    info!("💵 price feed started ({poll_secs}s poll)");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mids = match hl.all_mids().await {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("⚠️ mid-price poll failed: {e:#}");
                        continue;
                    }
                };
                metrics::get().price_polls.inc();
                let now = Utc::now();

                for asset in Asset::ALL {
                    let Some(mid) = mids.get(asset.hl_coin()).copied() else {
                        continue;
                    };
                    if mid <= 0.0 {
                        continue;
                    }
                    cache.set(asset, mid);

                    if let Some(builder) = builders.get_mut(&asset) {
                        if let Some(bar) = builder.on_sample(now, mid) {
                            if let Err(e) = upsert_bar(&db, &bar).await {
                                warn!("⚠️ minute bar upsert failed: {e:#}");
                            } else {
                                metrics::get().bars_written.inc();
                                debug!(asset = %bar.asset, mid = bar.mid_price, "minute bar written");
                            }
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("💵 price feed stopping");
                return;
            }
        }
    }
}

async fn upsert_bar(db: &Db, bar: &FinishedBar) -> Result<()> {
    let client = db.lock().await;
    client
        .execute(
            "INSERT INTO minute_bars (asset, minute_ts, mid_price, atr14)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (asset, minute_ts)
             DO UPDATE SET mid_price = EXCLUDED.mid_price, atr14 = EXCLUDED.atr14",
            &[
                &bar.asset.as_str(),
                &bar.minute_ts,
                &bar.mid_price,
                &bar.atr14,
            ],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn bar_closes_on_minute_roll() {
        let mut b = MinuteBarBuilder::new(Asset::Btc);
        assert!(b.on_sample(ts(0), 100.0).is_none());
        assert!(b.on_sample(ts(10), 110.0).is_none());
        assert!(b.on_sample(ts(50), 105.0).is_none());

        // Next minute: previous bar finishes with the last sample as close.
        let bar = b.on_sample(ts(70), 106.0).unwrap();
        assert_eq!(bar.mid_price, 105.0);
        assert_eq!(bar.minute_ts, floor_to_minute(ts(0)));
        assert!(bar.atr14.is_none(), "ATR hidden until warmed up");
    }

    #[test]
    fn atr_warms_up_after_fourteen_bars() {
        let mut b = MinuteBarBuilder::new(Asset::Eth);
        let mut finished = Vec::new();
        for i in 0..16 {
            let base = i as i64 * 60;
            b.on_sample(ts(base), 100.0 + i as f64);
            b.on_sample(ts(base + 30), 101.0 + i as f64);
            if let Some(bar) = b.on_sample(ts(base + 60), 100.5 + i as f64) {
                finished.push(bar);
            }
        }
        assert!(finished.len() >= 14);
        assert!(finished[12].atr14.is_none());
        assert!(finished[13].atr14.is_some());
        let atr = finished[13].atr14.unwrap();
        assert!(atr > 0.0 && atr < 10.0);
    }

    #[test]
    fn wilder_smoothing_converges_to_constant_tr() {
        // Constant true range → ATR converges to it.
        let mut b = MinuteBarBuilder::new(Asset::Btc);
        let mut last_atr = None;
        for i in 0..200 {
            let base = i as i64 * 60;
            b.on_sample(ts(base), 100.0);
            b.on_sample(ts(base + 20), 102.0);
            if let Some(bar) = b.on_sample(ts(base + 60), 100.0) {
                last_atr = bar.atr14.or(last_atr);
            }
        }
        let atr = last_atr.unwrap();
        assert!((atr - 2.0).abs() < 0.1, "ATR {atr} should approach TR 2.0");
    }

    #[test]
    fn floor_to_minute_truncates() {
        let t = Utc.timestamp_opt(1_700_000_059, 0).unwrap();
        assert_eq!(floor_to_minute(t).timestamp() % 60, 0);
        assert_eq!(floor_to_minute(t).timestamp(), 1_700_000_040);
    }
}
