//! 🌡️ Regime classification.
//!
//! Per asset, over the recent minute bars: short/long moving averages, the
//! ATR ratio against its own 60-bar average, and range compression decide
//! between trending / ranging / volatile. Each regime scales the stop
//! distance, the Kelly fraction, and the minimum confidence used downstream.

use anyhow::Result;
use common::assets::Asset;
use common::db::Db;
use serde::Serialize;
use std::sync::Arc;

pub const MA_SHORT: usize = 20;
pub const MA_LONG: usize = 50;
pub const ATR_AVG_WINDOW: usize = 60;

/// Volatile when current ATR runs this far above its average.
const VOLATILE_ATR_RATIO: f64 = 1.5;
/// Trending when the MAs diverge by more than this fraction of price.
const TREND_MA_SPREAD: f64 = 0.0015;
/// Ranging when the high-low range compresses below this fraction of price.
const COMPRESSION_RANGE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trending,
    Ranging,
    Volatile,
    Unknown,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::Trending => "trending",
            Regime::Ranging => "ranging",
            Regime::Volatile => "volatile",
            Regime::Unknown => "unknown",
        }
    }

    /// Multiplier on the ATR stop distance.
    pub fn stop_multiplier(&self) -> f64 {
        match self {
            Regime::Trending => 1.2,
            Regime::Ranging => 0.8,
            Regime::Volatile => 1.5,
            Regime::Unknown => 1.0,
        }
    }

    /// Multiplier on the Kelly fraction.
    pub fn kelly_multiplier(&self) -> f64 {
        match self {
            Regime::Trending => 1.0,
            Regime::Ranging => 0.75,
            Regime::Volatile => 0.5,
            Regime::Unknown => 1.0,
        }
    }

    /// Additive adjustment to the minimum confidence floor.
    pub fn min_confidence_adjustment(&self) -> f64 {
        match self {
            Regime::Trending => 0.0,
            Regime::Ranging => 0.02,
            Regime::Volatile => 0.05,
            Regime::Unknown => 0.0,
        }
    }
}

/// Inputs: (mid_price, atr) per minute bar, oldest first.
pub fn classify(bars: &[(f64, f64)]) -> Regime {
    if bars.len() < MA_LONG {
        return Regime::Unknown;
    }

    let closes: Vec<f64> = bars.iter().map(|(c, _)| *c).collect();
    let atrs: Vec<f64> = bars.iter().map(|(_, a)| *a).collect();

    let ma = |n: usize| -> f64 {
        let slice = &closes[closes.len() - n..];
        slice.iter().sum::<f64>() / n as f64
    };
    let ma_short = ma(MA_SHORT);
    let ma_long = ma(MA_LONG);
    let price = *closes.last().expect("bars non-empty");
    if price <= 0.0 {
        return Regime::Unknown;
    }

    let atr_window = &atrs[atrs.len().saturating_sub(ATR_AVG_WINDOW)..];
    let avg_atr = atr_window.iter().sum::<f64>() / atr_window.len() as f64;
    let current_atr = *atrs.last().expect("bars non-empty");
    let atr_ratio = if avg_atr > 0.0 {
        current_atr / avg_atr
    } else {
        1.0
    };

    let recent = &closes[closes.len() - MA_SHORT..];
    let high = recent.iter().cloned().fold(f64::MIN, f64::max);
    let low = recent.iter().cloned().fold(f64::MAX, f64::min);
    let compression = (high - low) / price;

    if atr_ratio > VOLATILE_ATR_RATIO {
        Regime::Volatile
    } else if (ma_short - ma_long).abs() / price > TREND_MA_SPREAD {
        Regime::Trending
    } else if compression < COMPRESSION_RANGE {
        Regime::Ranging
    } else {
        Regime::Unknown
    }
}

/// Classify from the stored minute bars.
pub async fn classify_from_db(db: &Arc<Db>, asset: Asset) -> Result<Regime> {
    let rows = {
        let client = db.lock().await;
        client
            .query(
                "SELECT mid_price, atr14 FROM minute_bars
                 WHERE asset = $1 AND atr14 IS NOT NULL
                 ORDER BY minute_ts DESC LIMIT $2",
                &[&asset.as_str(), &(ATR_AVG_WINDOW as i64 + MA_LONG as i64)],
            )
            .await?
    };
    let mut bars: Vec<(f64, f64)> = rows
        .into_iter()
        .map(|r| (r.get::<_, f64>(0), r.get::<_, f64>(1)))
        .collect();
    bars.reverse(); // oldest first
    Ok(classify(&bars))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bars(n: usize, price: f64, atr: f64) -> Vec<(f64, f64)> {
        (0..n).map(|_| (price, atr)).collect()
    }

    #[test]
    fn too_little_history_is_unknown() {
        assert_eq!(classify(&flat_bars(10, 100.0, 1.0)), Regime::Unknown);
    }

    #[test]
    fn atr_spike_is_volatile() {
        let mut bars = flat_bars(100, 50_000.0, 50.0);
        // Last bar's ATR triple the average.
        bars.last_mut().unwrap().1 = 160.0;
        assert_eq!(classify(&bars), Regime::Volatile);
    }

    #[test]
    fn steady_drift_is_trending() {
        // Price climbing 0.02% per bar, constant ATR.
        let bars: Vec<(f64, f64)> = (0..100)
            .map(|i| (50_000.0 * (1.0 + 0.0002 * i as f64), 50.0))
            .collect();
        assert_eq!(classify(&bars), Regime::Trending);
    }

    #[test]
    fn tight_flat_market_is_ranging() {
        // Constant price, constant ATR.
        assert_eq!(classify(&flat_bars(100, 50_000.0, 50.0)), Regime::Ranging);
    }

    #[test]
    fn multipliers_match_regime_table() {
        assert_eq!(Regime::Trending.stop_multiplier(), 1.2);
        assert_eq!(Regime::Ranging.stop_multiplier(), 0.8);
        assert_eq!(Regime::Volatile.stop_multiplier(), 1.5);
        assert_eq!(Regime::Unknown.stop_multiplier(), 1.0);

        assert_eq!(Regime::Trending.kelly_multiplier(), 1.0);
        assert_eq!(Regime::Ranging.kelly_multiplier(), 0.75);
        assert_eq!(Regime::Volatile.kelly_multiplier(), 0.5);
        assert_eq!(Regime::Unknown.kelly_multiplier(), 1.0);
    }
}
