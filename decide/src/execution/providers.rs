//! 💸 Cost providers: fees, funding, and orderbook-derived slippage.
//!
//! Live values are cached for five minutes; when a venue cannot be reached
//! the static fallback table applies, so G5 always has a (conservative)
//! number to work with. Slippage is computed by walking the book at the
//! actual notional being sized, never a reference size.

use common::assets::{Asset, Direction};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::adapter::{AdapterManager, Orderbook, Venue};
use crate::consensus::ev::VenueCosts;

const CACHE_TTL: Duration = Duration::from_secs(300);

/// Static fallbacks (bps) when live data is unavailable.
fn fallback_fees_bps(venue: Venue) -> f64 {
    match venue {
        Venue::Hyperliquid => 4.5,
        Venue::Aster => 5.0,
        Venue::Bybit => 5.5,
    }
}

fn fallback_funding_bps(_venue: Venue) -> f64 {
    // Neutral funding assumption when the venue cannot be asked.
    1.0
}

const FALLBACK_SLIPPAGE_BPS: f64 = 3.0;

/// Walk one side of the book and return the average-fill slippage in bps
/// against the mid. `None` when the book cannot absorb the notional.
pub fn walk_orderbook(levels: &[(f64, f64)], mid: f64, notional_usd: f64) -> Option<f64> {
    if mid <= 0.0 || notional_usd <= 0.0 {
        return Some(0.0);
    }
    let mut remaining = notional_usd;
    let mut cost = 0.0;
    for (price, size) in levels {
        let level_notional = price * size;
        let take = remaining.min(level_notional);
        cost += take * price;
        remaining -= take;
        if remaining <= 1e-9 {
            break;
        }
    }
    if remaining > 1e-9 {
        return None;
    }
    // Average execution price weighted by notional taken.
    let avg_price = cost / notional_usd;
    Some(((avg_price - mid).abs() / mid) * 10_000.0)
}

#[derive(Clone)]
struct CachedVenueData {
    at: Instant,
    fees_bps: f64,
    funding_rate_bps: f64,
    orderbook: Option<Orderbook>,
}

pub struct CostProviders {
    adapters: Arc<AdapterManager>,
    cache: Mutex<HashMap<(Venue, Asset), CachedVenueData>>,
    /// Expected funding intervals a position is held for.
    pub hold_intervals: f64,
}

impl CostProviders {
    pub fn new(adapters: Arc<AdapterManager>, hold_intervals: f64) -> Self {
        Self {
            adapters,
            cache: Mutex::new(HashMap::new()),
            hold_intervals,
        }
    }

    /// Costs for executing `notional_usd` in `direction` on `venue`.
    pub async fn venue_costs(
        &self,
        venue: Venue,
        asset: Asset,
        direction: Direction,
        notional_usd: f64,
    ) -> VenueCosts {
        let data = self.fetch_cached(venue, asset).await;

        let slippage_bps = data
            .orderbook
            .as_ref()
            .and_then(|book| {
                let levels = match direction {
                    Direction::Long => &book.asks,
                    Direction::Short => &book.bids,
                };
                walk_orderbook(levels, book.mid, notional_usd)
            })
            .unwrap_or(FALLBACK_SLIPPAGE_BPS);

        VenueCosts {
            venue,
            fees_bps: data.fees_bps,
            slippage_bps,
            funding_rate_bps: data.funding_rate_bps,
            hold_intervals: self.hold_intervals,
        }
    }

    async fn fetch_cached(&self, venue: Venue, asset: Asset) -> CachedVenueData {
        if let Some(data) = self.cache.lock().get(&(venue, asset)).cloned() {
            if data.at.elapsed() < CACHE_TTL {
                return data;
            }
        }

        let data = match self.adapters.get(venue) {
            Some(adapter) => {
                let fees_bps = adapter.taker_fees_bps();
                let funding_rate_bps = adapter
                    .funding_rate_bps(asset)
                    .await
                    .unwrap_or_else(|e| {
                        debug!("funding fetch failed on {venue}: {e:#}; using fallback");
                        fallback_funding_bps(venue)
                    });
                let orderbook = adapter.orderbook(asset).await.ok();
                CachedVenueData {
                    at: Instant::now(),
                    fees_bps,
                    funding_rate_bps,
                    orderbook,
                }
            }
            None => CachedVenueData {
                at: Instant::now(),
                fees_bps: fallback_fees_bps(venue),
                funding_rate_bps: fallback_funding_bps(venue),
                orderbook: None,
            },
        };

        self.cache.lock().insert((venue, asset), data.clone());
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_within_top_level_has_level_slippage() {
        // Mid 100, best ask 100.05 with plenty of depth.
        let asks = vec![(100.05, 1_000.0)];
        let bps = walk_orderbook(&asks, 100.0, 10_000.0).unwrap();
        assert!((bps - 5.0).abs() < 0.1);
    }

    #[test]
    fn deeper_notional_costs_more() {
        let asks = vec![(100.05, 1.0), (100.20, 1.0), (100.50, 10.0)];
        let small = walk_orderbook(&asks, 100.0, 50.0).unwrap();
        let big = walk_orderbook(&asks, 100.0, 220.0).unwrap();
        assert!(big > small);
    }

    #[test]
    fn insufficient_depth_is_none() {
        let asks = vec![(100.05, 1.0)];
        assert!(walk_orderbook(&asks, 100.0, 1_000_000.0).is_none());
    }

    #[test]
    fn zero_notional_is_free() {
        assert_eq!(walk_orderbook(&[], 100.0, 0.0), Some(0.0));
    }
}
