//! 🔗 Position chain validator.
//!
//! The venue promises `prev_position + signed_size == next start_position`
//! for consecutive fills of one (address, asset). A dropped websocket frame
//! breaks that chain; the repair is blunt and idempotent: clear the slice
//! and backfill it from the venue's fills history. This is the single
//! consistency repair mechanism in the system.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use common::assets::Asset;
use common::db::Db;
use common::hyperliquid::HlClient;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::fills::FillIngestor;
use crate::metrics;

/// How far back a repair backfills.
const BACKFILL_WINDOW_HOURS: i64 = 48;

/// Size tolerance when comparing chained positions.
const CHAIN_EPSILON: f64 = 1e-9;

/// One link of the chain as loaded from the DB.
#[derive(Debug, Clone, Copy)]
pub struct ChainLink {
    pub start_position: f64,
    pub signed_size: f64,
}

/// Index of the first link whose start position disagrees with the running
/// position implied by its predecessor, or `None` when the chain holds.
pub fn find_chain_break(links: &[ChainLink]) -> Option<usize> {
    for (i, pair) in links.windows(2).enumerate() {
        let expected = pair[0].start_position + pair[0].signed_size;
        if (pair[1].start_position - expected).abs() > CHAIN_EPSILON {
            return Some(i + 1);
        }
    }
    None
}

pub struct ChainValidator {
    db: Arc<Db>,
    hl: Arc<HlClient>,
    ingestor: Arc<FillIngestor>,
}

impl ChainValidator {
    pub fn new(db: Arc<Db>, hl: Arc<HlClient>, ingestor: Arc<FillIngestor>) -> Self {
        Self { db, hl, ingestor }
    }

    /// One sweep over every (address, asset) with recent fills.
    pub async fn sweep(&self) -> Result<()> {
        let pairs = {
            let client = self.db.lock().await;
            client
                .query(
                    "SELECT DISTINCT address, asset FROM fills
                     WHERE ts > now() - INTERVAL '48 hours'",
                    &[],
                )
                .await?
        };

        for row in pairs {
            let address: String = row.get(0);
            let asset_str: String = row.get(1);
            let Ok(asset) = Asset::from_str(&asset_str) else {
                continue;
            };
            if let Err(e) = self.validate_pair(&address, asset).await {
                warn!("⚠️ chain validation failed for {address}/{asset}: {e:#}");
            }
        }
        Ok(())
    }

    /// Validate one slice; repair on discrepancy.
    pub async fn validate_pair(&self, address: &str, asset: Asset) -> Result<bool> {
        let links = {
            let client = self.db.lock().await;
            client
                .query(
                    "SELECT start_position,
                            CASE WHEN side = 'buy' THEN size ELSE -size END
                     FROM fills
                     WHERE address = $1 AND asset = $2
                       AND ts > now() - INTERVAL '48 hours'
                     ORDER BY ts, fill_id",
                    &[&address, &asset.as_str()],
                )
                .await?
                .into_iter()
                .map(|r| ChainLink {
                    start_position: r.get(0),
                    signed_size: r.get(1),
                })
                .collect::<Vec<_>>()
        };

        let Some(break_idx) = find_chain_break(&links) else {
            return Ok(false);
        };

        metrics::get().chain_breaks.inc();
        warn!(
            "🔗 position chain break for {address}/{asset} at fill #{break_idx}; clearing and backfilling"
        );
        self.repair(address, asset).await?;
        metrics::get().chain_repairs.inc();
        Ok(true)
    }

    /// Clear the slice and re-ingest from venue history. Re-running after a
    /// completed repair is a no-op thanks to fill idempotency.
    async fn repair(&self, address: &str, asset: Asset) -> Result<()> {
        {
            let client = self.db.lock().await;
            client
                .execute(
                    "DELETE FROM fills WHERE address = $1 AND asset = $2",
                    &[&address, &asset.as_str()],
                )
                .await?;
        }

        let end = Utc::now();
        let start = end - ChronoDuration::hours(BACKFILL_WINDOW_HOURS);
        let history = self
            .hl
            .user_fills_by_time(
                address,
                start.timestamp_millis() as u64,
                end.timestamp_millis() as u64,
            )
            .await?;

        let mut restored = 0usize;
        for raw in history.iter().filter(|f| f.coin == asset.hl_coin()) {
            if self.ingestor.ingest(address, raw).await? {
                restored += 1;
            }
        }
        info!("🔗 chain repaired for {address}/{asset}: {restored} fills restored");
        Ok(())
    }
}

pub async fn run_chain_loop(
    validator: Arc<ChainValidator>,
    check_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(check_secs.max(10)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = validator.sweep().await {
                    warn!("⚠️ chain sweep failed: {e:#}");
                }
            }
            _ = shutdown.changed() => {
                info!("🔗 chain validator stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link(start: f64, signed: f64) -> ChainLink {
        ChainLink {
            start_position: start,
            signed_size: signed,
        }
    }

    #[test]
    fn intact_chain_passes() {
        let links = vec![link(0.0, 1.0), link(1.0, -0.5), link(0.5, -0.5), link(0.0, 2.0)];
        assert_eq!(find_chain_break(&links), None);
    }

    #[test]
    fn gap_is_detected_at_first_bad_link() {
        // Second link claims start 2.0 but predecessor implies 1.0.
        let links = vec![link(0.0, 1.0), link(2.0, -1.0), link(1.0, 0.5)];
        assert_eq!(find_chain_break(&links), Some(1));
    }

    #[test]
    fn float_noise_within_epsilon_is_tolerated() {
        let links = vec![link(0.0, 0.1), link(0.1 + 1e-12, 0.2)];
        assert_eq!(find_chain_break(&links), None);
    }

    #[test]
    fn empty_and_single_chains_hold() {
        assert_eq!(find_chain_break(&[]), None);
        assert_eq!(find_chain_break(&[link(5.0, -5.0)]), None);
    }
}
