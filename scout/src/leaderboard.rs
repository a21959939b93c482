//! 🔭 Leaderboard refresh protocol.
//!
//! Once per UTC day (and on demand): fetch the venue leaderboard, enrich the
//! top slice with per-trader stats under the venue rate limit, gate + score,
//! then replace the period's rows in a single transaction and publish one
//! candidate event per kept address. A failed refresh leaves prior state
//! intact and bumps a failure counter; partial DB state is never visible.

use anyhow::{Context, Result};
use chrono::Utc;
use common::bus::{subjects, Bus, CandidateEvent};
use common::db::Db;
use common::hyperliquid::{fnum, HlClient, HlLeaderboardRow};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics;
use crate::scoring::{select_top_k, CandidateStats, ScoredCandidate};

/// How many leaderboard rows get the expensive per-trader enrichment.
const ENRICH_MULTIPLE: usize = 5;

/// Fills window used to derive win rate / frequency during enrichment.
const ENRICH_LOOKBACK_DAYS: f64 = 7.0;

pub struct Refresher {
    db: Arc<Db>,
    bus: Arc<Bus>,
    hl: Arc<HlClient>,
    config: Config,
}

impl Refresher {
    pub fn new(db: Arc<Db>, bus: Arc<Bus>, hl: Arc<HlClient>, config: Config) -> Self {
        Self { db, bus, hl, config }
    }

    /// Run one full refresh. Returns the number of candidates published.
    pub async fn refresh_once(&self) -> Result<usize> {
        let m = metrics::get();

        let rows = self.fetch_with_retries().await.map_err(|e| {
            m.refresh_failures.inc();
            e
        })?;
        m.candidates_scanned.inc_by(rows.len() as u64);
        info!("🔭 leaderboard fetched: {} rows", rows.len());

        let mut base: Vec<CandidateStats> = rows
            .iter()
            .filter_map(|row| self.base_stats(row))
            .collect();

        // Enrich only the top slice worth scoring; the venue rate limiter
        // spaces these calls out.
        base.sort_by(|a, b| {
            b.pnl_30d
                .partial_cmp(&a.pnl_30d)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        base.truncate(self.config.refresh.top_k * ENRICH_MULTIPLE);

        let mut enriched = Vec::with_capacity(base.len());
        for stats in base {
            match self.enrich(stats).await {
                Ok(stats) => enriched.push(stats),
                Err(e) => {
                    // Conservative: an account we cannot verify is not a
                    // candidate this cycle.
                    warn!("⚠️ enrichment failed, skipping candidate: {e:#}");
                }
            }
        }

        let (selected, rejected) =
            select_top_k(enriched, &self.config.gates, self.config.refresh.top_k);
        metrics::get().gate_rejections.inc_by(rejected as u64);
        info!(
            "🔭 scored candidates: {} kept, {} gated out",
            selected.len(),
            rejected
        );

        self.store_atomically(&selected)
            .await
            .context("failed to store leaderboard refresh")?;

        let published = self.publish_candidates(&selected).await?;
        m.refreshes_total.inc();
        info!("✅ leaderboard refresh complete: {published} candidates published");
        Ok(published)
    }

    async fn fetch_with_retries(&self) -> Result<Vec<HlLeaderboardRow>> {
        let mut attempt = 0u32;
        loop {
            match self.hl.leaderboard().await {
                Ok(rows) if !rows.is_empty() => return Ok(rows),
                Ok(_) => anyhow::bail!("venue returned an empty leaderboard"),
                Err(e) => {
                    if attempt >= self.config.refresh.fetch_retries {
                        return Err(e.context("leaderboard fetch failed after retries"));
                    }
                    let backoff = Duration::from_millis(1_000 * (1 << attempt));
                    warn!("⏳ leaderboard fetch failed ({e:#}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Map a leaderboard row into base stats using the configured window.
    fn base_stats(&self, row: &HlLeaderboardRow) -> Option<CandidateStats> {
        let window_name = match self.config.refresh.period_days {
            0..=1 => "day",
            2..=7 => "week",
            _ => "month",
        };
        let perf_for = |name: &str| {
            row.window_performances
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, p)| p)
        };

        let main = perf_for(window_name)?;
        let day = perf_for("day");
        let week = perf_for("week");

        Some(CandidateStats {
            address: row.eth_address.to_lowercase(),
            nickname: row.display_name.clone(),
            pnl_30d: fnum(&main.pnl),
            roi_30d: fnum(&main.roi),
            account_value: fnum(&row.account_value),
            weekly_volume: week.map(|p| fnum(&p.vlm)).unwrap_or(0.0),
            orders_per_day: 0.0, // filled in by enrichment
            win_rate: 0.5,
            roi_1d: day.map(|p| fnum(&p.roi)).unwrap_or(0.0),
            roi_7d: week.map(|p| fnum(&p.roi)).unwrap_or(0.0),
            has_btc_eth_history: false,
            is_subaccount: is_subaccount_marker(row.display_name.as_deref()),
        })
    }

    /// Per-trader enrichment: recent fills → win rate, trade frequency,
    /// BTC/ETH presence.
    async fn enrich(&self, mut stats: CandidateStats) -> Result<CandidateStats> {
        let fills = self.hl.user_fills(&stats.address).await?;

        let now_ms = Utc::now().timestamp_millis() as u64;
        let lookback_ms = (ENRICH_LOOKBACK_DAYS * 86_400_000.0) as u64;
        let cutoff = now_ms.saturating_sub(lookback_ms);

        let recent: Vec<_> = fills.iter().filter(|f| f.time >= cutoff).collect();

        let mut wins = 0usize;
        let mut closes = 0usize;
        for f in &recent {
            if let Some(pnl) = f.closed_pnl.as_deref() {
                let pnl = fnum(pnl);
                if pnl.abs() > f64::EPSILON {
                    closes += 1;
                    if pnl > 0.0 {
                        wins += 1;
                    }
                }
            }
        }
        if closes > 0 {
            stats.win_rate = wins as f64 / closes as f64;
        }

        stats.orders_per_day = recent.len() as f64 / ENRICH_LOOKBACK_DAYS;
        stats.has_btc_eth_history = fills
            .iter()
            .any(|f| f.coin == "BTC" || f.coin == "ETH");

        Ok(stats)
    }

    /// Delete-then-insert for the period inside one transaction.
    async fn store_atomically(&self, selected: &[ScoredCandidate]) -> Result<()> {
        let period = self.config.refresh.period_days as i32;
        let mut client = self.db.lock().await;
        let tx = client.transaction().await?;

        tx.execute(
            "DELETE FROM leaderboard_entries WHERE period_days = $1",
            &[&period],
        )
        .await?;

        for (rank, c) in selected.iter().enumerate() {
            tx.execute(
                "INSERT INTO leaderboard_entries
                   (period_days, address, rank, weight, pnl_30d, roi_30d,
                    account_value, weekly_volume, orders_per_day, nickname)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                &[
                    &period,
                    &c.stats.address,
                    &((rank + 1) as i32),
                    &c.weight,
                    &c.stats.pnl_30d,
                    &c.stats.roi_30d,
                    &c.stats.account_value,
                    &c.stats.weekly_volume,
                    &c.stats.orders_per_day,
                    &c.stats.nickname,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn publish_candidates(&self, selected: &[ScoredCandidate]) -> Result<usize> {
        let ts = Utc::now();
        let mut published = 0usize;
        for c in selected {
            let event = CandidateEvent {
                address: c.stats.address.clone(),
                nickname: c.stats.nickname.clone(),
                weight: c.weight,
                pnl_30d: c.stats.pnl_30d,
                roi_30d: c.stats.roi_30d,
                account_value: c.stats.account_value,
                weekly_volume: c.stats.weekly_volume,
                orders_per_day: c.stats.orders_per_day,
                ts,
            };
            self.bus.publish_json(subjects::CANDIDATES, &event).await?;
            metrics::get().candidates_published.inc();
            published += 1;
        }
        Ok(published)
    }
}

/// Venue subaccount naming convention.
fn is_subaccount_marker(display_name: Option<&str>) -> bool {
    match display_name {
        Some(name) => {
            let lower = name.to_ascii_lowercase();
            lower.starts_with("sub") || lower.contains("subaccount")
        }
        None => false,
    }
}

/// Periodic refresh loop; also fires immediately when the table is empty
/// (fresh install).
pub async fn run_refresh_loop(refresher: Arc<Refresher>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let interval_hours = refresher.config.refresh.refresh_interval_hours.max(1);
    let period = refresher.config.refresh.period_days as i32;

    // Fresh-install detection.
    let empty = {
        let client = refresher.db.lock().await;
        client
            .query_one(
                "SELECT COUNT(*) FROM leaderboard_entries WHERE period_days = $1",
                &[&period],
            )
            .await
            .map(|row| row.get::<_, i64>(0) == 0)
            .unwrap_or(true)
    };
    if empty {
        info!("🔭 leaderboard empty, running initial refresh");
        if let Err(e) = refresher.refresh_once().await {
            warn!("❌ initial leaderboard refresh failed: {e:#}");
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_hours * 3_600));
    ticker.tick().await; // first tick is immediate; refresh already handled above

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = refresher.refresh_once().await {
                    warn!("❌ scheduled leaderboard refresh failed: {e:#}");
                }
            }
            _ = shutdown.changed() => {
                info!("🔭 refresh loop stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subaccount_markers() {
        assert!(is_subaccount_marker(Some("Sub-Account 3")));
        assert!(is_subaccount_marker(Some("subacct")));
        assert!(is_subaccount_marker(Some("My subaccount")));
        assert!(!is_subaccount_marker(Some("whale.hl")));
        assert!(!is_subaccount_marker(None));
    }
}
