//! 📒 Shadow ledger: daily trader snapshots with FDR qualification.
//!
//! One immutable row per (snapshot date, address, selection version) for
//! every trader ever observed: as-of features, NIG parameters, the seeded
//! Thompson draw, which membership universes the trader passed, and any
//! lifecycle event. Qualification runs Benjamini–Hochberg at α = 0.10 over
//! one-sided t-test p-values (R samples winsorized at ±3σ first); the
//! effect-size floor applies after BH. Replay reads only this table, never
//! live state, so backtests cannot look ahead.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use common::assets::Asset;
use common::db::Db;
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::JobConfig;
use crate::metrics;
use crate::posterior;
use crate::thompson::{draw_seed, thompson_draw};

// ── Statistics ───────────────────────────────────────────────────────────────

/// Winsorize in place at mean ± `z`·σ of the sample itself.
pub fn winsorize(values: &mut [f64], z: f64) {
    let n = values.len();
    if n < 2 {
        return;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    let sd = var.sqrt();
    if sd <= 0.0 {
        return;
    }
    let (lo, hi) = (mean - z * sd, mean + z * sd);
    for v in values.iter_mut() {
        *v = v.clamp(lo, hi);
    }
}

/// One-sided t-test p-value for H₁: mean > 0. `None` when the sample is too
/// small or degenerate to test.
pub fn one_sided_p(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let nf = n as f64;
    let mean = values.iter().sum::<f64>() / nf;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (nf - 1.0);
    if var <= 0.0 {
        // Zero variance: all mass on one side.
        return Some(if mean > 0.0 { 0.0 } else { 1.0 });
    }
    let t = mean / (var.sqrt() / nf.sqrt());
    let dist = StudentsT::new(0.0, 1.0, nf - 1.0).ok()?;
    Some(1.0 - dist.cdf(t))
}

/// Benjamini–Hochberg step-up at level `alpha`.
///
/// Returns a rejection flag per input p-value (original order). The number
/// rejected is exactly max{k : p₍ₖ₎ ≤ k·α/n}.
pub fn benjamini_hochberg(p_values: &[f64], alpha: f64) -> Vec<bool> {
    let n = p_values.len();
    if n == 0 {
        return Vec::new();
    }
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        p_values[a]
            .partial_cmp(&p_values[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut cutoff_rank = 0usize; // number of rejections
    for (rank, &idx) in order.iter().enumerate() {
        let threshold = (rank + 1) as f64 * alpha / n as f64;
        if p_values[idx] <= threshold {
            cutoff_rank = rank + 1;
        }
    }

    let mut rejected = vec![false; n];
    for &idx in order.iter().take(cutoff_rank) {
        rejected[idx] = true;
    }
    rejected
}

// ── Lifecycle classification ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Entered,
    Promoted,
    Demoted,
    Death(&'static str),
    Censored(&'static str),
}

impl Lifecycle {
    pub fn event_type(&self) -> &'static str {
        match self {
            Lifecycle::Entered => "entered",
            Lifecycle::Promoted => "promoted",
            Lifecycle::Demoted => "demoted",
            Lifecycle::Death(_) => "death",
            Lifecycle::Censored(_) => "censored",
        }
    }

    pub fn detail(&self) -> Option<&'static str> {
        match self {
            Lifecycle::Death(d) | Lifecycle::Censored(d) => Some(d),
            _ => None,
        }
    }
}

/// Inputs to lifecycle classification for one trader.
#[derive(Debug, Clone, Default)]
pub struct LifecycleInput {
    pub account_value: f64,
    pub peak_account_value: f64,
    pub had_prior_snapshot: bool,
    pub was_selected_yesterday: bool,
    pub selected_today: bool,
    pub days_since_last_fill: Option<i64>,
    pub liquidated_recently: bool,
    /// Trader is still active on the venue but no longer trades BTC/ETH:
    /// there is episode history, yet no tracked-asset episode in 30 days.
    pub lost_btc_eth: bool,
}

/// Death events outrank censoring, which outranks promotion bookkeeping.
pub fn classify_lifecycle(input: &LifecycleInput) -> Option<Lifecycle> {
    if input.account_value < 0.0 || (input.had_prior_snapshot && input.account_value == 0.0) {
        return Some(Lifecycle::Death("negative_equity"));
    }
    if input.liquidated_recently {
        return Some(Lifecycle::Death("liquidation"));
    }
    if input.peak_account_value > 0.0
        && input.account_value > 0.0
        && input.account_value < 0.20 * input.peak_account_value
    {
        return Some(Lifecycle::Death("drawdown_80"));
    }
    if input.had_prior_snapshot && input.account_value > 0.0 && input.account_value < 10_000.0 {
        return Some(Lifecycle::Death("account_value_floor"));
    }
    if input.lost_btc_eth {
        return Some(Lifecycle::Censored("lost_btc_eth"));
    }
    if matches!(input.days_since_last_fill, Some(d) if d >= 30) {
        return Some(Lifecycle::Censored("inactivity_30d"));
    }
    if !input.had_prior_snapshot {
        return Some(Lifecycle::Entered);
    }
    match (input.was_selected_yesterday, input.selected_today) {
        (false, true) => Some(Lifecycle::Promoted),
        (true, false) => Some(Lifecycle::Demoted),
        _ => None,
    }
}

// ── Snapshot job ─────────────────────────────────────────────────────────────

pub struct SnapshotJob {
    db: Arc<Db>,
    config: JobConfig,
}

impl SnapshotJob {
    pub fn new(db: Arc<Db>, config: JobConfig) -> Self {
        Self { db, config }
    }

    /// Write the shadow ledger for `date` at `selection_version`.
    /// Re-running upserts: same date + version never duplicates rows.
    pub async fn run_once(&self, date: NaiveDate, selection_version: i32) -> Result<usize> {
        let posteriors = posterior::load_all(&self.db).await?;
        if posteriors.is_empty() {
            info!("📒 snapshot skipped: no tracked traders yet");
            return Ok(0);
        }

        let universes = self.load_universes().await?;
        let r_samples = self.load_r_samples().await?;
        let activity = self.load_activity().await?;
        let coverage = self.load_recent_asset_coverage().await?;
        let prior = self.load_prior_snapshot_state().await?;

        // FDR qualification over testable traders.
        let mut testable: Vec<(String, f64, f64)> = Vec::new(); // (address, p, avg_r)
        for p in &posteriors {
            if let Some(rs) = r_samples.get(&p.address) {
                let mut rs = rs.clone();
                winsorize(&mut rs, 3.0);
                if let Some(pv) = one_sided_p(&rs) {
                    let avg = rs.iter().sum::<f64>() / rs.len() as f64;
                    testable.push((p.address.clone(), pv, avg));
                }
            }
        }
        let p_values: Vec<f64> = testable.iter().map(|(_, p, _)| *p).collect();
        let rejected = benjamini_hochberg(&p_values, self.config.fdr_alpha);
        let qualified: HashSet<String> = testable
            .iter()
            .zip(rejected.iter())
            .filter(|((_, _, avg_r), bh)| **bh && *avg_r >= self.config.min_effect_avg_r)
            .map(|((addr, _, _), _)| addr.clone())
            .collect();

        let mut written = 0usize;
        for p in &posteriors {
            let seed = draw_seed(date, &p.address, selection_version);
            let draw = thompson_draw(&p.nig, seed);

            let features = universes.features.get(&p.address);
            let account_value = features.map(|f| f.account_value).unwrap_or(0.0);
            let prior_state = prior.get(&p.address);

            let selected_today = universes.selected.contains(&p.address);
            // Still trading on the venue (visible on the leaderboard) with
            // episode history, but no BTC/ETH episode in the window: the
            // trader left our tracked assets rather than going dark.
            let covers_tracked = coverage
                .get(&p.address)
                .map(|assets| !assets.is_empty())
                .unwrap_or(false);
            let lost_btc_eth = p.total_signals > 0
                && !covers_tracked
                && universes.on_leaderboard.contains(&p.address);

            let lifecycle = classify_lifecycle(&LifecycleInput {
                account_value,
                peak_account_value: prior_state.map(|s| s.peak_account_value).unwrap_or(0.0),
                had_prior_snapshot: prior_state.is_some(),
                was_selected_yesterday: prior_state.map(|s| s.was_selected).unwrap_or(false),
                selected_today,
                days_since_last_fill: activity.get(&p.address).copied(),
                liquidated_recently: universes.liquidated.contains(&p.address),
                lost_btc_eth,
            });

            let client = self.db.lock().await;
            let result = client
                .execute(
                    "INSERT INTO trader_snapshots
                       (snapshot_date, address, selection_version,
                        pnl_30d, roi_30d, account_value, episode_count, avg_r,
                        nig_m, nig_kappa, nig_alpha, nig_beta,
                        thompson_draw, draw_seed, selection_rank,
                        on_leaderboard, passed_filters, qualified, pool_selected, pinned,
                        event_type, event_detail)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                             $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
                     ON CONFLICT (snapshot_date, address, selection_version) DO UPDATE SET
                       pnl_30d = EXCLUDED.pnl_30d,
                       roi_30d = EXCLUDED.roi_30d,
                       account_value = EXCLUDED.account_value,
                       episode_count = EXCLUDED.episode_count,
                       avg_r = EXCLUDED.avg_r,
                       thompson_draw = EXCLUDED.thompson_draw,
                       draw_seed = EXCLUDED.draw_seed,
                       selection_rank = EXCLUDED.selection_rank,
                       on_leaderboard = EXCLUDED.on_leaderboard,
                       passed_filters = EXCLUDED.passed_filters,
                       qualified = EXCLUDED.qualified,
                       pool_selected = EXCLUDED.pool_selected,
                       pinned = EXCLUDED.pinned,
                       event_type = EXCLUDED.event_type,
                       event_detail = EXCLUDED.event_detail",
                    &[
                        &date,
                        &p.address,
                        &selection_version,
                        &features.map(|f| f.pnl_30d).unwrap_or(0.0),
                        &features.map(|f| f.roi_30d).unwrap_or(0.0),
                        &account_value,
                        &p.total_signals,
                        &p.avg_r,
                        &p.nig.m,
                        &p.nig.kappa,
                        &p.nig.alpha,
                        &p.nig.beta,
                        &draw,
                        &(seed as i64), // stored as BIGINT, bit pattern preserved
                        &universes.rank.get(&p.address).copied(),
                        &universes.on_leaderboard.contains(&p.address),
                        &universes.on_leaderboard.contains(&p.address),
                        &qualified.contains(&p.address),
                        &universes.selected.contains(&p.address),
                        &universes.pinned.contains(&p.address),
                        &lifecycle.as_ref().map(|l| l.event_type()),
                        &lifecycle.as_ref().and_then(|l| l.detail()),
                    ],
                )
                .await;
            drop(client);

            match result {
                Ok(_) => written += 1,
                Err(e) => {
                    metrics::get().snapshot_failures.inc();
                    warn!("⚠️ snapshot row failed for {}: {e}", p.address);
                }
            }
        }

        metrics::get().snapshots_written.inc_by(written as u64);
        info!(
            "📒 shadow ledger {date} v{selection_version}: {written} rows, {} qualified",
            qualified.len()
        );
        Ok(written)
    }

    async fn load_universes(&self) -> Result<Universes> {
        let client = self.db.lock().await;

        let mut features = HashMap::new();
        let mut on_leaderboard = HashSet::new();
        for row in client
            .query(
                "SELECT address, pnl_30d, roi_30d, account_value FROM leaderboard_entries",
                &[],
            )
            .await?
        {
            let address: String = row.get(0);
            on_leaderboard.insert(address.clone());
            features.insert(
                address,
                Features {
                    pnl_30d: row.get(1),
                    roi_30d: row.get(2),
                    account_value: row.get(3),
                },
            );
        }

        // The selection run persists its outcome on the pool rows: the
        // selected flag marks the true SELECT_K winners, rank their order.
        let mut selected = HashSet::new();
        let mut rank = HashMap::new();
        for row in client
            .query(
                "SELECT address, selected, rank FROM alpha_pool WHERE is_active",
                &[],
            )
            .await?
        {
            let address: String = row.get(0);
            if row.get::<_, bool>(1) {
                selected.insert(address.clone());
            }
            if let Some(r) = row.get::<_, Option<i32>>(2) {
                rank.insert(address.clone(), r);
            }
        }

        let pinned: HashSet<String> = client
            .query("SELECT address FROM pinned_accounts", &[])
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();

        let liquidated: HashSet<String> = client
            .query(
                "SELECT DISTINCT address FROM fills
                 WHERE action_label ILIKE '%liquidat%'
                   AND ts > now() - INTERVAL '1 day'",
                &[],
            )
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect();

        Ok(Universes {
            features,
            on_leaderboard,
            pinned,
            rank,
            liquidated,
            selected,
        })
    }

    /// Assets each address has had episode activity in over the last 30
    /// days, for the lost-BTC/ETH censor.
    async fn load_recent_asset_coverage(&self) -> Result<HashMap<String, HashSet<Asset>>> {
        let client = self.db.lock().await;
        let rows = client
            .query(
                "SELECT DISTINCT address, asset FROM episodes
                 WHERE last_fill_ts > now() - INTERVAL '30 days'",
                &[],
            )
            .await?;
        let mut coverage: HashMap<String, HashSet<Asset>> = HashMap::new();
        for row in rows {
            let address: String = row.get(0);
            let asset: String = row.get(1);
            if let Ok(asset) = asset.parse::<Asset>() {
                coverage.entry(address).or_default().insert(asset);
            }
        }
        Ok(coverage)
    }

    async fn load_r_samples(&self) -> Result<HashMap<String, Vec<f64>>> {
        let client = self.db.lock().await;
        let rows = client
            .query(
                "SELECT address, result_r FROM episodes
                 WHERE status = 'closed' AND result_r IS NOT NULL
                 ORDER BY address, exit_ts",
                &[],
            )
            .await?;
        let mut samples: HashMap<String, Vec<f64>> = HashMap::new();
        for row in rows {
            samples
                .entry(row.get(0))
                .or_default()
                .push(row.get(1));
        }
        Ok(samples)
    }

    async fn load_activity(&self) -> Result<HashMap<String, i64>> {
        let client = self.db.lock().await;
        let rows = client
            .query(
                "SELECT address, EXTRACT(EPOCH FROM (now() - MAX(ts)))::BIGINT / 86400
                 FROM fills GROUP BY address",
                &[],
            )
            .await?;
        Ok(rows.into_iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    /// Peak account value and yesterday's selection flag from prior rows.
    async fn load_prior_snapshot_state(&self) -> Result<HashMap<String, PriorState>> {
        let client = self.db.lock().await;
        let rows = client
            .query(
                "SELECT address,
                        MAX(account_value),
                        BOOL_OR(pool_selected AND snapshot_date = (
                            SELECT MAX(snapshot_date) FROM trader_snapshots
                        ))
                 FROM trader_snapshots
                 GROUP BY address",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<_, String>(0),
                    PriorState {
                        peak_account_value: r.get(1),
                        was_selected: r.get(2),
                    },
                )
            })
            .collect())
    }
}

struct Features {
    pnl_30d: f64,
    roi_30d: f64,
    account_value: f64,
}

struct Universes {
    features: HashMap<String, Features>,
    on_leaderboard: HashSet<String>,
    pinned: HashSet<String>,
    rank: HashMap<String, i32>,
    liquidated: HashSet<String>,
    selected: HashSet<String>,
}

struct PriorState {
    peak_account_value: f64,
    was_selected: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winsorize_clamps_outliers() {
        let mut values = vec![0.1, 0.2, -0.1, 0.15, 50.0];
        winsorize(&mut values, 3.0);
        assert!(values[4] < 50.0);
        // Inliers untouched up to the clamp bound.
        assert_eq!(values[0], 0.1);
    }

    #[test]
    fn one_sided_p_small_for_clearly_positive_sample() {
        let values: Vec<f64> = (0..30).map(|i| 0.5 + (i % 3) as f64 * 0.1).collect();
        let p = one_sided_p(&values).unwrap();
        assert!(p < 0.001, "p = {p}");
    }

    #[test]
    fn one_sided_p_large_for_negative_sample() {
        let values: Vec<f64> = (0..30).map(|i| -0.5 - (i % 3) as f64 * 0.1).collect();
        let p = one_sided_p(&values).unwrap();
        assert!(p > 0.999, "p = {p}");
    }

    #[test]
    fn one_sided_p_degenerate_cases() {
        assert!(one_sided_p(&[0.5]).is_none());
        assert_eq!(one_sided_p(&[0.5, 0.5, 0.5]), Some(0.0));
        assert_eq!(one_sided_p(&[-0.5, -0.5]), Some(1.0));
    }

    #[test]
    fn bh_rejection_count_matches_definition() {
        // Invariant: #rejections == max{k : p_(k) <= k*alpha/n}.
        let ps = vec![0.001, 0.008, 0.039, 0.041, 0.09, 0.205, 0.5, 0.99];
        let alpha = 0.10;
        let flags = benjamini_hochberg(&ps, alpha);
        let rejected = flags.iter().filter(|f| **f).count();

        let mut sorted = ps.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let expected = (0..sorted.len())
            .filter(|&k| sorted[k] <= (k + 1) as f64 * alpha / sorted.len() as f64)
            .map(|k| k + 1)
            .max()
            .unwrap_or(0);
        assert_eq!(rejected, expected);
        // And BH rejects exactly the smallest `rejected` p-values.
        assert_eq!(&flags, &[true, true, true, true, false, false, false, false]);
    }

    #[test]
    fn bh_rejects_nothing_when_all_large() {
        let flags = benjamini_hochberg(&[0.4, 0.6, 0.9], 0.10);
        assert!(flags.iter().all(|f| !f));
        assert!(benjamini_hochberg(&[], 0.10).is_empty());
    }

    #[test]
    fn lifecycle_priorities() {
        // Drawdown death beats censoring.
        let input = LifecycleInput {
            account_value: 15_000.0,
            peak_account_value: 100_000.0,
            had_prior_snapshot: true,
            days_since_last_fill: Some(45),
            ..Default::default()
        };
        assert_eq!(
            classify_lifecycle(&input),
            Some(Lifecycle::Death("drawdown_80"))
        );

        // Liquidation outranks drawdown.
        let input = LifecycleInput {
            liquidated_recently: true,
            account_value: 15_000.0,
            peak_account_value: 100_000.0,
            had_prior_snapshot: true,
            ..Default::default()
        };
        assert_eq!(
            classify_lifecycle(&input),
            Some(Lifecycle::Death("liquidation"))
        );
    }

    #[test]
    fn lifecycle_floor_and_entry() {
        let input = LifecycleInput {
            account_value: 9_000.0,
            peak_account_value: 12_000.0,
            had_prior_snapshot: true,
            ..Default::default()
        };
        assert_eq!(
            classify_lifecycle(&input),
            Some(Lifecycle::Death("account_value_floor"))
        );

        let input = LifecycleInput {
            account_value: 50_000.0,
            had_prior_snapshot: false,
            ..Default::default()
        };
        assert_eq!(classify_lifecycle(&input), Some(Lifecycle::Entered));
    }

    #[test]
    fn lifecycle_lost_btc_eth_censors_before_inactivity() {
        // Still on the venue, still trading — just not BTC/ETH any more.
        let input = LifecycleInput {
            account_value: 50_000.0,
            peak_account_value: 50_000.0,
            had_prior_snapshot: true,
            lost_btc_eth: true,
            days_since_last_fill: Some(45),
            ..Default::default()
        };
        assert_eq!(
            classify_lifecycle(&input),
            Some(Lifecycle::Censored("lost_btc_eth"))
        );
    }

    #[test]
    fn lifecycle_death_outranks_lost_btc_eth() {
        let input = LifecycleInput {
            account_value: 5_000.0,
            peak_account_value: 8_000.0,
            had_prior_snapshot: true,
            lost_btc_eth: true,
            ..Default::default()
        };
        assert_eq!(
            classify_lifecycle(&input),
            Some(Lifecycle::Death("account_value_floor"))
        );
    }

    #[test]
    fn lifecycle_active_btc_eth_trader_is_not_censored() {
        let input = LifecycleInput {
            account_value: 50_000.0,
            peak_account_value: 50_000.0,
            had_prior_snapshot: true,
            was_selected_yesterday: true,
            selected_today: true,
            lost_btc_eth: false,
            days_since_last_fill: Some(2),
            ..Default::default()
        };
        assert_eq!(classify_lifecycle(&input), None);
    }

    #[test]
    fn lifecycle_promotion_and_steady_state() {
        let promoted = LifecycleInput {
            account_value: 50_000.0,
            peak_account_value: 50_000.0,
            had_prior_snapshot: true,
            was_selected_yesterday: false,
            selected_today: true,
            days_since_last_fill: Some(1),
            ..Default::default()
        };
        assert_eq!(classify_lifecycle(&promoted), Some(Lifecycle::Promoted));

        let steady = LifecycleInput {
            selected_today: true,
            was_selected_yesterday: true,
            ..promoted
        };
        assert_eq!(classify_lifecycle(&steady), None);
    }
}
