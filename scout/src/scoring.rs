//! 📊 Candidate scoring and quality gates.
//!
//! A leaderboard row becomes a candidate only after passing seven hard gates;
//! survivors get a composite score in [0, 100] and the top-K are kept with
//! weights normalized to sum to 1.0.
//!
//! Component weights mirror what actually predicts followable traders:
//! consistency first, then win-rate shape (extremes are penalized — a 100%
//! win rate on large volume is a maker bot, a near-zero one is noise), then
//! realized PnL through a saturating transform so whales do not drown out
//! everyone else, then trade frequency normalized into a followable band.

use tracing::debug;

use crate::config::GateConfig;

const STABILITY_WEIGHT: f64 = 0.30;
const WIN_RATE_WEIGHT: f64 = 0.25;
const PNL_WEIGHT: f64 = 0.30;
const FREQUENCY_WEIGHT: f64 = 0.15;

/// PnL at which the saturating transform reaches half of its range.
const PNL_HALF_SATURATION_USD: f64 = 100_000.0;

/// Everything the scorer needs about one account, assembled by the
/// leaderboard fetch + enrichment passes.
#[derive(Debug, Clone)]
pub struct CandidateStats {
    pub address: String,
    pub nickname: Option<String>,
    pub pnl_30d: f64,
    pub roi_30d: f64,
    pub account_value: f64,
    pub weekly_volume: f64,
    pub orders_per_day: f64,
    /// Fraction of recent closed trades with positive PnL, from enrichment.
    pub win_rate: f64,
    /// Day/week/month ROI used for the stability component.
    pub roi_1d: f64,
    pub roi_7d: f64,
    /// True when recent fills include BTC or ETH perps.
    pub has_btc_eth_history: bool,
    /// Venue subaccount marker.
    pub is_subaccount: bool,
}

/// A gated, scored candidate.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub stats: CandidateStats,
    pub score: f64,
    /// Normalized over the selected top-K, sums to 1.0.
    pub weight: f64,
}

/// Why a candidate was rejected; used for gate logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateRejection {
    Pnl,
    Roi,
    AccountValue,
    WeeklyVolume,
    OrdersPerDay,
    Subaccount,
    NoBtcEthHistory,
}

/// Apply the seven quality gates in order; first failure wins.
pub fn check_gates(stats: &CandidateStats, gates: &GateConfig) -> Result<(), GateRejection> {
    if stats.pnl_30d < gates.min_pnl_30d {
        return Err(GateRejection::Pnl);
    }
    if stats.roi_30d < gates.min_roi_30d {
        return Err(GateRejection::Roi);
    }
    if stats.account_value < gates.min_account_value {
        return Err(GateRejection::AccountValue);
    }
    if stats.weekly_volume < gates.min_weekly_volume {
        return Err(GateRejection::WeeklyVolume);
    }
    if stats.orders_per_day > gates.max_orders_per_day {
        return Err(GateRejection::OrdersPerDay);
    }
    if stats.is_subaccount {
        return Err(GateRejection::Subaccount);
    }
    if !stats.has_btc_eth_history {
        return Err(GateRejection::NoBtcEthHistory);
    }
    Ok(())
}

/// Consistency of returns across the day/week/month windows.
///
/// All three positive and of similar magnitude scores high; a month number
/// carried entirely by one spike day scores low.
fn stability_score(stats: &CandidateStats) -> f64 {
    let windows = [stats.roi_1d, stats.roi_7d, stats.roi_30d];
    let positive = windows.iter().filter(|r| **r > 0.0).count() as f64;
    let base = positive / windows.len() as f64 * 60.0;

    // Dispersion penalty: compare the weekly pace to the monthly pace.
    let monthly_pace = stats.roi_30d / 30.0;
    let weekly_pace = stats.roi_7d / 7.0;
    let agreement = if monthly_pace.abs() < 1e-9 {
        0.0
    } else {
        let ratio = weekly_pace / monthly_pace;
        // 1.0 = perfectly steady; reward [0.3, 3.0].
        if ratio > 0.3 && ratio < 3.0 {
            40.0 * (1.0 - ((ratio.ln()).abs() / 3.0_f64.ln()))
        } else {
            0.0
        }
    };

    (base + agreement).clamp(0.0, 100.0)
}

/// Win-rate component with penalties at both extremes.
fn win_rate_score(stats: &CandidateStats) -> f64 {
    let wr = stats.win_rate.clamp(0.0, 1.0);

    // Perfect win rates on meaningful volume are market-making, not alpha.
    if wr >= 0.95 && stats.weekly_volume > 1_000_000.0 {
        return 10.0;
    }
    if wr <= 0.05 {
        return 0.0;
    }

    // Peak at 65%, falling off towards both ends.
    let distance = (wr - 0.65).abs();
    (100.0 * (1.0 - distance / 0.65)).clamp(0.0, 100.0)
}

/// Monotone saturating transform of realized PnL.
fn pnl_score(stats: &CandidateStats) -> f64 {
    if stats.pnl_30d <= 0.0 {
        return 0.0;
    }
    100.0 * stats.pnl_30d / (stats.pnl_30d + PNL_HALF_SATURATION_USD)
}

/// Trade-frequency normalization: a followable trader places a handful of
/// orders a day. Very low frequency starves consensus; very high frequency
/// approaches the HFT gate.
fn frequency_score(stats: &CandidateStats) -> f64 {
    let opd = stats.orders_per_day;
    if opd < 0.5 {
        return 20.0;
    }
    if opd <= 50.0 {
        return 100.0;
    }
    // Linear falloff from 50 to 300 orders/day.
    (100.0 * (1.0 - (opd - 50.0) / 250.0)).clamp(0.0, 100.0)
}

/// Composite score in [0, 100].
pub fn composite_score(stats: &CandidateStats) -> f64 {
    let stability = stability_score(stats);
    let win = win_rate_score(stats);
    let pnl = pnl_score(stats);
    let freq = frequency_score(stats);

    let total = stability * STABILITY_WEIGHT
        + win * WIN_RATE_WEIGHT
        + pnl * PNL_WEIGHT
        + freq * FREQUENCY_WEIGHT;

    debug!(
        address = %stats.address,
        stability, win, pnl, freq, total,
        "candidate scored"
    );
    total
}

/// Gate, score, rank, and keep the top-K with normalized weights.
///
/// Returns the kept candidates and the number rejected by gates.
pub fn select_top_k(
    all: Vec<CandidateStats>,
    gates: &GateConfig,
    top_k: usize,
) -> (Vec<ScoredCandidate>, usize) {
    let mut rejected = 0usize;
    let mut scored: Vec<ScoredCandidate> = all
        .into_iter()
        .filter_map(|stats| match check_gates(&stats, gates) {
            Ok(()) => {
                let score = composite_score(&stats);
                Some(ScoredCandidate {
                    stats,
                    score,
                    weight: 0.0,
                })
            }
            Err(reason) => {
                debug!(reason = ?reason, "candidate gated out");
                rejected += 1;
                None
            }
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(top_k);

    let total: f64 = scored.iter().map(|c| c.score).sum();
    if total > 0.0 {
        for c in &mut scored {
            c.weight = c.score / total;
        }
    } else if !scored.is_empty() {
        let uniform = 1.0 / scored.len() as f64;
        for c in &mut scored {
            c.weight = uniform;
        }
    }

    (scored, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_stats(address: &str) -> CandidateStats {
        CandidateStats {
            address: address.to_string(),
            nickname: None,
            pnl_30d: 50_000.0,
            roi_30d: 0.25,
            account_value: 500_000.0,
            weekly_volume: 2_000_000.0,
            orders_per_day: 12.0,
            win_rate: 0.6,
            roi_1d: 0.01,
            roi_7d: 0.06,
            has_btc_eth_history: true,
            is_subaccount: false,
        }
    }

    fn default_gates() -> GateConfig {
        GateConfig {
            min_pnl_30d: 10_000.0,
            min_roi_30d: 0.10,
            min_account_value: 100_000.0,
            min_weekly_volume: 500_000.0,
            max_orders_per_day: 300.0,
        }
    }

    #[test]
    fn gates_reject_in_order() {
        let gates = default_gates();
        let mut s = passing_stats("0x1");
        assert!(check_gates(&s, &gates).is_ok());

        s.pnl_30d = 5_000.0;
        assert_eq!(check_gates(&s, &gates), Err(GateRejection::Pnl));

        let mut s = passing_stats("0x1");
        s.roi_30d = 0.05;
        assert_eq!(check_gates(&s, &gates), Err(GateRejection::Roi));

        let mut s = passing_stats("0x1");
        s.orders_per_day = 5_000.0;
        assert_eq!(check_gates(&s, &gates), Err(GateRejection::OrdersPerDay));

        let mut s = passing_stats("0x1");
        s.is_subaccount = true;
        assert_eq!(check_gates(&s, &gates), Err(GateRejection::Subaccount));

        let mut s = passing_stats("0x1");
        s.has_btc_eth_history = false;
        assert_eq!(check_gates(&s, &gates), Err(GateRejection::NoBtcEthHistory));
    }

    #[test]
    fn perfect_win_rate_on_volume_is_penalized() {
        let mut honest = passing_stats("0x1");
        honest.win_rate = 0.65;
        let mut bot = passing_stats("0x2");
        bot.win_rate = 1.0;
        bot.weekly_volume = 50_000_000.0;
        assert!(composite_score(&honest) > composite_score(&bot));
    }

    #[test]
    fn pnl_transform_is_monotone_and_saturating() {
        let mut small = passing_stats("0x1");
        small.pnl_30d = 20_000.0;
        let mut big = passing_stats("0x2");
        big.pnl_30d = 200_000.0;
        let mut huge = passing_stats("0x3");
        huge.pnl_30d = 2_000_000.0;

        let (s, b, h) = (pnl_score(&small), pnl_score(&big), pnl_score(&huge));
        assert!(s < b && b < h);
        // Saturation: 10x the PnL must not mean 10x the score.
        assert!(h < b * 2.0);
    }

    #[test]
    fn weights_sum_to_one() {
        let gates = default_gates();
        let all: Vec<CandidateStats> = (0..20)
            .map(|i| {
                let mut s = passing_stats(&format!("0x{i}"));
                s.pnl_30d = 10_000.0 + i as f64 * 5_000.0;
                s
            })
            .collect();

        let (selected, rejected) = select_top_k(all, &gates, 12);
        assert_eq!(selected.len(), 12);
        assert_eq!(rejected, 0);
        let total: f64 = selected.iter().map(|c| c.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        // Ranked descending.
        for pair in selected.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn gated_candidates_are_counted() {
        let gates = default_gates();
        let mut all = vec![passing_stats("0x1")];
        let mut bad = passing_stats("0x2");
        bad.account_value = 1_000.0;
        all.push(bad);

        let (selected, rejected) = select_top_k(all, &gates, 12);
        assert_eq!(selected.len(), 1);
        assert_eq!(rejected, 1);
        assert!((selected[0].weight - 1.0).abs() < 1e-9);
    }
}
