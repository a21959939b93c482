//! 🚧 Gates G1–G4: supermajority, effective-K, freshness, price band.
//!
//! Each gate produces a [`GateValue`] with the measured value, the
//! threshold, and the pass flag; the decision log stores all of them
//! verbatim so a skip can always name the failed gate and its numeric gap.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::votes::{median_entry_price, Vote, VoteTally};

#[derive(Debug, Clone, Serialize)]
pub struct GateValue {
    pub gate: &'static str,
    pub value: f64,
    pub threshold: f64,
    pub passed: bool,
    pub detail: String,
}

impl GateValue {
    fn new(gate: &'static str, value: f64, threshold: f64, passed: bool, detail: String) -> Self {
        Self {
            gate,
            value,
            threshold,
            passed,
            detail,
        }
    }
}

/// G1: weighted supermajority and a minimum trader count.
pub fn g1_supermajority(tally: &VoteTally, min_pct: f64, min_traders: usize) -> GateValue {
    let n_traders = tally.majority.len() + tally.minority.len();
    let majority_pct = if tally.total_weight > 0.0 {
        tally.majority_weight / tally.total_weight
    } else {
        0.0
    };
    let passed = majority_pct >= min_pct && tally.majority.len() >= min_traders;
    GateValue::new(
        "G1_supermajority",
        majority_pct,
        min_pct,
        passed,
        format!(
            "{:.2} majority over {} traders ({} agreeing)",
            majority_pct,
            n_traders,
            tally.majority.len()
        ),
    )
}

/// G2: correlation-adjusted effective vote count over the agreeing side.
///
/// `eff_k = (Σw)² / Σᵢⱼ wᵢ·wⱼ·ρᵢⱼ` with ρᵢᵢ = 1 and missing pairs at the
/// venue default.
pub fn effective_k(
    votes: &[Vote],
    correlations: &HashMap<(String, String), f64>,
    default_rho: f64,
) -> f64 {
    if votes.is_empty() {
        return 0.0;
    }
    let sum_w: f64 = votes.iter().map(|v| v.weight).sum();
    let mut denom = 0.0;
    for a in votes {
        for b in votes {
            let rho = if a.address == b.address {
                1.0
            } else {
                let key = pair_key(&a.address, &b.address);
                *correlations.get(&key).unwrap_or(&default_rho)
            };
            denom += a.weight * b.weight * rho;
        }
    }
    if denom <= 0.0 {
        return 0.0;
    }
    sum_w * sum_w / denom
}

/// Canonical (sorted) key for an unordered address pair.
pub fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub fn g2_effective_k(
    tally: &VoteTally,
    correlations: &HashMap<(String, String), f64>,
    default_rho: f64,
    min_eff_k: f64,
) -> GateValue {
    let eff_k = effective_k(&tally.majority, correlations, default_rho);
    GateValue::new(
        "G2_effective_k",
        eff_k,
        min_eff_k,
        eff_k >= min_eff_k,
        format!("effK {:.2} from {} agreeing votes (ρ default {:.2})", eff_k, tally.majority.len(), default_rho),
    )
}

/// G3: age of the oldest majority vote.
pub fn g3_freshness(tally: &VoteTally, now: DateTime<Utc>, window_secs: u64) -> GateValue {
    let oldest = tally.majority.iter().map(|v| v.ts).min();
    let age_secs = match oldest {
        Some(ts) => (now - ts).num_seconds().max(0) as f64,
        None => f64::INFINITY,
    };
    GateValue::new(
        "G3_freshness",
        age_secs,
        window_secs as f64,
        age_secs <= window_secs as f64,
        format!("oldest majority vote {age_secs:.0}s old"),
    )
}

/// G4: drift of the current price from the majority's median entry, in
/// stop-distance units.
pub fn g4_price_band(
    tally: &VoteTally,
    current_price: f64,
    stop_distance: f64,
    max_drift_r: f64,
) -> GateValue {
    let median = median_entry_price(&tally.majority);
    let drift_r = match median {
        Some(median) if stop_distance > 0.0 => (current_price - median).abs() / stop_distance,
        _ => f64::INFINITY,
    };
    GateValue::new(
        "G4_price_band",
        drift_r,
        max_drift_r,
        drift_r <= max_drift_r,
        match median {
            Some(m) => format!(
                "price {current_price:.2} vs median entry {m:.2} → drift {drift_r:.2}R"
            ),
            None => "no majority entry prices".to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::votes::VoteWindow;
    use chrono::TimeZone;
    use common::assets::Direction;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn window(longs: usize, shorts: usize, price: f64) -> VoteTally {
        let mut w = VoteWindow::new();
        for i in 0..longs {
            w.push(Vote {
                address: format!("0xl{i}"),
                direction: Direction::Long,
                entry_price: price,
                weight: 1.0,
                ts: t(i as i64),
            });
        }
        for i in 0..shorts {
            w.push(Vote {
                address: format!("0xs{i}"),
                direction: Direction::Short,
                entry_price: price,
                weight: 1.0,
                ts: t(i as i64),
            });
        }
        w.tally()
    }

    #[test]
    fn scenario_g1_fails_at_sixty_pct() {
        // 4 long / 6 short → majority 0.6 < 0.7.
        let tally = window(4, 6, 43_000.0);
        let gate = g1_supermajority(&tally, 0.70, 3);
        assert!(!gate.passed);
        assert!((gate.value - 0.6).abs() < 1e-9);
        assert!(gate.detail.contains("0.60"));
    }

    #[test]
    fn g1_needs_min_traders_too() {
        let tally = window(2, 0, 43_000.0);
        let gate = g1_supermajority(&tally, 0.70, 3);
        assert!(!gate.passed, "unanimous but only 2 traders");
        assert_eq!(gate.value, 1.0);
    }

    #[test]
    fn effective_k_with_default_rho() {
        // 8 equal votes, ρ = 0.3 everywhere: effK = 64 / (8 + 56·0.3) ≈ 2.58.
        let tally = window(8, 2, 43_000.0);
        let eff = effective_k(&tally.majority, &HashMap::new(), 0.3);
        assert!((eff - 64.0 / 24.8).abs() < 1e-9);
    }

    #[test]
    fn effective_k_drops_with_correlation() {
        let tally = window(8, 0, 43_000.0);
        let low = effective_k(&tally.majority, &HashMap::new(), 0.1);
        let high = effective_k(&tally.majority, &HashMap::new(), 0.9);
        assert!(low > high);
        // Perfect correlation collapses to a single effective vote.
        let perfect = effective_k(&tally.majority, &HashMap::new(), 1.0);
        assert!((perfect - 1.0).abs() < 1e-9);
    }

    #[test]
    fn measured_correlations_override_default() {
        let tally = window(2, 0, 43_000.0);
        let mut corr = HashMap::new();
        corr.insert(pair_key("0xl0", "0xl1"), 0.0);
        let independent = effective_k(&tally.majority, &corr, 0.9);
        assert!((independent - 2.0).abs() < 1e-9);
    }

    #[test]
    fn freshness_measures_oldest_majority_vote() {
        let mut w = VoteWindow::new();
        w.push(Vote {
            address: "0xa".into(),
            direction: Direction::Long,
            entry_price: 100.0,
            weight: 1.0,
            ts: t(0),
        });
        w.push(Vote {
            address: "0xb".into(),
            direction: Direction::Long,
            entry_price: 100.0,
            weight: 1.0,
            ts: t(250),
        });
        let tally = w.tally();
        let gate = g3_freshness(&tally, t(290), 300);
        assert!(gate.passed);
        assert!((gate.value - 290.0).abs() < 1e-9);

        let gate = g3_freshness(&tally, t(301), 300);
        assert!(!gate.passed);
    }

    #[test]
    fn scenario_price_band() {
        // Median entry 43_150, stop distance 170.
        let mut w = VoteWindow::new();
        for i in 0..8 {
            w.push(Vote {
                address: format!("0x{i}"),
                direction: Direction::Long,
                entry_price: 43_150.0,
                weight: 1.0,
                ts: t(0),
            });
        }
        let tally = w.tally();

        // Current 43_200 → drift 50/170 ≈ 0.29 → fails 0.25.
        let gate = g4_price_band(&tally, 43_200.0, 170.0, 0.25);
        assert!(!gate.passed);
        assert!((gate.value - 50.0 / 170.0).abs() < 1e-9);

        // Current 43_160 → drift ≈ 0.06 → passes.
        let gate = g4_price_band(&tally, 43_160.0, 170.0, 0.25);
        assert!(gate.passed);
        assert!((gate.value - 10.0 / 170.0).abs() < 1e-9);
    }
}
