//! 💰 G5: per-venue expected value.
//!
//! `p_win` is derived from the majority weight and agreement strength, then
//! the net EV per venue subtracts that venue's fees, orderbook-walked
//! slippage at the actual Kelly-sized notional, and direction-aware
//! funding. The venue with the highest net EV becomes `target_exchange`;
//! ties prefer the configured default venue.
//!
//! Funding sign convention: a long position pays `rate × hold_intervals`
//! when the rate is positive and receives it when negative; shorts mirror.

use common::assets::Direction;
use serde::Serialize;

use super::gates::GateValue;
use crate::execution::adapter::Venue;

/// `p_win = 0.5 + 0.3 · strength · min(effK/4, 1)`, clamped to [0.5, 0.85],
/// where `strength = (majority_pct − 0.5) / 0.5` scales agreement to [0, 1]
/// so a unanimous pool reaches full strength.
pub fn p_win(majority_pct: f64, eff_k: f64) -> f64 {
    let strength = ((majority_pct - 0.5) / 0.5).clamp(0.0, 1.0);
    let k_factor = (eff_k / 4.0).min(1.0).max(0.0);
    (0.5 + 0.3 * strength * k_factor).clamp(0.5, 0.85)
}

/// Per-venue cost inputs, all in basis points of notional.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct VenueCosts {
    pub venue: Venue,
    /// Round-trip taker fees.
    pub fees_bps: f64,
    /// Orderbook-walked slippage at the sized notional.
    pub slippage_bps: f64,
    /// Funding rate per interval (signed: positive = longs pay).
    pub funding_rate_bps: f64,
    /// Expected hold time in funding intervals.
    pub hold_intervals: f64,
}

/// Funding cost in bps for the given direction (negative = rebate).
pub fn funding_cost_bps(direction: Direction, funding_rate_bps: f64, hold_intervals: f64) -> f64 {
    let per_interval = match direction {
        Direction::Long => funding_rate_bps,
        Direction::Short => -funding_rate_bps,
    };
    per_interval * hold_intervals
}

/// Net expected value in R units for one venue.
pub fn ev_net_r(p: f64, direction: Direction, costs: &VenueCosts) -> f64 {
    let gross = p - (1.0 - p);
    let funding = funding_cost_bps(direction, costs.funding_rate_bps, costs.hold_intervals);
    let cost_r = (costs.fees_bps + costs.slippage_bps + funding) / 10_000.0;
    gross - cost_r
}

#[derive(Debug, Clone, Serialize)]
pub struct VenueEv {
    pub venue: Venue,
    pub ev_net_r: f64,
    pub fees_bps: f64,
    pub slippage_bps: f64,
    pub funding_bps: f64,
}

/// Evaluate every venue, pick the best, and produce the G5 gate value.
///
/// Equal EVs prefer `default_venue`.
pub fn g5_expected_value(
    p: f64,
    direction: Direction,
    venue_costs: &[VenueCosts],
    default_venue: Venue,
    min_ev_r: f64,
) -> (GateValue, Option<VenueEv>) {
    let mut best: Option<VenueEv> = None;
    for costs in venue_costs {
        let ev = ev_net_r(p, direction, costs);
        let candidate = VenueEv {
            venue: costs.venue,
            ev_net_r: ev,
            fees_bps: costs.fees_bps,
            slippage_bps: costs.slippage_bps,
            funding_bps: funding_cost_bps(direction, costs.funding_rate_bps, costs.hold_intervals),
        };
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let better = candidate.ev_net_r > current.ev_net_r
                    || (candidate.ev_net_r == current.ev_net_r
                        && candidate.venue == default_venue
                        && current.venue != default_venue);
                if better {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }

    let (value, detail, passed, winner) = match best {
        Some(winner) if winner.ev_net_r >= min_ev_r => (
            winner.ev_net_r,
            format!(
                "best venue {} at {:+.2}R net of {:.1}bps fees, {:.1}bps slippage, {:+.1}bps funding",
                winner.venue.as_str(),
                winner.ev_net_r,
                winner.fees_bps,
                winner.slippage_bps,
                winner.funding_bps
            ),
            true,
            Some(winner),
        ),
        Some(winner) => (
            winner.ev_net_r,
            format!(
                "best venue {} at {:+.2}R below the {:.2}R floor",
                winner.venue.as_str(),
                winner.ev_net_r,
                min_ev_r
            ),
            false,
            None,
        ),
        None => (f64::NEG_INFINITY, "no venues configured".to_string(), false, None),
    };

    (
        GateValue {
            gate: "G5_expected_value",
            value,
            threshold: min_ev_r,
            passed,
            detail,
        },
        winner,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn costs(venue: Venue, fees: f64, slip: f64, funding: f64) -> VenueCosts {
        VenueCosts {
            venue,
            fees_bps: fees,
            slippage_bps: slip,
            funding_rate_bps: funding,
            hold_intervals: 1.0,
        }
    }

    #[test]
    fn p_win_clamps_and_scales() {
        // No agreement beyond 50% → floor.
        assert_eq!(p_win(0.5, 4.0), 0.5);
        // Unanimous with high effK → 0.8, inside the clamp.
        assert!((p_win(1.0, 8.0) - 0.8).abs() < 1e-12);
        // Scenario 4: 80% majority, effK 3.2 → ≈ 0.64.
        let p = p_win(0.8, 3.2);
        assert!((p - 0.644).abs() < 1e-9);
        // Never exceeds 0.85 or dips below 0.5.
        assert!(p_win(2.0, 100.0) <= 0.85);
        assert!(p_win(0.1, 0.0) >= 0.5);
    }

    #[test]
    fn scenario_ev_fires_above_floor() {
        // Scenario 4: p ≈ 0.644, fees 5bps, slippage 2bps, funding 1bps.
        let p = p_win(0.8, 3.2);
        let ev = ev_net_r(
            p,
            Direction::Long,
            &costs(Venue::Hyperliquid, 5.0, 2.0, 1.0),
        );
        assert!(ev >= 0.20, "ev {ev} should clear the floor");
        assert!(ev < 0.35);
    }

    #[test]
    fn funding_sign_convention_both_ways() {
        // Positive rate: long pays, short receives.
        assert_eq!(funding_cost_bps(Direction::Long, 2.0, 3.0), 6.0);
        assert_eq!(funding_cost_bps(Direction::Short, 2.0, 3.0), -6.0);
        // Negative rate: long receives, short pays.
        assert_eq!(funding_cost_bps(Direction::Long, -2.0, 3.0), -6.0);
        assert_eq!(funding_cost_bps(Direction::Short, -2.0, 3.0), 6.0);

        // A funding rebate improves EV.
        let pay = ev_net_r(0.65, Direction::Long, &costs(Venue::Hyperliquid, 5.0, 2.0, 2.0));
        let rebate = ev_net_r(0.65, Direction::Long, &costs(Venue::Hyperliquid, 5.0, 2.0, -2.0));
        assert!(rebate > pay);
    }

    #[test]
    fn best_venue_wins_and_ties_prefer_default() {
        let venues = vec![
            costs(Venue::Hyperliquid, 5.0, 2.0, 1.0),
            costs(Venue::Bybit, 4.0, 1.0, 1.0), // cheaper
        ];
        let (gate, winner) =
            g5_expected_value(0.65, Direction::Long, &venues, Venue::Hyperliquid, 0.20);
        assert!(gate.passed);
        assert_eq!(winner.unwrap().venue, Venue::Bybit);

        // Identical costs → default venue wins the tie.
        let venues = vec![
            costs(Venue::Bybit, 5.0, 2.0, 1.0),
            costs(Venue::Hyperliquid, 5.0, 2.0, 1.0),
        ];
        let (_, winner) =
            g5_expected_value(0.65, Direction::Long, &venues, Venue::Hyperliquid, 0.20);
        assert_eq!(winner.unwrap().venue, Venue::Hyperliquid);
    }

    #[test]
    fn all_venues_below_floor_fails_gate() {
        let venues = vec![costs(Venue::Hyperliquid, 5.0, 2.0, 1.0)];
        // p barely above coin-flip → gross EV ~0.
        let (gate, winner) = g5_expected_value(0.52, Direction::Long, &venues, Venue::Hyperliquid, 0.20);
        assert!(!gate.passed);
        assert!(winner.is_none());
        assert!(gate.detail.contains("below"));
    }
}
