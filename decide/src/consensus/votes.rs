//! 🗳️ Vote windows and weights.
//!
//! A vote is the opening fill of a new episode by a pool trader. One vote
//! per trader per asset: a newer opening replaces the older one. Votes
//! expire out of the sliding window after the retention period (twice the
//! freshness window, so the freshness gate sees stale clusters before they
//! silently vanish).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::assets::{Asset, Direction};
use std::collections::HashMap;

use crate::config::{VoteWeightMode, WeightConfig};

#[derive(Debug, Clone)]
pub struct Vote {
    pub address: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub weight: f64,
    pub ts: DateTime<Utc>,
}

/// Vote weight for a trader given posterior κ and selection weight.
pub fn vote_weight(kappa: f64, selection_weight: f64, config: &WeightConfig) -> f64 {
    let raw = match config.mode {
        VoteWeightMode::Log => kappa / (kappa + config.log_base),
        VoteWeightMode::Linear => kappa / config.log_base.max(1.0),
        VoteWeightMode::Equity => selection_weight,
    };
    raw.clamp(0.0, config.max_weight)
}

/// Sliding vote window for one asset.
#[derive(Debug, Default)]
pub struct VoteWindow {
    votes: HashMap<String, Vote>,
}

/// Snapshot of the window split by side, used by gate evaluation.
#[derive(Debug, Clone)]
pub struct VoteTally {
    pub majority: Vec<Vote>,
    pub minority: Vec<Vote>,
    pub direction: Option<Direction>,
    pub total_weight: f64,
    pub majority_weight: f64,
}

impl VoteWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace this trader's vote.
    pub fn push(&mut self, vote: Vote) {
        self.votes.insert(vote.address.clone(), vote);
    }

    /// Drop votes older than the retention horizon.
    pub fn prune(&mut self, now: DateTime<Utc>, retention_secs: u64) {
        let cutoff = now - ChronoDuration::seconds(retention_secs as i64);
        self.votes.retain(|_, v| v.ts >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Split into majority/minority by weighted side. Equal weights on both
    /// sides → no majority direction (no signal).
    pub fn tally(&self) -> VoteTally {
        let mut long_w = 0.0;
        let mut short_w = 0.0;
        for v in self.votes.values() {
            match v.direction {
                Direction::Long => long_w += v.weight,
                Direction::Short => short_w += v.weight,
            }
        }

        let total_weight = long_w + short_w;
        let direction = if (long_w - short_w).abs() < f64::EPSILON {
            None
        } else if long_w > short_w {
            Some(Direction::Long)
        } else {
            Some(Direction::Short)
        };

        let (majority, minority): (Vec<Vote>, Vec<Vote>) = match direction {
            Some(d) => self
                .votes
                .values()
                .cloned()
                .partition(|v| v.direction == d),
            None => (Vec::new(), self.votes.values().cloned().collect()),
        };

        let majority_weight = majority.iter().map(|v| v.weight).sum();
        VoteTally {
            majority,
            minority,
            direction,
            total_weight,
            majority_weight,
        }
    }
}

/// Median of the majority entry prices; ties between the two middle
/// elements resolve to their arithmetic mean.
pub fn median_entry_price(votes: &[Vote]) -> Option<f64> {
    if votes.is_empty() {
        return None;
    }
    let mut prices: Vec<f64> = votes.iter().map(|v| v.entry_price).collect();
    prices.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = prices.len();
    Some(if n % 2 == 1 {
        prices[n / 2]
    } else {
        (prices[n / 2 - 1] + prices[n / 2]) / 2.0
    })
}

/// Per-asset windows keyed for the engine.
pub type AssetWindows = HashMap<Asset, VoteWindow>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn vote(addr: &str, dir: Direction, price: f64, weight: f64, secs: i64) -> Vote {
        Vote {
            address: addr.to_string(),
            direction: dir,
            entry_price: price,
            weight,
            ts: t(secs),
        }
    }

    fn log_config() -> WeightConfig {
        WeightConfig {
            mode: VoteWeightMode::Log,
            log_base: 10.0,
            max_weight: 1.0,
        }
    }

    #[test]
    fn log_weight_saturates_with_kappa() {
        let cfg = log_config();
        let w_new = vote_weight(1.0, 0.0, &cfg);
        let w_mid = vote_weight(10.0, 0.0, &cfg);
        let w_vet = vote_weight(100.0, 0.0, &cfg);
        assert!((w_new - 1.0 / 11.0).abs() < 1e-12);
        assert!((w_mid - 0.5).abs() < 1e-12);
        assert!(w_vet > w_mid && w_vet < 1.0);
    }

    #[test]
    fn weight_is_capped() {
        let cfg = WeightConfig {
            mode: VoteWeightMode::Linear,
            log_base: 10.0,
            max_weight: 1.0,
        };
        assert_eq!(vote_weight(1_000.0, 0.0, &cfg), 1.0);
    }

    #[test]
    fn newer_vote_replaces_older_from_same_trader() {
        let mut w = VoteWindow::new();
        w.push(vote("0xa", Direction::Long, 100.0, 1.0, 0));
        w.push(vote("0xa", Direction::Short, 101.0, 1.0, 10));
        assert_eq!(w.len(), 1);
        let tally = w.tally();
        assert_eq!(tally.direction, Some(Direction::Short));
    }

    #[test]
    fn prune_expires_old_votes() {
        let mut w = VoteWindow::new();
        w.push(vote("0xa", Direction::Long, 100.0, 1.0, 0));
        w.push(vote("0xb", Direction::Long, 100.0, 1.0, 500));
        w.prune(t(700), 600);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn tally_splits_by_weight() {
        let mut w = VoteWindow::new();
        for i in 0..8 {
            w.push(vote(&format!("0xl{i}"), Direction::Long, 100.0, 1.0, 0));
        }
        for i in 0..2 {
            w.push(vote(&format!("0xs{i}"), Direction::Short, 100.0, 1.0, 0));
        }
        let tally = w.tally();
        assert_eq!(tally.direction, Some(Direction::Long));
        assert_eq!(tally.majority.len(), 8);
        assert_eq!(tally.minority.len(), 2);
        assert!((tally.majority_weight / tally.total_weight - 0.8).abs() < 1e-12);
    }

    #[test]
    fn equal_sides_have_no_majority() {
        let mut w = VoteWindow::new();
        w.push(vote("0xa", Direction::Long, 100.0, 1.0, 0));
        w.push(vote("0xb", Direction::Short, 100.0, 1.0, 0));
        assert_eq!(w.tally().direction, None);
    }

    #[test]
    fn median_uses_mean_on_even_count() {
        let votes = vec![
            vote("0xa", Direction::Long, 100.0, 1.0, 0),
            vote("0xb", Direction::Long, 104.0, 1.0, 0),
        ];
        assert_eq!(median_entry_price(&votes), Some(102.0));

        let odd = vec![
            vote("0xa", Direction::Long, 100.0, 1.0, 0),
            vote("0xb", Direction::Long, 104.0, 1.0, 0),
            vote("0xc", Direction::Long, 120.0, 1.0, 0),
        ];
        assert_eq!(median_entry_price(&odd), Some(104.0));
        assert_eq!(median_entry_price(&[]), None);
    }
}
