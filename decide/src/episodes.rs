//! 📈 Position-episode reconstruction.
//!
//! Fills stream in per address; this module folds them into open→close
//! episodes with VWAP entries and exits, attributes realized PnL, and
//! converts each close into an R-multiple against the ATR-derived stop
//! fraction at close time.
//!
//! Direction-flip convention: the flipping fill is split. Its closing
//! portion (up to the prior running size) joins the closed episode's exit
//! side at the fill price — along with the fill's reported realized PnL —
//! and only the residual seeds the new opposite episode.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::assets::{Asset, Direction};
use common::bus::FillEvent;
use common::db::Db;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SIZE_EPSILON: f64 = 1e-9;
pub const EPISODE_TIMEOUT_DAYS: i64 = 7;

/// An open episode under construction.
#[derive(Debug, Clone, Serialize)]
pub struct OpenEpisode {
    pub id: Uuid,
    pub address: String,
    pub asset: Asset,
    pub direction: Direction,
    pub entry_vwap: f64,
    /// Total size accumulated on the entry side.
    pub entry_size: f64,
    /// Current unsigned position size.
    pub running_size: f64,
    pub entry_ts: DateTime<Utc>,
    pub last_fill_ts: DateTime<Utc>,
    /// (size, price) pairs on the exit side.
    exit_fills: Vec<(f64, f64)>,
    realized_pnl: f64,
}

/// A finished episode ready for persistence and outcome emission.
#[derive(Debug, Clone, Serialize)]
pub struct ClosedEpisode {
    pub id: Uuid,
    pub address: String,
    pub asset: Asset,
    pub direction: Direction,
    pub entry_vwap: f64,
    pub entry_size: f64,
    pub entry_ts: DateTime<Utc>,
    pub exit_vwap: f64,
    pub exit_ts: DateTime<Utc>,
    pub realized_pnl: f64,
    pub result_r: f64,
    pub closed_reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    FullClose,
    DirectionFlip,
    Timeout,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::FullClose => "full_close",
            CloseReason::DirectionFlip => "direction_flip",
            CloseReason::Timeout => "timeout",
        }
    }
}

/// What a fill did to the episode state.
#[derive(Debug)]
pub enum EpisodeEvent {
    /// A brand-new episode opened by a true opening fill (start position
    /// was flat). Consensus votes derive from exactly these.
    Opened(OpenEpisode),
    /// Entry extended or position partially reduced; no external effect.
    Updated,
    /// Episode closed (and possibly a new one opened, on a flip).
    Closed {
        closed: ClosedEpisode,
        flipped_open: Option<OpenEpisode>,
    },
    /// Fill ignored (zero size, or a close for an episode never seen).
    Ignored,
}

impl OpenEpisode {
    fn exit_vwap(&self) -> f64 {
        let total: f64 = self.exit_fills.iter().map(|(s, _)| s).sum();
        if total <= SIZE_EPSILON {
            return 0.0;
        }
        self.exit_fills.iter().map(|(s, p)| s * p).sum::<f64>() / total
    }

    fn close(self, exit_ts: DateTime<Utc>, reason: CloseReason, stop_fraction: f64) -> ClosedEpisode {
        let exit_vwap = self.exit_vwap();
        let result_r = r_multiple(self.realized_pnl, self.entry_vwap, self.entry_size, stop_fraction);
        ClosedEpisode {
            id: self.id,
            address: self.address,
            asset: self.asset,
            direction: self.direction,
            entry_vwap: self.entry_vwap,
            entry_size: self.entry_size,
            entry_ts: self.entry_ts,
            exit_vwap,
            exit_ts,
            realized_pnl: self.realized_pnl,
            result_r,
            closed_reason: reason,
        }
    }
}

/// `result_r = realized_pnl / (entry_vwap · entry_size · stop_fraction)`.
pub fn r_multiple(realized_pnl: f64, entry_vwap: f64, entry_size: f64, stop_fraction: f64) -> f64 {
    let stop_fraction = Asset::clamp_stop_fraction(stop_fraction);
    let risk = entry_vwap * entry_size * stop_fraction;
    if risk <= SIZE_EPSILON {
        return 0.0;
    }
    realized_pnl / risk
}

/// Pure per-(address, asset) fold of fills into episodes.
///
/// `stop_fraction` is sampled at close time by the caller (it depends on
/// live ATR), so it is passed per call.
pub struct EpisodeBook {
    open: HashMap<(String, Asset), OpenEpisode>,
}

impl EpisodeBook {
    pub fn new() -> Self {
        Self {
            open: HashMap::new(),
        }
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn get_open(&self, address: &str, asset: Asset) -> Option<&OpenEpisode> {
        self.open.get(&(address.to_string(), asset))
    }

    /// Restore an open episode loaded from the DB at startup.
    pub fn restore(&mut self, episode: OpenEpisode) {
        self.open
            .insert((episode.address.clone(), episode.asset), episode);
    }

    /// Apply one fill. `stop_fraction` is the current ATR-derived fraction
    /// used if this fill closes the episode.
    pub fn apply_fill(&mut self, fill: &FillEvent, stop_fraction: f64) -> EpisodeEvent {
        let signed = fill.signed_size();
        if signed.abs() <= SIZE_EPSILON {
            return EpisodeEvent::Ignored;
        }
        let key = (fill.address.clone(), fill.asset);
        let resulting = fill.resulting_position();

        let Some(mut ep) = self.open.remove(&key) else {
            // No open episode for this pair.
            if resulting.abs() <= SIZE_EPSILON {
                // Close of a position we never observed opening.
                return EpisodeEvent::Ignored;
            }
            let direction = Direction::from_signed_size(resulting);
            let ep = OpenEpisode {
                id: Uuid::new_v4(),
                address: fill.address.clone(),
                asset: fill.asset,
                direction,
                entry_vwap: fill.price,
                entry_size: resulting.abs(),
                running_size: resulting.abs(),
                entry_ts: fill.ts,
                last_fill_ts: fill.ts,
                exit_fills: Vec::new(),
                realized_pnl: 0.0,
            };
            let true_open = fill.start_position.abs() <= SIZE_EPSILON;
            self.open.insert(key, ep.clone());
            return if true_open {
                EpisodeEvent::Opened(ep)
            } else {
                // Adopted mid-flight (first sighting of an already-open
                // position); not a consensus vote.
                EpisodeEvent::Updated
            };
        };

        ep.last_fill_ts = fill.ts;
        let adds = signed * ep.direction.sign() > 0.0;

        if adds {
            // Entry VWAP is the size-weighted average across adds.
            let add_size = signed.abs();
            ep.entry_vwap = (ep.entry_vwap * ep.entry_size + fill.price * add_size)
                / (ep.entry_size + add_size);
            ep.entry_size += add_size;
            ep.running_size += add_size;
            self.open.insert(key, ep);
            return EpisodeEvent::Updated;
        }

        let reduce = signed.abs();
        if reduce < ep.running_size - SIZE_EPSILON {
            // Partial reduction.
            ep.running_size -= reduce;
            ep.exit_fills.push((reduce, fill.price));
            ep.realized_pnl += fill.realized_pnl.unwrap_or(0.0);
            self.open.insert(key, ep);
            return EpisodeEvent::Updated;
        }

        // Either zeroes out or crosses zero.
        let closing_size = ep.running_size;
        ep.exit_fills.push((closing_size, fill.price));
        ep.realized_pnl += fill.realized_pnl.unwrap_or(0.0);

        let residual = reduce - closing_size;
        if residual <= SIZE_EPSILON {
            let closed = ep.close(fill.ts, CloseReason::FullClose, stop_fraction);
            return EpisodeEvent::Closed {
                closed,
                flipped_open: None,
            };
        }

        // Direction flip: the residual opens the opposite episode at the
        // fill price.
        let closed = ep.close(fill.ts, CloseReason::DirectionFlip, stop_fraction);
        let flipped = OpenEpisode {
            id: Uuid::new_v4(),
            address: fill.address.clone(),
            asset: fill.asset,
            direction: closed.direction.opposite(),
            entry_vwap: fill.price,
            entry_size: residual,
            running_size: residual,
            entry_ts: fill.ts,
            last_fill_ts: fill.ts,
            exit_fills: Vec::new(),
            realized_pnl: 0.0,
        };
        self.open.insert(key, flipped.clone());
        EpisodeEvent::Closed {
            closed,
            flipped_open: Some(flipped),
        }
    }

    /// Force-close every episode idle past the timeout. Returns the closes.
    pub fn sweep_timeouts(&mut self, now: DateTime<Utc>) -> Vec<ClosedEpisode> {
        let cutoff = now - ChronoDuration::days(EPISODE_TIMEOUT_DAYS);
        let stale: Vec<(String, Asset)> = self
            .open
            .iter()
            .filter(|(_, ep)| ep.last_fill_ts < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.open.remove(&key))
            .map(|mut ep| {
                // Timeout closes carry no realized PnL.
                ep.realized_pnl = 0.0;
                ep.exit_fills.clear();
                ep.close(now, CloseReason::Timeout, 0.01)
            })
            .collect()
    }
}

impl Default for EpisodeBook {
    fn default() -> Self {
        Self::new()
    }
}

// ── Persistence ──────────────────────────────────────────────────────────────

pub struct EpisodeStore {
    db: Arc<Db>,
}

impl EpisodeStore {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub async fn insert_open(&self, ep: &OpenEpisode) -> Result<()> {
        let client = self.db.lock().await;
        client
            .execute(
                "INSERT INTO episodes
                   (id, address, asset, direction, entry_vwap, entry_size,
                    entry_ts, status, last_fill_ts)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'open', $8)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &ep.id,
                    &ep.address,
                    &ep.asset.as_str(),
                    &ep.direction.as_str(),
                    &ep.entry_vwap,
                    &ep.entry_size,
                    &ep.entry_ts,
                    &ep.last_fill_ts,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn update_open(&self, ep: &OpenEpisode) -> Result<()> {
        let client = self.db.lock().await;
        client
            .execute(
                "UPDATE episodes SET entry_vwap = $2, entry_size = $3, last_fill_ts = $4
                 WHERE id = $1",
                &[&ep.id, &ep.entry_vwap, &ep.entry_size, &ep.last_fill_ts],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_closed(&self, ep: &ClosedEpisode) -> Result<()> {
        let client = self.db.lock().await;
        client
            .execute(
                "UPDATE episodes SET
                   exit_vwap = $2, exit_ts = $3, realized_pnl = $4,
                   result_r = $5, status = 'closed', closed_reason = $6
                 WHERE id = $1",
                &[
                    &ep.id,
                    &ep.exit_vwap,
                    &ep.exit_ts,
                    &ep.realized_pnl,
                    &ep.result_r,
                    &ep.closed_reason.as_str(),
                ],
            )
            .await?;
        debug!(id = %ep.id, r = ep.result_r, "episode closed in store");
        Ok(())
    }

    /// Reload open episodes after a restart.
    pub async fn load_open(&self) -> Result<Vec<OpenEpisode>> {
        let client = self.db.lock().await;
        let rows = client
            .query(
                "SELECT id, address, asset, direction, entry_vwap, entry_size,
                        entry_ts, last_fill_ts
                 FROM episodes WHERE status = 'open'",
                &[],
            )
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let asset: String = r.get(2);
            let direction: String = r.get(3);
            let (Ok(asset), Ok(direction)) = (asset.parse::<Asset>(), direction.parse::<Direction>())
            else {
                warn!("skipping open episode with bad asset/direction");
                continue;
            };
            let entry_size: f64 = r.get(5);
            out.push(OpenEpisode {
                id: r.get(0),
                address: r.get(1),
                asset,
                direction,
                entry_vwap: r.get(4),
                entry_size,
                running_size: entry_size,
                entry_ts: r.get(6),
                last_fill_ts: r.get(7),
                exit_fills: Vec::new(),
                realized_pnl: 0.0,
            });
        }
        info!("📈 restored {} open episodes", out.len());
        Ok(out)
    }

    /// Number of closed episodes for an address (Kelly fallback input).
    pub async fn closed_count(&self, address: &str) -> Result<i64> {
        let client = self.db.lock().await;
        Ok(client
            .query_one(
                "SELECT COUNT(*) FROM episodes WHERE address = $1 AND status = 'closed'",
                &[&address],
            )
            .await?
            .get(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fill(address: &str, side: &str, size: f64, price: f64, start: f64, pnl: Option<f64>, t: i64) -> FillEvent {
        FillEvent {
            fill_id: format!("f{t}"),
            address: address.to_string(),
            asset: Asset::Btc,
            side: side.to_string(),
            size,
            price,
            start_position: start,
            realized_pnl: pnl,
            ts: Utc.timestamp_opt(1_700_000_000 + t, 0).unwrap(),
            action_label: String::new(),
            dedup_hash: format!("h{t}"),
        }
    }

    #[test]
    fn open_add_reduce_close_accounting() {
        let mut book = EpisodeBook::new();

        // Open 1 BTC @ 50k.
        let ev = book.apply_fill(&fill("0xa", "buy", 1.0, 50_000.0, 0.0, None, 0), 0.01);
        let opened = match ev {
            EpisodeEvent::Opened(ep) => ep,
            other => panic!("expected Opened, got {other:?}"),
        };
        assert_eq!(opened.direction, Direction::Long);
        assert_eq!(opened.entry_vwap, 50_000.0);

        // Add 1 BTC @ 52k → VWAP 51k.
        book.apply_fill(&fill("0xa", "buy", 1.0, 52_000.0, 1.0, None, 1), 0.01);
        let ep = book.get_open("0xa", Asset::Btc).unwrap();
        assert!((ep.entry_vwap - 51_000.0).abs() < 1e-9);
        assert_eq!(ep.entry_size, 2.0);

        // Reduce 0.5 @ 53k.
        book.apply_fill(&fill("0xa", "sell", 0.5, 53_000.0, 2.0, Some(1_000.0), 2), 0.01);
        let ep = book.get_open("0xa", Asset::Btc).unwrap();
        assert!((ep.running_size - 1.5).abs() < 1e-9);

        // Full close 1.5 @ 54k.
        let ev = book.apply_fill(&fill("0xa", "sell", 1.5, 54_000.0, 1.5, Some(4_500.0), 3), 0.01);
        let EpisodeEvent::Closed { closed, flipped_open } = ev else {
            panic!("expected close");
        };
        assert!(flipped_open.is_none());
        assert_eq!(closed.closed_reason, CloseReason::FullClose);
        // I1: entry size equals total closing size.
        assert!((closed.entry_size - 2.0).abs() < 1e-9);
        assert!((closed.realized_pnl - 5_500.0).abs() < 1e-9);
        // Exit VWAP over (0.5 @ 53k, 1.5 @ 54k) = 53_750.
        assert!((closed.exit_vwap - 53_750.0).abs() < 1e-9);
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn scenario_r_multiple() {
        // Entry 1 BTC @ 50k, stop fraction 0.01 → risk $500; pnl +$750 → 1.5R.
        assert!((r_multiple(750.0, 50_000.0, 1.0, 0.01) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn stop_fraction_is_clamped_in_r() {
        // Fraction above the band clamps to 0.10.
        let r = r_multiple(1_000.0, 50_000.0, 1.0, 0.5);
        assert!((r - 1_000.0 / (50_000.0 * 0.10)).abs() < 1e-9);
    }

    #[test]
    fn direction_flip_splits_the_fill() {
        let mut book = EpisodeBook::new();
        book.apply_fill(&fill("0xa", "buy", 1.0, 50_000.0, 0.0, None, 0), 0.01);

        // Sell 2.5 from +1 → -1.5: closes 1 at 51k, opens 1.5 short.
        let ev = book.apply_fill(&fill("0xa", "sell", 2.5, 51_000.0, 1.0, Some(1_000.0), 1), 0.01);
        let EpisodeEvent::Closed { closed, flipped_open } = ev else {
            panic!("expected close");
        };
        assert_eq!(closed.closed_reason, CloseReason::DirectionFlip);
        // The closing portion (1.0) exits at the flip price; PnL attributed
        // to the closed episode.
        assert!((closed.exit_vwap - 51_000.0).abs() < 1e-9);
        assert!((closed.realized_pnl - 1_000.0).abs() < 1e-9);

        let flipped = flipped_open.unwrap();
        assert_eq!(flipped.direction, Direction::Short);
        assert!((flipped.entry_size - 1.5).abs() < 1e-9);
        assert_eq!(flipped.entry_vwap, 51_000.0);
        assert!((flipped.realized_pnl).abs() < 1e-9);
    }

    #[test]
    fn adoption_mid_flight_is_not_a_vote() {
        let mut book = EpisodeBook::new();
        // First sighting reduces an unseen position but leaves it open.
        let ev = book.apply_fill(&fill("0xa", "sell", 0.5, 50_000.0, 2.0, None, 0), 0.01);
        assert!(matches!(ev, EpisodeEvent::Updated));
        let ep = book.get_open("0xa", Asset::Btc).unwrap();
        assert_eq!(ep.direction, Direction::Long);
        assert!((ep.running_size - 1.5).abs() < 1e-9);

        // Close of a fully unseen position is ignored.
        let mut book = EpisodeBook::new();
        let ev = book.apply_fill(&fill("0xb", "sell", 1.0, 50_000.0, 1.0, Some(10.0), 0), 0.01);
        assert!(matches!(ev, EpisodeEvent::Ignored));
    }

    #[test]
    fn running_position_invariant_holds() {
        // I1: running = entry − Σ decrements after each fill.
        let mut book = EpisodeBook::new();
        book.apply_fill(&fill("0xa", "sell", 2.0, 3_000.0, 0.0, None, 0), 0.01);
        let ep = book.get_open("0xa", Asset::Btc).unwrap();
        assert_eq!(ep.direction, Direction::Short);
        assert_eq!(ep.running_size, 2.0);

        book.apply_fill(&fill("0xa", "buy", 0.75, 2_900.0, -2.0, Some(75.0), 1), 0.01);
        let ep = book.get_open("0xa", Asset::Btc).unwrap();
        assert!((ep.running_size - 1.25).abs() < 1e-9);
        assert!((ep.entry_size - 2.0).abs() < 1e-9);
    }

    #[test]
    fn timeout_sweep_closes_stale_episodes_with_zero_r() {
        let mut book = EpisodeBook::new();
        book.apply_fill(&fill("0xa", "buy", 1.0, 50_000.0, 0.0, None, 0), 0.01);
        book.apply_fill(&fill("0xb", "buy", 1.0, 50_000.0, 0.0, None, 0), 0.01);

        // Eight days later only for the sweep clock.
        let now = Utc.timestamp_opt(1_700_000_000 + 8 * 86_400, 0).unwrap();
        let closed = book.sweep_timeouts(now);
        assert_eq!(closed.len(), 2);
        for c in &closed {
            assert_eq!(c.closed_reason, CloseReason::Timeout);
            assert_eq!(c.realized_pnl, 0.0);
            assert_eq!(c.result_r, 0.0);
        }
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn fresh_episode_survives_sweep() {
        let mut book = EpisodeBook::new();
        book.apply_fill(&fill("0xa", "buy", 1.0, 50_000.0, 0.0, None, 0), 0.01);
        let now = Utc.timestamp_opt(1_700_000_000 + 3_600, 0).unwrap();
        assert!(book.sweep_timeouts(now).is_empty());
        assert_eq!(book.open_count(), 1);
    }
}
