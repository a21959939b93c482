//! 🏆 Alpha-pool selection and refresh.
//!
//! The candidate set is the current pool plus newly-seen addresses with
//! enough closed episodes. Every candidate gets one seeded Thompson draw;
//! ranking the draws fills the pool (≤ POOL_SIZE) and marks the top
//! SELECT_K as selected. Membership is replaced atomically — never mutated
//! in place — and one score event per member goes out on the bus.
//!
//! Pool refresh additionally pulls Scout's latest candidates into the
//! universe. New members reach Stream's watchlist through the alpha_pool
//! table, which is what triggers their historical fill backfill (and so,
//! eventually, episodes and posteriors).

use anyhow::Result;
use chrono::Utc;
use common::bus::{subjects, Bus, ScoreEvent};
use common::db::Db;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::config::PoolConfig;
use crate::metrics;
use crate::posterior::{self, TraderPosterior};
use crate::thompson::{draw_seed, thompson_draw};

#[derive(Debug, Clone)]
pub struct RankedTrader {
    pub address: String,
    pub draw: f64,
    pub seed: u64,
    pub kappa: f64,
    /// 1-based rank over the whole candidate set.
    pub rank: usize,
    pub selected: bool,
    /// Selection weight, normalized over the selected subset.
    pub weight: f64,
}

/// Rank drawn candidates, keep the pool, mark the selected subset, and
/// assign normalized weights. Pure so the ranking rules are testable.
pub fn rank_candidates(
    mut drawn: Vec<(String, f64, u64, f64)>, // (address, draw, seed, kappa)
    pool_size: usize,
    select_k: usize,
) -> Vec<RankedTrader> {
    drawn.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    drawn.truncate(pool_size);

    let select_k = select_k.min(drawn.len());
    let selected_total: f64 = drawn
        .iter()
        .take(select_k)
        .map(|(_, draw, _, _)| draw.max(0.0))
        .sum();

    drawn
        .into_iter()
        .enumerate()
        .map(|(i, (address, draw, seed, kappa))| {
            let selected = i < select_k;
            let weight = if !selected {
                0.0
            } else if selected_total > 0.0 {
                draw.max(0.0) / selected_total
            } else {
                1.0 / select_k as f64
            };
            RankedTrader {
                address,
                draw,
                seed,
                kappa,
                rank: i + 1,
                selected,
                weight,
            }
        })
        .collect()
}

pub struct Selector {
    db: Arc<Db>,
    bus: Arc<Bus>,
    config: PoolConfig,
    /// Monotonic selection counter; seeds and snapshots key off it.
    version: AtomicI32,
}

impl Selector {
    pub async fn new(db: Arc<Db>, bus: Arc<Bus>, config: PoolConfig) -> Result<Self> {
        let version = {
            let client = db.lock().await;
            client
                .query_one(
                    "SELECT COALESCE(MAX(selection_version), 0) FROM trader_snapshots",
                    &[],
                )
                .await?
                .get::<_, i32>(0)
        };
        Ok(Self {
            db,
            bus,
            config,
            version: AtomicI32::new(version),
        })
    }

    pub fn current_version(&self) -> i32 {
        self.version.load(Ordering::Relaxed)
    }

    /// Is the pool empty (fresh install)?
    pub async fn pool_is_empty(&self) -> Result<bool> {
        let client = self.db.lock().await;
        let n: i64 = client
            .query_one("SELECT COUNT(*) FROM alpha_pool WHERE is_active", &[])
            .await?
            .get(0);
        Ok(n == 0)
    }

    /// Pull Scout's candidate set into the tracked universe (posterior rows
    /// with priors for anything new), then resample and re-select.
    pub async fn refresh_pool(&self, limit: Option<usize>) -> Result<Vec<RankedTrader>> {
        let candidates: Vec<String> = {
            let client = self.db.lock().await;
            client
                .query("SELECT address FROM leaderboard_entries ORDER BY rank", &[])
                .await?
                .into_iter()
                .map(|r| r.get(0))
                .collect()
        };
        for address in &candidates {
            posterior::ensure_exists(&self.db, address).await?;
        }
        info!("🏆 pool refresh: {} scout candidates in universe", candidates.len());

        self.run_selection(limit).await
    }

    /// One Thompson selection pass over the candidate set.
    pub async fn run_selection(&self, limit: Option<usize>) -> Result<Vec<RankedTrader>> {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        let today = Utc::now().date_naive();
        let pool_size = limit.unwrap_or(self.config.pool_size).min(self.config.pool_size);

        // Candidate set: current pool ∪ posteriors with enough episodes
        // ∪ fresh scout candidates (prior-only rows, vague posteriors).
        let posteriors = posterior::load_all(&self.db).await?;
        let pool_members = self.current_pool().await?;

        let candidates: Vec<&TraderPosterior> = posteriors
            .iter()
            .filter(|p| {
                pool_members.contains(&p.address)
                    || p.total_signals >= self.config.min_episodes
                    || p.total_signals == 0 // fresh candidate, explore on the prior
            })
            .collect();

        let drawn: Vec<(String, f64, u64, f64)> = candidates
            .iter()
            .map(|p| {
                let seed = draw_seed(today, &p.address, version);
                let draw = thompson_draw(&p.nig, seed);
                (p.address.clone(), draw, seed, p.nig.kappa)
            })
            .collect();

        let ranked = rank_candidates(drawn, pool_size, self.config.select_k);
        self.replace_pool(&ranked).await?;
        self.publish_scores(&ranked).await?;

        metrics::get().selections_run.inc();
        metrics::get().pool_members.set(ranked.len() as i64);
        metrics::get().tracked_traders.set(posteriors.len() as i64);
        info!(
            "🏆 selection v{version}: pool {} / selected {}",
            ranked.len(),
            ranked.iter().filter(|r| r.selected).count()
        );
        Ok(ranked)
    }

    async fn current_pool(&self) -> Result<std::collections::HashSet<String>> {
        let client = self.db.lock().await;
        Ok(client
            .query("SELECT address FROM alpha_pool WHERE is_active", &[])
            .await?
            .into_iter()
            .map(|r| r.get(0))
            .collect())
    }

    /// Replace membership in one transaction, preserving `added_at` for
    /// retained members. The selection outcome (`selected`, `rank`) is
    /// persisted so the shadow ledger reads the true SELECT_K winners.
    async fn replace_pool(&self, ranked: &[RankedTrader]) -> Result<()> {
        let mut client = self.db.lock().await;
        let tx = client.transaction().await?;

        let existing: std::collections::HashMap<String, chrono::DateTime<Utc>> = tx
            .query("SELECT address, added_at FROM alpha_pool", &[])
            .await?
            .into_iter()
            .map(|r| (r.get::<_, String>(0), r.get(1)))
            .collect();

        tx.execute("DELETE FROM alpha_pool", &[]).await?;

        let now = Utc::now();
        for member in ranked {
            let added_at = existing.get(&member.address).copied().unwrap_or(now);
            tx.execute(
                "INSERT INTO alpha_pool
                   (address, is_active, added_at, last_refreshed_at, selected, rank)
                 VALUES ($1, TRUE, $2, $3, $4, $5)",
                &[
                    &member.address,
                    &added_at,
                    &now,
                    &member.selected,
                    &(member.rank as i32),
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn publish_scores(&self, ranked: &[RankedTrader]) -> Result<()> {
        let ts = Utc::now();
        for member in ranked {
            let event = ScoreEvent {
                address: member.address.clone(),
                weight: member.weight,
                sampled_mu: member.draw,
                kappa: member.kappa,
                selected: member.selected,
                ts,
            };
            self.bus.publish_json(subjects::SCORES, &event).await?;
            metrics::get().scores_published.inc();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drawn(n: usize) -> Vec<(String, f64, u64, f64)> {
        (0..n)
            .map(|i| (format!("0x{i:02}"), i as f64 / 10.0, i as u64, 5.0))
            .collect()
    }

    #[test]
    fn ranks_descending_and_truncates_to_pool() {
        let ranked = rank_candidates(drawn(20), 10, 3);
        assert_eq!(ranked.len(), 10);
        assert_eq!(ranked[0].address, "0x19");
        assert_eq!(ranked[0].rank, 1);
        for pair in ranked.windows(2) {
            assert!(pair[0].draw >= pair[1].draw);
        }
    }

    #[test]
    fn top_k_marked_selected_with_normalized_weights() {
        let ranked = rank_candidates(drawn(20), 10, 3);
        let selected: Vec<_> = ranked.iter().filter(|r| r.selected).collect();
        assert_eq!(selected.len(), 3);
        assert!(ranked.iter().skip(3).all(|r| !r.selected && r.weight == 0.0));

        let total: f64 = selected.iter().map(|r| r.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn negative_draws_fall_back_to_uniform_weights() {
        let drawn = vec![
            ("0xa".to_string(), -0.5, 1, 2.0),
            ("0xb".to_string(), -1.0, 2, 2.0),
        ];
        let ranked = rank_candidates(drawn, 10, 2);
        assert!((ranked[0].weight - 0.5).abs() < 1e-9);
        assert!((ranked[1].weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn select_k_larger_than_pool_is_clamped() {
        let ranked = rank_candidates(drawn(2), 10, 5);
        assert_eq!(ranked.len(), 2);
        assert!(ranked.iter().all(|r| r.selected));
    }
}
