//! 🧩 The consensus state machine.
//!
//! Actor-shaped: one input channel carrying votes, timer ticks, and price
//! updates; one task owns all mutable state and processes one message at a
//! time, so gate evaluation is single-threaded per asset by construction.
//!
//! An evaluation either emerges fully gated through G1–G5, the cooldown,
//! and the risk governor — producing a decision-log row and then a signal —
//! or it is recorded as a skip/cooldown/risk-reject with reasoning. The
//! log row is always written before the signal is published.

pub mod ev;
pub mod gates;
pub mod votes;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use common::assets::{Asset, Direction};
use common::bus::{subjects, Bus, ScoreEvent, SignalEvent};
use common::db::Db;
use dashmap::DashMap;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::decision_log::{compose_reasoning, DecisionLogger, DecisionRecord, DecisionType};
use crate::execution::adapter::Venue;
use crate::execution::providers::CostProviders;
use crate::execution::Executor;
use crate::market::{MarketData, MarketError};
use crate::metrics;
use crate::regime;
use crate::risk::{RiskCheck, RiskGovernor};
use crate::sizing::{position_size, SizingInputs};
use ev::{g5_expected_value, p_win, VenueCosts};
use gates::{g1_supermajority, g2_effective_k, g3_freshness, g4_price_band, pair_key, GateValue};
use votes::{AssetWindows, Vote, VoteTally, VoteWindow};

/// Vote retention: long enough that the freshness gate sees a stale
/// cluster instead of the cluster silently evaporating.
const VOTE_RETENTION_FACTOR: u64 = 2;

/// Messages into the actor.
#[derive(Debug)]
pub enum ConsensusMsg {
    NewVote { asset: Asset, vote: Vote },
    TimerTick,
    PriceUpdate(Asset),
}

/// Latest selection scores per trader; the vote-weight and pool-membership
/// source. Fed by the score consumer.
pub type TraderDirectory = DashMap<String, ScoreEvent>;

/// Most recent emitted signal per (asset, direction), for back-annotating
/// trader-episode outcomes.
pub type SignalRegistry = DashMap<(Asset, Direction), (Uuid, DateTime<Utc>)>;

/// Measured ρ decays toward the venue default as it ages.
pub fn decayed_rho(measured: f64, age_days: f64, halflife_days: f64, default_rho: f64) -> f64 {
    if halflife_days <= 0.0 {
        return measured;
    }
    let weight = 0.5_f64.powf(age_days.max(0.0) / halflife_days);
    weight * measured + (1.0 - weight) * default_rho
}

/// Pairwise correlations loaded from the store, pre-decayed.
#[derive(Default)]
pub struct CorrelationCache {
    map: HashMap<(String, String), f64>,
    loaded_for: Option<NaiveDate>,
}

impl CorrelationCache {
    pub async fn reload(
        &mut self,
        db: &Db,
        halflife_days: f64,
        default_rho: f64,
    ) -> Result<usize> {
        let today = Utc::now().date_naive();
        let rows = {
            let client = db.lock().await;
            client
                .query(
                    "SELECT DISTINCT ON (addr_a, addr_b) addr_a, addr_b, rho, as_of_date
                     FROM trader_correlations
                     ORDER BY addr_a, addr_b, as_of_date DESC",
                    &[],
                )
                .await?
        };
        self.map.clear();
        for row in rows {
            let a: String = row.get(0);
            let b: String = row.get(1);
            let rho: f64 = row.get(2);
            let as_of: NaiveDate = row.get(3);
            let age_days = (today - as_of).num_days() as f64;
            self.map
                .insert(pair_key(&a, &b), decayed_rho(rho, age_days, halflife_days, default_rho));
        }
        self.loaded_for = Some(today);
        Ok(self.map.len())
    }

    pub fn stale(&self) -> bool {
        self.loaded_for != Some(Utc::now().date_naive())
    }

    pub fn map(&self) -> &HashMap<(String, String), f64> {
        &self.map
    }
}

pub struct ConsensusEngine {
    config: Config,
    db: Arc<Db>,
    bus: Arc<Bus>,
    market: Arc<MarketData>,
    governor: Arc<RiskGovernor>,
    executor: Arc<Executor>,
    providers: Arc<CostProviders>,
    logger: Arc<DecisionLogger>,
    signals: Arc<SignalRegistry>,

    windows: AssetWindows,
    cooldown_until: HashMap<Asset, DateTime<Utc>>,
    correlations: CorrelationCache,
}

impl ConsensusEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        db: Arc<Db>,
        bus: Arc<Bus>,
        market: Arc<MarketData>,
        governor: Arc<RiskGovernor>,
        executor: Arc<Executor>,
        providers: Arc<CostProviders>,
        logger: Arc<DecisionLogger>,
        signals: Arc<SignalRegistry>,
    ) -> Self {
        Self {
            config,
            db,
            bus,
            market,
            governor,
            executor,
            providers,
            logger,
            signals,
            windows: AssetWindows::new(),
            cooldown_until: HashMap::new(),
            correlations: CorrelationCache::default(),
        }
    }

    /// Actor loop: one message at a time.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<ConsensusMsg>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            self.config.consensus.tick_secs.max(1),
        ));
        info!("🧩 consensus engine started");

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(ConsensusMsg::NewVote { asset, vote }) => {
                            debug!(address = %vote.address, %asset, direction = %vote.direction, "vote received");
                            self.windows.entry(asset).or_insert_with(VoteWindow::new).push(vote);
                            self.evaluate(asset).await;
                        }
                        Some(ConsensusMsg::PriceUpdate(asset)) => self.evaluate(asset).await,
                        Some(ConsensusMsg::TimerTick) => self.evaluate_all().await,
                        None => {
                            warn!("🧩 consensus channel closed");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => self.evaluate_all().await,
                _ = shutdown.changed() => {
                    info!("🧩 consensus engine stopping");
                    return;
                }
            }
        }
    }

    async fn evaluate_all(&mut self) {
        for asset in Asset::ALL {
            self.evaluate(asset).await;
        }
    }

    async fn evaluate(&mut self, asset: Asset) {
        let now = Utc::now();
        let retention =
            self.config.consensus.freshness_window_secs * VOTE_RETENTION_FACTOR;

        let Some(window) = self.windows.get_mut(&asset) else {
            return;
        };
        window.prune(now, retention);
        if window.is_empty() {
            return;
        }
        let tally = window.tally();
        metrics::get().evaluations_total.inc();

        if self.correlations.stale() {
            let default_rho = self.config.consensus.default_correlation;
            let halflife = self.config.consensus.corr_decay_halflife_days;
            match self.correlations.reload(&self.db, halflife, default_rho).await {
                Ok(n) => debug!("correlations reloaded: {n} pairs"),
                Err(e) => warn!("⚠️ correlation reload failed: {e:#}"),
            }
        }

        let Some(direction) = tally.direction else {
            // Equal weight on both sides: record the dead heat as a skip.
            let g1 = g1_supermajority(
                &tally,
                self.config.consensus.min_majority_pct,
                self.config.consensus.min_traders,
            );
            self.record_skip(asset, Direction::Long, &tally, vec![g1], now, "dead heat")
                .await;
            return;
        };

        // ── G1–G4 in order, stop at first failure ─────────────────────────
        let mut gate_values: Vec<GateValue> = Vec::with_capacity(5);

        let g1 = g1_supermajority(
            &tally,
            self.config.consensus.min_majority_pct,
            self.config.consensus.min_traders,
        );
        let g1_passed = g1.passed;
        gate_values.push(g1);
        if !g1_passed {
            self.record_skip(asset, direction, &tally, gate_values, now, "supermajority")
                .await;
            return;
        }

        let g2 = g2_effective_k(
            &tally,
            self.correlations.map(),
            self.config.consensus.default_correlation,
            self.config.consensus.min_effective_k,
        );
        let eff_k = g2.value;
        let g2_passed = g2.passed;
        gate_values.push(g2);
        if !g2_passed {
            self.record_skip(asset, direction, &tally, gate_values, now, "effective-K")
                .await;
            return;
        }

        let g3 = g3_freshness(&tally, now, self.config.consensus.freshness_window_secs);
        let g3_passed = g3.passed;
        gate_values.push(g3);
        if !g3_passed {
            self.record_skip(asset, direction, &tally, gate_values, now, "freshness")
                .await;
            return;
        }

        // Market data is a safety dependency: unavailable → fail closed.
        let view = match self.market.view(asset).await {
            Ok(v) => v,
            Err(e @ (MarketError::NoData(_) | MarketError::Stale { .. })) => {
                metrics::get()
                    .safety_blocks
                    .with_label_values(&["atr"])
                    .inc();
                gate_values.push(GateValue {
                    gate: "G4_price_band",
                    value: f64::INFINITY,
                    threshold: self.config.consensus.max_price_drift_r,
                    passed: false,
                    detail: format!("market data unavailable: {e}"),
                });
                self.record_skip(asset, direction, &tally, gate_values, now, "market data")
                    .await;
                return;
            }
            Err(MarketError::Db(e)) => {
                warn!("⚠️ market read failed: {e:#}");
                return;
            }
        };

        let market_regime = regime::classify_from_db(&self.db, asset)
            .await
            .unwrap_or(regime::Regime::Unknown);
        let stop_distance = self
            .market
            .stop_distance(asset, &view, market_regime.stop_multiplier());

        let g4 = g4_price_band(
            &tally,
            view.price,
            stop_distance,
            self.config.consensus.max_price_drift_r,
        );
        let g4_passed = g4.passed;
        gate_values.push(g4);
        if !g4_passed {
            self.record_skip(asset, direction, &tally, gate_values, now, "price band")
                .await;
            return;
        }

        // ── G5: per-venue EV at the Kelly-sized notional ──────────────────
        let majority_pct = tally.majority_weight / tally.total_weight.max(f64::EPSILON);
        let p = p_win(majority_pct, eff_k);

        // Confidence floor, regime-adjusted upward in choppier conditions.
        let min_confidence = self.config.risk.min_signal_confidence
            + market_regime.min_confidence_adjustment();
        if p < min_confidence {
            gate_values.push(GateValue {
                gate: "confidence_floor",
                value: p,
                threshold: min_confidence,
                passed: false,
                detail: format!(
                    "p_win {p:.2} below the {min_confidence:.2} floor ({} regime)",
                    market_regime.as_str()
                ),
            });
            self.record_skip(asset, direction, &tally, gate_values, now, "confidence")
                .await;
            return;
        }

        let episode_count = self.total_closed_episodes().await;
        let mut venue_costs: Vec<VenueCosts> = Vec::new();
        let mut per_venue_notional: HashMap<Venue, (f64, f64)> = HashMap::new(); // (notional, size_base)

        for venue_name in &self.config.execution.venues {
            let Ok(venue) = Venue::from_str(venue_name) else {
                continue;
            };
            let Some(account) = self
                .executor
                .adapters
                .account_with_retries(venue, &self.governor.breakers)
                .await
            else {
                continue;
            };
            let sizing = position_size(
                &SizingInputs {
                    p_win: p,
                    r_ratio: self.config.execution.rr_ratio,
                    equity_usd: account.equity_usd,
                    episode_count,
                    regime_kelly_multiplier: market_regime.kelly_multiplier(),
                },
                &self.config.kelly,
                self.config.risk.max_position_pct,
            );
            per_venue_notional.insert(venue, (sizing.notional_usd, sizing.notional_usd / view.price));
            venue_costs.push(
                self.providers
                    .venue_costs(venue, asset, direction, sizing.notional_usd)
                    .await,
            );
        }

        if venue_costs.is_empty() {
            // Every venue's account state was unavailable: fail closed.
            let checks = vec![RiskCheck {
                guard: "account_state",
                passed: false,
                detail: "account state unavailable on every venue after retries".into(),
            }];
            self.record_risk_reject(asset, direction, &tally, gate_values, checks, now)
                .await;
            return;
        }

        let (g5, winner) = g5_expected_value(
            p,
            direction,
            &venue_costs,
            Venue::from_str(&self.config.execution.default_exchange)
                .unwrap_or(Venue::Hyperliquid),
            self.config.consensus.min_ev_r,
        );
        let g5_passed = g5.passed;
        gate_values.push(g5);
        let Some(winner) = winner else {
            debug_assert!(!g5_passed);
            self.record_skip(asset, direction, &tally, gate_values, now, "expected value")
                .await;
            return;
        };

        // ── Cooldown (all gates passed) ───────────────────────────────────
        if let Some(until) = self.cooldown_until.get(&asset) {
            if now < *until {
                let remaining = (*until - now).num_seconds();
                metrics::get().cooldown_blocks.inc();
                let record = DecisionRecord {
                    id: Uuid::new_v4(),
                    ts: now,
                    asset,
                    direction,
                    decision_type: DecisionType::Cooldown,
                    inputs: DecisionLogger::inputs_json(
                        tally.majority.len(),
                        tally.majority.len() + tally.minority.len(),
                        majority_pct,
                        eff_k,
                        p,
                        view.price,
                        market_regime.as_str(),
                    ),
                    gates: gate_values,
                    risk_checks: Vec::new(),
                    reasoning: compose_reasoning(
                        DecisionType::Cooldown,
                        asset,
                        direction,
                        tally.majority.len(),
                        tally.majority.len() + tally.minority.len(),
                        &[],
                        &[],
                        Some(remaining),
                    ),
                    execution_status: "none".into(),
                    signal_id: None,
                };
                if let Err(e) = self.logger.log(&record).await {
                    warn!("⚠️ cooldown log write failed: {e:#}");
                }
                return;
            }
        }

        // ── Risk governor on the target venue ─────────────────────────────
        let (notional_usd, size_base) = per_venue_notional
            .get(&winner.venue)
            .copied()
            .unwrap_or((0.0, 0.0));
        let Some(account) = self
            .executor
            .adapters
            .account_with_retries(winner.venue, &self.governor.breakers)
            .await
        else {
            let checks = vec![RiskCheck {
                guard: "account_state",
                passed: false,
                detail: format!("account state unavailable on {}", winner.venue),
            }];
            self.record_risk_reject(asset, direction, &tally, gate_values, checks, now)
                .await;
            return;
        };

        let verdict = self
            .governor
            .evaluate(
                &account,
                notional_usd,
                self.executor.open_position_count(),
                self.executor.positions_on(asset),
                now,
            )
            .await;
        if verdict.reject.is_some() {
            self.record_risk_reject(asset, direction, &tally, gate_values, verdict.checks, now)
                .await;
            return;
        }

        // ── Post-sizing EV recompute at the final notional ────────────────
        let final_costs = self
            .providers
            .venue_costs(winner.venue, asset, direction, notional_usd)
            .await;
        let final_ev = ev::ev_net_r(p, direction, &final_costs);
        if final_ev < self.config.consensus.min_ev_r {
            let mut checks = verdict.checks;
            checks.push(RiskCheck {
                guard: "ev_recompute",
                passed: false,
                detail: format!(
                    "EV fell to {final_ev:+.2}R at the executed notional (floor {:.2}R)",
                    self.config.consensus.min_ev_r
                ),
            });
            metrics::get().risk_rejects.inc();
            self.record_risk_reject(asset, direction, &tally, gate_values, checks, now)
                .await;
            return;
        }

        // ── Emit ──────────────────────────────────────────────────────────
        let stop_price = match direction {
            Direction::Long => view.price - stop_distance,
            Direction::Short => view.price + stop_distance,
        };
        let signal = SignalEvent {
            id: Uuid::new_v4(),
            ts: now,
            asset,
            direction,
            n_traders: (tally.majority.len() + tally.minority.len()) as u32,
            n_agree: tally.majority.len() as u32,
            majority_pct,
            effective_k: eff_k,
            p_win: p,
            ev_net_r: final_ev,
            entry_price: view.price,
            stop_price,
            target_exchange: winner.venue.as_str().to_string(),
            fees_bps: winner.fees_bps,
            slippage_bps: final_costs.slippage_bps,
            funding_bps: winner.funding_bps,
        };

        let record = DecisionRecord {
            id: Uuid::new_v4(),
            ts: now,
            asset,
            direction,
            decision_type: DecisionType::Signal,
            inputs: DecisionLogger::inputs_json(
                tally.majority.len(),
                tally.majority.len() + tally.minority.len(),
                majority_pct,
                eff_k,
                p,
                view.price,
                market_regime.as_str(),
            ),
            gates: gate_values,
            risk_checks: verdict.checks,
            reasoning: compose_reasoning(
                DecisionType::Signal,
                asset,
                direction,
                tally.majority.len(),
                tally.majority.len() + tally.minority.len(),
                &record_gates_for_reasoning(&signal),
                &[],
                None,
            ),
            execution_status: "pending".into(),
            signal_id: Some(signal.id),
        };

        // Log first — no orphan signals.
        if let Err(e) = self.logger.log(&record).await {
            warn!("❌ decision log write failed; signal suppressed: {e:#}");
            return;
        }
        if let Err(e) = self.logger.store_signal(&signal).await {
            warn!("⚠️ signal persist failed: {e:#}");
        }
        if let Err(e) = self.bus.publish_json(subjects::SIGNALS, &signal).await {
            warn!("⚠️ signal publish failed: {e:#}");
        }
        metrics::get().signals_emitted.inc();
        self.cooldown_until.insert(
            asset,
            now + ChronoDuration::seconds(self.config.consensus.cooldown_secs as i64),
        );
        self.signals.insert((asset, direction), (signal.id, now));

        info!(
            "🚨 SIGNAL: {} {} @ {:.2} | {}/{} agree ({:.0}%) effK {:.2} p {:.2} EV {:+.2}R → {}",
            direction,
            asset,
            view.price,
            signal.n_agree,
            signal.n_traders,
            majority_pct * 100.0,
            eff_k,
            p,
            final_ev,
            signal.target_exchange
        );

        // Execute (dry-run or live) and stamp the outcome on the log row.
        let status = match self.executor.execute(&signal, size_base, notional_usd).await {
            Ok(result) => result.status_str().to_string(),
            Err(e) => {
                warn!("❌ execution failed: {e:#}");
                "failed".to_string()
            }
        };
        if let Err(e) = self.update_execution_status(record.id, &status).await {
            warn!("⚠️ execution status update failed: {e:#}");
        }
    }

    async fn total_closed_episodes(&self) -> i64 {
        let client = self.db.lock().await;
        client
            .query_one("SELECT COUNT(*) FROM episodes WHERE status = 'closed'", &[])
            .await
            .map(|r| r.get(0))
            .unwrap_or(0)
    }

    async fn update_execution_status(&self, decision_id: Uuid, status: &str) -> Result<()> {
        let client = self.db.lock().await;
        client
            .execute(
                "UPDATE decision_log SET execution_status = $2 WHERE id = $1",
                &[&decision_id, &status],
            )
            .await?;
        Ok(())
    }

    async fn record_skip(
        &self,
        asset: Asset,
        direction: Direction,
        tally: &VoteTally,
        gates: Vec<GateValue>,
        now: DateTime<Utc>,
        _label: &str,
    ) {
        metrics::get().skips_total.inc();
        let n_traders = tally.majority.len() + tally.minority.len();
        let record = DecisionRecord {
            id: Uuid::new_v4(),
            ts: now,
            asset,
            direction,
            decision_type: DecisionType::Skip,
            inputs: serde_json::json!({
                "n_agree": tally.majority.len(),
                "n_traders": n_traders,
            }),
            reasoning: compose_reasoning(
                DecisionType::Skip,
                asset,
                direction,
                tally.majority.len(),
                n_traders,
                &gates,
                &[],
                None,
            ),
            gates,
            risk_checks: Vec::new(),
            execution_status: "none".into(),
            signal_id: None,
        };
        if let Err(e) = self.logger.log(&record).await {
            warn!("⚠️ skip log write failed: {e:#}");
        }
    }

    async fn record_risk_reject(
        &self,
        asset: Asset,
        direction: Direction,
        tally: &VoteTally,
        gates: Vec<GateValue>,
        checks: Vec<RiskCheck>,
        now: DateTime<Utc>,
    ) {
        let n_traders = tally.majority.len() + tally.minority.len();
        let record = DecisionRecord {
            id: Uuid::new_v4(),
            ts: now,
            asset,
            direction,
            decision_type: DecisionType::RiskReject,
            inputs: serde_json::json!({
                "n_agree": tally.majority.len(),
                "n_traders": n_traders,
            }),
            reasoning: compose_reasoning(
                DecisionType::RiskReject,
                asset,
                direction,
                tally.majority.len(),
                n_traders,
                &gates,
                &checks,
                None,
            ),
            gates,
            risk_checks: checks,
            execution_status: "none".into(),
            signal_id: None,
        };
        if let Err(e) = self.logger.log(&record).await {
            warn!("⚠️ risk-reject log write failed: {e:#}");
        }
    }
}

/// Gate values reconstructed for the success reasoning line.
fn record_gates_for_reasoning(signal: &SignalEvent) -> Vec<GateValue> {
    vec![
        GateValue {
            gate: "G1_supermajority",
            value: signal.majority_pct,
            threshold: 0.0,
            passed: true,
            detail: String::new(),
        },
        GateValue {
            gate: "G2_effective_k",
            value: signal.effective_k,
            threshold: 0.0,
            passed: true,
            detail: String::new(),
        },
        GateValue {
            gate: "G5_expected_value",
            value: signal.ev_net_r,
            threshold: 0.0,
            passed: true,
            detail: format!(
                "{:+.2}R net of {:.1}bps fees and {:.1}bps slippage on {}",
                signal.ev_net_r, signal.fees_bps, signal.slippage_bps, signal.target_exchange
            ),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rho_decays_toward_default() {
        // Fresh measurement passes through.
        assert!((decayed_rho(0.8, 0.0, 10.0, 0.3) - 0.8).abs() < 1e-12);
        // One half-life: halfway to the default.
        assert!((decayed_rho(0.8, 10.0, 10.0, 0.3) - 0.55).abs() < 1e-12);
        // Very old: effectively the default.
        assert!((decayed_rho(0.8, 1_000.0, 10.0, 0.3) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn rho_decay_disabled_with_zero_halflife() {
        assert_eq!(decayed_rho(0.8, 50.0, 0.0, 0.3), 0.8);
    }
}
