//! 📝 Decision logging with human-readable reasoning.
//!
//! Every consensus evaluation writes exactly one row — signal, skip,
//! risk-reject, or cooldown — with the full gate values and risk checks as
//! JSON, before any signal is published. The log is the source of truth:
//! a signal without a log row cannot exist.

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::assets::{Asset, Direction};
use common::db::Db;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::consensus::gates::GateValue;
use crate::risk::RiskCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Signal,
    Skip,
    RiskReject,
    Cooldown,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::Signal => "signal",
            DecisionType::Skip => "skip",
            DecisionType::RiskReject => "risk_reject",
            DecisionType::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub asset: Asset,
    pub direction: Direction,
    pub decision_type: DecisionType,
    pub inputs: serde_json::Value,
    pub gates: Vec<GateValue>,
    pub risk_checks: Vec<RiskCheck>,
    pub reasoning: String,
    pub execution_status: String,
    pub signal_id: Option<Uuid>,
}

/// Compose the 2–4 sentence reasoning summary from the decisive pieces.
pub fn compose_reasoning(
    decision_type: DecisionType,
    asset: Asset,
    direction: Direction,
    n_agree: usize,
    n_traders: usize,
    gates: &[GateValue],
    risk_checks: &[RiskCheck],
    cooldown_remaining_secs: Option<i64>,
) -> String {
    let mut sentences: Vec<String> = Vec::new();
    sentences.push(format!(
        "{n_agree}/{n_traders} pool traders are {} {asset} inside the window.",
        match direction {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
        }
    ));

    match decision_type {
        DecisionType::Signal => {
            let summary: Vec<String> = gates
                .iter()
                .map(|g| format!("{} {:.2}", short_name(g.gate), g.value))
                .collect();
            sentences.push(format!("All gates passed ({}).", summary.join(", ")));
            if let Some(g5) = gates.iter().find(|g| g.gate == "G5_expected_value") {
                sentences.push(format!("{}.", g5.detail));
            }
        }
        DecisionType::Skip => {
            if let Some(failed) = gates.iter().find(|g| !g.passed) {
                sentences.push(format!(
                    "{} failed: {:.2} vs required {:.2} ({}).",
                    short_name(failed.gate),
                    failed.value,
                    failed.threshold,
                    failed.detail
                ));
            }
            let passed = gates.iter().filter(|g| g.passed).count();
            sentences.push(format!("{passed} gate(s) passed before the failure."));
        }
        DecisionType::RiskReject => {
            if let Some(failed) = risk_checks.iter().find(|c| !c.passed) {
                sentences.push(format!(
                    "Risk governor blocked on {}: {}.",
                    failed.guard, failed.detail
                ));
            }
            sentences.push("All five consensus gates had passed.".to_string());
        }
        DecisionType::Cooldown => {
            sentences.push(match cooldown_remaining_secs {
                Some(secs) => format!(
                    "All gates passed but the asset is cooling down for another {secs}s."
                ),
                None => "All gates passed but the asset is cooling down.".to_string(),
            });
        }
    }

    sentences.join(" ")
}

fn short_name(gate: &str) -> &str {
    gate.split('_').next().unwrap_or(gate)
}

pub struct DecisionLogger {
    db: Arc<Db>,
}

impl DecisionLogger {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Write one evaluation row. Called before any signal publish.
    pub async fn log(&self, record: &DecisionRecord) -> Result<()> {
        let gates = serde_json::to_value(&record.gates)?;
        let risk_checks = serde_json::to_value(&record.risk_checks)?;
        let client = self.db.lock().await;
        client
            .execute(
                "INSERT INTO decision_log
                   (id, ts, asset, direction, decision_type, inputs, gates,
                    risk_checks, reasoning_text, execution_status, signal_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
                &[
                    &record.id,
                    &record.ts,
                    &record.asset.as_str(),
                    &record.direction.as_str(),
                    &record.decision_type.as_str(),
                    &record.inputs,
                    &gates,
                    &risk_checks,
                    &record.reasoning,
                    &record.execution_status,
                    &record.signal_id,
                ],
            )
            .await?;
        Ok(())
    }

    /// Persist an emitted signal row (after its decision log).
    pub async fn store_signal(&self, signal: &common::bus::SignalEvent) -> Result<()> {
        let client = self.db.lock().await;
        client
            .execute(
                "INSERT INTO consensus_signals
                   (id, ts, asset, direction, n_traders, n_agree, majority_pct,
                    effective_k, p_win, ev_net_r, entry_price, stop_price,
                    target_exchange, fees_bps, slippage_bps, funding_bps)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &signal.id,
                    &signal.ts,
                    &signal.asset.as_str(),
                    &signal.direction.as_str(),
                    &(signal.n_traders as i32),
                    &(signal.n_agree as i32),
                    &signal.majority_pct,
                    &signal.effective_k,
                    &signal.p_win,
                    &signal.ev_net_r,
                    &signal.entry_price,
                    &signal.stop_price,
                    &signal.target_exchange,
                    &signal.fees_bps,
                    &signal.slippage_bps,
                    &signal.funding_bps,
                ],
            )
            .await?;
        Ok(())
    }

    /// Back-annotate a trader-episode outcome onto the signal that the
    /// episode participated in.
    pub async fn annotate_outcome(
        &self,
        signal_id: Uuid,
        outcome: &str,
        realized_r: f64,
    ) -> Result<()> {
        let client = self.db.lock().await;
        client
            .execute(
                "UPDATE consensus_signals SET outcome = COALESCE(outcome, $2), realized_r = COALESCE(realized_r, $3)
                 WHERE id = $1",
                &[&signal_id, &outcome, &realized_r],
            )
            .await?;
        Ok(())
    }

    pub fn inputs_json(
        tally_majority: usize,
        tally_total: usize,
        majority_pct: f64,
        eff_k: f64,
        p_win: f64,
        current_price: f64,
        regime: &str,
    ) -> serde_json::Value {
        json!({
            "n_agree": tally_majority,
            "n_traders": tally_total,
            "majority_pct": majority_pct,
            "effective_k": eff_k,
            "p_win": p_win,
            "current_price": current_price,
            "regime": regime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(name: &'static str, value: f64, threshold: f64, passed: bool) -> GateValue {
        GateValue {
            gate: name,
            value,
            threshold,
            passed,
            detail: format!("{name} detail"),
        }
    }

    #[test]
    fn skip_reasoning_names_failed_gate_with_gap() {
        let gates = vec![
            gate("G1_supermajority", 0.60, 0.70, false),
        ];
        let text = compose_reasoning(
            DecisionType::Skip,
            Asset::Btc,
            Direction::Short,
            6,
            10,
            &gates,
            &[],
            None,
        );
        assert!(text.contains("G1 failed"));
        assert!(text.contains("0.60"));
        assert!(text.contains("0.70"));
        assert!(text.contains("6/10"));
    }

    #[test]
    fn signal_reasoning_mentions_all_gates_and_venue() {
        let gates = vec![
            gate("G1_supermajority", 0.80, 0.70, true),
            gate("G2_effective_k", 3.2, 2.0, true),
            gate("G3_freshness", 30.0, 300.0, true),
            gate("G4_price_band", 0.06, 0.25, true),
            GateValue {
                gate: "G5_expected_value",
                value: 0.29,
                threshold: 0.20,
                passed: true,
                detail: "best venue hyperliquid at +0.29R net of 4.5bps fees, 2.0bps slippage, +1.0bps funding".into(),
            },
        ];
        let text = compose_reasoning(
            DecisionType::Signal,
            Asset::Btc,
            Direction::Long,
            8,
            10,
            &gates,
            &[],
            None,
        );
        assert!(text.contains("8/10"));
        assert!(text.contains("All gates passed"));
        assert!(text.contains("hyperliquid"));
        // 2–4 sentences.
        let sentences = text.matches('.').count();
        assert!((2..=4).contains(&sentences), "got {sentences}: {text}");
    }

    #[test]
    fn cooldown_reasoning_mentions_remaining() {
        let text = compose_reasoning(
            DecisionType::Cooldown,
            Asset::Eth,
            Direction::Long,
            8,
            10,
            &[],
            &[],
            Some(180),
        );
        assert!(text.contains("cooling down"));
        assert!(text.contains("180s"));
    }

    #[test]
    fn risk_reject_reasoning_names_guard() {
        let checks = vec![RiskCheck {
            guard: "kill_switch",
            passed: false,
            detail: "kill switch active".into(),
        }];
        let text = compose_reasoning(
            DecisionType::RiskReject,
            Asset::Btc,
            Direction::Long,
            8,
            10,
            &[],
            &checks,
            None,
        );
        assert!(text.contains("kill_switch"));
    }
}
