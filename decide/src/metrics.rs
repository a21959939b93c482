//! Prometheus metrics for the Decide service.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

static METRICS: Lazy<Arc<DecideMetrics>> = Lazy::new(|| Arc::new(DecideMetrics::new()));

pub struct DecideMetrics {
    pub registry: Registry,

    pub fills_consumed: IntCounter,
    pub fills_duplicate: IntCounter,
    pub episodes_opened: IntCounter,
    pub episodes_closed: IntCounter,
    pub episodes_timed_out: IntCounter,
    pub evaluations_total: IntCounter,
    pub signals_emitted: IntCounter,
    pub skips_total: IntCounter,
    pub cooldown_blocks: IntCounter,
    pub risk_rejects: IntCounter,
    /// Fail-closed blocks, labeled by guard name.
    pub safety_blocks: IntCounterVec,
    pub executions_live: IntCounter,
    pub executions_dry_run: IntCounter,
    pub stops_placed: IntCounter,
    pub stops_cancelled: IntCounter,
    pub open_positions: IntGauge,
    pub kill_switch_active: IntGauge,
}

impl DecideMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        macro_rules! counter {
            ($name:expr, $help:expr) => {{
                let c = IntCounter::with_opts(Opts::new($name, $help)).unwrap();
                registry.register(Box::new(c.clone())).unwrap();
                c
            }};
        }
        macro_rules! gauge {
            ($name:expr, $help:expr) => {{
                let g = IntGauge::with_opts(Opts::new($name, $help)).unwrap();
                registry.register(Box::new(g.clone())).unwrap();
                g
            }};
        }

        let safety_blocks = IntCounterVec::new(
            Opts::new("decide_safety_blocks_total", "Fail-closed safety blocks"),
            &["guard"],
        )
        .unwrap();
        registry.register(Box::new(safety_blocks.clone())).unwrap();

        Self {
            fills_consumed: counter!("decide_fills_consumed_total", "Fill events consumed"),
            fills_duplicate: counter!("decide_fills_duplicate_total", "Fill events dropped as duplicates"),
            episodes_opened: counter!("decide_episodes_opened_total", "Episodes opened"),
            episodes_closed: counter!("decide_episodes_closed_total", "Episodes closed"),
            episodes_timed_out: counter!("decide_episodes_timed_out_total", "Episodes force-closed by timeout"),
            evaluations_total: counter!("decide_evaluations_total", "Consensus evaluations"),
            signals_emitted: counter!("decide_signals_total", "Signals emitted"),
            skips_total: counter!("decide_skips_total", "Evaluations skipped on a gate"),
            cooldown_blocks: counter!("decide_cooldown_total", "Evaluations suppressed by cooldown"),
            risk_rejects: counter!("decide_risk_rejects_total", "Signals rejected by the risk governor"),
            executions_live: counter!("decide_executions_live_total", "Live orders submitted"),
            executions_dry_run: counter!("decide_executions_dry_run_total", "Dry-run executions"),
            stops_placed: counter!("decide_stops_placed_total", "Native stop pairs placed"),
            stops_cancelled: counter!("decide_stops_cancelled_total", "Native stop pairs cancelled"),
            open_positions: gauge!("decide_open_positions", "Open managed positions"),
            kill_switch_active: gauge!("decide_kill_switch_active", "1 while the kill switch is engaged"),
            safety_blocks,
            registry,
        }
    }
}

pub fn get() -> Arc<DecideMetrics> {
    METRICS.clone()
}
