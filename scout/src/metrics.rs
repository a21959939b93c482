//! Prometheus metrics for the Scout service.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

static METRICS: Lazy<Arc<ScoutMetrics>> = Lazy::new(|| Arc::new(ScoutMetrics::new()));

pub struct ScoutMetrics {
    pub registry: Registry,

    pub refreshes_total: IntCounter,
    pub refresh_failures: IntCounter,
    pub candidates_scanned: IntCounter,
    pub candidates_published: IntCounter,
    pub gate_rejections: IntCounter,
    pub pinned_accounts: IntGauge,
}

impl ScoutMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let refreshes_total = IntCounter::with_opts(Opts::new(
            "scout_refreshes_total",
            "Completed leaderboard refreshes",
        ))
        .unwrap();
        registry.register(Box::new(refreshes_total.clone())).unwrap();

        let refresh_failures = IntCounter::with_opts(Opts::new(
            "scout_refresh_failures_total",
            "Leaderboard refreshes abandoned after bounded retries",
        ))
        .unwrap();
        registry.register(Box::new(refresh_failures.clone())).unwrap();

        let candidates_scanned = IntCounter::with_opts(Opts::new(
            "scout_candidates_scanned_total",
            "Leaderboard rows considered before gating",
        ))
        .unwrap();
        registry
            .register(Box::new(candidates_scanned.clone()))
            .unwrap();

        let candidates_published = IntCounter::with_opts(Opts::new(
            "scout_candidates_published_total",
            "Candidate events published to the bus",
        ))
        .unwrap();
        registry
            .register(Box::new(candidates_published.clone()))
            .unwrap();

        let gate_rejections = IntCounter::with_opts(Opts::new(
            "scout_gate_rejections_total",
            "Candidates dropped by a quality gate",
        ))
        .unwrap();
        registry.register(Box::new(gate_rejections.clone())).unwrap();

        let pinned_accounts = IntGauge::with_opts(Opts::new(
            "scout_pinned_accounts",
            "Current number of pinned accounts",
        ))
        .unwrap();
        registry.register(Box::new(pinned_accounts.clone())).unwrap();

        Self {
            registry,
            refreshes_total,
            refresh_failures,
            candidates_scanned,
            candidates_published,
            gate_rejections,
            pinned_accounts,
        }
    }
}

pub fn get() -> Arc<ScoutMetrics> {
    METRICS.clone()
}
