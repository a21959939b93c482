//! Prometheus metrics for the Sage service.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

static METRICS: Lazy<Arc<SageMetrics>> = Lazy::new(|| Arc::new(SageMetrics::new()));

pub struct SageMetrics {
    pub registry: Registry,

    pub posterior_updates: IntCounter,
    pub outcomes_duplicate: IntCounter,
    pub selections_run: IntCounter,
    pub scores_published: IntCounter,
    pub correlations_written: IntCounter,
    pub snapshots_written: IntCounter,
    pub snapshot_failures: IntCounter,
    pub pool_members: IntGauge,
    pub tracked_traders: IntGauge,
}

impl SageMetrics {
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

        Self {
            posterior_updates: counter!("sage_posterior_updates_total", "NIG conjugate updates applied"),
            outcomes_duplicate: counter!("sage_outcomes_duplicate_total", "Outcome messages dropped as duplicates"),
            selections_run: counter!("sage_selections_total", "Thompson selections performed"),
            scores_published: counter!("sage_scores_published_total", "Score events published"),
            correlations_written: counter!("sage_correlations_written_total", "Pairwise correlations upserted"),
            snapshots_written: counter!("sage_snapshots_written_total", "Shadow-ledger rows written"),
            snapshot_failures: counter!("sage_snapshot_failures_total", "Snapshot job failures"),
            pool_members: gauge!("sage_pool_members", "Active alpha-pool membership"),
            tracked_traders: gauge!("sage_tracked_traders", "Traders with a posterior row"),
            registry,
        }
    }
}

pub fn get() -> Arc<SageMetrics> {
    METRICS.clone()
}
