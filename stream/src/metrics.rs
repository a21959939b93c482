//! Prometheus metrics for the Stream service.

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

static METRICS: Lazy<Arc<StreamMetrics>> = Lazy::new(|| Arc::new(StreamMetrics::new()));

pub struct StreamMetrics {
    pub registry: Registry,

    pub fills_ingested: IntCounter,
    pub fills_duplicate: IntCounter,
    pub fills_published: IntCounter,
    pub ws_reconnects: IntCounter,
    pub chain_breaks: IntCounter,
    pub chain_repairs: IntCounter,
    pub price_polls: IntCounter,
    pub bars_written: IntCounter,
    pub tracked_websocket: IntGauge,
    pub tracked_polling: IntGauge,
    pub fanout_subscribers: IntGauge,
}

impl StreamMetrics {
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
            fills_ingested: counter!("stream_fills_ingested_total", "Fills inserted"),
            fills_duplicate: counter!("stream_fills_duplicate_total", "Fills dropped as duplicates"),
            fills_published: counter!("stream_fills_published_total", "Fill events published to the bus"),
            ws_reconnects: counter!("stream_ws_reconnects_total", "Venue websocket reconnects"),
            chain_breaks: counter!("stream_chain_breaks_total", "Position chain discrepancies found"),
            chain_repairs: counter!("stream_chain_repairs_total", "Position chain repairs performed"),
            price_polls: counter!("stream_price_polls_total", "Mid-price polls"),
            bars_written: counter!("stream_bars_written_total", "Minute bars upserted"),
            tracked_websocket: gauge!("stream_tracked_websocket", "Addresses on websocket transport"),
            tracked_polling: gauge!("stream_tracked_polling", "Addresses on polling transport"),
            fanout_subscribers: gauge!("stream_fanout_subscribers", "Connected fan-out subscribers"),
            registry,
        }
    }
}

pub fn get() -> Arc<StreamMetrics> {
    METRICS.clone()
}
