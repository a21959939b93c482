//! HTTP surface for Stream: health, metrics, docs, the `/ws` fan-out
//! endpoint, and read views over primed positions and the watchlist.

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common::http::{openapi_doc, render_metrics, ApiError, OwnerKey};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::config::FeedConfig;
use crate::fanout::{ws_handler, EventRing};
use crate::metrics;
use crate::price_feed::PriceCache;
use crate::subscriptions::{SourceLabel, SubscriptionManager, Transport};
use crate::tracker::PositionCache;

#[derive(Clone)]
pub struct ApiState {
    pub ring: Arc<EventRing>,
    pub prices: Arc<PriceCache>,
    pub positions: Arc<PositionCache>,
    pub manager: Arc<SubscriptionManager>,
    pub feed_config: FeedConfig,
}

#[derive(Debug, Deserialize)]
struct WatchRequest {
    address: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/docs", get(docs))
        .route("/ws", get(ws_handler))
        .route("/positions", get(positions))
        .route("/watchlist", get(watchlist))
        .route("/watchlist/custom", post(add_custom))
        .with_state(state)
}

async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let staleness = state.prices.staleness_secs();
    // Best-effort status: the feed is "ready" once a price has been seen
    // recently; consumers decide what to do with a degraded feed.
    let feed_ready = staleness.map(|s| s < 60).unwrap_or(false);
    Json(json!({
        "status": "ok",
        "service": "stream",
        "feedReady": feed_ready,
        "priceAgeSecs": staleness,
        "tracked": state.manager.len(),
        "latestSeq": state.ring.latest_seq(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    render_metrics(&metrics::get().registry)
}

async fn docs() -> impl IntoResponse {
    Json(openapi_doc(
        "stream",
        &[
            ("GET", "/healthz", "liveness + feed readiness"),
            ("GET", "/metrics", "prometheus metrics"),
            ("GET", "/ws", "event fan-out websocket"),
            ("GET", "/positions", "primed holdings for tracked addresses"),
            ("GET", "/watchlist", "current transport plan"),
            ("POST", "/watchlist/custom", "track an extra address"),
        ],
    ))
}

async fn positions(State(state): State<ApiState>) -> impl IntoResponse {
    let entries: Vec<_> = state
        .positions
        .iter()
        .map(|e| {
            let ((address, asset), szi) = (e.key().clone(), *e.value());
            json!({ "address": address, "asset": asset, "position": szi })
        })
        .collect();
    Json(json!({ "positionsReady": !entries.is_empty(), "positions": entries }))
}

async fn watchlist(State(state): State<ApiState>) -> impl IntoResponse {
    let plan = state.manager.transport_plan();
    let entries: Vec<_> = plan
        .iter()
        .map(|(addr, transport)| {
            json!({
                "address": addr,
                "transport": match transport {
                    Transport::Websocket => "websocket",
                    Transport::Polling => "polling",
                },
            })
        })
        .collect();
    Json(json!({ "watchlist": entries }))
}

async fn add_custom(
    _auth: OwnerKey,
    State(state): State<ApiState>,
    Json(req): Json<WatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.address.trim().is_empty() {
        return Err(ApiError::bad_request("address required"));
    }
    state.manager.register(&req.address, SourceLabel::Custom);
    Ok(Json(json!({ "tracking": req.address.to_lowercase() })))
}
