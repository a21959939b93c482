//! HTTP surface for Decide: health, metrics, docs, regime view, execution
//! config, recent signals/decisions, and kill-switch administration.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use common::assets::Asset;
use common::http::{openapi_doc, render_metrics, ApiError, OwnerKey};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::execution::Executor;
use crate::metrics;
use crate::regime;
use crate::risk::KillSwitch;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<common::db::Db>,
    pub executor: Arc<Executor>,
    pub kill_switch: Arc<KillSwitch>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/docs", get(docs))
        .route("/regime", get(get_regime))
        .route("/positions", get(get_positions))
        .route("/signals", get(get_signals))
        .route("/decisions", get(get_decisions))
        .route("/execution/config", post(set_execution_config))
        .route("/kill-switch/reset", post(reset_kill_switch))
        .with_state(state)
}

async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let kill = state.kill_switch.snapshot();
    Json(json!({
        "status": "ok",
        "service": "decide",
        "openPositions": state.executor.open_position_count(),
        "killSwitchActive": kill.active,
        "liveExecution": state.executor.live_enabled().await,
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    render_metrics(&metrics::get().registry)
}

async fn docs() -> impl IntoResponse {
    Json(openapi_doc(
        "decide",
        &[
            ("GET", "/healthz", "liveness + execution state"),
            ("GET", "/metrics", "prometheus metrics"),
            ("GET", "/regime", "current regime per asset"),
            ("GET", "/positions", "open managed positions"),
            ("GET", "/signals", "recent consensus signals"),
            ("GET", "/decisions", "recent decision log"),
            ("POST", "/execution/config", "update stored execution config"),
            ("POST", "/kill-switch/reset", "clear the kill switch"),
        ],
    ))
}

async fn get_regime(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let mut out = serde_json::Map::new();
    for asset in Asset::ALL {
        let regime = regime::classify_from_db(&state.db, asset)
            .await
            .unwrap_or(regime::Regime::Unknown);
        out.insert(
            asset.as_str().to_string(),
            json!({
                "regime": regime.as_str(),
                "stopMultiplier": regime.stop_multiplier(),
                "kellyMultiplier": regime.kelly_multiplier(),
            }),
        );
    }
    Ok(Json(json!({ "regimes": out })))
}

async fn get_positions(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({ "positions": state.executor.open_positions() }))
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn get_signals(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let client = state.db.lock().await;
    let rows = client
        .query(
            "SELECT id, ts, asset, direction, n_agree, n_traders, majority_pct,
                    effective_k, p_win, ev_net_r, entry_price, target_exchange,
                    outcome, realized_r
             FROM consensus_signals ORDER BY ts DESC LIMIT $1",
            &[&limit],
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let signals: Vec<_> = rows
        .into_iter()
        .map(|r| {
            json!({
                "id": r.get::<_, uuid::Uuid>(0),
                "ts": r.get::<_, chrono::DateTime<chrono::Utc>>(1),
                "asset": r.get::<_, String>(2),
                "direction": r.get::<_, String>(3),
                "nAgree": r.get::<_, i32>(4),
                "nTraders": r.get::<_, i32>(5),
                "majorityPct": r.get::<_, f64>(6),
                "effectiveK": r.get::<_, f64>(7),
                "pWin": r.get::<_, f64>(8),
                "evNetR": r.get::<_, f64>(9),
                "entryPrice": r.get::<_, f64>(10),
                "targetExchange": r.get::<_, String>(11),
                "outcome": r.get::<_, Option<String>>(12),
                "realizedR": r.get::<_, Option<f64>>(13),
            })
        })
        .collect();
    Ok(Json(json!({ "signals": signals })))
}

async fn get_decisions(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let client = state.db.lock().await;
    let rows = client
        .query(
            "SELECT id, ts, asset, direction, decision_type, reasoning_text,
                    execution_status, outcome_pnl, outcome_r
             FROM decision_log ORDER BY ts DESC LIMIT $1",
            &[&limit],
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let decisions: Vec<_> = rows
        .into_iter()
        .map(|r| {
            json!({
                "id": r.get::<_, uuid::Uuid>(0),
                "ts": r.get::<_, chrono::DateTime<chrono::Utc>>(1),
                "asset": r.get::<_, String>(2),
                "direction": r.get::<_, String>(3),
                "decisionType": r.get::<_, String>(4),
                "reasoning": r.get::<_, String>(5),
                "executionStatus": r.get::<_, String>(6),
                "outcomePnl": r.get::<_, Option<f64>>(7),
                "outcomeR": r.get::<_, Option<f64>>(8),
            })
        })
        .collect();
    Ok(Json(json!({ "decisions": decisions })))
}

#[derive(Debug, Deserialize)]
struct ExecutionConfigRequest {
    enabled: Option<bool>,
    exchange: Option<String>,
    use_native_stops: Option<bool>,
}

async fn set_execution_config(
    _auth: OwnerKey,
    State(state): State<ApiState>,
    Json(req): Json<ExecutionConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(exchange) = &req.exchange {
        exchange
            .parse::<crate::execution::adapter::Venue>()
            .map_err(ApiError::bad_request)?;
    }

    let client = state.db.lock().await;
    client
        .execute(
            "UPDATE execution_config SET
               enabled = COALESCE($1, enabled),
               exchange = COALESCE($2, exchange),
               use_native_stops = COALESCE($3, use_native_stops),
               updated_at = now()
             WHERE singleton",
            &[&req.enabled, &req.exchange, &req.use_native_stops],
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    drop(client);

    info!(
        "⚙️ execution config updated (enabled={:?}, exchange={:?}, native_stops={:?})",
        req.enabled, req.exchange, req.use_native_stops
    );
    Ok(Json(json!({ "updated": true })))
}

async fn reset_kill_switch(
    _auth: OwnerKey,
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    state.kill_switch.deactivate().await?;
    Ok(Json(json!({ "killSwitchActive": false })))
}
