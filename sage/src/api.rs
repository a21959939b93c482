//! HTTP surface for Sage: health, metrics, docs, pool views, and the admin
//! endpoints for pool refresh, snapshot creation, and shadow-ledger replay.

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use common::http::{openapi_doc, render_metrics, ApiError, OwnerKey};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::metrics;
use crate::selection::Selector;
use crate::snapshot::SnapshotJob;

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<common::db::Db>,
    pub selector: Arc<Selector>,
    pub snapshot: Arc<SnapshotJob>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/docs", get(docs))
        .route("/alpha-pool", get(get_pool))
        .route("/alpha-pool/refresh", post(refresh_pool))
        .route("/snapshots/create", post(create_snapshot))
        .route("/replay/run", post(run_replay))
        .with_state(state)
}

async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    let pool_size = {
        let client = state.db.lock().await;
        client
            .query_one("SELECT COUNT(*) FROM alpha_pool WHERE is_active", &[])
            .await
            .map(|r| r.get::<_, i64>(0))
            .unwrap_or(-1)
    };
    Json(json!({
        "status": "ok",
        "service": "sage",
        "poolSize": pool_size,
        "selectionVersion": state.selector.current_version(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    render_metrics(&metrics::get().registry)
}

async fn docs() -> impl IntoResponse {
    Json(openapi_doc(
        "sage",
        &[
            ("GET", "/healthz", "liveness + pool size"),
            ("GET", "/metrics", "prometheus metrics"),
            ("GET", "/alpha-pool", "current pool membership"),
            ("POST", "/alpha-pool/refresh", "refresh candidates and re-select"),
            ("POST", "/snapshots/create", "write today's shadow ledger"),
            ("POST", "/replay/run", "replay selection from snapshots only"),
        ],
    ))
}

async fn get_pool(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let client = state.db.lock().await;
    let rows = client
        .query(
            "SELECT address, selected, rank, added_at, last_refreshed_at
             FROM alpha_pool WHERE is_active
             ORDER BY rank NULLS LAST, address",
            &[],
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let members: Vec<_> = rows
        .into_iter()
        .map(|r| {
            json!({
                "address": r.get::<_, String>(0),
                "selected": r.get::<_, bool>(1),
                "rank": r.get::<_, Option<i32>>(2),
                "addedAt": r.get::<_, chrono::DateTime<chrono::Utc>>(3),
                "lastRefreshedAt": r.get::<_, chrono::DateTime<chrono::Utc>>(4),
            })
        })
        .collect();
    Ok(Json(json!({ "pool": members })))
}

#[derive(Debug, Deserialize)]
struct RefreshQuery {
    limit: Option<usize>,
}

async fn refresh_pool(
    _auth: OwnerKey,
    State(state): State<ApiState>,
    Query(query): Query<RefreshQuery>,
) -> Result<impl IntoResponse, ApiError> {
    info!("🏆 on-demand pool refresh requested");
    let ranked = state.selector.refresh_pool(query.limit).await?;
    let selected: Vec<&str> = ranked
        .iter()
        .filter(|r| r.selected)
        .map(|r| r.address.as_str())
        .collect();
    Ok(Json(json!({
        "poolSize": ranked.len(),
        "selected": selected,
        "selectionVersion": state.selector.current_version(),
    })))
}

async fn create_snapshot(
    _auth: OwnerKey,
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    let date = chrono::Utc::now().date_naive();
    let version = state.selector.current_version();
    let rows = state.snapshot.run_once(date, version).await?;
    Ok(Json(json!({ "snapshotDate": date, "selectionVersion": version, "rows": rows })))
}

#[derive(Debug, Deserialize)]
struct ReplayQuery {
    start_date: NaiveDate,
    end_date: NaiveDate,
    #[serde(default)]
    select_k: Option<i64>,
}

/// Replay daily selection from the shadow ledger alone. Live tables are
/// never read, so the result is exactly what the recorded draws implied at
/// the time — no look-ahead.
async fn run_replay(
    _auth: OwnerKey,
    State(state): State<ApiState>,
    Query(query): Query<ReplayQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if query.end_date < query.start_date {
        return Err(ApiError::bad_request("end_date before start_date"));
    }
    let select_k = query.select_k.unwrap_or(10).max(1);

    let client = state.db.lock().await;
    let rows = client
        .query(
            "SELECT snapshot_date, address, thompson_draw, qualified
             FROM trader_snapshots
             WHERE snapshot_date BETWEEN $1 AND $2
             ORDER BY snapshot_date, thompson_draw DESC",
            &[&query.start_date, &query.end_date],
        )
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let mut days: Vec<serde_json::Value> = Vec::new();
    let mut current_date: Option<NaiveDate> = None;
    let mut current: Vec<serde_json::Value> = Vec::new();

    for row in rows {
        let date: NaiveDate = row.get(0);
        if current_date != Some(date) {
            if let Some(d) = current_date {
                days.push(json!({ "date": d, "selected": current }));
            }
            current_date = Some(date);
            current = Vec::new();
        }
        if (current.len() as i64) < select_k {
            current.push(json!({
                "address": row.get::<_, String>(1),
                "draw": row.get::<_, f64>(2),
                "qualified": row.get::<_, bool>(3),
            }));
        }
    }
    if let Some(d) = current_date {
        days.push(json!({ "date": d, "selected": current }));
    }

    Ok(Json(json!({ "days": days })))
}
