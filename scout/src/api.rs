//! HTTP surface for Scout: health, metrics, docs, and the admin endpoints
//! for leaderboard refresh and the pinned registry.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use common::http::{openapi_doc, render_metrics, ApiError, OwnerKey};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::leaderboard::Refresher;
use crate::metrics;
use crate::pinned::{PinError, PinnedRegistry};

#[derive(Clone)]
pub struct ApiState {
    pub refresher: Arc<Refresher>,
    pub pinned: Arc<PinnedRegistry>,
}

#[derive(Debug, Deserialize)]
struct PinRequest {
    address: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/docs", get(docs))
        .route("/leaderboard/refresh", post(refresh_leaderboard))
        .route("/pinned-accounts", get(list_pins))
        .route("/pinned-accounts/leaderboard", post(pin_leaderboard))
        .route("/pinned-accounts/custom", post(pin_custom))
        .route("/pinned-accounts/:address", delete(unpin))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "scout" }))
}

async fn metrics_handler() -> impl IntoResponse {
    render_metrics(&metrics::get().registry)
}

async fn docs() -> impl IntoResponse {
    Json(openapi_doc(
        "scout",
        &[
            ("GET", "/healthz", "liveness"),
            ("GET", "/metrics", "prometheus metrics"),
            ("POST", "/leaderboard/refresh", "force a leaderboard refresh"),
            ("GET", "/pinned-accounts", "list pinned accounts"),
            ("POST", "/pinned-accounts/leaderboard", "pin a leaderboard address"),
            ("POST", "/pinned-accounts/custom", "pin a custom address (max 3)"),
            ("DELETE", "/pinned-accounts/{address}", "remove a pin"),
        ],
    ))
}

async fn refresh_leaderboard(
    _auth: OwnerKey,
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    info!("🔭 on-demand leaderboard refresh requested");
    let published = state.refresher.refresh_once().await?;
    Ok(Json(json!({ "published": published })))
}

async fn list_pins(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let pins = state.pinned.list().await?;
    Ok(Json(json!({ "pinned": pins })))
}

async fn pin_leaderboard(
    _auth: OwnerKey,
    State(state): State<ApiState>,
    Json(req): Json<PinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_address(&req.address)?;
    state.pinned.add_leaderboard_pin(&req.address).await?;
    Ok(Json(json!({ "pinned": req.address.to_lowercase() })))
}

async fn pin_custom(
    _auth: OwnerKey,
    State(state): State<ApiState>,
    Json(req): Json<PinRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_address(&req.address)?;
    match state.pinned.add_custom_pin(&req.address).await {
        Ok(()) => Ok(Json(json!({ "pinned": req.address.to_lowercase() }))),
        Err(PinError::CustomLimit) => Err(ApiError::bad_request(
            "custom pin limit reached (3)",
        )),
        Err(PinError::Db(e)) => Err(e.into()),
    }
}

async fn unpin(
    _auth: OwnerKey,
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.pinned.unpin(&address).await?;
    if removed {
        Ok(Json(json!({ "unpinned": address.to_lowercase() })))
    } else {
        Err(ApiError::not_found("address is not pinned"))
    }
}

/// 20-byte hex account id, optionally 0x-prefixed.
fn validate_address(address: &str) -> Result<(), ApiError> {
    let hex_part = address.strip_prefix("0x").unwrap_or(address);
    if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ApiError::bad_request("invalid address"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_validation() {
        assert!(validate_address("0x0123456789abcdef0123456789abcdef01234567").is_ok());
        assert!(validate_address("0123456789abcdef0123456789abcdef01234567").is_ok());
        assert!(validate_address("0xshort").is_err());
        assert!(validate_address("0xzz23456789abcdef0123456789abcdef01234567").is_err());
    }
}
