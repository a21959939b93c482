//! HTTP scaffolding shared by all four services.
//!
//! Every service exposes `/healthz`, `/metrics`, and `/docs`; admin routes
//! additionally require the `x-owner-key` header to match `OWNER_TOKEN`.
//! Error bodies are always `{"error": "..."}`.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::{Encoder, Registry, TextEncoder};
use serde_json::json;
use tracing::warn;

/// Header carrying the admin token.
pub const OWNER_KEY_HEADER: &str = "x-owner-key";

// ── Errors ───────────────────────────────────────────────────────────────────

/// API error that renders as `{"error": "..."}` with the right status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::internal(format!("{e:#}"))
    }
}

// ── Owner-key auth ───────────────────────────────────────────────────────────

/// Compare two byte slices in constant time: the loop always touches every
/// byte so timing does not reveal the first mismatching position.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Axum extractor guarding admin endpoints.
///
/// Rejects with 403 `{"error"}` when `x-owner-key` is absent or does not
/// match `OWNER_TOKEN`. An unset `OWNER_TOKEN` rejects everything rather
/// than letting the check default open.
pub struct OwnerKey;

#[axum::async_trait]
impl<S> FromRequestParts<S> for OwnerKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let expected = std::env::var("OWNER_TOKEN").unwrap_or_default();
        if expected.is_empty() {
            warn!("OWNER_TOKEN is not set; rejecting admin request");
            return Err(ApiError::forbidden("admin auth not configured"));
        }

        let presented = parts
            .headers
            .get(OWNER_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            warn!("invalid owner key presented");
            return Err(ApiError::forbidden("invalid owner key"));
        }

        Ok(OwnerKey)
    }
}

// ── Standard routes ──────────────────────────────────────────────────────────

/// Render a Prometheus registry to the text exposition format.
pub fn render_metrics(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buf) {
        warn!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

/// Minimal OpenAPI 3 document for a service's route list.
pub fn openapi_doc(service: &str, routes: &[(&str, &str, &str)]) -> serde_json::Value {
    let mut paths = serde_json::Map::new();
    for (method, path, summary) in routes {
        let op = json!({ "summary": summary, "responses": { "200": { "description": "OK" } } });
        let entry = paths
            .entry(path.to_string())
            .or_insert_with(|| json!({}));
        entry[method.to_lowercase()] = op;
    }
    json!({
        "openapi": "3.0.0",
        "info": { "title": format!("sigmapilot-{service}"), "version": "1.0.0" },
        "paths": paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secrex"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn openapi_lists_routes() {
        let doc = openapi_doc(
            "scout",
            &[
                ("GET", "/healthz", "liveness"),
                ("POST", "/leaderboard/refresh", "force refresh"),
            ],
        );
        assert!(doc["paths"]["/healthz"]["get"].is_object());
        assert!(doc["paths"]["/leaderboard/refresh"]["post"].is_object());
    }
}
