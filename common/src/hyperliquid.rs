//! Thin Hyperliquid info-API client.
//!
//! The venue is an external collaborator: this module knows the wire shapes
//! and nothing about what the services do with them. All numeric fields
//! arrive as strings on the info API; [`fnum`] is the tolerant parser.
//!
//! Every request goes through the process-wide [`RateLimiter`] and retries
//! 429s with exponential backoff, bounded.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ratelimit::RateLimiter;

pub const MAINNET_API: &str = "https://api.hyperliquid.xyz";
pub const MAINNET_WS: &str = "wss://api.hyperliquid.xyz/ws";

const INFO_RETRIES: u32 = 4;
const BACKOFF_BASE_MS: u64 = 500;

/// Parse one of Hyperliquid's stringly-typed numbers; empty/garbage → 0.
pub fn fnum(s: &str) -> f64 {
    s.trim().parse::<f64>().unwrap_or(0.0)
}

// ── Wire shapes ──────────────────────────────────────────────────────────────

/// One entry of the `userFills` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlFill {
    pub coin: String,
    pub px: String,
    pub sz: String,
    /// "B" = buy, "A" = sell.
    pub side: String,
    /// Milliseconds since epoch.
    pub time: u64,
    pub start_position: String,
    #[serde(default)]
    pub closed_pnl: Option<String>,
    /// Transaction hash; unique per fill together with `tid`.
    pub hash: String,
    #[serde(default)]
    pub tid: u64,
    #[serde(default)]
    pub oid: u64,
    /// Venue action label, e.g. "Open Long", "Close Short".
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub liquidation: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlMarginSummary {
    pub account_value: String,
    #[serde(default)]
    pub total_ntl_pos: String,
    #[serde(default)]
    pub total_margin_used: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlPosition {
    pub coin: String,
    /// Signed position size.
    pub szi: String,
    #[serde(default)]
    pub entry_px: Option<String>,
    #[serde(default)]
    pub liquidation_px: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlAssetPosition {
    pub position: HlPosition,
}

/// `clearinghouseState` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlUserState {
    pub margin_summary: HlMarginSummary,
    #[serde(default)]
    pub cross_maintenance_margin_used: String,
    #[serde(default)]
    pub asset_positions: Vec<HlAssetPosition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HlWindowPerf {
    #[serde(default)]
    pub pnl: String,
    #[serde(default)]
    pub roi: String,
    #[serde(default)]
    pub vlm: String,
}

/// One leaderboard row from the stats API.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlLeaderboardRow {
    pub eth_address: String,
    #[serde(default)]
    pub account_value: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Pairs of (window name, performance), e.g. ("month", {...}).
    #[serde(default)]
    pub window_performances: Vec<(String, HlWindowPerf)>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HlLeaderboard {
    #[serde(default)]
    leaderboard_rows: Vec<HlLeaderboardRow>,
}

/// One minute candle from `candleSnapshot`.
#[derive(Debug, Clone, Deserialize)]
pub struct HlCandle {
    /// Open time, ms.
    pub t: u64,
    pub o: String,
    pub h: String,
    pub l: String,
    pub c: String,
}

// ── Client ───────────────────────────────────────────────────────────────────

pub struct HlClient {
    http: reqwest::Client,
    base: String,
    limiter: Arc<RateLimiter>,
}

impl HlClient {
    pub fn new(base_url: &str, limiter: Arc<RateLimiter>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build venue HTTP client")?;
        Ok(Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            limiter,
        })
    }

    /// POST to `/info`, rate-limited, retrying 429/5xx with exponential
    /// backoff up to a bound.
    async fn info(&self, body: Value) -> Result<Value> {
        let url = format!("{}/info", self.base);
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire().await;
            let resp = self.http.post(&url).json(&body).send().await;

            match resp {
                Ok(r) if r.status().is_success() => {
                    return r.json::<Value>().await.context("invalid JSON from venue");
                }
                Ok(r) => {
                    let status = r.status();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if !retryable || attempt >= INFO_RETRIES {
                        anyhow::bail!("venue info request failed: {status}");
                    }
                    let backoff = BACKOFF_BASE_MS * (1 << attempt);
                    warn!("⏳ venue returned {status}, backing off {backoff}ms");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
                Err(e) => {
                    if attempt >= INFO_RETRIES {
                        return Err(anyhow!(e).context("venue info request failed"));
                    }
                    let backoff = BACKOFF_BASE_MS * (1 << attempt);
                    debug!("venue request error ({e}), retrying in {backoff}ms");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
            attempt += 1;
        }
    }

    /// Current mid price per coin.
    pub async fn all_mids(&self) -> Result<HashMap<String, f64>> {
        let v = self.info(json!({ "type": "allMids" })).await?;
        let map: HashMap<String, String> =
            serde_json::from_value(v).context("unexpected allMids shape")?;
        Ok(map.into_iter().map(|(k, s)| (k, fnum(&s))).collect())
    }

    /// Recent fills for one account (venue caps the window; callers page by
    /// time when backfilling).
    pub async fn user_fills(&self, address: &str) -> Result<Vec<HlFill>> {
        let v = self
            .info(json!({ "type": "userFills", "user": address }))
            .await?;
        serde_json::from_value(v).context("unexpected userFills shape")
    }

    /// Fills within a time range, for backfill.
    pub async fn user_fills_by_time(
        &self,
        address: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<HlFill>> {
        let v = self
            .info(json!({
                "type": "userFillsByTime",
                "user": address,
                "startTime": start_ms,
                "endTime": end_ms,
            }))
            .await?;
        serde_json::from_value(v).context("unexpected userFillsByTime shape")
    }

    /// Account margin + open positions.
    pub async fn user_state(&self, address: &str) -> Result<HlUserState> {
        let v = self
            .info(json!({ "type": "clearinghouseState", "user": address }))
            .await?;
        serde_json::from_value(v).context("unexpected clearinghouseState shape")
    }

    /// Ranked accounts for a leaderboard window.
    pub async fn leaderboard(&self) -> Result<Vec<HlLeaderboardRow>> {
        let v = self.info(json!({ "type": "leaderboard" })).await?;
        let lb: HlLeaderboard =
            serde_json::from_value(v).context("unexpected leaderboard shape")?;
        Ok(lb.leaderboard_rows)
    }

    /// Minute candles for ATR seeding.
    pub async fn candle_snapshot(
        &self,
        coin: &str,
        interval: &str,
        start_ms: u64,
        end_ms: u64,
    ) -> Result<Vec<HlCandle>> {
        let v = self
            .info(json!({
                "type": "candleSnapshot",
                "req": { "coin": coin, "interval": interval, "startTime": start_ms, "endTime": end_ms },
            }))
            .await?;
        serde_json::from_value(v).context("unexpected candleSnapshot shape")
    }
}

// ── WebSocket helpers ────────────────────────────────────────────────────────

/// Subscribe payload for a per-user feed (`userFills`, `userPositions`).
pub fn ws_subscribe_msg(kind: &str, address: &str) -> String {
    json!({
        "method": "subscribe",
        "subscription": { "type": kind, "user": address },
    })
    .to_string()
}

/// Unsubscribe payload matching [`ws_subscribe_msg`].
pub fn ws_unsubscribe_msg(kind: &str, address: &str) -> String {
    json!({
        "method": "unsubscribe",
        "subscription": { "type": kind, "user": address },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnum_tolerates_garbage() {
        assert_eq!(fnum("123.5"), 123.5);
        assert_eq!(fnum(" -2 "), -2.0);
        assert_eq!(fnum(""), 0.0);
        assert_eq!(fnum("n/a"), 0.0);
    }

    #[test]
    fn fill_deserializes_from_venue_json() {
        let raw = r#"{
            "coin": "BTC",
            "px": "50000.0",
            "sz": "0.5",
            "side": "B",
            "time": 1700000000000,
            "startPosition": "-0.25",
            "closedPnl": "12.5",
            "hash": "0xabc",
            "tid": 7,
            "oid": 9,
            "dir": "Open Long",
            "feeToken": "USDC"
        }"#;
        let fill: HlFill = serde_json::from_str(raw).unwrap();
        assert_eq!(fill.coin, "BTC");
        assert_eq!(fnum(&fill.start_position), -0.25);
        assert_eq!(fill.tid, 7);
    }

    #[test]
    fn subscribe_msg_shape() {
        let msg = ws_subscribe_msg("userFills", "0xabc");
        let v: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["method"], "subscribe");
        assert_eq!(v["subscription"]["type"], "userFills");
        assert_eq!(v["subscription"]["user"], "0xabc");
    }
}
