//! Bybit venue adapter (v5 REST, header-signed HMAC).

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::assets::{Asset, Direction};
use serde_json::{json, Value};
use std::time::Duration;

use super::adapter::{
    AccountSnapshot, ExchangeAdapter, OrderFill, Orderbook, StopPair, Venue, VenuePosition,
};
use super::signing::{hmac_sha256_hex, now_ms};

const RECV_WINDOW: &str = "5000";

pub struct BybitAdapter {
    http: reqwest::Client,
    base: String,
    api_key: String,
    api_secret: String,
}

fn symbol(asset: Asset) -> &'static str {
    match asset {
        Asset::Btc => "BTCUSDT",
        Asset::Eth => "ETHUSDT",
    }
}

fn parse_f64(v: &Value) -> f64 {
    v.as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| v.as_f64())
        .unwrap_or(0.0)
}

impl BybitAdapter {
    pub fn new(base: &str, api_key: Option<String>, api_secret: Option<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("failed to build Bybit client")?,
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or_default(),
            api_secret: api_secret.unwrap_or_default(),
        })
    }

    fn require_creds(&self) -> Result<()> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            anyhow::bail!("Bybit credentials are not configured");
        }
        Ok(())
    }

    fn check_ret(value: Value) -> Result<Value> {
        if value["retCode"].as_i64().unwrap_or(-1) != 0 {
            anyhow::bail!(
                "Bybit error {}: {}",
                value["retCode"],
                value["retMsg"].as_str().unwrap_or("unknown")
            );
        }
        Ok(value)
    }

    /// v5 signature: HMAC(timestamp + api_key + recv_window + payload).
    async fn signed_get(&self, path: &str, query: &str) -> Result<Value> {
        self.require_creds()?;
        let ts = now_ms().to_string();
        let signature = hmac_sha256_hex(
            &self.api_secret,
            &format!("{ts}{}{RECV_WINDOW}{query}", self.api_key),
        );
        let value = self
            .http
            .get(format!("{}{path}?{query}", self.base))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .send()
            .await?
            .json()
            .await?;
        Self::check_ret(value)
    }

    async fn signed_post(&self, path: &str, body: Value) -> Result<Value> {
        self.require_creds()?;
        let ts = now_ms().to_string();
        let payload = body.to_string();
        let signature = hmac_sha256_hex(
            &self.api_secret,
            &format!("{ts}{}{RECV_WINDOW}{payload}", self.api_key),
        );
        let value = self
            .http
            .post(format!("{}{path}", self.base))
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", signature)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        Self::check_ret(value)
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value> {
        let value = self
            .http
            .get(format!("{}{path}?{query}", self.base))
            .send()
            .await?
            .json()
            .await?;
        Self::check_ret(value)
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn venue(&self) -> Venue {
        Venue::Bybit
    }

    async fn connect(&self) -> Result<()> {
        self.public_get("/v5/market/time", "").await.map(|_| ())
    }

    async fn account(&self) -> Result<AccountSnapshot> {
        let wallet = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let account = &wallet["result"]["list"][0];
        // USDT equity treated 1:1 as USD.
        let equity = parse_f64(&account["totalEquity"]);
        let maintenance = parse_f64(&account["totalMaintenanceMargin"]);

        let positions_resp = self
            .signed_get("/v5/position/list", "category=linear&settleCoin=USDT")
            .await?;
        let mut positions = Vec::new();
        let mut total_notional = 0.0;
        if let Some(list) = positions_resp["result"]["list"].as_array() {
            for p in list {
                let asset = match p["symbol"].as_str().unwrap_or_default() {
                    "BTCUSDT" => Asset::Btc,
                    "ETHUSDT" => Asset::Eth,
                    _ => continue,
                };
                let mut size = parse_f64(&p["size"]);
                if p["side"].as_str() == Some("Sell") {
                    size = -size;
                }
                if size.abs() <= f64::EPSILON {
                    continue;
                }
                let entry = parse_f64(&p["avgPrice"]);
                let notional = parse_f64(&p["positionValue"]).abs();
                total_notional += notional;
                positions.push(VenuePosition {
                    asset,
                    size,
                    entry_price: entry,
                    notional_usd: notional,
                });
            }
        }

        Ok(AccountSnapshot {
            equity_usd: equity,
            maintenance_margin_usd: maintenance,
            total_notional_usd: total_notional,
            positions,
        })
    }

    async fn mark_price(&self, asset: Asset) -> Result<f64> {
        let value = self
            .public_get(
                "/v5/market/tickers",
                &format!("category=linear&symbol={}", symbol(asset)),
            )
            .await?;
        let price = parse_f64(&value["result"]["list"][0]["markPrice"]);
        if price <= 0.0 {
            anyhow::bail!("mark price unavailable");
        }
        Ok(price)
    }

    async fn orderbook(&self, asset: Asset) -> Result<Orderbook> {
        let value = self
            .public_get(
                "/v5/market/orderbook",
                &format!("category=linear&symbol={}&limit=50", symbol(asset)),
            )
            .await?;
        let parse_side = |side: &Value| -> Vec<(f64, f64)> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|l| Some((parse_f64(l.get(0)?), parse_f64(l.get(1)?))))
                        .collect()
                })
                .unwrap_or_default()
        };
        let bids = parse_side(&value["result"]["b"]);
        let asks = parse_side(&value["result"]["a"]);
        let mid = match (bids.first(), asks.first()) {
            (Some((b, _)), Some((a, _))) => (b + a) / 2.0,
            _ => anyhow::bail!("empty orderbook"),
        };
        Ok(Orderbook { mid, bids, asks })
    }

    async fn funding_rate_bps(&self, asset: Asset) -> Result<f64> {
        let value = self
            .public_get(
                "/v5/market/tickers",
                &format!("category=linear&symbol={}", symbol(asset)),
            )
            .await?;
        Ok(parse_f64(&value["result"]["list"][0]["fundingRate"]) * 10_000.0)
    }

    fn taker_fees_bps(&self) -> f64 {
        5.5
    }

    async fn open_market(
        &self,
        asset: Asset,
        direction: Direction,
        size: f64,
        _slippage_tolerance_pct: f64,
    ) -> Result<OrderFill> {
        let body = json!({
            "category": "linear",
            "symbol": symbol(asset),
            "side": if direction == Direction::Long { "Buy" } else { "Sell" },
            "orderType": "Market",
            "qty": self.format_size(asset, size).to_string(),
        });
        let value = self.signed_post("/v5/order/create", body).await?;
        Ok(OrderFill {
            order_id: value["result"]["orderId"].as_str().unwrap_or_default().to_string(),
            avg_price: 0.0, // filled price arrives via execution list; mark is close enough
            filled_size: size,
        })
    }

    async fn close_market(&self, asset: Asset, direction: Direction, size: f64) -> Result<OrderFill> {
        let body = json!({
            "category": "linear",
            "symbol": symbol(asset),
            "side": if direction == Direction::Long { "Sell" } else { "Buy" },
            "orderType": "Market",
            "qty": self.format_size(asset, size).to_string(),
            "reduceOnly": true,
        });
        let value = self.signed_post("/v5/order/create", body).await?;
        Ok(OrderFill {
            order_id: value["result"]["orderId"].as_str().unwrap_or_default().to_string(),
            avg_price: 0.0,
            filled_size: size,
        })
    }

    async fn set_leverage(&self, asset: Asset, leverage: f64) -> Result<()> {
        let body = json!({
            "category": "linear",
            "symbol": symbol(asset),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.signed_post("/v5/position/set-leverage", body).await.map(|_| ())
    }

    async fn place_stop_pair(
        &self,
        asset: Asset,
        _direction: Direction,
        _size: f64,
        stop_price: f64,
        take_profit_price: f64,
    ) -> Result<StopPair> {
        // Bybit attaches SL/TP to the position in one call — atomic by
        // construction.
        let body = json!({
            "category": "linear",
            "symbol": symbol(asset),
            "stopLoss": stop_price.to_string(),
            "takeProfit": take_profit_price.to_string(),
            "tpslMode": "Full",
        });
        self.signed_post("/v5/position/trading-stop", body).await?;
        Ok(StopPair {
            sl_order_id: format!("pos-sl-{}", symbol(asset)),
            tp_order_id: format!("pos-tp-{}", symbol(asset)),
        })
    }

    async fn cancel_stop_pair(&self, asset: Asset, _pair: &StopPair) -> Result<()> {
        // Clearing the position-level stops is a zero write.
        let body = json!({
            "category": "linear",
            "symbol": symbol(asset),
            "stopLoss": "0",
            "takeProfit": "0",
            "tpslMode": "Full",
        });
        self.signed_post("/v5/position/trading-stop", body).await.map(|_| ())
    }

    fn format_size(&self, asset: Asset, size: f64) -> f64 {
        let step = match asset {
            Asset::Btc => 1e-3,
            Asset::Eth => 1e-2,
        };
        (size / step).floor() * step
    }
}
