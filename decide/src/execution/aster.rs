//! Aster venue adapter (futures-API style REST with query-string HMAC).

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::assets::{Asset, Direction};
use serde_json::Value;
use std::time::Duration;

use super::adapter::{
    AccountSnapshot, ExchangeAdapter, OrderFill, Orderbook, StopPair, Venue, VenuePosition,
};
use super::signing::{hmac_sha256_hex, now_ms};

pub struct AsterAdapter {
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

impl AsterAdapter {
    pub fn new(base: &str, api_key: Option<String>, api_secret: Option<String>) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("failed to build Aster client")?,
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.unwrap_or_default(),
            api_secret: api_secret.unwrap_or_default(),
        })
    }

    fn require_creds(&self) -> Result<()> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            anyhow::bail!("Aster credentials are not configured");
        }
        Ok(())
    }

    async fn signed_get(&self, path: &str, query: &str) -> Result<Value> {
        self.require_creds()?;
        let query = format!("{query}&timestamp={}", now_ms());
        let signature = hmac_sha256_hex(&self.api_secret, &query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base);
        let resp = self
            .http
            .get(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let status = resp.status();
        let value: Value = resp.json().await?;
        if !status.is_success() {
            anyhow::bail!("Aster request failed ({status}): {value}");
        }
        Ok(value)
    }

    async fn signed_post(&self, path: &str, query: String) -> Result<Value> {
        self.require_creds()?;
        let query = format!("{query}&timestamp={}", now_ms());
        let signature = hmac_sha256_hex(&self.api_secret, &query);
        let url = format!("{}{path}?{query}&signature={signature}", self.base);
        let resp = self
            .http
            .post(url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        let status = resp.status();
        let value: Value = resp.json().await?;
        if !status.is_success() {
            anyhow::bail!("Aster order failed ({status}): {value}");
        }
        Ok(value)
    }

    async fn public_get(&self, path: &str, query: &str) -> Result<Value> {
        let url = format!("{}{path}?{query}", self.base);
        Ok(self.http.get(url).send().await?.json().await?)
    }
}

#[async_trait]
impl ExchangeAdapter for AsterAdapter {
    fn venue(&self) -> Venue {
        Venue::Aster
    }

    async fn connect(&self) -> Result<()> {
        self.public_get("/fapi/v1/ping", "").await.map(|_| ())
    }

    async fn account(&self) -> Result<AccountSnapshot> {
        let value = self.signed_get("/fapi/v2/account", "").await?;

        let equity = parse_f64(&value["totalMarginBalance"]);
        let maintenance = parse_f64(&value["totalMaintMargin"]);

        let mut positions = Vec::new();
        let mut total_notional = 0.0;
        if let Some(raw) = value["positions"].as_array() {
            for p in raw {
                let sym = p["symbol"].as_str().unwrap_or_default();
                let asset = match sym {
                    "BTCUSDT" => Asset::Btc,
                    "ETHUSDT" => Asset::Eth,
                    _ => continue,
                };
                let size = parse_f64(&p["positionAmt"]);
                if size.abs() <= f64::EPSILON {
                    continue;
                }
                let entry = parse_f64(&p["entryPrice"]);
                let notional = parse_f64(&p["notional"]).abs();
                total_notional += notional;
                positions.push(VenuePosition {
                    asset,
                    size,
                    entry_price: entry,
                    notional_usd: notional,
                });
            }
        }

        // USDT-margined balances count 1:1 as USD.
        Ok(AccountSnapshot {
            equity_usd: equity,
            maintenance_margin_usd: maintenance,
            total_notional_usd: total_notional,
            positions,
        })
    }

    async fn mark_price(&self, asset: Asset) -> Result<f64> {
        let value = self
            .public_get("/fapi/v1/premiumIndex", &format!("symbol={}", symbol(asset)))
            .await?;
        let price = parse_f64(&value["markPrice"]);
        if price <= 0.0 {
            anyhow::bail!("mark price unavailable");
        }
        Ok(price)
    }

    async fn orderbook(&self, asset: Asset) -> Result<Orderbook> {
        let value = self
            .public_get("/fapi/v1/depth", &format!("symbol={}&limit=50", symbol(asset)))
            .await?;
        let parse_side = |side: &Value| -> Vec<(f64, f64)> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|l| {
                            Some((parse_f64(l.get(0)?), parse_f64(l.get(1)?)))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let bids = parse_side(&value["bids"]);
        let asks = parse_side(&value["asks"]);
        let mid = match (bids.first(), asks.first()) {
            (Some((b, _)), Some((a, _))) => (b + a) / 2.0,
            _ => anyhow::bail!("empty orderbook"),
        };
        Ok(Orderbook { mid, bids, asks })
    }

    async fn funding_rate_bps(&self, asset: Asset) -> Result<f64> {
        let value = self
            .public_get("/fapi/v1/premiumIndex", &format!("symbol={}", symbol(asset)))
            .await?;
        Ok(parse_f64(&value["lastFundingRate"]) * 10_000.0)
    }

    fn taker_fees_bps(&self) -> f64 {
        5.0
    }

    async fn open_market(
        &self,
        asset: Asset,
        direction: Direction,
        size: f64,
        _slippage_tolerance_pct: f64,
    ) -> Result<OrderFill> {
        let side = match direction {
            Direction::Long => "BUY",
            Direction::Short => "SELL",
        };
        let query = format!(
            "symbol={}&side={side}&type=MARKET&quantity={}&newOrderRespType=RESULT",
            symbol(asset),
            self.format_size(asset, size)
        );
        let value = self.signed_post("/fapi/v1/order", query).await?;
        Ok(OrderFill {
            order_id: value["orderId"]
                .as_u64()
                .map(|o| o.to_string())
                .unwrap_or_default(),
            avg_price: parse_f64(&value["avgPrice"]),
            filled_size: parse_f64(&value["executedQty"]).max(0.0),
        })
    }

    async fn close_market(&self, asset: Asset, direction: Direction, size: f64) -> Result<OrderFill> {
        let side = match direction {
            Direction::Long => "SELL",
            Direction::Short => "BUY",
        };
        let query = format!(
            "symbol={}&side={side}&type=MARKET&quantity={}&reduceOnly=true&newOrderRespType=RESULT",
            symbol(asset),
            self.format_size(asset, size)
        );
        let value = self.signed_post("/fapi/v1/order", query).await?;
        Ok(OrderFill {
            order_id: value["orderId"]
                .as_u64()
                .map(|o| o.to_string())
                .unwrap_or_default(),
            avg_price: parse_f64(&value["avgPrice"]),
            filled_size: parse_f64(&value["executedQty"]).max(0.0),
        })
    }

    async fn set_leverage(&self, asset: Asset, leverage: f64) -> Result<()> {
        let query = format!("symbol={}&leverage={}", symbol(asset), leverage as u32);
        self.signed_post("/fapi/v1/leverage", query).await.map(|_| ())
    }

    async fn place_stop_pair(
        &self,
        asset: Asset,
        direction: Direction,
        size: f64,
        stop_price: f64,
        take_profit_price: f64,
    ) -> Result<StopPair> {
        let side = match direction {
            Direction::Long => "SELL",
            Direction::Short => "BUY",
        };
        let qty = self.format_size(asset, size);

        let sl_query = format!(
            "symbol={}&side={side}&type=STOP_MARKET&stopPrice={stop_price}&quantity={qty}&reduceOnly=true",
            symbol(asset)
        );
        let sl = self.signed_post("/fapi/v1/order", sl_query).await?;
        let sl_id = sl["orderId"].as_u64().map(|o| o.to_string()).unwrap_or_default();

        let tp_query = format!(
            "symbol={}&side={side}&type=TAKE_PROFIT_MARKET&stopPrice={take_profit_price}&quantity={qty}&reduceOnly=true",
            symbol(asset)
        );
        match self.signed_post("/fapi/v1/order", tp_query).await {
            Ok(tp) => Ok(StopPair {
                sl_order_id: sl_id,
                tp_order_id: tp["orderId"].as_u64().map(|o| o.to_string()).unwrap_or_default(),
            }),
            Err(e) => {
                // Atomicity: a lone SL must not survive a failed TP.
                let cancel = format!("symbol={}&orderId={sl_id}", symbol(asset));
                let _ = self.signed_post("/fapi/v1/cancel", cancel).await;
                Err(e.context("take-profit leg failed; stop-loss rolled back"))
            }
        }
    }

    async fn cancel_stop_pair(&self, asset: Asset, pair: &StopPair) -> Result<()> {
        for oid in [&pair.sl_order_id, &pair.tp_order_id] {
            if oid.is_empty() {
                continue;
            }
            let query = format!("symbol={}&orderId={oid}", symbol(asset));
            self.signed_post("/fapi/v1/cancel", query).await?;
        }
        Ok(())
    }

    fn format_size(&self, asset: Asset, size: f64) -> f64 {
        let step = match asset {
            Asset::Btc => 1e-3,
            Asset::Eth => 1e-2,
        };
        (size / step).floor() * step
    }
}
