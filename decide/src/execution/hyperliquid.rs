//! Hyperliquid venue adapter.
//!
//! Reads ride the shared info client (clearinghouse state, l2 book, asset
//! contexts). Writes post signed actions to the exchange endpoint through
//! the configured API agent credentials.

use anyhow::{Context, Result};
use async_trait::async_trait;
use common::assets::{Asset, Direction};
use common::hyperliquid::{fnum, HlClient};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::adapter::{
    AccountSnapshot, ExchangeAdapter, OrderFill, Orderbook, StopPair, Venue, VenuePosition,
};
use super::signing::{hmac_sha256_hex, now_ms};

pub struct HyperliquidAdapter {
    info: Arc<HlClient>,
    http: reqwest::Client,
    base: String,
    account_address: String,
    api_key: String,
    api_secret: String,
}

impl HyperliquidAdapter {
    pub fn new(
        info: Arc<HlClient>,
        base: &str,
        account_address: &str,
        api_key: Option<String>,
        api_secret: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            info,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("failed to build Hyperliquid exchange client")?,
            base: base.trim_end_matches('/').to_string(),
            account_address: account_address.to_lowercase(),
            api_key: api_key.unwrap_or_default(),
            api_secret: api_secret.unwrap_or_default(),
        })
    }

    /// Post one signed action to the exchange endpoint.
    async fn exchange(&self, action: Value) -> Result<Value> {
        if self.api_key.is_empty() || self.api_secret.is_empty() {
            anyhow::bail!("Hyperliquid credentials are not configured");
        }
        let nonce = now_ms();
        let body = json!({ "action": action, "nonce": nonce });
        let signature = hmac_sha256_hex(&self.api_secret, &body.to_string());

        let resp = self
            .http
            .post(format!("{}/exchange", self.base))
            .header("x-api-key", &self.api_key)
            .header("x-signature", signature)
            .json(&body)
            .send()
            .await
            .context("Hyperliquid exchange request failed")?;
        let status = resp.status();
        let value: Value = resp.json().await.context("invalid exchange response")?;
        if !status.is_success() || value.get("status").and_then(Value::as_str) == Some("err") {
            anyhow::bail!("Hyperliquid order rejected: {value}");
        }
        Ok(value)
    }

    fn parse_fill(value: &Value, fallback_size: f64) -> OrderFill {
        // Response shape: statuses[0].filled.{oid, avgPx, totalSz}.
        let filled = &value["response"]["data"]["statuses"][0]["filled"];
        OrderFill {
            order_id: filled["oid"]
                .as_u64()
                .map(|o| o.to_string())
                .unwrap_or_default(),
            avg_price: filled["avgPx"].as_str().map(fnum).unwrap_or(0.0),
            filled_size: filled["totalSz"]
                .as_str()
                .map(fnum)
                .filter(|s| *s > 0.0)
                .unwrap_or(fallback_size),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn venue(&self) -> Venue {
        Venue::Hyperliquid
    }

    async fn connect(&self) -> Result<()> {
        self.info.all_mids().await.map(|_| ())
    }

    async fn account(&self) -> Result<AccountSnapshot> {
        let state = self.info.user_state(&self.account_address).await?;

        let mut positions = Vec::new();
        let mut total_notional = 0.0;
        for ap in &state.asset_positions {
            let Ok(asset) = ap.position.coin.parse::<Asset>() else {
                continue;
            };
            let size = fnum(&ap.position.szi);
            if size.abs() <= f64::EPSILON {
                continue;
            }
            let entry = ap.position.entry_px.as_deref().map(fnum).unwrap_or(0.0);
            let notional = (size * entry).abs();
            total_notional += notional;
            positions.push(VenuePosition {
                asset,
                size,
                entry_price: entry,
                notional_usd: notional,
            });
        }

        Ok(AccountSnapshot {
            equity_usd: fnum(&state.margin_summary.account_value),
            maintenance_margin_usd: fnum(&state.cross_maintenance_margin_used),
            total_notional_usd: total_notional,
            positions,
        })
    }

    async fn mark_price(&self, asset: Asset) -> Result<f64> {
        let mids = self.info.all_mids().await?;
        mids.get(asset.hl_coin())
            .copied()
            .filter(|p| *p > 0.0)
            .context("mid price unavailable")
    }

    async fn orderbook(&self, asset: Asset) -> Result<Orderbook> {
        // l2Book returns { levels: [bids, asks] } with {px, sz} entries.
        let value = self
            .http
            .post(format!("{}/info", self.base))
            .json(&json!({ "type": "l2Book", "coin": asset.hl_coin() }))
            .send()
            .await?
            .json::<Value>()
            .await?;

        let parse_side = |side: &Value| -> Vec<(f64, f64)> {
            side.as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|l| {
                            let px = l.get("px")?.as_str().map(fnum)?;
                            let sz = l.get("sz")?.as_str().map(fnum)?;
                            Some((px, sz))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        let bids = parse_side(&value["levels"][0]);
        let asks = parse_side(&value["levels"][1]);
        let mid = match (bids.first(), asks.first()) {
            (Some((b, _)), Some((a, _))) => (b + a) / 2.0,
            _ => self.mark_price(asset).await?,
        };
        Ok(Orderbook { mid, bids, asks })
    }

    async fn funding_rate_bps(&self, asset: Asset) -> Result<f64> {
        // metaAndAssetCtxs: [meta, [ctx per asset]] with ctx.funding.
        let value = self
            .http
            .post(format!("{}/info", self.base))
            .json(&json!({ "type": "metaAndAssetCtxs" }))
            .send()
            .await?
            .json::<Value>()
            .await?;

        let universe = value[0]["universe"]
            .as_array()
            .context("unexpected meta shape")?;
        let idx = universe
            .iter()
            .position(|u| u["name"].as_str() == Some(asset.hl_coin()))
            .context("asset not in universe")?;
        let funding = value[1][idx]["funding"]
            .as_str()
            .map(fnum)
            .context("funding missing")?;
        // Fraction per interval → bps.
        Ok(funding * 10_000.0)
    }

    fn taker_fees_bps(&self) -> f64 {
        // Round trip at the base taker tier.
        4.5
    }

    async fn open_market(
        &self,
        asset: Asset,
        direction: Direction,
        size: f64,
        slippage_tolerance_pct: f64,
    ) -> Result<OrderFill> {
        let mark = self.mark_price(asset).await?;
        let limit = match direction {
            Direction::Long => mark * (1.0 + slippage_tolerance_pct),
            Direction::Short => mark * (1.0 - slippage_tolerance_pct),
        };
        let action = json!({
            "type": "order",
            "orders": [{
                "coin": asset.hl_coin(),
                "isBuy": direction == Direction::Long,
                "sz": self.format_size(asset, size),
                "limitPx": limit,
                "orderType": { "limit": { "tif": "Ioc" } },
                "reduceOnly": false,
            }],
        });
        let resp = self.exchange(action).await?;
        Ok(Self::parse_fill(&resp, size))
    }

    async fn close_market(&self, asset: Asset, direction: Direction, size: f64) -> Result<OrderFill> {
        let mark = self.mark_price(asset).await?;
        // Closing a long sells; allow 1% through the book.
        let closing_buy = direction == Direction::Short;
        let limit = if closing_buy { mark * 1.01 } else { mark * 0.99 };
        let action = json!({
            "type": "order",
            "orders": [{
                "coin": asset.hl_coin(),
                "isBuy": closing_buy,
                "sz": self.format_size(asset, size),
                "limitPx": limit,
                "orderType": { "limit": { "tif": "Ioc" } },
                "reduceOnly": true,
            }],
        });
        let resp = self.exchange(action).await?;
        Ok(Self::parse_fill(&resp, size))
    }

    async fn set_leverage(&self, asset: Asset, leverage: f64) -> Result<()> {
        let action = json!({
            "type": "updateLeverage",
            "coin": asset.hl_coin(),
            "isCross": true,
            "leverage": leverage as u32,
        });
        self.exchange(action).await.map(|_| ())
    }

    async fn place_stop_pair(
        &self,
        asset: Asset,
        direction: Direction,
        size: f64,
        stop_price: f64,
        take_profit_price: f64,
    ) -> Result<StopPair> {
        let closing_buy = direction == Direction::Short;
        let sz = self.format_size(asset, size);
        let trigger = |px: f64, tpsl: &str| {
            json!({
                "coin": asset.hl_coin(),
                "isBuy": closing_buy,
                "sz": sz,
                "limitPx": px,
                "orderType": { "trigger": { "triggerPx": px, "isMarket": true, "tpsl": tpsl } },
                "reduceOnly": true,
            })
        };
        // One grouped action so the pair lands atomically.
        let action = json!({
            "type": "order",
            "grouping": "positionTpsl",
            "orders": [trigger(stop_price, "sl"), trigger(take_profit_price, "tp")],
        });
        let resp = self.exchange(action).await?;
        let statuses = &resp["response"]["data"]["statuses"];
        let oid = |i: usize| -> String {
            statuses[i]["resting"]["oid"]
                .as_u64()
                .map(|o| o.to_string())
                .unwrap_or_default()
        };
        Ok(StopPair {
            sl_order_id: oid(0),
            tp_order_id: oid(1),
        })
    }

    async fn cancel_stop_pair(&self, asset: Asset, pair: &StopPair) -> Result<()> {
        let cancel = |oid: &str| {
            json!({ "coin": asset.hl_coin(), "oid": oid.parse::<u64>().unwrap_or(0) })
        };
        let action = json!({
            "type": "cancel",
            "cancels": [cancel(&pair.sl_order_id), cancel(&pair.tp_order_id)],
        });
        self.exchange(action).await.map(|_| ())
    }

    fn format_size(&self, asset: Asset, size: f64) -> f64 {
        // Lot steps: BTC 1e-5, ETH 1e-4.
        let step = match asset {
            Asset::Btc => 1e-5,
            Asset::Eth => 1e-4,
        };
        (size / step).floor() * step
    }
}
