//! 🧾 Fill normalization and idempotent ingestion.
//!
//! Every raw venue fill becomes the canonical [`FillEvent`]: inserted keyed
//! on `dedup_hash` (ON CONFLICT DO NOTHING), then published to `fills.v1`
//! only when the insert actually landed — so at-least-once redelivery from
//! the venue socket, the polling path, and chain backfill all collapse into
//! one row and one bus message.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use common::assets::Asset;
use common::bus::{subjects, Bus, FillEvent};
use common::db::Db;
use common::hyperliquid::{fnum, HlFill};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::fanout::EventRing;
use crate::metrics;

pub struct FillIngestor {
    db: Arc<Db>,
    bus: Arc<Bus>,
    ring: Arc<EventRing>,
}

impl FillIngestor {
    pub fn new(db: Arc<Db>, bus: Arc<Bus>, ring: Arc<EventRing>) -> Self {
        Self { db, bus, ring }
    }

    /// Normalize, insert, publish. Returns true when the fill was new.
    pub async fn ingest(&self, address: &str, raw: &HlFill) -> Result<bool> {
        let m = metrics::get();

        let Some(event) = normalize(address, raw) else {
            // Non-tracked coin; not an error.
            return Ok(false);
        };

        let inserted = {
            let client = self.db.lock().await;
            client
                .execute(
                    "INSERT INTO fills
                       (fill_id, address, asset, side, size, price, start_position,
                        realized_pnl, ts, action_label, dedup_hash)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                     ON CONFLICT (dedup_hash) DO NOTHING",
                    &[
                        &event.fill_id,
                        &event.address,
                        &event.asset.as_str(),
                        &event.side,
                        &event.size,
                        &event.price,
                        &event.start_position,
                        &event.realized_pnl,
                        &event.ts,
                        &event.action_label,
                        &event.dedup_hash,
                    ],
                )
                .await?
        };

        if inserted == 0 {
            m.fills_duplicate.inc();
            debug!(fill_id = %event.fill_id, "duplicate fill dropped");
            return Ok(false);
        }
        m.fills_ingested.inc();

        self.bus.publish_json(subjects::FILLS, &event).await?;
        m.fills_published.inc();

        self.ring.push(serde_json::json!({
            "type": "fill",
            "address": event.address,
            "asset": event.asset,
            "side": event.side,
            "size": event.size,
            "price": event.price,
            "ts": event.ts,
        }));

        Ok(true)
    }
}

/// Convert a venue fill to the canonical shape; `None` for untracked coins.
pub fn normalize(address: &str, raw: &HlFill) -> Option<FillEvent> {
    let asset = Asset::from_str(&raw.coin).ok()?;
    let address = address.to_lowercase();

    let side = match raw.side.as_str() {
        "B" | "b" => "buy",
        _ => "sell",
    }
    .to_string();

    let ts: DateTime<Utc> = Utc
        .timestamp_millis_opt(raw.time as i64)
        .single()
        .unwrap_or_else(Utc::now);

    let realized_pnl = raw
        .closed_pnl
        .as_deref()
        .map(fnum)
        .filter(|p| p.abs() > f64::EPSILON);

    Some(FillEvent {
        fill_id: format!("{}-{}", raw.hash, raw.tid),
        dedup_hash: dedup_hash(&address, &raw.coin, &raw.hash, raw.tid, raw.time),
        address,
        asset,
        side,
        size: fnum(&raw.sz).abs(),
        price: fnum(&raw.px),
        start_position: fnum(&raw.start_position),
        realized_pnl,
        ts,
        action_label: raw.dir.clone(),
    })
}

/// Stable identity for a fill across delivery paths.
pub fn dedup_hash(address: &str, coin: &str, tx_hash: &str, tid: u64, time_ms: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(address.as_bytes());
    hasher.update(b"|");
    hasher.update(coin.as_bytes());
    hasher.update(b"|");
    hasher.update(tx_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(tid.to_le_bytes());
    hasher.update(b"|");
    hasher.update(time_ms.to_le_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_fill() -> HlFill {
        serde_json::from_value(serde_json::json!({
            "coin": "BTC",
            "px": "50000",
            "sz": "0.5",
            "side": "A",
            "time": 1_700_000_000_000u64,
            "startPosition": "1.5",
            "closedPnl": "250.0",
            "hash": "0xdead",
            "tid": 42,
            "oid": 7,
            "dir": "Close Long"
        }))
        .unwrap()
    }

    #[test]
    fn normalizes_sides_and_signs() {
        let event = normalize("0xAbC", &raw_fill()).unwrap();
        assert_eq!(event.address, "0xabc");
        assert_eq!(event.asset, Asset::Btc);
        assert_eq!(event.side, "sell");
        assert_eq!(event.size, 0.5);
        assert_eq!(event.signed_size(), -0.5);
        assert_eq!(event.resulting_position(), 1.0);
        assert_eq!(event.realized_pnl, Some(250.0));
        assert_eq!(event.action_label, "Close Long");
    }

    #[test]
    fn untracked_coin_is_skipped() {
        let mut raw = raw_fill();
        raw.coin = "DOGE".into();
        assert!(normalize("0xabc", &raw).is_none());
    }

    #[test]
    fn dedup_hash_is_stable_and_distinct() {
        let a = dedup_hash("0xabc", "BTC", "0xdead", 42, 1_700_000_000_000);
        let b = dedup_hash("0xabc", "BTC", "0xdead", 42, 1_700_000_000_000);
        let c = dedup_hash("0xabc", "BTC", "0xdead", 43, 1_700_000_000_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn zero_closed_pnl_maps_to_none() {
        let mut raw = raw_fill();
        raw.closed_pnl = Some("0.0".into());
        let event = normalize("0xabc", &raw).unwrap();
        assert_eq!(event.realized_pnl, None);
    }
}
