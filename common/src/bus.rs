//! 📡 Message bus contract and JetStream client wrapper.
//!
//! All cross-service coordination rides five durable subjects on a single
//! JetStream stream. Payloads are versioned JSON; consumers ignore unknown
//! fields and deduplicate on the payload id, so redelivery under the
//! at-least-once contract is harmless.

use anyhow::{anyhow, Context, Result};
use async_nats::jetstream::{self, consumer};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::assets::{Asset, Direction};

/// Stream holding every SigmaPilot subject.
pub const STREAM_NAME: &str = "SIGMAPILOT";

pub mod subjects {
    /// Scout → Sage: scored leaderboard candidates.
    pub const CANDIDATES: &str = "candidates.v1";
    /// Sage → Decide: per-trader selection scores.
    pub const SCORES: &str = "scores.v1";
    /// Stream → Decide: normalized fills.
    pub const FILLS: &str = "fills.v1";
    /// Decide → persistence: emitted consensus signals.
    pub const SIGNALS: &str = "signals.v1";
    /// Decide → Sage + persistence: closed episode outcomes.
    pub const OUTCOMES: &str = "outcomes.v1";

    pub const ALL: [&str; 5] = [CANDIDATES, SCORES, FILLS, SIGNALS, OUTCOMES];
}

// ── Payloads ─────────────────────────────────────────────────────────────────

/// A leaderboard candidate that survived Scout's quality gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvent {
    pub address: String,
    #[serde(default)]
    pub nickname: Option<String>,
    pub weight: f64,
    pub pnl_30d: f64,
    pub roi_30d: f64,
    pub account_value: f64,
    pub weekly_volume: f64,
    pub orders_per_day: f64,
    pub ts: DateTime<Utc>,
}

/// One trader's Thompson-sampled selection result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEvent {
    pub address: String,
    pub weight: f64,
    pub sampled_mu: f64,
    pub kappa: f64,
    pub selected: bool,
    pub ts: DateTime<Utc>,
}

/// Canonical normalized fill (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: String,
    pub address: String,
    pub asset: Asset,
    /// "buy" or "sell" as reported by the venue.
    pub side: String,
    /// Unsigned base-unit quantity.
    pub size: f64,
    pub price: f64,
    /// Signed position before this fill was applied.
    pub start_position: f64,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub action_label: String,
    pub dedup_hash: String,
}

impl FillEvent {
    /// Signed size: buys add, sells subtract.
    pub fn signed_size(&self) -> f64 {
        if self.side.eq_ignore_ascii_case("buy") {
            self.size
        } else {
            -self.size
        }
    }

    /// Position after this fill is applied.
    pub fn resulting_position(&self) -> f64 {
        self.start_position + self.signed_size()
    }
}

/// Emitted consensus signal (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEvent {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub asset: Asset,
    pub direction: Direction,
    pub n_traders: u32,
    pub n_agree: u32,
    pub majority_pct: f64,
    pub effective_k: f64,
    pub p_win: f64,
    pub ev_net_r: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub target_exchange: String,
    pub fees_bps: f64,
    pub slippage_bps: f64,
    pub funding_bps: f64,
}

/// Closed episode outcome, consumed by Sage for posterior updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub episode_id: Uuid,
    #[serde(default)]
    pub signal_id: Option<Uuid>,
    pub address: String,
    pub asset: Asset,
    pub direction: Direction,
    pub result_r: f64,
    pub realized_pnl: f64,
    pub closed_ts: DateTime<Utc>,
    pub close_reason: String,
}

// ── Client wrapper ───────────────────────────────────────────────────────────

/// Messages stream returned by [`Bus::durable_subscribe`].
pub type Subscription = consumer::pull::Stream;

/// Thin JetStream wrapper: one connection per service, explicit-ack pull
/// consumers named `<service>-<subject>`.
pub struct Bus {
    js: jetstream::Context,
}

impl Bus {
    /// Connect and make sure the SigmaPilot stream exists with all five
    /// subjects. Creating an already-existing stream is a no-op.
    pub async fn connect(nats_url: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url)
            .await
            .with_context(|| format!("failed to connect to NATS at {nats_url}"))?;
        let js = jetstream::new(client);

        js.get_or_create_stream(jetstream::stream::Config {
            name: STREAM_NAME.to_string(),
            subjects: subjects::ALL.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
        .await
        .map_err(|e| anyhow!("failed to ensure stream {STREAM_NAME}: {e}"))?;

        info!("📡 Bus connected ({nats_url}), stream {STREAM_NAME} ready");
        Ok(Self { js })
    }

    /// Publish a JSON payload and wait for the broker ack.
    pub async fn publish_json<T: Serialize>(&self, subject: &str, msg: &T) -> Result<()> {
        let payload = serde_json::to_vec(msg).context("failed to serialize bus payload")?;
        self.js
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| anyhow!("publish to {subject} failed: {e}"))?
            .await
            .map_err(|e| anyhow!("publish ack for {subject} failed: {e}"))?;
        debug!(subject, "bus message published");
        Ok(())
    }

    /// Create (or resume) a durable explicit-ack pull consumer on `subject`.
    ///
    /// The durable name makes redelivery resume where the consumer left off
    /// after a restart; unacked messages are redelivered, hence the
    /// [`Deduplicator`] on the consuming side.
    pub async fn durable_subscribe(&self, durable: &str, subject: &str) -> Result<Subscription> {
        let stream = self
            .js
            .get_stream(STREAM_NAME)
            .await
            .map_err(|e| anyhow!("failed to open stream {STREAM_NAME}: {e}"))?;

        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(
                durable,
                consumer::pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow!("failed to create consumer {durable}: {e}"))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| anyhow!("failed to open message stream for {durable}: {e}"))?;

        info!(durable, subject, "📻 durable subscription ready");
        Ok(messages)
    }
}

/// Decode a bus message payload, tolerating unknown fields.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).context("failed to decode bus payload")
}

// ── Consumer-side deduplication ──────────────────────────────────────────────

/// Drops payloads already seen within the TTL window.
///
/// At-least-once delivery means every consumer can see a message twice:
/// once on the original delivery and again after an ack is lost or a
/// service restarts mid-batch. Keyed on the payload id (`fill_id`,
/// `signal_id`, `episode_id`), capacity-bounded with stale-entry eviction.
pub struct Deduplicator {
    seen: Mutex<HashMap<String, Instant>>,
    max_capacity: usize,
    ttl: Duration,
}

impl Deduplicator {
    pub fn new(max_capacity: usize, ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::with_capacity(max_capacity)),
            max_capacity,
            ttl,
        }
    }

    /// Returns true if `id` was already seen within the TTL (drop it),
    /// false if it is fresh (process it, and it is now marked seen).
    pub fn is_duplicate(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some(last) = seen.get(id) {
            if now.duration_since(*last) < self.ttl {
                return true;
            }
        }

        seen.insert(id.to_string(), now);

        if seen.len() > self.max_capacity {
            let ttl = self.ttl;
            seen.retain(|_, last| now.duration_since(*last) < ttl);
        }

        false
    }

    /// Un-mark an id so a redelivery is processed again. Used when handling
    /// failed after the duplicate check already recorded the id.
    pub fn forget(&self, id: &str) {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_drops_repeats() {
        let dedup = Deduplicator::new(100, Duration::from_secs(60));
        assert!(!dedup.is_duplicate("fill-1"));
        assert!(dedup.is_duplicate("fill-1"));
        assert!(!dedup.is_duplicate("fill-2"));
        assert!(dedup.is_duplicate("fill-2"));
    }

    #[test]
    fn dedup_forget_allows_retry() {
        let dedup = Deduplicator::new(100, Duration::from_secs(60));
        assert!(!dedup.is_duplicate("ep-1"));
        assert!(dedup.is_duplicate("ep-1"));
        dedup.forget("ep-1");
        assert!(!dedup.is_duplicate("ep-1"));
    }

    #[test]
    fn dedup_expires_after_ttl() {
        let dedup = Deduplicator::new(100, Duration::from_millis(50));
        assert!(!dedup.is_duplicate("fill-1"));
        std::thread::sleep(Duration::from_millis(80));
        assert!(!dedup.is_duplicate("fill-1"));
    }

    #[test]
    fn fill_event_signed_size() {
        let mut fill = FillEvent {
            fill_id: "1".into(),
            address: "0xabc".into(),
            asset: Asset::Btc,
            side: "buy".into(),
            size: 2.0,
            price: 50_000.0,
            start_position: -0.5,
            realized_pnl: None,
            ts: Utc::now(),
            action_label: String::new(),
            dedup_hash: "h".into(),
        };
        assert_eq!(fill.signed_size(), 2.0);
        assert_eq!(fill.resulting_position(), 1.5);

        fill.side = "sell".into();
        assert_eq!(fill.signed_size(), -2.0);
        assert_eq!(fill.resulting_position(), -2.5);
    }

    #[test]
    fn payloads_ignore_unknown_fields() {
        let raw = r#"{
            "address": "0xabc",
            "weight": 0.1,
            "sampled_mu": 0.4,
            "kappa": 12.0,
            "selected": true,
            "ts": "2026-01-05T00:00:00Z",
            "some_future_field": {"nested": true}
        }"#;
        let event: ScoreEvent = decode(raw.as_bytes()).unwrap();
        assert!(event.selected);
        assert_eq!(event.kappa, 12.0);
    }
}
