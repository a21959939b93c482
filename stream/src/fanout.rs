//! 📺 Real-time fan-out to dashboard subscribers.
//!
//! A bounded ring buffer of the most recent events is the source of truth.
//! Every event carries a monotonic `seq`; each subscriber keeps its own
//! cursor and the push loop sends everything past it, capped per tick.
//! Clients may ask for a bounded replay with `{"since": seq}` right after
//! the hello. A heartbeat ping evicts dead connections.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::api::ApiState;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct StampedEvent {
    pub seq: u64,
    pub payload: Value,
}

/// Bounded ring of recent events; oldest entries fall off the front.
pub struct EventRing {
    buf: RwLock<VecDeque<StampedEvent>>,
    next_seq: AtomicU64,
    capacity: usize,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: RwLock::new(VecDeque::with_capacity(capacity)),
            next_seq: AtomicU64::new(1),
            capacity,
        }
    }

    /// Stamp and store an event; returns its sequence number.
    pub fn push(&self, payload: Value) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut buf = self.buf.write();
        if buf.len() == self.capacity {
            buf.pop_front();
        }
        buf.push_back(StampedEvent { seq, payload });
        seq
    }

    /// Events with `seq > after`, oldest first, capped at `limit`.
    pub fn since(&self, after: u64, limit: usize) -> Vec<StampedEvent> {
        let buf = self.buf.read();
        buf.iter()
            .filter(|e| e.seq > after)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn latest_seq(&self) -> u64 {
        self.next_seq.load(Ordering::Relaxed).saturating_sub(1)
    }

    pub fn len(&self) -> usize {
        self.buf.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── WebSocket endpoint ───────────────────────────────────────────────────────

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber(socket, state))
}

async fn handle_subscriber(socket: WebSocket, state: ApiState) {
    let m = metrics::get();
    m.fanout_subscribers.inc();
    info!("📺 fan-out subscriber connected");

    let (mut sender, mut receiver) = socket.split();
    let ring = state.ring.clone();
    let feed_cfg = state.feed_config.clone();

    // Hello with the current cursor position and last known prices.
    let (btc, eth) = state.prices.snapshot();
    let hello = json!({
        "type": "hello",
        "latestSeq": ring.latest_seq(),
        "prices": { "btc": btc, "eth": eth },
    });
    if sender.send(Message::Text(hello.to_string())).await.is_err() {
        m.fanout_subscribers.dec();
        return;
    }

    let mut cursor = ring.latest_seq();
    let mut last_prices = (btc, eth);

    let mut push_tick = interval(Duration::from_millis(1_000));
    let mut heartbeat = interval(Duration::from_secs(feed_cfg.heartbeat_secs.max(1)));
    heartbeat.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = push_tick.tick() => {
                // Price change notification.
                let now_prices = state.prices.snapshot();
                if now_prices != last_prices {
                    last_prices = now_prices;
                    let msg = json!({ "type": "price", "btc": now_prices.0, "eth": now_prices.1 });
                    if sender.send(Message::Text(msg.to_string())).await.is_err() {
                        break;
                    }
                }

                // Event batch.
                let events = ring.since(cursor, feed_cfg.max_events_per_tick);
                if let Some(last) = events.last() {
                    cursor = last.seq;
                    if send_event_batches(&mut sender, &events).await.is_err() {
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!("heartbeat failed; evicting subscriber");
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Replay request: {"since": seq}.
                        if let Ok(v) = serde_json::from_str::<Value>(&text) {
                            if let Some(since) = v.get("since").and_then(Value::as_u64) {
                                let events = ring.since(since, feed_cfg.max_replay_events);
                                if let Some(last) = events.last() {
                                    cursor = cursor.max(last.seq);
                                }
                                if send_event_batches(&mut sender, &events).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("subscriber receive error: {e}");
                        break;
                    }
                }
            }
        }
    }

    m.fanout_subscribers.dec();
    info!("📺 fan-out subscriber disconnected");
}

/// Send events in 200-element batches as `{"type":"events","events":[...]}`.
async fn send_event_batches<S>(
    sender: &mut S,
    events: &[StampedEvent],
) -> Result<(), axum::Error>
where
    S: futures_util::Sink<Message, Error = axum::Error> + Unpin,
{
    for chunk in events.chunks(200) {
        let batch: Vec<Value> = chunk
            .iter()
            .map(|e| json!({ "seq": e.seq, "event": e.payload }))
            .collect();
        let msg = json!({ "type": "events", "events": batch });
        sender.send(Message::Text(msg.to_string())).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_caps_and_orders() {
        let ring = EventRing::new(3);
        for i in 0..5 {
            ring.push(json!({ "i": i }));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest_seq(), 5);

        let all = ring.since(0, 100);
        let seqs: Vec<u64> = all.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
    }

    #[test]
    fn since_respects_cursor_and_limit() {
        let ring = EventRing::new(100);
        for i in 0..10 {
            ring.push(json!({ "i": i }));
        }
        let events = ring.since(4, 3);
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![5, 6, 7]);

        assert!(ring.since(10, 100).is_empty());
    }
}
