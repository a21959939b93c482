//! 📡 Per-address venue trackers.
//!
//! Every websocket address gets its own task: subscribe to `userFills` and
//! `userPositions`, prime holdings with a one-shot REST snapshot so they are
//! immediately queryable, then forward everything to the fill ingestor.
//! Disconnects reconnect with exponential backoff and full jitter. Polled
//! addresses get a jittered 30–60s loop over the same ingestion path — the
//! dedup hash makes the overlap harmless.
//!
//! A supervisor reconciles running tasks against the subscription manager's
//! transport plan.

use common::assets::Asset;
use common::hyperliquid::{self, fnum, HlClient, HlFill};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fills::FillIngestor;
use crate::metrics;
use crate::subscriptions::{SubscriptionManager, Transport};

const RECONNECT_BASE_MS: u64 = 500;
const RECONNECT_CAP_MS: u64 = 30_000;
const SUPERVISE_INTERVAL_SECS: u64 = 10;

/// Primed holdings per (address, asset), updated live from the feed.
pub type PositionCache = DashMap<(String, Asset), f64>;

/// Exponential backoff with full jitter: uniform in [0, min(cap, base·2ⁿ)].
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let ceiling = RECONNECT_BASE_MS
        .saturating_mul(1u64 << attempt.min(16))
        .min(RECONNECT_CAP_MS);
    let jittered = rand::thread_rng().gen_range(0..=ceiling);
    Duration::from_millis(jittered)
}

/// Extract fills from a `userFills` channel frame (snapshot or update).
pub fn parse_ws_fills(frame: &Value) -> Option<Vec<HlFill>> {
    if frame.get("channel")?.as_str()? != "userFills" {
        return None;
    }
    let fills = frame.get("data")?.get("fills")?.clone();
    serde_json::from_value(fills).ok()
}

/// Extract (asset, signed size) pairs from a `userPositions` frame.
pub fn parse_ws_positions(frame: &Value) -> Option<Vec<(Asset, f64)>> {
    if frame.get("channel")?.as_str()? != "userPositions" {
        return None;
    }
    let positions = frame.get("data")?.get("assetPositions")?.as_array()?;
    let mut out = Vec::new();
    for p in positions {
        let pos = p.get("position")?;
        let coin = pos.get("coin")?.as_str()?;
        if let Ok(asset) = Asset::from_str(coin) {
            let szi = pos.get("szi")?.as_str().map(fnum).unwrap_or(0.0);
            out.push((asset, szi));
        }
    }
    Some(out)
}

// ── Supervisor ───────────────────────────────────────────────────────────────

pub struct TrackerSupervisor {
    manager: Arc<SubscriptionManager>,
    hl: Arc<HlClient>,
    ingestor: Arc<FillIngestor>,
    positions: Arc<PositionCache>,
    config: Config,
    running: HashMap<String, (Transport, JoinHandle<()>)>,
}

impl TrackerSupervisor {
    pub fn new(
        manager: Arc<SubscriptionManager>,
        hl: Arc<HlClient>,
        ingestor: Arc<FillIngestor>,
        positions: Arc<PositionCache>,
        config: Config,
    ) -> Self {
        Self {
            manager,
            hl,
            ingestor,
            positions,
            config,
            running: HashMap::new(),
        }
    }

    /// Reconcile running tasks against the transport plan, forever.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let child_shutdown = shutdown.clone();
        let mut ticker = interval(Duration::from_secs(SUPERVISE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile(&child_shutdown),
                _ = shutdown.changed() => {
                    info!("📡 tracker supervisor stopping ({} tasks)", self.running.len());
                    for (_, (_, handle)) in self.running.drain() {
                        handle.abort();
                    }
                    return;
                }
            }
        }
    }

    fn reconcile(&mut self, shutdown: &tokio::sync::watch::Receiver<bool>) {
        let plan = self.manager.transport_plan();

        // Stop trackers for removed or re-transported addresses.
        self.running.retain(|address, (transport, handle)| {
            match plan.get(address) {
                Some(wanted) if *wanted == *transport && !handle.is_finished() => true,
                _ => {
                    debug!(%address, "stopping tracker (plan changed)");
                    handle.abort();
                    false
                }
            }
        });

        // Start what is missing.
        for (address, transport) in &plan {
            if self.running.contains_key(address) {
                continue;
            }
            let handle = match transport {
                Transport::Websocket => tokio::spawn(run_ws_address(
                    address.clone(),
                    self.config.infra.venue_ws_url.clone(),
                    self.hl.clone(),
                    self.ingestor.clone(),
                    self.positions.clone(),
                    shutdown.clone(),
                )),
                Transport::Polling => tokio::spawn(run_polling_address(
                    address.clone(),
                    self.hl.clone(),
                    self.ingestor.clone(),
                    self.positions.clone(),
                    self.config.subs.poll_min_secs,
                    self.config.subs.poll_max_secs,
                    shutdown.clone(),
                )),
            };
            self.running.insert(address.clone(), (*transport, handle));
        }

        let ws = self
            .running
            .values()
            .filter(|(t, _)| *t == Transport::Websocket)
            .count();
        metrics::get().tracked_websocket.set(ws as i64);
        metrics::get()
            .tracked_polling
            .set((self.running.len() - ws) as i64);
    }
}

// ── Per-address tasks ────────────────────────────────────────────────────────

/// Prime the position cache from a one-shot clearinghouse snapshot.
async fn prime_positions(address: &str, hl: &HlClient, positions: &PositionCache) {
    match hl.user_state(address).await {
        Ok(state) => {
            for ap in &state.asset_positions {
                if let Ok(asset) = Asset::from_str(&ap.position.coin) {
                    positions.insert((address.to_string(), asset), fnum(&ap.position.szi));
                }
            }
            debug!(%address, "positions primed");
        }
        Err(e) => warn!("⚠️ position priming failed for {address}: {e:#}"),
    }
}

async fn run_ws_address(
    address: String,
    ws_url: String,
    hl: Arc<HlClient>,
    ingestor: Arc<FillIngestor>,
    positions: Arc<PositionCache>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let (mut ws, _) = match connect_async(&ws_url).await {
            Ok(conn) => conn,
            Err(e) => {
                let wait = reconnect_backoff(attempt);
                warn!("⚠️ ws connect failed for {address}: {e}; retrying in {wait:?}");
                metrics::get().ws_reconnects.inc();
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(wait).await;
                continue;
            }
        };

        for kind in ["userFills", "userPositions"] {
            let sub = hyperliquid::ws_subscribe_msg(kind, &address);
            if let Err(e) = ws.send(WsMessage::Text(sub)).await {
                warn!("⚠️ ws subscribe failed for {address}: {e}");
            }
        }

        // Holdings must be queryable before the first live frame arrives.
        prime_positions(&address, &hl, &positions).await;
        attempt = 0;
        info!("📡 tracking {address} over websocket");

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                                continue;
                            };
                            if let Some(fills) = parse_ws_fills(&value) {
                                for raw in &fills {
                                    if let Err(e) = ingestor.ingest(&address, raw).await {
                                        warn!("⚠️ fill ingest failed for {address}: {e:#}");
                                    }
                                }
                            } else if let Some(pos) = parse_ws_positions(&value) {
                                for (asset, szi) in pos {
                                    positions.insert((address.clone(), asset), szi);
                                }
                            }
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            let _ = ws.send(WsMessage::Pong(data)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("⚠️ ws read error for {address}: {e}");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }

        metrics::get().ws_reconnects.inc();
        let wait = reconnect_backoff(attempt);
        attempt = attempt.saturating_add(1);
        warn!("📡 ws dropped for {address}; reconnecting in {wait:?}");
        tokio::time::sleep(wait).await;
    }
}

async fn run_polling_address(
    address: String,
    hl: Arc<HlClient>,
    ingestor: Arc<FillIngestor>,
    positions: Arc<PositionCache>,
    poll_min_secs: u64,
    poll_max_secs: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    prime_positions(&address, &hl, &positions).await;

    // Fixed jittered cadence per address, so the fleet spreads out.
    let cadence = rand::thread_rng().gen_range(poll_min_secs..=poll_max_secs.max(poll_min_secs));
    let mut ticker = interval(Duration::from_secs(cadence));
    info!("📡 tracking {address} by polling every {cadence}s");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match hl.user_fills(&address).await {
                    Ok(fills) => {
                        for raw in &fills {
                            if let Err(e) = ingestor.ingest(&address, raw).await {
                                warn!("⚠️ fill ingest failed for {address}: {e:#}");
                            }
                        }
                    }
                    Err(e) => warn!("⚠️ fill poll failed for {address}: {e:#}"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_and_grows() {
        for attempt in 0..20 {
            let d = reconnect_backoff(attempt);
            assert!(d <= Duration::from_millis(RECONNECT_CAP_MS));
        }
        // The ceiling (not the draw) doubles until the cap.
        let ceiling = |a: u32| {
            RECONNECT_BASE_MS
                .saturating_mul(1u64 << a.min(16))
                .min(RECONNECT_CAP_MS)
        };
        assert_eq!(ceiling(0), 500);
        assert_eq!(ceiling(1), 1_000);
        assert_eq!(ceiling(10), RECONNECT_CAP_MS);
    }

    #[test]
    fn parses_user_fills_frame() {
        let frame = serde_json::json!({
            "channel": "userFills",
            "data": {
                "user": "0xabc",
                "isSnapshot": true,
                "fills": [{
                    "coin": "ETH",
                    "px": "3000",
                    "sz": "1.0",
                    "side": "B",
                    "time": 1_700_000_000_000u64,
                    "startPosition": "0.0",
                    "hash": "0xbeef",
                    "tid": 1
                }]
            }
        });
        let fills = parse_ws_fills(&frame).unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].coin, "ETH");
    }

    #[test]
    fn parses_user_positions_frame() {
        let frame = serde_json::json!({
            "channel": "userPositions",
            "data": {
                "assetPositions": [
                    { "position": { "coin": "BTC", "szi": "-0.75" } },
                    { "position": { "coin": "DOGE", "szi": "100" } }
                ]
            }
        });
        let positions = parse_ws_positions(&frame).unwrap();
        // Untracked coins are dropped.
        assert_eq!(positions, vec![(Asset::Btc, -0.75)]);
    }

    #[test]
    fn other_channels_are_ignored() {
        let frame = serde_json::json!({ "channel": "pong" });
        assert!(parse_ws_fills(&frame).is_none());
        assert!(parse_ws_positions(&frame).is_none());
    }
}
