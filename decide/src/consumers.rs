//! 📻 Bus consumers: fills → episodes → votes/outcomes, scores → trader
//! directory.
//!
//! One consumer task per subject. The fill consumer is the episode
//! builder's single writer, so per-address ordering on `fills.v1` carries
//! straight through to episode-close ordering on `outcomes.v1`.

use chrono::{Duration as ChronoDuration, Utc};
use common::bus::{decode, subjects, Bus, Deduplicator, FillEvent, OutcomeEvent, ScoreEvent};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::consensus::votes::{vote_weight, Vote};
use crate::consensus::{ConsensusMsg, SignalRegistry, TraderDirectory};
use crate::episodes::{ClosedEpisode, EpisodeBook, EpisodeEvent, EpisodeStore, OpenEpisode};
use crate::market::MarketData;
use crate::metrics;

const DEDUP_CAPACITY: usize = 50_000;
const DEDUP_TTL: Duration = Duration::from_secs(3_600);

/// How stale a trader's score may be before their votes stop counting.
const DIRECTORY_TTL_HOURS: i64 = 48;

/// Fallback stop fraction when no ATR is available at close time.
const DEFAULT_STOP_FRACTION: f64 = 0.01;

pub struct FillPipeline {
    pub bus: Arc<Bus>,
    pub store: Arc<EpisodeStore>,
    pub book: Arc<Mutex<EpisodeBook>>,
    pub market: Arc<MarketData>,
    pub directory: Arc<TraderDirectory>,
    pub signals: Arc<SignalRegistry>,
    pub consensus_tx: mpsc::Sender<ConsensusMsg>,
    pub config: Config,
}

impl FillPipeline {
    /// Current ATR-derived stop fraction, best effort.
    async fn stop_fraction(&self, asset: common::assets::Asset) -> f64 {
        match self.market.view(asset).await {
            Ok(view) => self.market.stop_fraction(asset, &view, 1.0),
            Err(_) => DEFAULT_STOP_FRACTION,
        }
    }

    async fn dispatch_vote(&self, ep: &OpenEpisode) {
        // Only pool traders with a fresh score vote.
        let Some(score) = self.directory.get(&ep.address).map(|e| e.value().clone()) else {
            return;
        };
        if Utc::now() - score.ts > ChronoDuration::hours(DIRECTORY_TTL_HOURS) {
            return;
        }
        let weight = vote_weight(score.kappa, score.weight, &self.config.weights);
        if weight <= 0.0 {
            return;
        }
        let vote = Vote {
            address: ep.address.clone(),
            direction: ep.direction,
            entry_price: ep.entry_vwap,
            weight,
            ts: ep.entry_ts,
        };
        if self
            .consensus_tx
            .send(ConsensusMsg::NewVote {
                asset: ep.asset,
                vote,
            })
            .await
            .is_err()
        {
            warn!("⚠️ consensus channel closed; vote dropped");
        }
    }

    async fn publish_outcome(&self, closed: &ClosedEpisode) {
        // Match the closing episode to the most recent signal it could have
        // participated in (same asset + direction, episode opened after the
        // signal window began).
        let signal_id = self
            .signals
            .get(&(closed.asset, closed.direction))
            .and_then(|entry| {
                let (id, signal_ts) = *entry;
                let window =
                    ChronoDuration::seconds(self.config.consensus.freshness_window_secs as i64);
                if closed.entry_ts >= signal_ts - window {
                    Some(id)
                } else {
                    None
                }
            });

        let outcome = OutcomeEvent {
            episode_id: closed.id,
            signal_id,
            address: closed.address.clone(),
            asset: closed.asset,
            direction: closed.direction,
            result_r: closed.result_r,
            realized_pnl: closed.realized_pnl,
            closed_ts: closed.exit_ts,
            close_reason: closed.closed_reason.as_str().to_string(),
        };
        if let Err(e) = self.bus.publish_json(subjects::OUTCOMES, &outcome).await {
            warn!("⚠️ outcome publish failed: {e:#}");
        }
    }

    async fn handle_fill(&self, fill: FillEvent) {
        let stop_fraction = self.stop_fraction(fill.asset).await;
        let event = {
            let mut book = self.book.lock().await;
            book.apply_fill(&fill, stop_fraction)
        };

        match event {
            EpisodeEvent::Opened(ep) => {
                metrics::get().episodes_opened.inc();
                if let Err(e) = self.store.insert_open(&ep).await {
                    warn!("⚠️ episode insert failed: {e:#}");
                }
                self.dispatch_vote(&ep).await;
            }
            EpisodeEvent::Updated => {
                let snapshot = {
                    let book = self.book.lock().await;
                    book.get_open(&fill.address, fill.asset).cloned()
                };
                if let Some(ep) = snapshot {
                    // Adopted positions get their row on first sight.
                    if let Err(e) = self.store.insert_open(&ep).await {
                        warn!("⚠️ episode upsert failed: {e:#}");
                    }
                    if let Err(e) = self.store.update_open(&ep).await {
                        warn!("⚠️ episode update failed: {e:#}");
                    }
                }
            }
            EpisodeEvent::Closed {
                closed,
                flipped_open,
            } => {
                metrics::get().episodes_closed.inc();
                if let Err(e) = self.store.mark_closed(&closed).await {
                    warn!("⚠️ episode close failed: {e:#}");
                }
                debug!(
                    address = %closed.address,
                    asset = %closed.asset,
                    r = closed.result_r,
                    reason = closed.closed_reason.as_str(),
                    "episode closed"
                );
                self.publish_outcome(&closed).await;

                if let Some(ep) = flipped_open {
                    metrics::get().episodes_opened.inc();
                    if let Err(e) = self.store.insert_open(&ep).await {
                        warn!("⚠️ flipped episode insert failed: {e:#}");
                    }
                    self.dispatch_vote(&ep).await;
                }
            }
            EpisodeEvent::Ignored => {}
        }
    }
}

/// Consume `fills.v1` into the episode builder.
pub async fn run_fill_consumer(
    pipeline: Arc<FillPipeline>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let dedup = Deduplicator::new(DEDUP_CAPACITY, DEDUP_TTL);

    let mut messages = loop {
        match pipeline
            .bus
            .durable_subscribe("decide-fills", subjects::FILLS)
            .await
        {
            Ok(stream) => break stream,
            Err(e) => {
                warn!("⚠️ fill subscription failed ({e:#}); retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    info!("📻 fill consumer started");

    loop {
        tokio::select! {
            msg = messages.next() => {
                let Some(msg) = msg else {
                    warn!("📻 fill stream ended");
                    return;
                };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("⚠️ fill receive error: {e}");
                        continue;
                    }
                };

                match decode::<FillEvent>(&msg.payload) {
                    Ok(fill) => {
                        metrics::get().fills_consumed.inc();
                        if dedup.is_duplicate(&fill.fill_id) {
                            metrics::get().fills_duplicate.inc();
                        } else {
                            pipeline.handle_fill(fill).await;
                        }
                    }
                    Err(e) => warn!("⚠️ undecodable fill dropped: {e:#}"),
                }

                if let Err(e) = msg.ack().await {
                    warn!("⚠️ fill ack failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                info!("📻 fill consumer stopping");
                return;
            }
        }
    }
}

/// Consume `scores.v1` into the trader directory.
pub async fn run_score_consumer(
    bus: Arc<Bus>,
    directory: Arc<TraderDirectory>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut messages = loop {
        match bus.durable_subscribe("decide-scores", subjects::SCORES).await {
            Ok(stream) => break stream,
            Err(e) => {
                warn!("⚠️ score subscription failed ({e:#}); retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    info!("📻 score consumer started");

    loop {
        tokio::select! {
            msg = messages.next() => {
                let Some(msg) = msg else {
                    warn!("📻 score stream ended");
                    return;
                };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("⚠️ score receive error: {e}");
                        continue;
                    }
                };

                match decode::<ScoreEvent>(&msg.payload) {
                    Ok(score) => {
                        debug!(address = %score.address, kappa = score.kappa, selected = score.selected, "score updated");
                        directory.insert(score.address.clone(), score);
                    }
                    Err(e) => warn!("⚠️ undecodable score dropped: {e:#}"),
                }

                if let Err(e) = msg.ack().await {
                    warn!("⚠️ score ack failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                info!("📻 score consumer stopping");
                return;
            }
        }
    }
}

/// Minute sweep force-closing episodes idle past the timeout.
pub async fn run_timeout_sweep(
    pipeline: Arc<FillPipeline>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let closed = {
                    let mut book = pipeline.book.lock().await;
                    book.sweep_timeouts(Utc::now())
                };
                for ep in closed {
                    metrics::get().episodes_timed_out.inc();
                    info!(address = %ep.address, asset = %ep.asset, "⏱️ episode timed out");
                    if let Err(e) = pipeline.store.mark_closed(&ep).await {
                        warn!("⚠️ timeout close failed: {e:#}");
                    }
                    pipeline.publish_outcome(&ep).await;
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
