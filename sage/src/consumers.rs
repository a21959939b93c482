//! 📻 Bus consumers: outcomes (posterior updates) and candidates
//! (universe admission).
//!
//! Outcomes are applied strictly in arrival order by a single consumer
//! task, which for any one address equals episode-close order (the episode
//! builder serializes closes). Redelivered messages are dropped by the
//! episode-id deduplicator; the posterior upsert itself is the last write,
//! so a crash between update and ack can only cause a redelivery that the
//! dedup (or the unchanged total_signals guard in tests) absorbs.

use common::bus::{decode, subjects, Bus, CandidateEvent, Deduplicator, OutcomeEvent};
use common::db::Db;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::posterior;

const DEDUP_CAPACITY: usize = 10_000;
const DEDUP_TTL: Duration = Duration::from_secs(3_600);

/// Consume `outcomes.v1` and fold each closed-episode R into the trader's
/// posterior.
pub async fn run_outcome_consumer(
    db: Arc<Db>,
    bus: Arc<Bus>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let dedup = Deduplicator::new(DEDUP_CAPACITY, DEDUP_TTL);

    let mut messages = loop {
        match bus.durable_subscribe("sage-outcomes", subjects::OUTCOMES).await {
            Ok(stream) => break stream,
            Err(e) => {
                warn!("⚠️ outcome subscription failed ({e:#}); retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    info!("📻 outcome consumer started");

    loop {
        tokio::select! {
            msg = messages.next() => {
                let Some(msg) = msg else {
                    warn!("📻 outcome stream ended");
                    return;
                };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("⚠️ outcome receive error: {e}");
                        continue;
                    }
                };

                match decode::<OutcomeEvent>(&msg.payload) {
                    Ok(outcome) => {
                        let id = outcome.episode_id.to_string();
                        if dedup.is_duplicate(&id) {
                            metrics::get().outcomes_duplicate.inc();
                        } else {
                            match posterior::apply_outcome(
                                &db,
                                &outcome.address,
                                outcome.result_r,
                                outcome.closed_ts,
                            )
                            .await
                            {
                                Ok(updated) => {
                                    metrics::get().posterior_updates.inc();
                                    debug!(
                                        address = %outcome.address,
                                        r = outcome.result_r,
                                        m = updated.m,
                                        kappa = updated.kappa,
                                        "posterior updated"
                                    );
                                }
                                Err(e) => {
                                    warn!("⚠️ posterior update failed for {}: {e:#}", outcome.address);
                                    // Leave unacked so the bus redelivers, and
                                    // un-mark the id so the retry is processed.
                                    dedup.forget(&id);
                                    continue;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        // Malformed upstream message: log, drop, count.
                        warn!("⚠️ undecodable outcome dropped: {e:#}");
                    }
                }

                if let Err(e) = msg.ack().await {
                    warn!("⚠️ outcome ack failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                info!("📻 outcome consumer stopping");
                return;
            }
        }
    }
}

/// Consume `candidates.v1`: every candidate gets a posterior row (prior
/// values) so the selection universe sees it.
pub async fn run_candidate_consumer(
    db: Arc<Db>,
    bus: Arc<Bus>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut messages = loop {
        match bus
            .durable_subscribe("sage-candidates", subjects::CANDIDATES)
            .await
        {
            Ok(stream) => break stream,
            Err(e) => {
                warn!("⚠️ candidate subscription failed ({e:#}); retrying in 5s");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    info!("📻 candidate consumer started");

    loop {
        tokio::select! {
            msg = messages.next() => {
                let Some(msg) = msg else {
                    warn!("📻 candidate stream ended");
                    return;
                };
                let msg = match msg {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("⚠️ candidate receive error: {e}");
                        continue;
                    }
                };

                match decode::<CandidateEvent>(&msg.payload) {
                    Ok(candidate) => {
                        if let Err(e) = posterior::ensure_exists(&db, &candidate.address).await {
                            warn!("⚠️ candidate admission failed for {}: {e:#}", candidate.address);
                            continue; // unacked → redelivered
                        }
                        debug!(address = %candidate.address, "candidate admitted to universe");
                    }
                    Err(e) => warn!("⚠️ undecodable candidate dropped: {e:#}"),
                }

                if let Err(e) = msg.ack().await {
                    warn!("⚠️ candidate ack failed: {e}");
                }
            }
            _ = shutdown.changed() => {
                info!("📻 candidate consumer stopping");
                return;
            }
        }
    }
}
