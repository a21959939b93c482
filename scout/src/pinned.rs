//! 📌 Pinned-account registry.
//!
//! Pins override auto-selection: a pinned address is always on Stream's
//! watchlist. Leaderboard pins are unbounded; custom pins are capped at
//! three, enforced under the same transaction as the insert so two
//! concurrent adds cannot both sneak under the cap.

use anyhow::Result;
use chrono::{DateTime, Utc};
use common::db::Db;
use serde::Serialize;
use std::sync::Arc;

use crate::metrics;

pub const MAX_CUSTOM_PINS: i64 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct PinnedAccount {
    pub address: String,
    pub is_custom: bool,
    pub pinned_at: DateTime<Utc>,
}

pub struct PinnedRegistry {
    db: Arc<Db>,
}

#[derive(Debug, thiserror::Error)]
pub enum PinError {
    #[error("custom pin limit reached ({MAX_CUSTOM_PINS})")]
    CustomLimit,
    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

impl PinnedRegistry {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Pin an address sourced from the leaderboard. Idempotent.
    pub async fn add_leaderboard_pin(&self, address: &str) -> Result<()> {
        let address = address.to_lowercase();
        let client = self.db.lock().await;
        client
            .execute(
                "INSERT INTO pinned_accounts (address, is_custom)
                 VALUES ($1, FALSE)
                 ON CONFLICT (address) DO NOTHING",
                &[&address],
            )
            .await?;
        drop(client);
        self.refresh_gauge().await;
        Ok(())
    }

    /// Pin an arbitrary address. At most [`MAX_CUSTOM_PINS`] may exist.
    pub async fn add_custom_pin(&self, address: &str) -> Result<(), PinError> {
        let address = address.to_lowercase();
        let mut client = self.db.lock().await;
        let tx = client.transaction().await.map_err(anyhow::Error::from)?;

        let count: i64 = tx
            .query_one(
                "SELECT COUNT(*) FROM pinned_accounts WHERE is_custom",
                &[],
            )
            .await
            .map_err(anyhow::Error::from)?
            .get(0);
        if count >= MAX_CUSTOM_PINS {
            return Err(PinError::CustomLimit);
        }

        tx.execute(
            "INSERT INTO pinned_accounts (address, is_custom)
             VALUES ($1, TRUE)
             ON CONFLICT (address) DO UPDATE SET is_custom = TRUE",
            &[&address],
        )
        .await
        .map_err(anyhow::Error::from)?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        drop(client);
        self.refresh_gauge().await;
        Ok(())
    }

    /// Remove a pin regardless of kind. Unpinning an unknown address is a
    /// no-op.
    pub async fn unpin(&self, address: &str) -> Result<bool> {
        let address = address.to_lowercase();
        let client = self.db.lock().await;
        let removed = client
            .execute("DELETE FROM pinned_accounts WHERE address = $1", &[&address])
            .await?;
        drop(client);
        self.refresh_gauge().await;
        Ok(removed > 0)
    }

    pub async fn list(&self) -> Result<Vec<PinnedAccount>> {
        let client = self.db.lock().await;
        let rows = client
            .query(
                "SELECT address, is_custom, pinned_at
                 FROM pinned_accounts ORDER BY pinned_at",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| PinnedAccount {
                address: r.get(0),
                is_custom: r.get(1),
                pinned_at: r.get(2),
            })
            .collect())
    }

    /// Watchlist contribution: all pinned addresses, pins first.
    pub async fn watchlist(&self) -> Result<Vec<String>> {
        Ok(self.list().await?.into_iter().map(|p| p.address).collect())
    }

    async fn refresh_gauge(&self) {
        if let Ok(pins) = self.list().await {
            metrics::get().pinned_accounts.set(pins.len() as i64);
        }
    }
}
