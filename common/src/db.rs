//! 🗄️ Shared PostgreSQL access.
//!
//! One client per service; the connection driver runs on its own task and a
//! drop of the connection surfaces as an error metric in the owning service,
//! not a crash. Migrations are numbered SQL files compiled into the binary
//! and applied in order at startup; each file runs in its own transaction
//! and records its name in `schema_migrations`, so re-running is a no-op.

use anyhow::{Context, Result};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

/// Numbered migrations in apply order.
const MIGRATIONS: &[(&str, &str)] = &[
    ("0001_init.sql", include_str!("../../migrations/0001_init.sql")),
    ("0002_decisions.sql", include_str!("../../migrations/0002_decisions.sql")),
    (
        "0003_shadow_ledger.sql",
        include_str!("../../migrations/0003_shadow_ledger.sql"),
    ),
    (
        "0004_pool_selection.sql",
        include_str!("../../migrations/0004_pool_selection.sql"),
    ),
];

/// Service handle to the shared database.
///
/// The mutex serializes transactions; plain reads and single-statement
/// writes take the guard only for the duration of the call.
pub struct Db {
    client: Mutex<Client>,
}

impl Db {
    /// Connect and spawn the connection driver task.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("failed to connect to PostgreSQL")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("❌ PostgreSQL connection error: {e}");
            }
        });

        info!("✅ PostgreSQL: connected");
        Ok(Self {
            client: Mutex::new(client),
        })
    }

    /// Exclusive access to the client (needed for transactions).
    pub async fn lock(&self) -> MutexGuard<'_, Client> {
        self.client.lock().await
    }

    /// Apply all pending migrations. Returns the number applied.
    pub async fn run_migrations(&self) -> Result<usize> {
        let mut client = self.lock().await;

        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    filename   TEXT PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
                )",
            )
            .await
            .context("failed to create schema_migrations")?;

        let mut applied = 0usize;
        for (filename, sql) in MIGRATIONS {
            let already = client
                .query_opt(
                    "SELECT 1 FROM schema_migrations WHERE filename = $1",
                    &[filename],
                )
                .await?
                .is_some();
            if already {
                continue;
            }

            let tx = client.transaction().await?;
            tx.batch_execute(sql)
                .await
                .with_context(|| format!("migration {filename} failed"))?;
            tx.execute(
                "INSERT INTO schema_migrations (filename) VALUES ($1)",
                &[filename],
            )
            .await?;
            tx.commit().await?;

            info!("🗄️ migration applied: {filename}");
            applied += 1;
        }

        if applied == 0 {
            info!("🗄️ schema up to date ({} migrations)", MIGRATIONS.len());
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_ordered_and_unique() {
        let mut names: Vec<&str> = MIGRATIONS.iter().map(|(n, _)| *n).collect();
        let sorted = {
            let mut s = names.clone();
            s.sort();
            s
        };
        assert_eq!(names, sorted, "migrations must be listed in apply order");
        names.dedup();
        assert_eq!(names.len(), MIGRATIONS.len(), "duplicate migration name");
    }

    #[test]
    fn migrations_are_nonempty() {
        for (name, sql) in MIGRATIONS {
            assert!(!sql.trim().is_empty(), "{name} is empty");
        }
    }
}
