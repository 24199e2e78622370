//! Durable store
//!
//! A single local SQLite file records super batches, sub-batches, and
//! fall-back operations. The schema is versioned by an integer epoch;
//! embedded migration scripts are applied in lexicographic order on open,
//! and a failed script aborts the open.

mod store;

pub use store::{BatchRow, OpCounts, OpRow, Store, StoreTx, SubFilter};

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::info;

use crate::core::error::{GatewayError, Result};

/// Embedded migration scripts; filenames sort lexicographically and their
/// numeric prefix is the epoch the script brings the schema to.
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_batches.sql",
    include_str!("schema/0001_batches.sql"),
)];

impl Store {
    /// Open (or create) the store at `path` and bring the schema up to date.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Store::from_pool(pool);
        store.migrate().await?;
        info!(path = %path.display(), "opened store");
        Ok(store)
    }

    /// In-memory store for tests. One connection, so every handle sees the
    /// same database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(GatewayError::Bookkeeping)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Store::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let epoch = self.epoch().await.unwrap_or(0);
        let mut fresh = epoch == 0;
        for (name, sql) in MIGRATIONS {
            let e: i64 = name
                .split('_')
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| GatewayError::Config(format!("bad migration name {name}")))?;
            if e <= epoch {
                continue;
            }
            sqlx::raw_sql(sql)
                .execute(self.pool())
                .await
                .map_err(|err| {
                    GatewayError::Config(format!("{name} migration failed: {err}"))
                })?;
            if fresh {
                sqlx::query("insert into migration (epoch) values (?1)")
                    .bind(e)
                    .execute(self.pool())
                    .await?;
                fresh = false;
            } else {
                sqlx::query("update migration set epoch = ?1")
                    .bind(e)
                    .execute(self.pool())
                    .await?;
            }
        }
        Ok(())
    }
}
