//! Relay-side persistence.
//!
//! One SQLite database file (WAL mode) opened once at startup and shared
//! by the durable message queue and the block store. A failure to open is
//! fatal — the relay refuses to start without its durable state.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct RelayStorage {
    pool: SqlitePool,
}

impl RelayStorage {
    /// Open (creating if missing) the relay database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .context("invalid database path")?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .with_context(|| format!("opening relay database at {}", path.display()))?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Clone of the connection pool (cheap — Arc-backed). The queue and
    /// the block store each hold one.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        // Schema evolution is additive-only: new statements append below,
        // existing ones never change.
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RelayStorage::open(&dir.path().join("relay.db")).await.unwrap();

        // Both tables exist and are queryable.
        let (queue_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages")
            .fetch_one(&storage.pool())
            .await
            .unwrap();
        let (block_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM blocked_pairs")
            .fetch_one(&storage.pool())
            .await
            .unwrap();
        assert_eq!((queue_count, block_count), (0, 0));
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        drop(RelayStorage::open(&path).await.unwrap());
        // Second open re-runs migrations without error.
        RelayStorage::open(&path).await.unwrap();
    }
}
