//! Persistent block relationships.
//!
//! A block is stored directed (`blocker → blocked`) but consulted
//! bidirectionally: traffic is suppressed whenever either party has
//! blocked the other. The table shares the relay database with the
//! message queue.

use chrono::Utc;
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct BlockStore {
    pool: SqlitePool,
}

impl BlockStore {
    pub fn new(pool: SqlitePool) -> Self {
        BlockStore { pool }
    }

    /// Record `blocker` blocking `blocked`. Idempotent.
    pub async fn block(&self, blocker: &str, blocked: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR IGNORE INTO blocked_pairs (blocker, blocked, created_at)
             VALUES (?, ?, ?)",
        )
        .bind(blocker)
        .bind(blocked)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove `blocker`'s block on `blocked`. Idempotent.
    pub async fn unblock(&self, blocker: &str, blocked: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM blocked_pairs WHERE blocker = ? AND blocked = ?")
            .bind(blocker)
            .bind(blocked)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// True if either party has blocked the other.
    pub async fn is_blocked(&self, a: &str, b: &str) -> Result<bool, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM blocked_pairs
             WHERE (blocker = ?1 AND blocked = ?2) OR (blocker = ?2 AND blocked = ?1)",
        )
        .bind(a)
        .bind(b)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
