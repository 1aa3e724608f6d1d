//! Durable per-recipient message queue.
//!
//! Messages for offline (or currently-flushing) recipients are stored in
//! SQLite under the recipient's address. The composite key is 16 bytes:
//! big-endian arrival-timestamp milliseconds followed by a big-endian
//! monotonic sequence within that millisecond — lexicographic key order is
//! chronological order, so `ORDER BY key` drains oldest-first.
//!
//! The queue never inspects envelope bytes; they stay opaque ciphertext.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::proto;

/// Default cap on undelivered messages per recipient.
pub const DEFAULT_MAX_PER_AGENT: usize = 1_000;
/// Default retention for undelivered messages.
pub const DEFAULT_TTL: Duration = Duration::from_secs(168 * 60 * 60);
/// How often the TTL sweeper runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The recipient's bucket is at capacity; the message was not stored.
    #[error("queue full for {0}")]
    Full(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// One stored message, as returned by [`MessageQueue::flush_batch`].
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub key: [u8; 16],
    pub sender: String,
    pub envelope: Vec<u8>,
    pub arrival_ms: i64,
}

pub struct MessageQueue {
    pool: SqlitePool,
    max_per_agent: usize,
    ttl: Duration,
    /// `(last_ms, seq_within_ms)` — makes keys unique when several
    /// messages arrive in the same millisecond.
    key_state: Mutex<(i64, u64)>,
}

impl MessageQueue {
    pub fn new(pool: SqlitePool, max_per_agent: usize, ttl: Duration) -> Self {
        MessageQueue {
            pool,
            max_per_agent,
            ttl,
            key_state: Mutex::new((0, 0)),
        }
    }

    /// Next composite key for an arrival at `now_ms`.
    fn next_key(&self, now_ms: i64) -> [u8; 16] {
        let mut state = self.key_state.lock().unwrap_or_else(|e| e.into_inner());
        // Clock went backwards or stayed in the same ms: bump the sequence
        // instead of risking a duplicate key.
        if now_ms <= state.0 {
            state.1 += 1;
        } else {
            *state = (now_ms, 0);
        }
        let ms = state.0.max(now_ms);

        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&ms.to_be_bytes());
        key[8..].copy_from_slice(&state.1.to_be_bytes());
        key
    }

    /// Store one envelope for `recipient`. Fails closed with
    /// [`QueueError::Full`] at the per-recipient cap.
    ///
    /// The cap check and the insert commit as one transaction: concurrent
    /// senders to the same recipient cannot both pass a stale under-cap
    /// count and overfill the bucket.
    pub async fn enqueue(
        &self,
        recipient: &str,
        sender: &str,
        envelope: &[u8],
    ) -> Result<(), QueueError> {
        let now_ms = proto::now_ms();
        let key = self.next_key(now_ms);

        let mut tx = self.pool.begin().await?;
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE recipient = ?")
                .bind(recipient)
                .fetch_one(&mut *tx)
                .await?;
        if count as u64 >= self.max_per_agent as u64 {
            return Err(QueueError::Full(recipient.to_string()));
        }

        sqlx::query(
            "INSERT INTO queue_messages (recipient, key, sender, envelope, arrival_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(recipient)
        .bind(key.as_slice())
        .bind(sender)
        .bind(envelope)
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Oldest `n` entries for `recipient`, in enqueue order. Entries are
    /// not removed — the flush engine removes each one only after it has
    /// been pushed to the client, so a crash mid-flush loses nothing.
    pub async fn flush_batch(
        &self,
        recipient: &str,
        n: usize,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        let rows: Vec<(Vec<u8>, String, Vec<u8>, i64)> = sqlx::query_as(
            "SELECT key, sender, envelope, arrival_ms FROM queue_messages
             WHERE recipient = ? ORDER BY key ASC LIMIT ?",
        )
        .bind(recipient)
        .bind(n as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, sender, envelope, arrival_ms)| {
                let key: [u8; 16] = key.try_into().ok()?;
                Some(QueueEntry {
                    key,
                    sender,
                    envelope,
                    arrival_ms,
                })
            })
            .collect())
    }

    /// Delete one delivered entry. Concurrent `flush_batch` calls for the
    /// same recipient stay valid — they simply stop seeing this key.
    pub async fn remove(&self, recipient: &str, key: &[u8; 16]) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM queue_messages WHERE recipient = ? AND key = ?")
            .bind(recipient)
            .bind(key.as_slice())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Undelivered message count for `recipient`.
    pub async fn count(&self, recipient: &str) -> Result<u64, QueueError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE recipient = ?")
                .bind(recipient)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    /// Delete everything past its TTL. Returns per-recipient removal
    /// counts for logging.
    pub async fn sweep(&self) -> Result<HashMap<String, u64>, QueueError> {
        let cutoff = proto::now_ms() - self.ttl.as_millis() as i64;

        let mut tx = self.pool.begin().await?;
        let expired: Vec<(String, i64)> = sqlx::query_as(
            "SELECT recipient, COUNT(*) FROM queue_messages
             WHERE arrival_ms < ? GROUP BY recipient",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM queue_messages WHERE arrival_ms < ?")
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(expired
            .into_iter()
            .map(|(recipient, count)| (recipient, count as u64))
            .collect())
    }

    /// Run the TTL sweeper until `cancel` fires.
    pub fn start_sweep(self: &Arc<Self>, cancel: CancellationToken) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("queue sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                match queue.sweep().await {
                    Ok(removed) if removed.is_empty() => {}
                    Ok(removed) => {
                        let total: u64 = removed.values().sum();
                        info!(
                            recipients = removed.len(),
                            messages = total,
                            "swept expired queue entries"
                        );
                    }
                    Err(e) => warn!(err = %e, "queue sweep failed"),
                }
            }
        });
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
