//! Client-side SQLite persistence.
//!
//! Connections, message records, and the per-connection outbound sequence
//! counters share one database file with the activity log. The counter
//! scheme (`INSERT OR IGNORE` seed + `UPDATE … RETURNING`) makes sequence
//! allocation atomic, gap-free, starting at 1, and durable across
//! restarts.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::SqlitePool;

use super::model::{
    Attribution, AutonomyLevel, Connection, ConnectionState, Direction, MessageRecord,
    MessageState,
};

#[derive(sqlx::FromRow)]
struct ConnectionRow {
    address: String,
    state: String,
    autonomy: String,
    peer_public_key: Option<Vec<u8>>,
    muted: i64,
    passthrough: i64,
    nickname: String,
    last_activity: String,
}

impl From<ConnectionRow> for Connection {
    fn from(r: ConnectionRow) -> Connection {
        Connection {
            address: r.address,
            state: ConnectionState::parse(&r.state).unwrap_or(ConnectionState::Revoked),
            autonomy: AutonomyLevel::parse(&r.autonomy),
            peer_public_key: r.peer_public_key.unwrap_or_default(),
            muted: r.muted != 0,
            passthrough: r.passthrough != 0,
            nickname: r.nickname,
            last_activity: r.last_activity,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    message_id: String,
    connection_address: String,
    direction: String,
    sequence: i64,
    state: String,
    content: String,
    attribution: String,
    thread_id: Option<String>,
    reply_to: Option<String>,
    created_at: String,
}

impl From<MessageRow> for MessageRecord {
    fn from(r: MessageRow) -> MessageRecord {
        MessageRecord {
            message_id: r.message_id,
            connection_address: r.connection_address,
            direction: if r.direction == "inbound" {
                Direction::Inbound
            } else {
                Direction::Outbound
            },
            sequence: r.sequence as u64,
            state: MessageState::parse(&r.state).unwrap_or(MessageState::Failed),
            content: r.content,
            attribution: Attribution::parse(&r.attribution),
            thread_id: r.thread_id,
            reply_to: r.reply_to,
            created_at: r.created_at,
        }
    }
}

// ─── ClientStore ──────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ClientStore {
    pool: SqlitePool,
}

impl ClientStore {
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
            .with_context(|| format!("opening client database at {}", path.display()))?;

        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(&pool).await?;
                }
            }
        }
        Ok(Self { pool })
    }

    /// Shared pool for the activity log living in the same file.
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    // ── Connections ───────────────────────────────────────────────────────────

    pub async fn upsert_connection(&self, conn: &Connection) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO connections
                 (address, state, autonomy, peer_public_key, muted, passthrough, nickname, last_activity)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                 state = excluded.state,
                 autonomy = excluded.autonomy,
                 peer_public_key = excluded.peer_public_key,
                 muted = excluded.muted,
                 passthrough = excluded.passthrough,
                 nickname = excluded.nickname,
                 last_activity = excluded.last_activity",
        )
        .bind(&conn.address)
        .bind(conn.state.as_str())
        .bind(conn.autonomy.as_str())
        .bind(&conn.peer_public_key)
        .bind(conn.muted as i64)
        .bind(conn.passthrough as i64)
        .bind(&conn.nickname)
        .bind(&conn.last_activity)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_connection(&self, address: &str) -> Result<Option<Connection>, sqlx::Error> {
        let row: Option<ConnectionRow> =
            sqlx::query_as("SELECT * FROM connections WHERE address = ?")
                .bind(address)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    pub async fn set_connection_state(
        &self,
        address: &str,
        state: ConnectionState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE connections SET state = ?, last_activity = ? WHERE address = ?")
            .bind(state.as_str())
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_muted(&self, address: &str, muted: bool) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE connections SET muted = ? WHERE address = ?")
            .bind(muted as i64)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_passthrough(
        &self,
        address: &str,
        passthrough: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE connections SET passthrough = ? WHERE address = ?")
            .bind(passthrough as i64)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_autonomy(
        &self,
        address: &str,
        autonomy: AutonomyLevel,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE connections SET autonomy = ? WHERE address = ?")
            .bind(autonomy.as_str())
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_nickname(&self, address: &str, nickname: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE connections SET nickname = ? WHERE address = ?")
            .bind(nickname)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Sequence counters ─────────────────────────────────────────────────────

    /// Allocate the next outbound sequence number for `address`.
    /// First call yields 1; the counter never skips and never repeats,
    /// including across process restarts.
    pub async fn next_sequence(&self, address: &str) -> Result<u64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO connection_counters (address, next_seq) VALUES (?, 0)")
            .bind(address)
            .execute(&mut *tx)
            .await?;
        let (seq,): (i64,) = sqlx::query_as(
            "UPDATE connection_counters SET next_seq = next_seq + 1
             WHERE address = ? RETURNING next_seq",
        )
        .bind(address)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(seq as u64)
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    /// Persist a message record. Returns false if `message_id` was already
    /// present — the dedup that makes relay at-least-once delivery safe.
    pub async fn insert_message(&self, msg: &MessageRecord) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages
                 (message_id, connection_address, direction, sequence, state,
                  content, attribution, thread_id, reply_to, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.message_id)
        .bind(&msg.connection_address)
        .bind(msg.direction.as_str())
        .bind(msg.sequence as i64)
        .bind(msg.state.as_str())
        .bind(&msg.content)
        .bind(msg.attribution.as_str())
        .bind(msg.thread_id.as_deref())
        .bind(msg.reply_to.as_deref())
        .bind(&msg.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_message_state(
        &self,
        message_id: &str,
        state: MessageState,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE messages SET state = ? WHERE message_id = ?")
            .bind(state.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_message(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, sqlx::Error> {
        let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM messages WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Fail the most recent still-`sent` outbound message, optionally
    /// scoped to one connection. Used when the relay answers `QueueFull`
    /// or `RateLimited` (those envelopes carry no message id).
    pub async fn fail_latest_sent(
        &self,
        connection_address: Option<&str>,
    ) -> Result<Option<String>, sqlx::Error> {
        let row: Option<(String,)> = match connection_address {
            Some(addr) => {
                sqlx::query_as(
                    "SELECT message_id FROM messages
                     WHERE direction = 'outbound' AND state = 'sent' AND connection_address = ?
                     ORDER BY created_at DESC, message_id DESC LIMIT 1",
                )
                .bind(addr)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT message_id FROM messages
                     WHERE direction = 'outbound' AND state = 'sent'
                     ORDER BY created_at DESC, message_id DESC LIMIT 1",
                )
                .fetch_optional(&self.pool)
                .await?
            }
        };
        if let Some((message_id,)) = &row {
            self.set_message_state(message_id, MessageState::Failed).await?;
        }
        Ok(row.map(|(id,)| id))
    }

    pub async fn messages_for(
        &self,
        connection_address: &str,
    ) -> Result<Vec<MessageRecord>, sqlx::Error> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM messages WHERE connection_address = ?
             ORDER BY created_at ASC, message_id ASC",
        )
        .bind(connection_address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
