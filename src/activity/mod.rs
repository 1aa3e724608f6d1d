//! Hash-chained activity log.
//!
//! Append-only record of everything that happens on a connection, with
//! tamper evidence: every entry's hash covers its predecessor's hash, so
//! editing any stored row breaks the chain from that row forward.
//!
//!   entry_hash = SHA256(id|created_at|actor_pubkey|action_type|
//!                       connection_address|message_hash|prev_hash)
//!
//! with `|` the literal 0x7C byte and `prev_hash = ""` for the genesis
//! entry. Writes are serialized behind a mutex — two concurrent writers
//! reading the same tail would fork the chain.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::proto;

/// Recorded when a muted connection receives a message. Excluded from
/// queries by default.
pub const EVENT_MUTED_DELIVERY: &str = "muted_delivery";
/// Recorded when a message arrives while passthrough routes the
/// connection to a human.
pub const EVENT_MESSAGE_DURING_INTERVENTION: &str = "message_during_intervention";

/// One immutable row of the log.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct ActivityEvent {
    /// UUIDv7 — time-ordered.
    pub id: String,
    pub connection_address: String,
    pub event_type: String,
    /// Hex-encoded public key of the acting party.
    pub actor_pubkey: String,
    pub action_type: String,
    pub message_id: Option<String>,
    pub message_hash: Option<String>,
    pub details: Option<String>,
    /// Milliseconds since epoch.
    pub created_at: i64,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// Fields the caller supplies; id, timestamps and hashes are allocated by
/// [`ActivityLog::record`].
#[derive(Clone, Debug, Default)]
pub struct NewEvent {
    pub connection_address: String,
    pub event_type: String,
    pub actor_pubkey: String,
    pub action_type: String,
    pub message_id: Option<String>,
    pub message_hash: Option<String>,
    pub details: Option<String>,
}

/// Query filters for [`ActivityLog::get_events`].
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub connection_address: Option<String>,
    pub event_type: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<i64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<i64>,
    /// `None` applies the default exclusion (muted deliveries);
    /// `Some(vec![])` disables exclusion entirely.
    pub exclude_event_types: Option<Vec<String>>,
    pub limit: Option<u32>,
}

/// Outcome of a chain verification walk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainReport {
    pub valid: bool,
    pub total: u64,
    /// Id of the first entry whose recomputed hash mismatched.
    pub first_broken_at: Option<String>,
}

// ─── ActivityLog ──────────────────────────────────────────────────────────────

pub struct ActivityLog {
    pool: SqlitePool,
    /// Serializes the read-tail + insert pair.
    writer: Mutex<()>,
}

impl ActivityLog {
    pub fn new(pool: SqlitePool) -> Self {
        ActivityLog {
            pool,
            writer: Mutex::new(()),
        }
    }

    /// Append one event, linking it to the current chain tail.
    pub async fn record(&self, event: NewEvent) -> Result<ActivityEvent, sqlx::Error> {
        let _guard = self.writer.lock().await;

        let prev_hash: String = sqlx::query_scalar(
            "SELECT entry_hash FROM activity_log ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or_default();

        let id = Uuid::now_v7().to_string();
        let created_at = proto::now_ms();
        let entry_hash = compute_entry_hash(
            &id,
            created_at,
            &event.actor_pubkey,
            &event.action_type,
            &event.connection_address,
            event.message_hash.as_deref().unwrap_or_default(),
            &prev_hash,
        );

        let row = ActivityEvent {
            id,
            connection_address: event.connection_address,
            event_type: event.event_type,
            actor_pubkey: event.actor_pubkey,
            action_type: event.action_type,
            message_id: event.message_id,
            message_hash: event.message_hash,
            details: event.details,
            created_at,
            prev_hash,
            entry_hash,
        };

        sqlx::query(
            "INSERT INTO activity_log
                 (id, connection_address, event_type, actor_pubkey, action_type,
                  message_id, message_hash, details, created_at, prev_hash, entry_hash)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.connection_address)
        .bind(&row.event_type)
        .bind(&row.actor_pubkey)
        .bind(&row.action_type)
        .bind(row.message_id.as_deref())
        .bind(row.message_hash.as_deref())
        .bind(row.details.as_deref())
        .bind(row.created_at)
        .bind(&row.prev_hash)
        .bind(&row.entry_hash)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    /// Query events, newest first.
    pub async fn get_events(&self, filter: EventFilter) -> Result<Vec<ActivityEvent>, sqlx::Error> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM activity_log WHERE 1=1");

        if let Some(addr) = &filter.connection_address {
            qb.push(" AND connection_address = ").push_bind(addr.clone());
        }
        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type.clone());
        }
        if let Some(since) = filter.since {
            qb.push(" AND created_at >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND created_at <= ").push_bind(until);
        }

        let excluded = filter
            .exclude_event_types
            .unwrap_or_else(|| vec![EVENT_MUTED_DELIVERY.to_string()]);
        // An explicit event_type filter overrides the exclusion list.
        if filter.event_type.is_none() {
            for event_type in excluded {
                qb.push(" AND event_type != ").push_bind(event_type);
            }
        }

        qb.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        qb.build_query_as::<ActivityEvent>().fetch_all(&self.pool).await
    }

    /// Walk the chain oldest-first, recomputing every hash from the stored
    /// fields and the predecessor's stored hash. With `tail_n`, only the
    /// most recent `n` entries are checked (seeded from the first stored
    /// `prev_hash` in the window).
    pub async fn verify_chain(&self, tail_n: Option<u64>) -> Result<ChainReport, sqlx::Error> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM activity_log")
            .fetch_one(&self.pool)
            .await?;
        let total = total as u64;

        let offset = match tail_n {
            Some(n) if n < total => (total - n) as i64,
            _ => 0,
        };
        let rows: Vec<ActivityEvent> = sqlx::query_as(
            "SELECT * FROM activity_log ORDER BY created_at ASC, id ASC LIMIT -1 OFFSET ?",
        )
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let mut expected_prev: Option<String> = if offset == 0 {
            Some(String::new())
        } else {
            // Tail verification cannot see the predecessor row; trust the
            // first window entry's stored link and verify from there.
            None
        };

        for row in &rows {
            if let Some(expected) = &expected_prev {
                if &row.prev_hash != expected {
                    return Ok(ChainReport {
                        valid: false,
                        total,
                        first_broken_at: Some(row.id.clone()),
                    });
                }
            }
            let recomputed = compute_entry_hash(
                &row.id,
                row.created_at,
                &row.actor_pubkey,
                &row.action_type,
                &row.connection_address,
                row.message_hash.as_deref().unwrap_or_default(),
                &row.prev_hash,
            );
            if recomputed != row.entry_hash {
                return Ok(ChainReport {
                    valid: false,
                    total,
                    first_broken_at: Some(row.id.clone()),
                });
            }
            expected_prev = Some(row.entry_hash.clone());
        }

        Ok(ChainReport {
            valid: true,
            total,
            first_broken_at: None,
        })
    }
}

/// The chain hash: fields joined by a literal `|` (0x7C), SHA-256, hex.
fn compute_entry_hash(
    id: &str,
    created_at: i64,
    actor_pubkey: &str,
    action_type: &str,
    connection_address: &str,
    message_hash: &str,
    prev_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in [
        id,
        &created_at.to_string(),
        actor_pubkey,
        action_type,
        connection_address,
        message_hash,
        prev_hash,
    ]
    .iter()
    .enumerate()
    {
        if i > 0 {
            hasher.update([0x7C]);
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::store::ClientStore;

    async fn test_log() -> (tempfile::TempDir, ActivityLog) {
        let dir = tempfile::tempdir().unwrap();
        let store = ClientStore::open(&dir.path().join("client.db")).await.unwrap();
        (dir, ActivityLog::new(store.pool()))
    }

    fn event(action: &str) -> NewEvent {
        NewEvent {
            connection_address: "pinch:bob@r".into(),
            event_type: "message".into(),
            actor_pubkey: "ab".repeat(32),
            action_type: action.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chain_links_and_verifies() {
        let (_dir, log) = test_log().await;
        let first = log.record(event("message_sent")).await.unwrap();
        assert_eq!(first.prev_hash, "");
        let second = log.record(event("message_received")).await.unwrap();
        assert_eq!(second.prev_hash, first.entry_hash);

        let report = log.verify_chain(None).await.unwrap();
        assert_eq!(
            report,
            ChainReport {
                valid: true,
                total: 2,
                first_broken_at: None
            }
        );
    }

    #[tokio::test]
    async fn tampering_is_detected_at_the_edited_entry() {
        let (_dir, log) = test_log().await;
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(log.record(event(&format!("a{i}"))).await.unwrap().id);
        }

        // Mutate entry 5's covered field directly in the store.
        sqlx::query("UPDATE activity_log SET action_type = 'forged' WHERE id = ?")
            .bind(&ids[4])
            .execute(&log.pool)
            .await
            .unwrap();

        let report = log.verify_chain(None).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.total, 10);
        assert_eq!(report.first_broken_at, Some(ids[4].clone()));
    }

    #[tokio::test]
    async fn tail_verification_checks_only_the_window() {
        let (_dir, log) = test_log().await;
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(log.record(event(&format!("a{i}"))).await.unwrap().id);
        }
        // Corrupt an early entry, outside a tail-3 window.
        sqlx::query("UPDATE activity_log SET action_type = 'forged' WHERE id = ?")
            .bind(&ids[0])
            .execute(&log.pool)
            .await
            .unwrap();

        assert!(log.verify_chain(Some(3)).await.unwrap().valid);
        assert!(!log.verify_chain(None).await.unwrap().valid);
    }

    #[tokio::test]
    async fn muted_deliveries_are_excluded_by_default() {
        let (_dir, log) = test_log().await;
        log.record(event("message_received")).await.unwrap();
        log.record(NewEvent {
            event_type: EVENT_MUTED_DELIVERY.into(),
            ..event("muted")
        })
        .await
        .unwrap();

        let defaults = log.get_events(EventFilter::default()).await.unwrap();
        assert_eq!(defaults.len(), 1);

        // Opting out of exclusion shows everything.
        let all = log
            .get_events(EventFilter {
                exclude_event_types: Some(vec![]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        // Asking for the muted type explicitly also works.
        let muted = log
            .get_events(EventFilter {
                event_type: Some(EVENT_MUTED_DELIVERY.into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(muted.len(), 1);
    }

    #[tokio::test]
    async fn filters_narrow_by_connection_and_time() {
        let (_dir, log) = test_log().await;
        let a = log.record(event("one")).await.unwrap();
        log.record(NewEvent {
            connection_address: "pinch:carol@r".into(),
            ..event("two")
        })
        .await
        .unwrap();

        let bob_only = log
            .get_events(EventFilter {
                connection_address: Some("pinch:bob@r".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bob_only.len(), 1);
        assert_eq!(bob_only[0].id, a.id);

        let none = log
            .get_events(EventFilter {
                until: Some(a.created_at - 1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
