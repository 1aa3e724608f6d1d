//! Client send/receive pipeline.
//!
//! Everything between the application ("send this text to that peer") and
//! the wire (opaque envelopes): sequence allocation, attribution
//! wrapping, box encryption, message persistence, autonomy routing,
//! signed delivery confirmations, and the connection consent lifecycle.
//!
//! The pipeline is transport-free — it consumes decoded envelopes and
//! returns the envelopes to ship in reply — so the whole protocol
//! surface is testable without a socket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use ed25519_dalek::VerifyingKey;
use prost::Message as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::crypto::{self, CryptoError, MessageBox};
use super::model::{
    message_id_str, Attribution, Connection, ConnectionState, Direction, MessageRecord,
    MessageState,
};
use super::router::{route_inbound, Disposition};
use super::store::ClientStore;
use crate::activity::{ActivityLog, NewEvent, EVENT_MESSAGE_DURING_INTERVENTION, EVENT_MUTED_DELIVERY};
use crate::identity::{parse_address, AddressError, Keypair};
use crate::proto::{self, Envelope, EnvelopeType, Payload, PlaintextPayload};

/// Content type for plain message bodies.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Content type carrying `{text, attribution}` JSON.
pub const CONTENT_TYPE_PINCH_JSON: &str = "application/x-pinch+json";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no connection with {0}")]
    UnknownPeer(String),
    #[error("connection with {0} is not active")]
    NotActive(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("peer key unavailable: {0}")]
    Address(#[from] AddressError),
}

/// Options for [`Pipeline::send_message`].
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Explicit attribution wraps the body as `application/x-pinch+json`.
    pub attribution: Option<Attribution>,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
}

/// The `application/x-pinch+json` body.
#[derive(Serialize, Deserialize)]
struct AttributedBody {
    text: String,
    attribution: String,
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    keypair: Keypair,
    store: ClientStore,
    activity: ActivityLog,
    /// Relay-assigned address; empty until the first successful auth.
    address: RwLock<String>,
    /// Backlog countdown after a `QueueStatus`: messages arriving while
    /// this is positive were drained from the durable queue, so their
    /// confirmations carry `was_stored = true`.
    draining: AtomicU64,
}

impl Pipeline {
    pub fn new(keypair: Keypair, store: ClientStore, activity: ActivityLog) -> Self {
        Pipeline {
            keypair,
            store,
            activity,
            address: RwLock::new(String::new()),
            draining: AtomicU64::new(0),
        }
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    /// Adopt the address the relay assigned at auth.
    pub fn set_address(&self, address: &str) {
        *self.address.write().unwrap_or_else(|e| e.into_inner()) = address.to_string();
    }

    pub fn address(&self) -> String {
        self.address.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn own_pubkey_hex(&self) -> String {
        hex::encode(self.keypair.public_key_bytes())
    }

    /// The peer's signing key: the exchanged key when present, otherwise
    /// recovered from the address itself.
    fn peer_verifying_key(&self, conn: &Connection) -> Result<VerifyingKey, ClientError> {
        if let Ok(bytes) = <[u8; 32]>::try_from(conn.peer_public_key.as_slice()) {
            if let Ok(key) = VerifyingKey::from_bytes(&bytes) {
                return Ok(key);
            }
        }
        Ok(parse_address(&conn.address)?.0)
    }

    // ── Send ──────────────────────────────────────────────────────────────────

    /// Encrypt and persist an outbound message. Returns the message id
    /// (canonical string form) and the envelope to ship; the local record
    /// starts in `sent` and advances when a verified confirmation lands.
    pub async fn send_message(
        &self,
        to: &str,
        body: &str,
        opts: SendOptions,
    ) -> Result<(String, Envelope), ClientError> {
        let conn = self
            .store
            .get_connection(to)
            .await?
            .ok_or_else(|| ClientError::UnknownPeer(to.to_string()))?;
        if conn.state != ConnectionState::Active {
            return Err(ClientError::NotActive(to.to_string()));
        }

        let sequence = self.store.next_sequence(to).await?;

        // Passthrough connections always speak with human attribution.
        let attribution = if conn.passthrough {
            Attribution::Human
        } else {
            opts.attribution.unwrap_or_default()
        };
        let (content, content_type) = if conn.passthrough || opts.attribution.is_some() {
            let wrapped = serde_json::to_vec(&AttributedBody {
                text: body.to_string(),
                attribution: attribution.as_str().to_string(),
            })
            .unwrap_or_else(|_| body.as_bytes().to_vec());
            (wrapped, CONTENT_TYPE_PINCH_JSON)
        } else {
            (body.as_bytes().to_vec(), CONTENT_TYPE_TEXT)
        };

        let plaintext = PlaintextPayload {
            version: proto::WIRE_VERSION,
            sequence,
            timestamp: proto::now_ms(),
            content,
            content_type: content_type.to_string(),
        };

        let peer_key = self.peer_verifying_key(&conn)?;
        let mbox = MessageBox::new(&self.keypair, &peer_key)?;
        let (nonce, ciphertext) = mbox.seal(&plaintext.encode_to_vec())?;

        let mut envelope = Envelope::new(
            EnvelopeType::Message,
            Payload::Encrypted(proto::EncryptedPayload {
                nonce: nonce.to_vec(),
                ciphertext,
                sender_public_key: self.keypair.public_key_bytes().to_vec(),
            }),
        );
        envelope.from_address = self.address();
        envelope.to_address = to.to_string();

        let message_id = message_id_str(&envelope.message_id);
        self.store
            .insert_message(&MessageRecord {
                message_id: message_id.clone(),
                connection_address: to.to_string(),
                direction: Direction::Outbound,
                sequence,
                state: MessageState::Sent,
                content: body.to_string(),
                attribution,
                thread_id: opts.thread_id,
                reply_to: opts.reply_to,
                created_at: chrono::Utc::now().to_rfc3339(),
            })
            .await?;

        self.record_activity(NewEvent {
            connection_address: to.to_string(),
            event_type: "message".to_string(),
            actor_pubkey: self.own_pubkey_hex(),
            action_type: "message_sent".to_string(),
            message_id: Some(message_id.clone()),
            message_hash: Some(content_hash(body)),
            details: None,
        })
        .await;

        Ok((message_id, envelope))
    }

    // ── Receive ───────────────────────────────────────────────────────────────

    /// Process one inbound envelope; returns envelopes to send in reply.
    pub async fn handle_incoming(&self, envelope: Envelope) -> Result<Vec<Envelope>, ClientError> {
        match envelope.payload.clone() {
            Some(Payload::Encrypted(enc)) => self.handle_encrypted(&envelope, &enc).await,
            Some(Payload::DeliveryConfirm(confirm)) => {
                self.handle_confirm(&envelope, &confirm).await
            }
            Some(Payload::QueueStatus(status)) => {
                debug!(pending = status.pending_count, "queued backlog incoming");
                self.draining.store(status.pending_count, Ordering::SeqCst);
                Ok(Vec::new())
            }
            Some(Payload::QueueFull(full)) => {
                let failed = self
                    .store
                    .fail_latest_sent(Some(&full.recipient_address))
                    .await?;
                warn!(
                    recipient = %full.recipient_address,
                    failed = failed.as_deref().unwrap_or("-"),
                    "recipient queue full"
                );
                Ok(Vec::new())
            }
            Some(Payload::RateLimited(limited)) => {
                let failed = self.store.fail_latest_sent(None).await?;
                warn!(
                    retry_after_ms = limited.retry_after_ms,
                    failed = failed.as_deref().unwrap_or("-"),
                    "rate limited by relay"
                );
                Ok(Vec::new())
            }
            Some(Payload::ConnectionRequest(request)) => {
                self.handle_connection_request(&envelope, request.display_name).await
            }
            Some(Payload::ConnectionResponse(response)) => {
                self.handle_connection_response(&envelope, response.accepted).await
            }
            Some(Payload::ConnectionRevoke(_)) => self.handle_connection_revoke(&envelope).await,
            Some(Payload::Heartbeat(_)) | Some(Payload::Handshake(_)) => Ok(Vec::new()),
            other => {
                debug!(
                    kind = envelope.r#type,
                    tag = other.map(|p| p.wire_tag()).unwrap_or_default(),
                    "unhandled envelope"
                );
                Ok(Vec::new())
            }
        }
    }

    async fn handle_encrypted(
        &self,
        envelope: &Envelope,
        enc: &proto::EncryptedPayload,
    ) -> Result<Vec<Envelope>, ClientError> {
        let from = envelope.from_address.clone();
        let Some(conn) = self.store.get_connection(&from).await? else {
            debug!(%from, "message from unknown peer dropped");
            return Ok(Vec::new());
        };
        if conn.state != ConnectionState::Active {
            debug!(%from, state = conn.state.as_str(), "message on inactive connection dropped");
            return Ok(Vec::new());
        }

        // Count this arrival against the post-reconnect backlog whether or
        // not it ends up processed — the relay drained it either way.
        let was_stored = self
            .draining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let message_id = message_id_str(&envelope.message_id);
        let peer_key = self.peer_verifying_key(&conn)?;

        // Muted connections acknowledge but never surface content: the
        // ciphertext stays sealed and only an excluded-by-default
        // activity event records the arrival.
        if conn.muted {
            self.store
                .insert_message(&MessageRecord {
                    message_id: message_id.clone(),
                    connection_address: from.clone(),
                    direction: Direction::Inbound,
                    sequence: 0,
                    state: MessageState::Delivered,
                    content: String::new(),
                    attribution: Attribution::Agent,
                    thread_id: None,
                    reply_to: None,
                    created_at: chrono::Utc::now().to_rfc3339(),
                })
                .await?;
            self.record_activity(NewEvent {
                connection_address: from.clone(),
                event_type: EVENT_MUTED_DELIVERY.to_string(),
                actor_pubkey: hex::encode(peer_key.to_bytes()),
                action_type: "message_received".to_string(),
                message_id: Some(message_id),
                message_hash: None,
                details: None,
            })
            .await;
            return Ok(vec![self.build_confirm(envelope, MessageState::Delivered, was_stored)]);
        }

        let mbox = MessageBox::new(&self.keypair, &peer_key)?;
        let plaintext_bytes = match mbox.open(&enc.nonce, &enc.ciphertext) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(%from, err = %e, "undecryptable message dropped");
                return Ok(Vec::new());
            }
        };
        let plaintext = match PlaintextPayload::decode(plaintext_bytes.as_slice()) {
            Ok(p) => p,
            Err(e) => {
                debug!(%from, err = %e, "malformed plaintext payload dropped");
                return Ok(Vec::new());
            }
        };

        let (content, attribution) = parse_content(&plaintext);
        let disposition = route_inbound(conn.passthrough, conn.autonomy);
        let state = disposition.message_state();

        let inserted = self
            .store
            .insert_message(&MessageRecord {
                message_id: message_id.clone(),
                connection_address: from.clone(),
                direction: Direction::Inbound,
                sequence: plaintext.sequence,
                state,
                content: content.clone(),
                attribution,
                thread_id: None,
                reply_to: None,
                created_at: chrono::Utc::now().to_rfc3339(),
            })
            .await?;

        if inserted {
            if let Disposition::EscalateToHuman { intervention: true } = disposition {
                self.record_activity(NewEvent {
                    connection_address: from.clone(),
                    event_type: EVENT_MESSAGE_DURING_INTERVENTION.to_string(),
                    actor_pubkey: hex::encode(peer_key.to_bytes()),
                    action_type: "message_received".to_string(),
                    message_id: Some(message_id.clone()),
                    message_hash: Some(content_hash(&content)),
                    details: None,
                })
                .await;
            }
            self.record_activity(NewEvent {
                connection_address: from.clone(),
                event_type: "message".to_string(),
                actor_pubkey: hex::encode(peer_key.to_bytes()),
                action_type: "message_received".to_string(),
                message_id: Some(message_id.clone()),
                message_hash: Some(content_hash(&content)),
                details: None,
            })
            .await;
        } else {
            debug!(%from, %message_id, "duplicate delivery — record kept, confirm re-sent");
        }

        Ok(vec![self.build_confirm(envelope, state, was_stored)])
    }

    fn build_confirm(
        &self,
        envelope: &Envelope,
        state: MessageState,
        was_stored: bool,
    ) -> Envelope {
        let timestamp = proto::now_ms();
        let signature = crypto::sign_confirm(&self.keypair, &envelope.message_id, timestamp);
        let mut confirm = Envelope::new(
            EnvelopeType::DeliveryConfirm,
            Payload::DeliveryConfirm(proto::DeliveryConfirm {
                message_id: envelope.message_id.clone(),
                signature: signature.to_vec(),
                timestamp,
                state: state.as_str().to_string(),
                was_stored,
            }),
        );
        confirm.from_address = self.address();
        confirm.to_address = envelope.from_address.clone();
        confirm
    }

    /// A confirmation only moves local state if its signature verifies
    /// under the confirming peer's key over `message_id ‖ be_i64(ts)`.
    async fn handle_confirm(
        &self,
        envelope: &Envelope,
        confirm: &proto::DeliveryConfirm,
    ) -> Result<Vec<Envelope>, ClientError> {
        let from = envelope.from_address.clone();
        let Some(conn) = self.store.get_connection(&from).await? else {
            debug!(%from, "confirm from unknown peer dropped");
            return Ok(Vec::new());
        };
        let peer_key = self.peer_verifying_key(&conn)?;

        if !crypto::verify_confirm(
            &peer_key.to_bytes(),
            &confirm.message_id,
            confirm.timestamp,
            &confirm.signature,
        ) {
            debug!(%from, "unverifiable delivery confirm dropped");
            return Ok(Vec::new());
        }

        let message_id = message_id_str(&confirm.message_id);
        if let Some(record) = self.store.get_message(&message_id).await? {
            if record.direction == Direction::Outbound {
                let state = MessageState::parse(&confirm.state).unwrap_or(MessageState::Delivered);
                self.store.set_message_state(&message_id, state).await?;
                self.record_activity(NewEvent {
                    connection_address: from,
                    event_type: "message".to_string(),
                    actor_pubkey: hex::encode(peer_key.to_bytes()),
                    action_type: "delivery_confirmed".to_string(),
                    message_id: Some(message_id),
                    message_hash: None,
                    details: Some(format!("was_stored={}", confirm.was_stored)),
                })
                .await;
            }
        }
        Ok(Vec::new())
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    async fn handle_connection_request(
        &self,
        envelope: &Envelope,
        display_name: String,
    ) -> Result<Vec<Envelope>, ClientError> {
        let from = envelope.from_address.clone();
        if let Some(existing) = self.store.get_connection(&from).await? {
            // Blocked peers do not get to re-knock; anything else is a
            // repeat request and keeps its current state.
            debug!(%from, state = existing.state.as_str(), "repeat connection request");
            return Ok(Vec::new());
        }

        let mut conn = Connection::new(from.clone(), ConnectionState::PendingInbound);
        conn.nickname = display_name;
        if let Ok((key, _)) = parse_address(&from) {
            conn.peer_public_key = key.to_bytes().to_vec();
        }
        self.store.upsert_connection(&conn).await?;

        self.record_activity(NewEvent {
            connection_address: from,
            event_type: "connection".to_string(),
            actor_pubkey: hex::encode(conn.peer_public_key),
            action_type: "connection_requested".to_string(),
            message_id: None,
            message_hash: None,
            details: None,
        })
        .await;
        Ok(Vec::new())
    }

    async fn handle_connection_response(
        &self,
        envelope: &Envelope,
        accepted: bool,
    ) -> Result<Vec<Envelope>, ClientError> {
        let from = envelope.from_address.clone();
        let Some(conn) = self.store.get_connection(&from).await? else {
            debug!(%from, "connection response without a pending request");
            return Ok(Vec::new());
        };
        if conn.state != ConnectionState::PendingOutbound {
            debug!(%from, state = conn.state.as_str(), "unexpected connection response");
            return Ok(Vec::new());
        }

        let state = if accepted {
            ConnectionState::Active
        } else {
            ConnectionState::Revoked
        };
        self.store.set_connection_state(&from, state).await?;
        self.record_activity(NewEvent {
            connection_address: from,
            event_type: "connection".to_string(),
            actor_pubkey: hex::encode(conn.peer_public_key),
            action_type: if accepted {
                "connection_accepted".to_string()
            } else {
                "connection_declined".to_string()
            },
            message_id: None,
            message_hash: None,
            details: None,
        })
        .await;
        Ok(Vec::new())
    }

    async fn handle_connection_revoke(
        &self,
        envelope: &Envelope,
    ) -> Result<Vec<Envelope>, ClientError> {
        let from = envelope.from_address.clone();
        if self.store.get_connection(&from).await?.is_none() {
            return Ok(Vec::new());
        }
        self.store
            .set_connection_state(&from, ConnectionState::Revoked)
            .await?;
        self.record_activity(NewEvent {
            connection_address: from,
            event_type: "connection".to_string(),
            actor_pubkey: String::new(),
            action_type: "connection_revoked_by_peer".to_string(),
            message_id: None,
            message_hash: None,
            details: None,
        })
        .await;
        Ok(Vec::new())
    }

    /// Ask `to` for a connection. Creates the local `pending_outbound`
    /// record and returns the request envelope to ship.
    pub async fn request_connection(
        &self,
        to: &str,
        display_name: &str,
        intro: &str,
    ) -> Result<Envelope, ClientError> {
        let mut conn = Connection::new(to.to_string(), ConnectionState::PendingOutbound);
        if let Ok((key, _)) = parse_address(to) {
            conn.peer_public_key = key.to_bytes().to_vec();
        }
        self.store.upsert_connection(&conn).await?;

        let mut envelope = Envelope::new(
            EnvelopeType::ConnectionRequest,
            Payload::ConnectionRequest(proto::ConnectionRequest {
                from_address: self.address(),
                display_name: display_name.to_string(),
                intro: intro.to_string(),
            }),
        );
        envelope.from_address = self.address();
        envelope.to_address = to.to_string();
        Ok(envelope)
    }

    /// Answer a pending inbound request.
    pub async fn respond_connection(
        &self,
        to: &str,
        accepted: bool,
        note: &str,
    ) -> Result<Envelope, ClientError> {
        let conn = self
            .store
            .get_connection(to)
            .await?
            .ok_or_else(|| ClientError::UnknownPeer(to.to_string()))?;
        let state = if accepted {
            ConnectionState::Active
        } else {
            ConnectionState::Revoked
        };
        self.store.set_connection_state(&conn.address, state).await?;

        let mut envelope = Envelope::new(
            EnvelopeType::ConnectionResponse,
            Payload::ConnectionResponse(proto::ConnectionResponse {
                from_address: self.address(),
                accepted,
                note: note.to_string(),
            }),
        );
        envelope.from_address = self.address();
        envelope.to_address = to.to_string();
        Ok(envelope)
    }

    /// Withdraw consent for an established connection.
    pub async fn revoke_connection(&self, to: &str, reason: &str) -> Result<Envelope, ClientError> {
        self.store
            .set_connection_state(to, ConnectionState::Revoked)
            .await?;
        self.record_activity(NewEvent {
            connection_address: to.to_string(),
            event_type: "connection".to_string(),
            actor_pubkey: self.own_pubkey_hex(),
            action_type: "connection_revoked".to_string(),
            message_id: None,
            message_hash: None,
            details: Some(reason.to_string()),
        })
        .await;

        let mut envelope = Envelope::new(
            EnvelopeType::ConnectionRevoke,
            Payload::ConnectionRevoke(proto::ConnectionRevoke {
                from_address: self.address(),
                reason: reason.to_string(),
            }),
        );
        envelope.from_address = self.address();
        envelope.to_address = to.to_string();
        Ok(envelope)
    }

    /// Block a peer: local state plus the relay-side block notification.
    pub async fn block_peer(&self, peer: &str) -> Result<Envelope, ClientError> {
        self.store
            .set_connection_state(peer, ConnectionState::Blocked)
            .await?;
        let mut envelope = Envelope::new(
            EnvelopeType::BlockNotification,
            Payload::BlockNotification(proto::BlockNotification {
                from_address: self.address(),
                blocked_address: peer.to_string(),
            }),
        );
        envelope.from_address = self.address();
        Ok(envelope)
    }

    /// Lift a block. The connection drops back to `revoked` — consent
    /// must be re-established explicitly.
    pub async fn unblock_peer(&self, peer: &str) -> Result<Envelope, ClientError> {
        self.store
            .set_connection_state(peer, ConnectionState::Revoked)
            .await?;
        let mut envelope = Envelope::new(
            EnvelopeType::UnblockNotification,
            Payload::UnblockNotification(proto::UnblockNotification {
                from_address: self.address(),
                unblocked_address: peer.to_string(),
            }),
        );
        envelope.from_address = self.address();
        Ok(envelope)
    }

    /// Activity logging never fails the pipeline.
    async fn record_activity(&self, event: NewEvent) {
        if let Err(e) = self.activity.record(event).await {
            warn!(err = %e, "activity log write failed");
        }
    }
}

fn parse_content(plaintext: &PlaintextPayload) -> (String, Attribution) {
    if plaintext.content_type == CONTENT_TYPE_PINCH_JSON {
        if let Ok(body) = serde_json::from_slice::<AttributedBody>(&plaintext.content) {
            return (body.text, Attribution::parse(&body.attribution));
        }
    }
    (
        String::from_utf8_lossy(&plaintext.content).into_owned(),
        Attribution::Agent,
    )
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
