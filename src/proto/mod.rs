//! Wire protocol types — the envelope every frame on the relay transport
//! carries, plus its tagged payload variants.
//!
//! The encoding is protocol-buffer wire format with hand-assigned field
//! numbers so the Rust and non-Rust implementations share one schema:
//!
//!   Envelope: version=1, from_address=2, to_address=3, type=4,
//!             message_id=5 (16 bytes), timestamp=6 (ms since epoch),
//!             payload oneof tags 10–24 (see [`Payload`]).
//!
//! Field numbers and the oneof ordering are wire-stable: renumbering is a
//! protocol break. The relay reads only routing fields; `EncryptedPayload`
//! contents never exist in plaintext on the relay side.

pub mod codec;

pub use codec::{decode, encode, ProtoError};

use chrono::Utc;
use uuid::Uuid;

/// Protocol revision carried in `Envelope.version`.
pub const WIRE_VERSION: u32 = 1;

/// Maximum serialized envelope size accepted at the application layer.
/// The transport read cap is 2× this so oversized envelopes can be dropped
/// silently instead of tearing down the connection.
pub const MAX_ENVELOPE_BYTES: usize = 65_536;

/// Current time as milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Fresh 16-byte message id. UUIDv7 so ids sort by creation time.
pub fn new_message_id() -> Vec<u8> {
    Uuid::now_v7().into_bytes().to_vec()
}

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// Message type discriminant. Numbers are part of the wire contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum EnvelopeType {
    Unspecified = 0,
    Handshake = 1,
    AuthChallenge = 2,
    AuthResponse = 3,
    Message = 4,
    DeliveryConfirm = 5,
    ConnectionRequest = 6,
    ConnectionResponse = 7,
    Heartbeat = 8,
    AuthResult = 9,
    ConnectionRevoke = 10,
    BlockNotification = 11,
    UnblockNotification = 12,
    QueueStatus = 13,
    QueueFull = 14,
    RateLimited = 15,
}

/// The outer wire message. Everything the relay ever sees.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Envelope {
    pub version: u32,
    pub from_address: String,
    pub to_address: String,
    pub r#type: i32,
    pub message_id: Vec<u8>,
    pub timestamp: i64,
    pub payload: Option<Payload>,
}

impl Envelope {
    /// Build an envelope of `kind` with a fresh v7 message id and the
    /// current timestamp. Addresses start empty; callers fill in routing.
    pub fn new(kind: EnvelopeType, payload: Payload) -> Self {
        Envelope {
            version: WIRE_VERSION,
            from_address: String::new(),
            to_address: String::new(),
            r#type: kind as i32,
            message_id: new_message_id(),
            timestamp: now_ms(),
            payload: Some(payload),
        }
    }

    /// Typed view of the `type` field; unknown discriminants read as
    /// `Unspecified`.
    pub fn r#type(&self) -> EnvelopeType {
        EnvelopeType::try_from(self.r#type).unwrap_or(EnvelopeType::Unspecified)
    }

    pub fn set_type(&mut self, kind: EnvelopeType) {
        self.r#type = kind as i32;
    }
}

// ─── Payload oneof ────────────────────────────────────────────────────────────

/// Tagged payload union. Tags 10–24 are the oneof field numbers; variants
/// from newer protocol revisions survive a decode/encode round trip via
/// [`Payload::Unknown`].
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Encrypted(EncryptedPayload),
    Handshake(Handshake),
    Heartbeat(Heartbeat),
    AuthChallenge(AuthChallenge),
    AuthResponse(AuthResponse),
    AuthResult(AuthResult),
    ConnectionRequest(ConnectionRequest),
    ConnectionResponse(ConnectionResponse),
    ConnectionRevoke(ConnectionRevoke),
    BlockNotification(BlockNotification),
    UnblockNotification(UnblockNotification),
    DeliveryConfirm(DeliveryConfirm),
    QueueStatus(QueueStatus),
    QueueFull(QueueFull),
    RateLimited(RateLimited),
    /// A payload field number this build does not recognize. The raw
    /// length-delimited bytes are kept so the envelope re-encodes intact.
    Unknown { tag: u32, data: Vec<u8> },
}

impl Payload {
    /// Overwrite every sender-identifying payload field with the
    /// authenticated sender address. The relay calls this before routing so
    /// a client can never claim another agent's identity inside a payload.
    pub fn normalize_sender(&mut self, addr: &str) {
        match self {
            Payload::Handshake(p) => p.from_address = addr.to_string(),
            Payload::ConnectionRequest(p) => p.from_address = addr.to_string(),
            Payload::ConnectionResponse(p) => p.from_address = addr.to_string(),
            Payload::ConnectionRevoke(p) => p.from_address = addr.to_string(),
            Payload::BlockNotification(p) => p.from_address = addr.to_string(),
            Payload::UnblockNotification(p) => p.from_address = addr.to_string(),
            _ => {}
        }
    }
}

// ─── Payload messages ─────────────────────────────────────────────────────────

/// Ciphertext container. `ciphertext` wraps a serialized
/// [`PlaintextPayload`]; the relay treats it as opaque bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EncryptedPayload {
    /// 24 random bytes, fresh per message.
    #[prost(bytes = "vec", tag = "1")]
    pub nonce: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub ciphertext: Vec<u8>,
    /// Sender's ed25519 public key (32 bytes) so the recipient can derive
    /// the box key without a directory lookup.
    #[prost(bytes = "vec", tag = "3")]
    pub sender_public_key: Vec<u8>,
}

/// What the ciphertext decrypts to. Never serialized outside a sealed box.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PlaintextPayload {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Strictly monotonic per peer-connection; replay defense.
    #[prost(uint64, tag = "2")]
    pub sequence: u64,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub content: Vec<u8>,
    #[prost(string, tag = "5")]
    pub content_type: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Handshake {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub display_name: String,
    #[prost(bytes = "vec", tag = "3")]
    pub public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Heartbeat {
    #[prost(int64, tag = "1")]
    pub sent_at_ms: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthChallenge {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// 32 random bytes, single use.
    #[prost(bytes = "vec", tag = "2")]
    pub nonce: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub issued_at_ms: i64,
    #[prost(int64, tag = "4")]
    pub expires_at_ms: i64,
    /// Host the client must sign over — binds the response to this relay.
    #[prost(string, tag = "5")]
    pub relay_host: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthResponse {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
    /// Detached ed25519 signature over the canonical auth payload.
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
    /// Echo of the challenge nonce.
    #[prost(bytes = "vec", tag = "4")]
    pub nonce: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AuthResult {
    #[prost(bool, tag = "1")]
    pub success: bool,
    /// Canonical address the relay derived for this session. The client
    /// adopts it verbatim; self-reported addresses are never honored.
    #[prost(string, tag = "2")]
    pub assigned_address: String,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionRequest {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub display_name: String,
    #[prost(string, tag = "3")]
    pub intro: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionResponse {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(bool, tag = "2")]
    pub accepted: bool,
    #[prost(string, tag = "3")]
    pub note: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectionRevoke {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct BlockNotification {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub blocked_address: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UnblockNotification {
    #[prost(string, tag = "1")]
    pub from_address: String,
    #[prost(string, tag = "2")]
    pub unblocked_address: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeliveryConfirm {
    #[prost(bytes = "vec", tag = "1")]
    pub message_id: Vec<u8>,
    /// Detached signature over `message_id ‖ be_i64(timestamp)`.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(string, tag = "4")]
    pub state: String,
    /// True when the message was drained from the relay's durable queue
    /// rather than delivered live.
    #[prost(bool, tag = "5")]
    pub was_stored: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueStatus {
    #[prost(uint64, tag = "1")]
    pub pending_count: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct QueueFull {
    #[prost(string, tag = "1")]
    pub recipient_address: String,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RateLimited {
    #[prost(int64, tag = "1")]
    pub retry_after_ms: i64,
    #[prost(string, tag = "2")]
    pub reason: String,
}

// ─── Tests ────────────────────────────────────────────────────────────────────
