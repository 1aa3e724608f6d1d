//! Client-side domain model: peer connections and message records.

use uuid::Uuid;

// ─── Connection ───────────────────────────────────────────────────────────────

/// Lifecycle of an application-level peer relationship. Distinct from the
/// relay handshake: a connection is requested, consented to, and revocable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    PendingOutbound,
    PendingInbound,
    Active,
    Revoked,
    Blocked,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::PendingOutbound => "pending_outbound",
            ConnectionState::PendingInbound => "pending_inbound",
            ConnectionState::Active => "active",
            ConnectionState::Revoked => "revoked",
            ConnectionState::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_outbound" => Some(ConnectionState::PendingOutbound),
            "pending_inbound" => Some(ConnectionState::PendingInbound),
            "active" => Some(ConnectionState::Active),
            "revoked" => Some(ConnectionState::Revoked),
            "blocked" => Some(ConnectionState::Blocked),
            _ => None,
        }
    }
}

/// Per-connection policy controlling what happens to inbound messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutonomyLevel {
    FullManual,
    Notify,
    AutoRespond,
    FullAuto,
}

impl AutonomyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyLevel::FullManual => "full_manual",
            AutonomyLevel::Notify => "notify",
            AutonomyLevel::AutoRespond => "auto_respond",
            AutonomyLevel::FullAuto => "full_auto",
        }
    }

    /// Unknown strings fall back to full manual — the safe default is a
    /// human in the loop.
    pub fn parse(s: &str) -> Self {
        match s {
            "notify" => AutonomyLevel::Notify,
            "auto_respond" => AutonomyLevel::AutoRespond,
            "full_auto" => AutonomyLevel::FullAuto,
            _ => AutonomyLevel::FullManual,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub address: String,
    pub state: ConnectionState,
    pub autonomy: AutonomyLevel,
    /// May be empty until exchanged; recoverable from the address.
    pub peer_public_key: Vec<u8>,
    pub muted: bool,
    /// Routes inbound to the human override path and tags outbound with
    /// human attribution.
    pub passthrough: bool,
    pub nickname: String,
    pub last_activity: String,
}

impl Connection {
    pub fn new(address: String, state: ConnectionState) -> Self {
        Connection {
            address,
            state,
            autonomy: AutonomyLevel::FullManual,
            peer_public_key: Vec::new(),
            muted: false,
            passthrough: false,
            nickname: String::new(),
            last_activity: chrono::Utc::now().to_rfc3339(),
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }
}

/// Observable lifecycle of a message record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    Sent,
    Relayed,
    Delivered,
    ReadByAgent,
    EscalatedToHuman,
    Failed,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Sent => "sent",
            MessageState::Relayed => "relayed",
            MessageState::Delivered => "delivered",
            MessageState::ReadByAgent => "read_by_agent",
            MessageState::EscalatedToHuman => "escalated_to_human",
            MessageState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(MessageState::Sent),
            "relayed" => Some(MessageState::Relayed),
            "delivered" => Some(MessageState::Delivered),
            "read_by_agent" => Some(MessageState::ReadByAgent),
            "escalated_to_human" => Some(MessageState::EscalatedToHuman),
            "failed" => Some(MessageState::Failed),
            _ => None,
        }
    }
}

/// Who authored a message body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Attribution {
    #[default]
    Agent,
    Human,
}

impl Attribution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Attribution::Agent => "agent",
            Attribution::Human => "human",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "human" => Attribution::Human,
            _ => Attribution::Agent,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MessageRecord {
    /// Hyphenated UUID form of the 16-byte wire message id.
    pub message_id: String,
    pub connection_address: String,
    pub direction: Direction,
    pub sequence: u64,
    pub state: MessageState,
    pub content: String,
    pub attribution: Attribution,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub created_at: String,
}

/// Canonical string form of a wire message id. Non-16-byte ids (never
/// produced by this implementation) fall back to hex.
pub fn message_id_str(bytes: &[u8]) -> String {
    match Uuid::from_slice(bytes) {
        Ok(uuid) => uuid.to_string(),
        Err(_) => hex::encode(bytes),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
