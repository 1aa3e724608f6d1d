//! Challenge-response authentication.
//!
//! The relay drives the exchange immediately after the transport upgrade,
//! before any other traffic:
//!
//! 1. relay → client  `AuthChallenge { nonce, issued_at, expires_at, relay_host }`
//! 2. client → relay  `AuthResponse { public_key, signature, nonce }`
//! 3. relay verifies and answers `AuthResult { success, assigned_address }`
//!
//! The signature covers `"pinch-auth-v1" ‖ 0x00 ‖ relay_host ‖ 0x00 ‖ nonce`
//! so a response cannot be replayed against a different relay. After a
//! successful exchange the relay binds the derived address to the session
//! and never again trusts a self-reported identity.

use ed25519_dalek::VerifyingKey;
use rand_core::{OsRng, RngCore};

use crate::identity::{self, Keypair};
use crate::proto::{self, AuthChallenge, AuthResponse};

/// Domain-separation context for the auth signature.
const AUTH_CONTEXT: &[u8] = b"pinch-auth-v1";

/// How long an issued challenge stays valid.
pub const CHALLENGE_TTL_MS: i64 = 30_000;

/// Both handshake phases (write challenge, read response) get this long.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("challenge expired")]
    Expired,
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("public key is not a valid ed25519 point")]
    BadKey,
    #[error("signature verification failed")]
    BadSignature,
}

/// Relay-side record of an outstanding challenge.
pub struct Challenge {
    pub nonce: [u8; 32],
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
    pub relay_host: String,
}

impl Challenge {
    /// Issue a fresh challenge bound to `relay_host`.
    pub fn issue(relay_host: &str) -> Self {
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let issued_at_ms = proto::now_ms();
        Challenge {
            nonce,
            issued_at_ms,
            expires_at_ms: issued_at_ms + CHALLENGE_TTL_MS,
            relay_host: relay_host.to_string(),
        }
    }

    /// The wire payload for this challenge.
    pub fn to_payload(&self) -> AuthChallenge {
        AuthChallenge {
            version: proto::WIRE_VERSION,
            nonce: self.nonce.to_vec(),
            issued_at_ms: self.issued_at_ms,
            expires_at_ms: self.expires_at_ms,
            relay_host: self.relay_host.clone(),
        }
    }

    /// Verify a client's response against this challenge.
    ///
    /// Expiry is strict: a response arriving even 1 ms past
    /// `expires_at_ms` is rejected. Returns the proven public key; the
    /// caller derives the session address from it.
    pub fn verify(&self, response: &AuthResponse, now_ms: i64) -> Result<VerifyingKey, AuthError> {
        if now_ms > self.expires_at_ms {
            return Err(AuthError::Expired);
        }
        if response.nonce != self.nonce {
            return Err(AuthError::NonceMismatch);
        }

        let key_bytes: [u8; 32] = response
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| AuthError::BadKey)?;
        let verifying = VerifyingKey::from_bytes(&key_bytes).map_err(|_| AuthError::BadKey)?;

        let message = signing_bytes(&self.relay_host, &self.nonce);
        if !identity::verify_detached(&key_bytes, &message, &response.signature) {
            return Err(AuthError::BadSignature);
        }
        Ok(verifying)
    }
}

/// Canonical auth payload: context, relay host, and nonce joined by NUL.
fn signing_bytes(relay_host: &str, nonce: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(AUTH_CONTEXT.len() + relay_host.len() + nonce.len() + 2);
    buf.extend_from_slice(AUTH_CONTEXT);
    buf.push(0);
    buf.extend_from_slice(relay_host.as_bytes());
    buf.push(0);
    buf.extend_from_slice(nonce);
    buf
}

/// Client side: answer a challenge by proving possession of the signing key.
pub fn respond(keypair: &Keypair, challenge: &AuthChallenge) -> AuthResponse {
    let signature = keypair.sign(&signing_bytes(&challenge.relay_host, &challenge.nonce));
    AuthResponse {
        version: proto::WIRE_VERSION,
        public_key: keypair.public_key_bytes().to_vec(),
        signature: signature.to_vec(),
        nonce: challenge.nonce.clone(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
