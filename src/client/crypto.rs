//! E2E encryption between two agents.
//!
//! Protocol: static x25519 key agreement over converted ed25519 keys →
//! HKDF-SHA256 key derivation → XChaCha20-Poly1305 AEAD with a fresh
//! 24-byte random nonce per message.
//!
//! The derived key is symmetric in both directions (DH commutes and the
//! HKDF info string is fixed), so one [`MessageBox`] both seals outbound
//! and opens inbound traffic for a peer. The sender's signing public key
//! travels in `EncryptedPayload.sender_public_key`, letting the recipient
//! derive the same box without a directory lookup.
//!
//! This module also owns the delivery-confirmation signing domain: the
//! exact byte concatenation `message_id ‖ be_i64(timestamp)` lives in one
//! place so sender and recipient cannot disagree on it.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::VerifyingKey;
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::identity::{encryption_public_key, Keypair};

/// Nonce length of the box construction.
pub const NONCE_LEN: usize = 24;

/// HKDF info string — versioned so a future construction can re-key.
const BOX_INFO: &[u8] = b"pinch-box-v1";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("nonce must be {NONCE_LEN} bytes, got {0}")]
    BadNonce(usize),
    #[error("AEAD open failed — wrong key or tampered ciphertext")]
    Open,
    #[error("AEAD seal failed")]
    Seal,
}

/// A pairwise cipher between the local identity and one peer.
pub struct MessageBox {
    cipher: XChaCha20Poly1305,
}

impl MessageBox {
    /// Derive the box for `(local, peer)`. Either side constructing this
    /// from its own half arrives at the same key.
    pub fn new(local: &Keypair, peer: &VerifyingKey) -> Result<Self, CryptoError> {
        let shared = local
            .encryption_secret()
            .diffie_hellman(&encryption_public_key(peer));

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(BOX_INFO, &mut okm)
            .map_err(|_| CryptoError::KeyDerivation)?;

        Ok(MessageBox {
            cipher: XChaCha20Poly1305::new(Key::from_slice(&okm)),
        })
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    /// Returns `(nonce, ciphertext)` for the `EncryptedPayload` fields.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Seal)?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt and authenticate a received `(nonce, ciphertext)` pair.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::BadNonce(nonce.len()));
        }
        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}

// ─── Delivery confirmation signing ────────────────────────────────────────────

/// Canonical bytes a delivery confirmation signs: the 16-byte message id
/// followed by the big-endian i64 timestamp (24 bytes total).
pub fn confirm_signing_bytes(message_id: &[u8], timestamp: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(message_id.len() + 8);
    buf.extend_from_slice(message_id);
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf
}

/// Sign a delivery confirmation with the recipient's signing key.
pub fn sign_confirm(keypair: &Keypair, message_id: &[u8], timestamp: i64) -> [u8; 64] {
    keypair.sign(&confirm_signing_bytes(message_id, timestamp))
}

/// Verify a delivery confirmation under the confirming peer's public key.
pub fn verify_confirm(
    peer_public_key: &[u8],
    message_id: &[u8],
    timestamp: i64,
    signature: &[u8],
) -> bool {
    crate::identity::verify_detached(
        peer_public_key,
        &confirm_signing_bytes(message_id, timestamp),
        signature,
    )
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip_across_peers() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        let alice_box = MessageBox::new(&alice, &bob.verifying_key()).unwrap();
        let bob_box = MessageBox::new(&bob, &alice.verifying_key()).unwrap();

        let (nonce, ct) = alice_box.seal(b"hello bob").unwrap();
        assert_eq!(bob_box.open(&nonce, &ct).unwrap(), b"hello bob");
    }

    #[test]
    fn tampered_ciphertext_fails_open() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let alice_box = MessageBox::new(&alice, &bob.verifying_key()).unwrap();
        let bob_box = MessageBox::new(&bob, &alice.verifying_key()).unwrap();

        let (nonce, mut ct) = alice_box.seal(b"payload").unwrap();
        ct[0] ^= 0x01;
        assert!(matches!(bob_box.open(&nonce, &ct), Err(CryptoError::Open)));
    }

    #[test]
    fn wrong_peer_cannot_open() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let eve = Keypair::generate();

        let alice_box = MessageBox::new(&alice, &bob.verifying_key()).unwrap();
        let eve_box = MessageBox::new(&eve, &alice.verifying_key()).unwrap();

        let (nonce, ct) = alice_box.seal(b"secret").unwrap();
        assert!(eve_box.open(&nonce, &ct).is_err());
    }

    #[test]
    fn short_nonce_is_rejected_before_decrypt() {
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let bob_box = MessageBox::new(&bob, &alice.verifying_key()).unwrap();
        assert!(matches!(
            bob_box.open(&[0u8; 12], b"whatever"),
            Err(CryptoError::BadNonce(12))
        ));
    }

    #[test]
    fn confirm_signature_covers_both_fields() {
        let bob = Keypair::generate();
        let id = [7u8; 16];
        let ts = 1_700_000_000_123i64;
        let sig = sign_confirm(&bob, &id, ts);

        assert!(verify_confirm(&bob.public_key_bytes(), &id, ts, &sig));
        // Tamper with the timestamp.
        assert!(!verify_confirm(&bob.public_key_bytes(), &id, ts + 1, &sig));
        // Tamper with the message id.
        let mut other = id;
        other[0] ^= 1;
        assert!(!verify_confirm(&bob.public_key_bytes(), &other, ts, &sig));
    }

    #[test]
    fn confirm_domain_is_24_bytes() {
        let bytes = confirm_signing_bytes(&[0u8; 16], 42);
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[16..], &42i64.to_be_bytes());
    }
}
