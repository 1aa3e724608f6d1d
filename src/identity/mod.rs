//! Agent identity: ed25519 signing keypairs and the `pinch:` address form.
//!
//! An address is `pinch:<base58(pubkey ‖ checksum4)>@<relay_host>` where the
//! checksum is the first 4 bytes of SHA-256 over the 32-byte public key.
//! Addresses are derived by the relay after authentication — a client never
//! picks its own.
//!
//! The encryption keypair is not independent material: it is the standard
//! Edwards→Montgomery conversion of the signing keypair, performed in
//! [`Keypair::encryption_secret`] and [`encryption_public_key`].

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// Scheme prefix on every address.
pub const ADDRESS_SCHEME: &str = "pinch:";

/// Public key (32) + checksum (4) — length of the base58 payload, decoded.
const ADDRESS_PAYLOAD_LEN: usize = 36;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address does not start with `pinch:`")]
    MissingScheme,
    #[error("address has no `@<relay_host>` suffix")]
    MissingHost,
    #[error("address payload is not valid base58")]
    BadEncoding,
    #[error("address payload must decode to 36 bytes, got {0}")]
    BadLength(usize),
    #[error("address checksum mismatch")]
    BadChecksum,
    #[error("address public key is not a valid ed25519 point")]
    BadKey,
}

// ─── Keypair ──────────────────────────────────────────────────────────────────

/// An agent's signing identity. Everything else — encryption keys, the
/// address — derives from this.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Keypair {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from its 32-byte private seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Keypair {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Detached 64-byte signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// The x25519 secret converted from the signing key (clamped scalar).
    pub fn encryption_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing.to_scalar_bytes())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the seed.
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish()
    }
}

/// Montgomery form of a signing public key — the peer half of the box.
pub fn encryption_public_key(verifying: &VerifyingKey) -> X25519Public {
    X25519Public::from(verifying.to_montgomery().to_bytes())
}

/// Verify a detached signature. Returns false on malformed input rather
/// than erroring — callers treat any failure as "not authentic".
pub fn verify_detached(public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    verifying
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

// ─── Addresses ────────────────────────────────────────────────────────────────

fn checksum(public_key: &[u8; 32]) -> [u8; 4] {
    let digest = Sha256::digest(public_key);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Canonical address for `public_key` at `relay_host`.
pub fn derive_address(public_key: &VerifyingKey, relay_host: &str) -> String {
    let key_bytes = public_key.to_bytes();
    let mut payload = [0u8; ADDRESS_PAYLOAD_LEN];
    payload[..32].copy_from_slice(&key_bytes);
    payload[32..].copy_from_slice(&checksum(&key_bytes));
    format!(
        "{ADDRESS_SCHEME}{}@{relay_host}",
        bs58::encode(payload).into_string()
    )
}

/// Parse and validate an address, returning the embedded public key and
/// relay host.
pub fn parse_address(address: &str) -> Result<(VerifyingKey, String), AddressError> {
    let rest = address
        .strip_prefix(ADDRESS_SCHEME)
        .ok_or(AddressError::MissingScheme)?;
    let (encoded, host) = rest.rsplit_once('@').ok_or(AddressError::MissingHost)?;
    if host.is_empty() || encoded.is_empty() {
        return Err(AddressError::MissingHost);
    }

    let payload = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| AddressError::BadEncoding)?;
    if payload.len() != ADDRESS_PAYLOAD_LEN {
        return Err(AddressError::BadLength(payload.len()));
    }

    let key_bytes: [u8; 32] = payload[..32].try_into().unwrap_or_default();
    if payload[32..] != checksum(&key_bytes) {
        return Err(AddressError::BadChecksum);
    }

    let verifying = VerifyingKey::from_bytes(&key_bytes).map_err(|_| AddressError::BadKey)?;
    Ok((verifying, host.to_string()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
