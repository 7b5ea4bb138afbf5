//! Sealed boxes for signaling envelopes.
//!
//! A sender that knows only the recipient's static public key generates an
//! ephemeral key pair, derives a one-time AEAD key and encrypts. Layout:
//!
//! ```text
//! +-----------------+-------------+---------------------------+
//! | ephemeral pk 32 | nonce 24    | ciphertext + tag (n + 16) |
//! +-----------------+-------------+---------------------------+
//! ```
//!
//! The ephemeral public key is bound as associated data.

use crate::CryptoError;
use crate::aead::{AeadKey, NONCE_SIZE, Nonce, TAG_SIZE};
use crate::hash::Kdf;
use crate::x25519::{PrivateKey, PublicKey};
use rand_core::OsRng;

const SEAL_CONTEXT: &str = "punchline-signal-seal";

/// Bytes added to every sealed plaintext.
pub const SEAL_OVERHEAD: usize = 32 + NONCE_SIZE + TAG_SIZE;

fn box_key(shared: &[u8; 32], eph_pk: &PublicKey, recipient_pk: &PublicKey) -> AeadKey {
    let mut ikm = [0u8; 96];
    ikm[..32].copy_from_slice(shared);
    ikm[32..64].copy_from_slice(eph_pk.as_bytes());
    ikm[64..].copy_from_slice(recipient_pk.as_bytes());
    AeadKey::new(Kdf::new(SEAL_CONTEXT).derive_key(&ikm))
}

/// Encrypt `plaintext` so only the holder of `recipient`'s private key can read it.
///
/// # Errors
///
/// Returns `CryptoError::InvalidPublicKey` if `recipient` is a low-order point.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let eph = PrivateKey::generate(&mut OsRng);
    let eph_pk = eph.public_key();
    let shared = eph
        .exchange(recipient)
        .ok_or(CryptoError::InvalidPublicKey)?;

    let key = box_key(shared.as_bytes(), &eph_pk, recipient);
    let nonce = Nonce::generate(&mut OsRng);
    let ct = key.encrypt(&nonce, plaintext, eph_pk.as_bytes())?;

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    out.extend_from_slice(eph_pk.as_bytes());
    out.extend_from_slice(nonce.as_bytes());
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open a box produced by [`seal`].
///
/// # Errors
///
/// `Truncated` for short input, `InvalidPublicKey` for a degenerate
/// ephemeral key and `DecryptionFailed` if authentication fails.
pub fn open(recipient: &PrivateKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (pk_bytes, rest) = sealed.split_at(32);
    let (nonce_bytes, ct) = rest.split_at(NONCE_SIZE);

    let mut pk = [0u8; 32];
    pk.copy_from_slice(pk_bytes);
    let eph_pk = PublicKey::from_bytes(pk);
    let nonce = Nonce::from_slice(nonce_bytes).ok_or(CryptoError::DecryptionFailed)?;

    let shared = recipient
        .exchange(&eph_pk)
        .ok_or(CryptoError::InvalidPublicKey)?;
    let key = box_key(shared.as_bytes(), &eph_pk, &recipient.public_key());
    key.decrypt(&nonce, ct, eph_pk.as_bytes())
}
