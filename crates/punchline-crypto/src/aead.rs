//! `XChaCha20-Poly1305` for sealed signaling boxes.
//!
//! Each box gets its own derived key and a random 192-bit nonce, so nonce
//! reuse under one key cannot happen and no counter state is kept.
//!
//! ```
//! use punchline_crypto::aead::{AeadKey, Nonce};
//! use rand_core::OsRng;
//!
//! let key = AeadKey::new([7u8; 32]);
//! let nonce = Nonce::generate(&mut OsRng);
//!
//! let boxed = key.encrypt(&nonce, b"mappings", b"eph-pk").unwrap();
//! assert_eq!(key.decrypt(&nonce, &boxed, b"eph-pk").unwrap(), b"mappings");
//! ```

use crate::CryptoError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand_core::{CryptoRng, RngCore};
use zeroize::ZeroizeOnDrop;

/// Poly1305 tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;

/// Extended nonce length
pub const NONCE_SIZE: usize = 24;

/// Key length
pub const KEY_SIZE: usize = 32;

/// Per-box nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Nonce read back out of a box; `None` unless exactly 24 bytes.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    /// Fresh random nonce.
    #[must_use]
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut n = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut n);
        Self(n)
    }

    /// Wire bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// One-box key, wiped on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Wrap derived key material.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }

    /// Encrypt `msg`, binding `aad`. Output is `msg.len() + TAG_SIZE` bytes.
    ///
    /// # Errors
    ///
    /// `EncryptionFailed` if the cipher refuses the input.
    pub fn encrypt(&self, nonce: &Nonce, msg: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher()
            .encrypt(XNonce::from_slice(nonce.as_bytes()), Payload { msg, aad })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt and authenticate `boxed` against `aad`.
    ///
    /// # Errors
    ///
    /// `DecryptionFailed` for short input, a wrong key or nonce, altered
    /// bytes or mismatched `aad`.
    pub fn decrypt(&self, nonce: &Nonce, boxed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if boxed.len() < TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        self.cipher()
            .decrypt(XNonce::from_slice(nonce.as_bytes()), Payload { msg: boxed, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
