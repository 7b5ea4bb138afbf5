//! Node identity keys.
//!
//! A node is an X25519 key pair. The public half is published in the
//! peer address and names the node (its id is a hash of it); the private
//! half opens envelopes sealed to it and lives hex-encoded in a key file.

use crate::CryptoError;
use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

const KEY_LEN: usize = 32;

/// Secret half of a node identity.
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// Published half of a node identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// Raw DH output, wiped on drop.
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct SharedSecret(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// New random identity
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Matching public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey((&self.0).into())
    }

    /// DH with `theirs`. `None` when the result is all zeros, which
    /// happens only for low-order points.
    #[must_use]
    pub fn exchange(&self, theirs: &PublicKey) -> Option<SharedSecret> {
        let shared = self.0.diffie_hellman(&theirs.0);
        if shared.as_bytes().iter().all(|&b| b == 0) {
            return None;
        }
        Some(SharedSecret(shared))
    }

    /// Scalar bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// Key from scalar bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes.into())
    }

    /// Key file contents.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parse key file contents; surrounding whitespace is ignored.
    ///
    /// # Errors
    ///
    /// `InvalidEncoding` for non-hex text, `InvalidKeyLength` unless it
    /// decodes to 32 bytes.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        key_from_hex(s).map(Self::from_bytes)
    }
}

impl PublicKey {
    /// Point bytes
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    /// Key from point bytes. Degenerate points are caught by
    /// [`PrivateKey::exchange`].
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes.into())
    }

    /// Borrowed point bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }

    /// Hex form
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse [`PublicKey::to_hex`] output.
    ///
    /// # Errors
    ///
    /// As [`PrivateKey::from_hex`].
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        key_from_hex(s).map(Self::from_bytes)
    }
}

impl SharedSecret {
    /// Raw bytes; only ever used as KDF input.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        self.0.as_bytes()
    }
}

fn key_from_hex(s: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    let actual = raw.len();
    raw.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        actual,
    })
}
