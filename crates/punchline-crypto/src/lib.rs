//! # punchline crypto
//!
//! Cryptographic primitives used by the punchline signaling layer.
//!
//! This crate provides:
//! - X25519 key agreement with low-order point rejection
//! - `XChaCha20-Poly1305` AEAD encryption
//! - BLAKE3 digests and context-bound key derivation
//! - Sealed boxes (ephemeral-static ECIES) for signaling envelopes
//!
//! ## Sealed box layout
//!
//! | Field | Bytes | Source |
//! |-------|-------|--------|
//! | ephemeral public key | 32 | fresh X25519 key per box |
//! | nonce | 24 | random |
//! | ciphertext + tag | n + 16 | XChaCha20-Poly1305, key from BLAKE3 KDF |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod seal;
pub mod x25519;

pub use error::CryptoError;
pub use seal::{open, seal};
pub use x25519::{PrivateKey, PublicKey};
