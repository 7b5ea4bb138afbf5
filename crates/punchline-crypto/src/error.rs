//! Errors from key handling and sealed boxes.

use thiserror::Error;

/// Failure to parse a key or to seal or open a box.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// The cipher refused to seal the input
    #[error("sealing failed")]
    EncryptionFailed,

    /// Wrong key, nonce or associated data, or altered bytes
    #[error("box did not authenticate")]
    DecryptionFailed,

    /// Decoded key text is the wrong size
    #[error("key is {actual} bytes, need {expected}")]
    InvalidKeyLength {
        /// Required length
        expected: usize,
        /// Decoded length
        actual: usize,
    },

    /// Sealed box shorter than its fixed header
    #[error("sealed box truncated: {0} bytes")]
    Truncated(usize),

    /// Low-order point; no usable shared secret
    #[error("unusable public key")]
    InvalidPublicKey,

    /// Key text is not hex
    #[error("key is not hex: {0}")]
    InvalidEncoding(String),
}
