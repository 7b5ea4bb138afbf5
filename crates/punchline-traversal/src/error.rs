//! Traversal error types.

use punchline_crypto::CryptoError;
use thiserror::Error;

/// Errors surfaced by the traversal layer
#[derive(Debug, Error)]
pub enum TraversalError {
    /// Host name could not be resolved
    #[error("resolution failed: {0}")]
    Resolution(String),

    /// Local socket could not be bound
    #[error("bind failed: {0}")]
    Bind(String),

    /// A probe, strategy or reply wait ran out of time
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// Not enough STUN servers agreed on a result
    #[error("no consensus: {0}")]
    Consensus(String),

    /// Signaling message was a replay or arrived after its ttl
    #[error("message replayed or expired (pipe {0})")]
    ReplayOrExpired(String),

    /// Malformed envelope, frame or STUN message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The NAT pair cannot be punched with predicted mappings
    #[error("NAT pair is not predictable")]
    Unpredictable,

    /// Every strategy and candidate pair failed
    #[error("connection failed: all strategies exhausted")]
    Exhausted,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope crypto failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<crate::nat::stun::StunError> for TraversalError {
    fn from(err: crate::nat::stun::StunError) -> Self {
        use crate::nat::stun::StunError;
        match err {
            StunError::Io(e) => Self::Io(e),
            StunError::Timeout => Self::Timeout("stun"),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<bincode::Error> for TraversalError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result alias for traversal operations
pub type Result<T> = std::result::Result<T, TraversalError>;
