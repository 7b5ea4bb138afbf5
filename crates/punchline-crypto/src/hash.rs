//! BLAKE3 digests for node ids and sealed box keys.

/// 32-byte BLAKE3 digest.
pub type Digest = [u8; 32];

/// Digest of `data`. Node ids are cut from the digest of a public key.
#[must_use]
pub fn hash(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// BLAKE3 key derivation under one fixed context string.
///
/// ```
/// use punchline_crypto::hash::Kdf;
///
/// let seal = Kdf::new("punchline seal key");
/// assert_eq!(seal.derive_key(b"dh output"), seal.derive_key(b"dh output"));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// KDF for `context`. Each key purpose gets its own context.
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Key for `ikm`.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        blake3::derive_key(self.context, ikm)
    }
}
