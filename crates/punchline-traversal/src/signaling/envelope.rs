//! Signaling envelope and its wire form.
//!
//! ```text
//! hex( tag:1 | body )
//!   tag 0: body = bincode(envelope)
//!   tag 1: body = seal(dest public key, bincode(envelope))
//! ```

use crate::addr::{AddrType, PeerAddress};
use crate::error::{Result, TraversalError};
use crate::transport::AddrFamily;
use punchline_crypto::{PrivateKey, PublicKey};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Plaintext envelope tag
pub const TAG_PLAIN: u8 = 0;

/// Sealed envelope tag
pub const TAG_SEALED: u8 = 1;

/// Length of a generated pipe id.
pub const PIPE_ID_LEN: usize = 15;

/// New random pipe id.
#[must_use]
pub fn new_pipe_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PIPE_ID_LEN)
        .map(char::from)
        .collect()
}

/// What an envelope asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    /// Dial back to the sender
    Con,
    /// Punch offer or reply
    TcpPunch,
    /// Relay endpoint exchange
    Turn,
    /// Ask for the receiver's current address
    GetAddr,
    /// Answer to `GetAddr`
    ReturnAddr,
}

/// Sender-side fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMeta {
    /// Connection attempt id
    pub pipe_id: String,
    /// Absolute deadline on the synchronized clock
    pub ttl: f64,
    /// Address family to connect over
    pub af: AddrFamily,
    /// Sender's address, node id and key
    pub source: PeerAddress,
    /// Sender's interface index
    pub src_if_index: usize,
    /// Address types the sender wants used, in order
    pub addr_types: Vec<AddrType>,
}

/// Receiver-side fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRouting {
    /// Intended receiver
    pub dest_node_id: String,
    /// Receiver's interface index
    pub dest_if_index: usize,
}

/// One signaling message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Message kind
    pub kind: SignalKind,
    /// Sender fields
    pub meta: SignalMeta,
    /// Receiver fields
    pub routing: SignalRouting,
    /// Kind-specific payload
    pub payload: Vec<u8>,
}

impl SignalEnvelope {
    /// Envelope from `source` to `dest` over interface 0 of each side,
    /// preferring external addresses.
    #[must_use]
    pub fn new(
        kind: SignalKind,
        pipe_id: impl Into<String>,
        ttl: f64,
        source: PeerAddress,
        dest: &PeerAddress,
        payload: Vec<u8>,
    ) -> Self {
        let af = source
            .interface(0)
            .map_or(AddrFamily::V4, |i| i.family());
        Self {
            kind,
            meta: SignalMeta {
                pipe_id: pipe_id.into(),
                ttl,
                af,
                source,
                src_if_index: 0,
                addr_types: vec![AddrType::External, AddrType::Nic],
            },
            routing: SignalRouting {
                dest_node_id: dest.node_id.clone(),
                dest_if_index: 0,
            },
            payload,
        }
    }

    /// Pin the interfaces used on each side.
    #[must_use]
    pub fn with_interfaces(mut self, src_if_index: usize, dest_if_index: usize) -> Self {
        self.meta.src_if_index = src_if_index;
        self.routing.dest_if_index = dest_if_index;
        if let Some(iface) = self.meta.source.interface(src_if_index) {
            self.meta.af = iface.family();
        }
        self
    }

    /// Set the preferred address types.
    #[must_use]
    pub fn with_addr_types(mut self, addr_types: Vec<AddrType>) -> Self {
        self.meta.addr_types = addr_types;
        self
    }

    /// Pipe id
    #[must_use]
    pub fn pipe_id(&self) -> &str {
        &self.meta.pipe_id
    }

    /// Sender's node id
    #[must_use]
    pub fn src_node_id(&self) -> &str {
        &self.meta.source.node_id
    }

    /// Reply envelope: same pipe id, source and destination swapped.
    #[must_use]
    pub fn reply(&self, kind: SignalKind, ttl: f64, source: PeerAddress, payload: Vec<u8>) -> Self {
        Self::new(kind, self.meta.pipe_id.clone(), ttl, source, &self.meta.source, payload)
            .with_interfaces(self.routing.dest_if_index, self.meta.src_if_index)
            .with_addr_types(self.meta.addr_types.clone())
    }

    /// Wire text, sealed to `dest` when a key is given.
    ///
    /// # Errors
    ///
    /// `Protocol` if serialization fails, `Crypto` if sealing fails.
    pub fn encode(&self, dest: Option<&PublicKey>) -> Result<String> {
        let body = bincode::serialize(self)?;
        let mut wire = Vec::with_capacity(body.len() + punchline_crypto::seal::SEAL_OVERHEAD + 1);
        match dest {
            Some(key) => {
                wire.push(TAG_SEALED);
                wire.extend_from_slice(&punchline_crypto::seal(key, &body)?);
            }
            None => {
                wire.push(TAG_PLAIN);
                wire.extend_from_slice(&body);
            }
        }
        Ok(hex::encode(wire))
    }

    /// Parse wire text, opening sealed bodies with `key`.
    ///
    /// # Errors
    ///
    /// `Protocol` for bad hex, an unknown tag or a bad body; `Crypto`
    /// when a sealed body does not open.
    pub fn decode(text: &str, key: &PrivateKey) -> Result<Self> {
        let wire = hex::decode(text.trim())
            .map_err(|e| TraversalError::Protocol(format!("envelope hex: {e}")))?;
        let (tag, body) = wire
            .split_first()
            .ok_or_else(|| TraversalError::Protocol("empty envelope".into()))?;
        let envelope: Self = match *tag {
            TAG_PLAIN => bincode::deserialize(body)?,
            TAG_SEALED => bincode::deserialize(&punchline_crypto::open(key, body)?)?,
            other => {
                return Err(TraversalError::Protocol(format!("unknown envelope tag {other}")));
            }
        };
        envelope.meta.source.validate()?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PeerInterface;
    use crate::nat::types::NatInfo;
    use rand::rngs::OsRng;

    fn peer(key: &PrivateKey, ip: &str) -> PeerAddress {
        let ip = ip.parse().unwrap();
        PeerAddress::new(
            &key.public_key(),
            vec![PeerInterface {
                wan_ip: ip,
                nic_ip: ip,
                port: 20000,
                nat: NatInfo::open(),
            }],
        )
    }

    #[test]
    fn test_pipe_id() {
        let a = new_pipe_id();
        assert_eq!(a.len(), PIPE_ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, new_pipe_id());
    }

    #[test]
    fn test_sealed_and_plain() {
        let alice = PrivateKey::generate(&mut OsRng);
        let bob = PrivateKey::generate(&mut OsRng);
        let env = SignalEnvelope::new(
            SignalKind::Con,
            "abc",
            100.0,
            peer(&alice, "10.0.0.1"),
            &peer(&bob, "10.0.0.2"),
            b"payload".to_vec(),
        );

        let sealed = env.encode(Some(&bob.public_key())).unwrap();
        assert!(sealed.starts_with("01"));
        assert_eq!(SignalEnvelope::decode(&sealed, &bob).unwrap(), env);
        assert!(matches!(
            SignalEnvelope::decode(&sealed, &alice),
            Err(TraversalError::Crypto(_))
        ));

        let plain = env.encode(None).unwrap();
        assert!(plain.starts_with("00"));
        assert_eq!(SignalEnvelope::decode(&plain, &alice).unwrap(), env);
    }

    #[test]
    fn test_bad_wire() {
        let key = PrivateKey::generate(&mut OsRng);
        for text in ["", "zz", "02abcd", "00ffff"] {
            assert!(SignalEnvelope::decode(text, &key).is_err(), "{text}");
        }
    }

    #[test]
    fn test_reply_swaps_ends() {
        let alice = PrivateKey::generate(&mut OsRng);
        let bob = PrivateKey::generate(&mut OsRng);
        let (a, b) = (peer(&alice, "10.0.0.1"), peer(&bob, "10.0.0.2"));
        let env = SignalEnvelope::new(SignalKind::GetAddr, "p1", 5.0, a.clone(), &b, vec![])
            .with_addr_types(vec![AddrType::Nic]);
        let reply = env.reply(SignalKind::ReturnAddr, 6.0, b.clone(), vec![]);
        assert_eq!(reply.pipe_id(), "p1");
        assert_eq!(reply.routing.dest_node_id, a.node_id);
        assert_eq!(reply.src_node_id(), b.node_id);
        assert_eq!(reply.meta.addr_types, vec![AddrType::Nic]);
    }
}
