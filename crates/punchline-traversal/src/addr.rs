//! Peer addresses.
//!
//! A peer address lists, per interface, the external and NIC IPs, the
//! node's listen port and the NAT seen on that interface, plus the node's
//! encryption key. Its text form is hex over bincode so it survives any
//! text-only relay.

use crate::error::{Result, TraversalError};
use crate::nat::types::NatInfo;
use crate::transport::AddrFamily;
use punchline_crypto::PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Interfaces per address family an address may carry.
pub const MAX_INTERFACES: usize = 4;

/// Bytes of the key hash used as node id.
const NODE_ID_BYTES: usize = 16;

/// Which address of an interface to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrType {
    /// WAN address as seen by STUN
    External,
    /// Address assigned to the network card
    Nic,
}

/// One interface of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInterface {
    /// WAN IP
    pub wan_ip: IpAddr,
    /// NIC IP
    pub nic_ip: IpAddr,
    /// Node listen port
    pub port: u16,
    /// NAT on this interface
    pub nat: NatInfo,
}

impl PeerInterface {
    /// IP for `kind`.
    #[must_use]
    pub fn ip(&self, kind: AddrType) -> IpAddr {
        match kind {
            AddrType::External => self.wan_ip,
            AddrType::Nic => self.nic_ip,
        }
    }

    /// Listen address for `kind`.
    #[must_use]
    pub fn listen_addr(&self, kind: AddrType) -> SocketAddr {
        SocketAddr::new(self.ip(kind), self.port)
    }

    /// Address family of the interface
    #[must_use]
    pub fn family(&self) -> AddrFamily {
        AddrFamily::of(self.nic_ip)
    }
}

/// Node id for a public key: hex of the first 16 bytes of its BLAKE3 hash.
#[must_use]
pub fn node_id_for(key: &PublicKey) -> String {
    let digest = punchline_crypto::hash::hash(key.as_bytes());
    hex::encode(&digest[..NODE_ID_BYTES])
}

/// Everything needed to reach and encrypt to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Node id, derived from `public_key`
    pub node_id: String,
    /// X25519 public key for envelopes
    pub public_key: [u8; 32],
    /// Interfaces, at most [`MAX_INTERFACES`] per family
    pub interfaces: Vec<PeerInterface>,
}

impl PeerAddress {
    /// Address for `key` with the given interfaces.
    #[must_use]
    pub fn new(key: &PublicKey, interfaces: Vec<PeerInterface>) -> Self {
        Self {
            node_id: node_id_for(key),
            public_key: key.to_bytes(),
            interfaces,
        }
    }

    /// Encryption key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.public_key)
    }

    /// Interface at `index`
    #[must_use]
    pub fn interface(&self, index: usize) -> Option<&PeerInterface> {
        self.interfaces.get(index)
    }

    /// Interfaces of one family with their indexes.
    pub fn interfaces_of(&self, family: AddrFamily) -> impl Iterator<Item = (usize, &PeerInterface)> {
        self.interfaces
            .iter()
            .enumerate()
            .filter(move |(_, i)| i.family() == family)
    }

    /// Whether `ip` is one of this peer's addresses.
    #[must_use]
    pub fn has_ip(&self, ip: IpAddr) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.wan_ip == ip || i.nic_ip == ip)
    }

    /// Check the id matches the key and the interface limits hold.
    ///
    /// # Errors
    ///
    /// `Protocol` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.node_id != node_id_for(&self.public_key()) {
            return Err(TraversalError::Protocol("node id does not match key".into()));
        }
        for family in [AddrFamily::V4, AddrFamily::V6] {
            if self.interfaces_of(family).count() > MAX_INTERFACES {
                return Err(TraversalError::Protocol(format!(
                    "more than {MAX_INTERFACES} {family:?} interfaces"
                )));
            }
        }
        if self.interfaces.iter().any(|i| i.port == 0) {
            return Err(TraversalError::Protocol("listen port 0".into()));
        }
        Ok(())
    }

    /// Hex text form.
    ///
    /// # Errors
    ///
    /// `Protocol` if serialization fails.
    pub fn to_text(&self) -> Result<String> {
        Ok(hex::encode(bincode::serialize(self)?))
    }

    /// Parse and validate the text form.
    ///
    /// # Errors
    ///
    /// `Protocol` for bad hex, bad encoding or a failed [`validate`](Self::validate).
    pub fn from_text(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| TraversalError::Protocol(format!("peer address hex: {e}")))?;
        let addr: Self = bincode::deserialize(&bytes)?;
        addr.validate()?;
        Ok(addr)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.node_id)?;
        for i in &self.interfaces {
            write!(f, " [{} / {}:{} {}]", i.wan_ip, i.nic_ip, i.port, i.nat.nat_type)?;
        }
        Ok(())
    }
}
