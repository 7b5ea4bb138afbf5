//! Relay collaborator.
//!
//! Allocation on a relay server is outside this crate. The orchestrator
//! only swaps allocated endpoints with the peer and asks the allocator to
//! join them.

use crate::error::Result;
use crate::transport::{AddrFamily, PipeRef};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Allocates relayed endpoints.
#[async_trait]
pub trait RelayAllocator: Send + Sync {
    /// Allocate an endpoint for `pipe_id`. Returns its public address.
    async fn allocate(&self, pipe_id: &str, af: AddrFamily) -> Result<SocketAddr>;

    /// Pipe from our allocation for `pipe_id` to the peer's endpoint.
    async fn connect(&self, pipe_id: &str, peer_relay: SocketAddr) -> Result<PipeRef>;

    /// Free the allocation for `pipe_id`, if any.
    async fn release(&self, pipe_id: &str);
}

/// `Turn` payload: the sender's relayed endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOffer {
    /// Relayed address
    pub relay: SocketAddr,
}

impl TurnOffer {
    /// Encode for an envelope payload.
    ///
    /// # Errors
    ///
    /// Serialization failure.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode an envelope payload.
    ///
    /// # Errors
    ///
    /// `Protocol` for a malformed payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}
