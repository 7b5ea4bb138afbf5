//! # punchline traversal
//!
//! NAT traversal for peer-to-peer TCP connections.
//!
//! This crate provides:
//! - STUN probing and NAT classification with a per-interface cache
//! - Port-mapping prediction from the detected NAT behaviour
//! - A clock-synchronized TCP hole punch with a bounded worker pool
//! - Encrypted, replay-protected signaling over text relays
//! - A connection orchestrator trying Direct, Reverse, Punch and Relay
//! - Acknowledged UDP delivery and an idle pipe reaper
//!
//! ## Connecting
//!
//! A node publishes a [`PeerAddress`] listing, per interface, its WAN and
//! NIC addresses, listen port and NAT. Given a peer's address,
//! [`Orchestrator::connect`] tries each strategy over each candidate
//! address pair until one yields a pipe:
//!
//! | Strategy | Timeout | Cleanup | Pairs |
//! |----------|---------|---------|-------|
//! | Direct   | 2s      | no      | 6     |
//! | Reverse  | 4s      | no      | 6     |
//! | Punch    | 20s     | yes     | 4     |
//! | Relay    | 20s     | yes     | 2     |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod clock;
pub mod error;
pub mod nat;
pub mod predict;
pub mod punch;
pub mod reaper;
pub mod reliable;
pub mod signaling;
pub mod strategy;
pub mod transport;

pub use addr::{AddrType, MAX_INTERFACES, PeerAddress, PeerInterface, node_id_for};
pub use clock::SyncClock;
pub use error::{Result, TraversalError};
pub use nat::{NatCache, NatClassifier, NatInfo, NatType};
pub use predict::{NatMapping, PortPredictor, PunchMode};
pub use punch::{PunchConfig, PunchPool, PunchTarget, TcpPuncher};
pub use reaper::{IdleReaper, ReaperConfig};
pub use reliable::{ReliableConfig, ReliableSocket};
pub use signaling::{RelayChannel, SignalEnvelope, SignalKind, Signaling, SignalingConfig};
pub use strategy::{
    Incoming, Orchestrator, OrchestratorConfig, RelayAllocator, StrategyHandler, StrategyKind,
};
pub use transport::{Pipe, PipeRef, TcpPipe, UdpPipe};
