//! NAT classification types.
//!
//! A [`NatInfo`] pairs the filtering behaviour of a NAT (how strict it is
//! about who may send to an open mapping) with the allocation pattern of
//! its external ports (the delta), which together decide whether and how
//! its mappings can be predicted.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;

/// Highest valid port
pub const MAX_PORT: u16 = 65535;

/// NAT filtering behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatType {
    /// No NAT, public address
    OpenInternet,
    /// Any host may use an open mapping
    FullCone,
    /// Only previously contacted IPs may use a mapping
    RestrictNAT,
    /// Only previously contacted IP:port pairs may use a mapping
    RestrictPortNAT,
    /// New mapping per destination
    SymmetricNAT,
    /// Public address behind a stateful firewall
    SymmetricUDPFirewall,
    /// UDP is blocked outright
    Blocked,
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenInternet => write!(f, "Open Internet"),
            Self::FullCone => write!(f, "Full Cone NAT"),
            Self::RestrictNAT => write!(f, "Restricted NAT"),
            Self::RestrictPortNAT => write!(f, "Port Restricted NAT"),
            Self::SymmetricNAT => write!(f, "Symmetric NAT"),
            Self::SymmetricUDPFirewall => write!(f, "Symmetric UDP Firewall"),
            Self::Blocked => write!(f, "Blocked"),
        }
    }
}

/// External port allocation pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaType {
    /// Not applicable (no translation)
    NA,
    /// External port equals local port
    Equal,
    /// Distance between local ports is kept between external ports
    Preserving,
    /// External port advances by a constant regardless of local port
    Independent,
    /// External port advances by a constant per local port step
    Dependent,
    /// No usable pattern
    Random,
}

/// Delta type with its step value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Delta {
    /// Pattern
    pub kind: DeltaType,
    /// Step for Independent/Dependent, 0 otherwise
    pub value: i32,
}

impl Delta {
    /// Delta with a step value.
    #[must_use]
    pub const fn new(kind: DeltaType, value: i32) -> Self {
        Self { kind, value }
    }

    /// Delta without a step.
    #[must_use]
    pub const fn of(kind: DeltaType) -> Self {
        Self { kind, value: 0 }
    }
}

/// Classification result for one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatInfo {
    /// Filtering behaviour
    pub nat_type: NatType,
    /// Allocation pattern
    pub delta: Delta,
    /// Inclusive external port range the NAT allocates from
    pub range: (u16, u16),
}

impl NatInfo {
    /// NAT info with the full port range.
    #[must_use]
    pub const fn new(nat_type: NatType, delta: Delta) -> Self {
        Self {
            nat_type,
            delta,
            range: (1, MAX_PORT),
        }
    }

    /// Same NAT with a narrower allocation range.
    #[must_use]
    pub fn with_range(mut self, start: u16, end: u16) -> Self {
        self.range = (start.max(1), end.max(start.max(1)));
        self
    }

    /// Allocation range as an inclusive range.
    #[must_use]
    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.range.0..=self.range.1
    }

    /// No translation (OpenInternet or SymmetricUDPFirewall).
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.nat_type,
            NatType::OpenInternet | NatType::SymmetricUDPFirewall
        )
    }

    /// Mappings are reusable per local endpoint.
    #[must_use]
    pub fn can_predict(&self) -> bool {
        matches!(
            self.nat_type,
            NatType::FullCone | NatType::RestrictNAT | NatType::RestrictPortNAT
        )
    }

    /// Neither easy filtering nor a port-keeping delta.
    #[must_use]
    pub fn is_hard(&self) -> bool {
        let easy = matches!(self.nat_type, NatType::OpenInternet | NatType::FullCone);
        !easy && !matches!(self.delta.kind, DeltaType::Preserving | DeltaType::Equal)
    }

    /// Safe to predict several mappings at once.
    #[must_use]
    pub fn is_concurrent(&self) -> bool {
        let easy = matches!(self.nat_type, NatType::OpenInternet | NatType::FullCone);
        easy || !matches!(
            self.delta.kind,
            DeltaType::Independent | DeltaType::Dependent
        )
    }

    /// Reply port must match the peer's destination port.
    #[must_use]
    pub fn is_port_strict(&self) -> bool {
        self.nat_type == NatType::RestrictPortNAT
    }

    /// Open NAT with no delta, used for LAN and self punching.
    #[must_use]
    pub const fn open() -> Self {
        Self::new(NatType::OpenInternet, Delta::of(DeltaType::NA))
    }
}

impl Default for NatInfo {
    fn default() -> Self {
        Self::new(NatType::RestrictPortNAT, Delta::of(DeltaType::Random))
    }
}

impl std::fmt::Display for NatInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {:?}({}) range {}-{}",
            self.nat_type, self.delta.kind, self.delta.value, self.range.0, self.range.1
        )
    }
}

/// One STUN probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunProbeResult {
    /// External IP seen by the server
    pub wan_ip: IpAddr,
    /// External port seen by the server
    pub mapped_port: u16,
    /// Server that answered
    pub source_server: SocketAddr,
    /// Local socket the probe was sent from
    pub local: SocketAddr,
    /// Server's alternate address, if advertised
    pub changed: Option<SocketAddr>,
}
