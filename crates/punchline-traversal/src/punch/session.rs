//! Punch session state machine.
//!
//! ```text
//! Init ──► MappingsSent ──► MappingsUpdated ──┐
//!   │       (initiator)                        ├──► Punching ──► Done{Success|Fail}
//!   └────► MappingsReceived ──────────────────┘
//!           (recipient)
//! ```
//!
//! Any non-terminal state may also go straight to `Done`.

use crate::error::{Result, TraversalError};
use crate::predict::{NatMapping, PunchMode, check_mappings};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Which side of the exchange this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchRole {
    /// Sends the first mapping list
    Initiator,
    /// Answers with its own list
    Recipient,
}

/// Terminal result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchOutcome {
    /// A connection was made
    Success,
    /// Timed out or every attempt failed
    Fail,
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    /// Created, nothing exchanged
    Init,
    /// Initiator sent its mappings
    MappingsSent,
    /// Recipient has the initiator's mappings
    MappingsReceived,
    /// Initiator has the recipient's mappings
    MappingsUpdated,
    /// Connect burst running
    Punching,
    /// Finished
    Done(PunchOutcome),
}

impl PunchState {
    /// Whether the session has finished.
    #[must_use]
    pub fn is_done(self) -> bool {
        matches!(self, Self::Done(_))
    }
}

/// Mapping list plus meeting time, as exchanged between peers.
///
/// On the wire: `{ntp: "<decimal seconds>", mappings: [[remote, reply, local], ...]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct PunchOffer {
    /// Synchronized-clock time to start punching
    pub ntp: f64,
    /// Sender's predicted mappings
    pub mappings: Vec<NatMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct OfferWire {
    ntp: String,
    mappings: Vec<[u16; 3]>,
}

impl PunchOffer {
    /// Encode for a signaling payload.
    ///
    /// # Errors
    ///
    /// `Protocol` if serialization fails.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let wire = OfferWire {
            ntp: format!("{:.6}", self.ntp),
            mappings: self.mappings.iter().map(NatMapping::to_wire).collect(),
        };
        Ok(bincode::serialize(&wire)?)
    }

    /// Decode and validate a signaling payload.
    ///
    /// # Errors
    ///
    /// `Protocol` for malformed data, a bad time or invalid mappings.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let wire: OfferWire = bincode::deserialize(payload)?;
        let ntp: f64 = wire
            .ntp
            .parse()
            .map_err(|_| TraversalError::Protocol(format!("bad punch time {:?}", wire.ntp)))?;
        if !ntp.is_finite() || ntp <= 0.0 {
            return Err(TraversalError::Protocol(format!("bad punch time {ntp}")));
        }
        let mappings: Vec<NatMapping> = wire.mappings.into_iter().map(NatMapping::from_wire).collect();
        check_mappings(&mappings)?;
        Ok(Self { ntp, mappings })
    }
}

/// One punch attempt between two peers.
#[derive(Debug, Clone)]
pub struct PunchSession {
    pipe_id: String,
    role: PunchRole,
    state: PunchState,
    mode: PunchMode,
    local_ip: IpAddr,
    peer_ip: IpAddr,
    local_mappings: Vec<NatMapping>,
    remote_mappings: Vec<NatMapping>,
    start_time: Option<f64>,
    created: Instant,
}

impl PunchSession {
    /// New session in `Init`.
    #[must_use]
    pub fn new(
        pipe_id: impl Into<String>,
        role: PunchRole,
        mode: PunchMode,
        local_ip: IpAddr,
        peer_ip: IpAddr,
    ) -> Self {
        Self {
            pipe_id: pipe_id.into(),
            role,
            state: PunchState::Init,
            mode,
            local_ip,
            peer_ip,
            local_mappings: Vec::new(),
            remote_mappings: Vec::new(),
            start_time: None,
            created: Instant::now(),
        }
    }

    /// Pipe id
    #[must_use]
    pub fn pipe_id(&self) -> &str {
        &self.pipe_id
    }

    /// Role
    #[must_use]
    pub fn role(&self) -> PunchRole {
        self.role
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PunchState {
        self.state
    }

    /// Punch mode
    #[must_use]
    pub fn mode(&self) -> PunchMode {
        self.mode
    }

    /// Whether both ends are on this machine
    #[must_use]
    pub fn same_machine(&self) -> bool {
        self.mode == PunchMode::SelfPunch
    }

    /// Local IP to bind
    #[must_use]
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Peer IP to connect to
    #[must_use]
    pub fn peer_ip(&self) -> IpAddr {
        self.peer_ip
    }

    /// Our predicted mappings
    #[must_use]
    pub fn local_mappings(&self) -> &[NatMapping] {
        &self.local_mappings
    }

    /// Peer's predicted mappings
    #[must_use]
    pub fn remote_mappings(&self) -> &[NatMapping] {
        &self.remote_mappings
    }

    /// Agreed start time
    #[must_use]
    pub fn start_time(&self) -> Option<f64> {
        self.start_time
    }

    /// Time since creation
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    fn transition(&mut self, to: PunchState) -> Result<()> {
        use PunchState::*;
        let allowed = match (self.state, to) {
            (Done(_), _) => false,
            (_, Done(_)) => true,
            (Init, MappingsSent) => self.role == PunchRole::Initiator,
            (Init, MappingsReceived) => self.role == PunchRole::Recipient,
            (MappingsSent, MappingsUpdated) => true,
            (MappingsReceived | MappingsUpdated, Punching) => true,
            _ => false,
        };
        if !allowed {
            return Err(TraversalError::Protocol(format!(
                "punch {}: {:?} -> {:?} not allowed",
                self.pipe_id, self.state, to
            )));
        }
        debug!("Punch {} {:?} -> {:?}", self.pipe_id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Initiator: our list is out with the meeting time.
    ///
    /// # Errors
    ///
    /// `Protocol` for an invalid transition or mapping list.
    pub fn mappings_sent(&mut self, mappings: Vec<NatMapping>, start_time: f64) -> Result<()> {
        check_mappings(&mappings)?;
        self.transition(PunchState::MappingsSent)?;
        self.local_mappings = mappings;
        self.start_time = Some(start_time);
        Ok(())
    }

    /// Recipient: the initiator's offer arrived.
    ///
    /// # Errors
    ///
    /// `Protocol` for an invalid transition.
    pub fn mappings_received(&mut self, offer: &PunchOffer) -> Result<()> {
        self.transition(PunchState::MappingsReceived)?;
        self.remote_mappings = offer.mappings.clone();
        self.start_time = Some(offer.ntp);
        Ok(())
    }

    /// Recipient: record the list sent back.
    ///
    /// # Errors
    ///
    /// `Protocol` if not in `MappingsReceived` or the list is invalid.
    pub fn set_local_mappings(&mut self, mappings: Vec<NatMapping>) -> Result<()> {
        if self.state != PunchState::MappingsReceived {
            return Err(TraversalError::Protocol(format!(
                "punch {}: local mappings in {:?}",
                self.pipe_id, self.state
            )));
        }
        check_mappings(&mappings)?;
        self.local_mappings = mappings;
        Ok(())
    }

    /// Initiator: the recipient's reply arrived.
    ///
    /// # Errors
    ///
    /// `Protocol` for an invalid transition.
    pub fn mappings_updated(&mut self, offer: &PunchOffer) -> Result<()> {
        self.transition(PunchState::MappingsUpdated)?;
        self.remote_mappings = offer.mappings.clone();
        if let Some(start) = self.start_time {
            self.start_time = Some(start.max(offer.ntp));
        }
        Ok(())
    }

    /// Enter `Punching`. Both mapping lists and a start time must be known.
    ///
    /// # Errors
    ///
    /// `Protocol` if anything is missing or the transition is invalid.
    pub fn start_punching(&mut self) -> Result<f64> {
        let start = match self.start_time {
            Some(t) if !self.local_mappings.is_empty() && !self.remote_mappings.is_empty() => t,
            _ => {
                return Err(TraversalError::Protocol(format!(
                    "punch {}: mappings incomplete",
                    self.pipe_id
                )));
            }
        };
        self.transition(PunchState::Punching)?;
        Ok(start)
    }

    /// Enter `Done`. A finished session stays as it was.
    pub fn finish(&mut self, outcome: PunchOutcome) {
        if !self.state.is_done() {
            let _ = self.transition(PunchState::Done(outcome));
        }
    }

    /// `(local port, peer port)` pairs to try, index-aligned pairs first
    /// and then the rest of the cross product, capped at `limit`.
    #[must_use]
    pub fn connect_pairs(&self, limit: usize) -> Vec<(u16, u16)> {
        let mut pairs: Vec<(u16, u16)> = self
            .local_mappings
            .iter()
            .zip(&self.remote_mappings)
            .map(|(ours, theirs)| (ours.local, theirs.remote))
            .collect();
        'outer: for ours in &self.local_mappings {
            for theirs in &self.remote_mappings {
                if pairs.len() >= limit {
                    break 'outer;
                }
                let pair = (ours.local, theirs.remote);
                if !pairs.contains(&pair) {
                    pairs.push(pair);
                }
            }
        }
        pairs.truncate(limit);
        pairs
    }
}
