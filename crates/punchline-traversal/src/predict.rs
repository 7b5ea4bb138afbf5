//! External port prediction.
//!
//! A hole punch needs each side to know which external port its peer's
//! NAT will show for each local port it connects from. The predictor turns
//! a [`NatInfo`] (filtering type plus delta) and the last observed mapping
//! into a list of `(local, remote, reply)` guesses:
//!
//! | delta        | local port               | remote port                         |
//! |--------------|--------------------------|-------------------------------------|
//! | open / Equal | the wanted port          | same as local                       |
//! | Preserving   | last local + offset      | the wanted port                     |
//! | Independent  | any                      | last remote + delta                 |
//! | Dependent    | last local + 1           | last remote + delta per local step  |
//! | Random       | STUN probe or any        | STUN probe or uniform from range    |

use crate::error::{Result, TraversalError};
use crate::nat::stun::STUN_PORT;
use crate::nat::types::{DeltaType, MAX_PORT, NatInfo, StunProbeResult};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Upper bound on mappings per punch session
pub const MAX_PREDICT_NO: usize = 100;

/// Highest port that needs privileges to bind
pub const RESERVED_PORT_MAX: u16 = 1024;

/// Range local ports are chosen from
pub const LOCAL_PORT_RANGE: (u16, u16) = (2000, MAX_PORT);

/// Self-punch local port shift
const SELF_PUNCH_SHIFT: i64 = 1000;

/// How the two peers reach each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchMode {
    /// Across the internet through both NATs
    Remote,
    /// Same LAN, NIC addresses, no NAT in between
    Lan,
    /// Both ends on this machine
    SelfPunch,
}

/// One predicted mapping.
///
/// `reply` is the port the peer must connect from for a port restricted
/// NAT to let the connection in; 0 means no constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NatMapping {
    /// Local port to bind
    pub local: u16,
    /// External port the NAT is expected to show
    pub remote: u16,
    /// Required peer source port, or 0
    pub reply: u16,
}

impl NatMapping {
    /// New mapping
    #[must_use]
    pub const fn new(local: u16, remote: u16, reply: u16) -> Self {
        Self {
            local,
            remote,
            reply,
        }
    }

    /// Wire order: `[remote, reply, local]`.
    #[must_use]
    pub fn to_wire(&self) -> [u16; 3] {
        [self.remote, self.reply, self.local]
    }

    /// From wire order.
    #[must_use]
    pub fn from_wire(wire: [u16; 3]) -> Self {
        Self::new(wire[2], wire[0], wire[1])
    }
}

/// Reject mappings with out of range or privileged ports.
///
/// # Errors
///
/// `Protocol` naming the offending mapping.
pub fn check_mapping(mapping: &NatMapping) -> Result<()> {
    if mapping.local == 0 || mapping.remote == 0 {
        return Err(TraversalError::Protocol(format!(
            "invalid mapping {mapping:?}"
        )));
    }
    if mapping.local <= RESERVED_PORT_MAX {
        return Err(TraversalError::Protocol(format!(
            "privileged local port in mapping {mapping:?}"
        )));
    }
    Ok(())
}

/// Reject empty or oversized mapping lists and any invalid entry.
///
/// # Errors
///
/// `Protocol` for a bad length or entry.
pub fn check_mappings(mappings: &[NatMapping]) -> Result<()> {
    if mappings.is_empty() || mappings.len() > MAX_PREDICT_NO {
        return Err(TraversalError::Protocol(format!(
            "mapping list length {}",
            mappings.len()
        )));
    }
    mappings.iter().try_for_each(check_mapping)
}

/// Drop entries whose local, remote or reply port already appeared.
/// Zero local/reply ports are not compared. First-seen order is kept.
#[must_use]
pub fn strip_duplicate_mappings(mappings: &[NatMapping]) -> Vec<NatMapping> {
    let mut locals = HashSet::new();
    let mut remotes = HashSet::new();
    let mut replies = HashSet::new();
    let mut out = Vec::with_capacity(mappings.len());
    for m in mappings {
        if (m.local != 0 && locals.contains(&m.local))
            || remotes.contains(&m.remote)
            || (m.reply != 0 && replies.contains(&m.reply))
        {
            continue;
        }
        if m.local != 0 {
            locals.insert(m.local);
        }
        remotes.insert(m.remote);
        if m.reply != 0 {
            replies.insert(m.reply);
        }
        out.push(*m);
    }
    out
}

/// Signed shortest distance from `y` to `x` on a ring of `field` values.
/// Negative when `x` is the smaller of the two.
#[must_use]
pub fn field_dist(x: u16, y: u16, field: u16) -> i32 {
    let (max, min) = (i32::from(x.max(y)), i32::from(x.min(y)));
    let dist = max - min;
    if dist == 0 {
        return 0;
    }
    let wrapped = min + (i32::from(field) - max);
    let d = dist.min(wrapped);
    if x < y { -d } else { d }
}

/// Wrap `n` into the inclusive range `[start, stop]`.
#[must_use]
pub fn field_wrap(n: i64, start: u16, stop: u16) -> u16 {
    let (start, stop) = (i64::from(start.max(1)), i64::from(stop.max(start.max(1))));
    let span = stop - start + 1;
    (start + (n - start).rem_euclid(span)) as u16
}

/// Uniform port from the inclusive range, avoiding privileged ports when
/// the range allows.
#[must_use]
pub fn from_range(range: (u16, u16)) -> u16 {
    let (mut lo, hi) = (range.0.max(1), range.1.max(range.0.max(1)));
    if hi > RESERVED_PORT_MAX {
        lo = lo.max(RESERVED_PORT_MAX + 1);
    }
    rand::thread_rng().gen_range(lo..=hi)
}

/// Whether the two NATs can be punched, and whether the STUN port must be
/// used as the reply port.
///
/// # Errors
///
/// `Unpredictable` for pairings that cannot satisfy a port restricted
/// side's reply constraint.
pub fn nats_can_predict(ours: &NatInfo, theirs: &NatInfo) -> Result<bool> {
    let (our_strict, their_strict) = (ours.is_port_strict(), theirs.is_port_strict());
    let random = |n: &NatInfo| n.delta.kind == DeltaType::Random;

    if our_strict && their_strict && (random(ours) || random(theirs)) {
        debug!("Two port restricted NATs need non-random deltas");
        return Err(TraversalError::Unpredictable);
    }

    let mut use_stun_port = false;
    for (strict, partner) in [(ours, theirs), (theirs, ours)] {
        if !strict.is_port_strict() || !random(strict) {
            continue;
        }
        if partner.is_hard() {
            debug!("Port restricted random NAT paired with a hard NAT");
            return Err(TraversalError::Unpredictable);
        }
        if !partner.port_range().contains(&STUN_PORT) {
            debug!("Partner range cannot produce reply port {}", STUN_PORT);
            return Err(TraversalError::Unpredictable);
        }
        use_stun_port = true;
    }
    Ok(use_stun_port)
}

/// Overlap of both allocation ranges when at least `test_no` wide, else
/// our own range.
#[must_use]
pub fn intersect_range(ours: &NatInfo, theirs: &NatInfo, test_no: usize) -> (u16, u16) {
    let lo = ours.range.0.max(theirs.range.0);
    let hi = ours.range.1.min(theirs.range.1);
    if hi >= lo && usize::from(hi - lo) >= test_no {
        (lo, hi)
    } else {
        ours.range
    }
}

/// Source of real mappings for NATs with no usable delta.
#[async_trait]
pub trait MappingProbe: Send + Sync {
    /// Mapping observed for `local_port` (0 for any).
    async fn probe(&self, local_port: u16) -> Result<StunProbeResult>;
}

/// Predicts mappings for one local IP.
///
/// Keeps the last `(local, remote)` pair so Independent and Dependent
/// counters carry across calls.
pub struct PortPredictor {
    nat: NatInfo,
    mode: PunchMode,
    last: Option<(u16, u16)>,
    prober: Option<Arc<dyn MappingProbe>>,
}

impl PortPredictor {
    /// Predictor for a NAT. LAN and self modes predict as if open.
    #[must_use]
    pub fn new(nat: NatInfo, mode: PunchMode) -> Self {
        Self {
            nat,
            mode,
            last: None,
            prober: None,
        }
    }

    /// Use `prober` for Random deltas and to seed counters.
    #[must_use]
    pub fn with_prober(mut self, prober: Arc<dyn MappingProbe>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Seed the last observed mapping.
    pub fn seed(&mut self, local: u16, remote: u16) {
        self.last = Some((local, remote));
    }

    /// Last observed `(local, remote)` pair.
    #[must_use]
    pub fn last(&self) -> Option<(u16, u16)> {
        self.last
    }

    fn effective_nat(&self) -> NatInfo {
        match self.mode {
            PunchMode::Remote => self.nat,
            PunchMode::Lan | PunchMode::SelfPunch => NatInfo::open(),
        }
    }

    fn last_or(&self, fallback: u16) -> (u16, u16) {
        self.last.unwrap_or((fallback, fallback))
    }

    /// Up to `count` (max 100) guesses for local ports starting at
    /// `local_port`, without probing.
    pub fn predict(&mut self, local_port: u16, count: usize) -> Vec<NatMapping> {
        let nat = self.effective_nat();
        let mut out = Vec::new();
        for i in 0..count.min(MAX_PREDICT_NO) {
            let local = field_wrap(
                i64::from(local_port) + i as i64,
                LOCAL_PORT_RANGE.0,
                LOCAL_PORT_RANGE.1,
            );
            let (last_local, last_remote) = self.last_or(local);
            let delta = i64::from(nat.delta.value);

            let remote = if nat.is_open() {
                local
            } else {
                match nat.delta.kind {
                    DeltaType::NA | DeltaType::Equal => local,
                    DeltaType::Preserving => {
                        let offset = i64::from(last_remote) - i64::from(last_local);
                        field_wrap(i64::from(local) + offset, nat.range.0, nat.range.1)
                    }
                    DeltaType::Independent => {
                        let next =
                            field_wrap(i64::from(last_remote) + delta, nat.range.0, nat.range.1);
                        self.last = Some((local, next));
                        next
                    }
                    DeltaType::Dependent => {
                        let steps = i64::from(field_dist(local, last_local, MAX_PORT));
                        let next = field_wrap(
                            i64::from(last_remote) + delta * steps,
                            nat.range.0,
                            nat.range.1,
                        );
                        self.last = Some((local, next));
                        next
                    }
                    DeltaType::Random => from_range(nat.range),
                }
            };

            let reply = if nat.is_port_strict() { local } else { 0 };
            out.push(NatMapping::new(local, remote, reply));
        }
        strip_duplicate_mappings(&out)
    }

    /// Mapping that lets a peer reach us given the mapping the peer wants
    /// to use (its remote and reply ports).
    ///
    /// # Errors
    ///
    /// `Unpredictable` when the NAT has no usable pattern; probe errors
    /// for Random deltas with a prober.
    pub async fn mapping_for(&mut self, want: &NatMapping, use_range: (u16, u16)) -> Result<NatMapping> {
        let nat = self.effective_nat();
        let mut bind = if want.reply != 0 {
            want.reply
        } else {
            want.remote
        };
        if self.mode == PunchMode::SelfPunch {
            bind = field_wrap(i64::from(bind) + SELF_PUNCH_SHIFT, 2001, MAX_PORT);
        }
        let our_reply = if nat.is_port_strict() { bind } else { 0 };

        if nat.is_open() {
            return Ok(NatMapping::new(bind, bind, 0));
        }

        let delta = i64::from(nat.delta.value);
        match nat.delta.kind {
            DeltaType::Equal | DeltaType::NA => {
                if !nat.port_range().contains(&bind) {
                    bind = from_range(use_range);
                }
                Ok(NatMapping::new(bind, bind, 0))
            }
            DeltaType::Preserving => {
                if !nat.port_range().contains(&bind) {
                    bind = from_range(use_range);
                }
                let (last_local, last_remote) = self.last_or(bind);
                let offset = i64::from(bind) - i64::from(last_remote);
                let local = field_wrap(
                    i64::from(last_local) + offset,
                    LOCAL_PORT_RANGE.0,
                    LOCAL_PORT_RANGE.1,
                );
                Ok(NatMapping::new(local, bind, our_reply))
            }
            DeltaType::Independent => {
                let (_, last_remote) = self.last_or(from_range(use_range));
                let local = from_range(LOCAL_PORT_RANGE);
                let remote = field_wrap(i64::from(last_remote) + delta, use_range.0, use_range.1);
                self.last = Some((local, remote));
                Ok(NatMapping::new(local, remote, our_reply))
            }
            DeltaType::Dependent => {
                let (last_local, last_remote) =
                    self.last.unwrap_or((from_range(LOCAL_PORT_RANGE), from_range(use_range)));
                let local = field_wrap(
                    i64::from(last_local) + 1,
                    LOCAL_PORT_RANGE.0,
                    LOCAL_PORT_RANGE.1,
                );
                let remote = field_wrap(i64::from(last_remote) + delta, use_range.0, use_range.1);
                self.last = Some((local, remote));
                Ok(NatMapping::new(local, remote, our_reply))
            }
            DeltaType::Random if nat.can_predict() => match &self.prober {
                Some(prober) => {
                    let probe = prober.probe(0).await?;
                    let reply = if nat.is_port_strict() { STUN_PORT } else { 0 };
                    trace!(
                        "Random delta mapping from STUN: {} -> {}",
                        probe.local.port(),
                        probe.mapped_port
                    );
                    Ok(NatMapping::new(probe.local.port(), probe.mapped_port, reply))
                }
                None => Ok(NatMapping::new(
                    from_range(LOCAL_PORT_RANGE),
                    from_range(use_range),
                    our_reply,
                )),
            },
            DeltaType::Random => Err(TraversalError::Unpredictable),
        }
    }

    /// Full mapping list for a punch session.
    ///
    /// `their_maps` is the peer's list (unknown for the side that starts
    /// the exchange, in which case targets are synthesized).
    ///
    /// # Errors
    ///
    /// `Unpredictable` for NAT pairs that cannot be punched, or when no
    /// valid mapping remains.
    pub async fn predict_mappings(
        &mut self,
        theirs: &NatInfo,
        their_maps: Option<&[NatMapping]>,
        test_no: usize,
    ) -> Result<Vec<NatMapping>> {
        let ours = self.effective_nat();
        let theirs = match self.mode {
            PunchMode::Remote => *theirs,
            PunchMode::Lan | PunchMode::SelfPunch => NatInfo::open(),
        };

        let test_no = their_maps.map_or(test_no, <[NatMapping]>::len).clamp(1, MAX_PREDICT_NO);
        let use_stun_port = nats_can_predict(&ours, &theirs)?;
        let use_range = intersect_range(&ours, &theirs, test_no);

        let wants: Vec<NatMapping> = match their_maps {
            Some(maps) => maps.to_vec(),
            None if use_stun_port => vec![NatMapping::new(0, STUN_PORT, 0)],
            None => (0..test_no)
                .map(|_| NatMapping::new(0, from_range(use_range), 0))
                .collect(),
        };

        let needs_seed = matches!(
            ours.delta.kind,
            DeltaType::Preserving | DeltaType::Independent | DeltaType::Dependent
        );
        if needs_seed && self.last.is_none() && !ours.is_open() {
            if let Some(prober) = &self.prober {
                let probe = prober.probe(0).await?;
                self.last = Some((probe.local.port(), probe.mapped_port));
            }
        }

        let mut mappings = Vec::with_capacity(wants.len());
        for want in &wants {
            let mapping = self.mapping_for(want, use_range).await?;
            match check_mapping(&mapping) {
                Ok(()) => mappings.push(mapping),
                Err(e) => trace!("Dropping prediction: {}", e),
            }
        }

        let mut mappings = strip_duplicate_mappings(&mappings);
        mappings.truncate(MAX_PREDICT_NO);
        if mappings.is_empty() {
            return Err(TraversalError::Unpredictable);
        }
        debug!("Predicted {} mappings ({:?} mode)", mappings.len(), self.mode);
        Ok(mappings)
    }
}
