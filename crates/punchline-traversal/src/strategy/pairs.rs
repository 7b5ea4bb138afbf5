//! Candidate address pairs.
//!
//! For each address type the interface pairs of both peers are split into
//! those sharing a WAN IP (overlap) and the rest (unique). External
//! addresses try unique pairs first; NIC addresses try overlap first.

use super::table::{StrategyKind, StrategySpec};
use crate::addr::{AddrType, PeerAddress, PeerInterface};
use crate::transport::AddrFamily;
use std::net::{IpAddr, SocketAddr};

/// One attempt's addressing.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Strategy being tried
    pub kind: StrategyKind,
    /// Address type in use
    pub addr_type: AddrType,
    /// Our interface index
    pub src_if: usize,
    /// Peer interface index
    pub dest_if: usize,
    /// Our interface
    pub local: PeerInterface,
    /// Peer interface
    pub remote: PeerInterface,
    /// Peer IP to use
    pub dest_ip: IpAddr,
    /// Both peers on one host
    pub same_machine: bool,
}

impl Candidate {
    /// Peer listen address
    #[must_use]
    pub fn dest(&self) -> SocketAddr {
        SocketAddr::new(self.dest_ip, self.remote.port)
    }

    /// Local IP to bind
    #[must_use]
    pub fn local_ip(&self) -> IpAddr {
        self.local.nic_ip
    }

    /// Both peers behind the same WAN IP
    #[must_use]
    pub fn same_wan(&self) -> bool {
        self.local.wan_ip == self.remote.wan_ip
    }
}

/// Whether two addresses belong to one host (they share a NIC IP).
#[must_use]
pub fn same_machine(ours: &PeerAddress, theirs: &PeerAddress) -> bool {
    ours.interfaces.iter().any(|o| {
        !o.nic_ip.is_unspecified() && theirs.interfaces.iter().any(|t| t.nic_ip == o.nic_ip)
    })
}

/// Peer IP to use for `addr_type`, if any.
///
/// External needs distinct WAN IPs and, on one host, distinct
/// interfaces. NIC addresses always qualify; when the strategy does not
/// bind to an interface and the peers sit on different interfaces of one
/// host, both sides pick the lower NIC IP.
#[must_use]
pub fn select_dest_ip(
    addr_type: AddrType,
    same_machine: bool,
    same_if: bool,
    src: (usize, &PeerInterface),
    dest: (usize, &PeerInterface),
) -> Option<IpAddr> {
    let same_index = src.0 == dest.0;
    match addr_type {
        AddrType::External => {
            if (same_machine && same_index) || src.1.wan_ip == dest.1.wan_ip {
                None
            } else {
                Some(dest.1.wan_ip)
            }
        }
        AddrType::Nic => {
            if !same_if && same_machine && !same_index {
                Some(src.1.nic_ip.min(dest.1.nic_ip))
            } else {
                Some(dest.1.nic_ip)
            }
        }
    }
}

/// Interface index pairs of one family in trial order for `addr_type`.
#[must_use]
pub fn pair_order(
    ours: &PeerAddress,
    theirs: &PeerAddress,
    family: AddrFamily,
    addr_type: AddrType,
) -> Vec<(usize, usize)> {
    let mut overlap = Vec::new();
    let mut unique = Vec::new();
    for (si, s) in ours.interfaces_of(family) {
        for (di, d) in theirs.interfaces_of(family) {
            if s.wan_ip == d.wan_ip {
                overlap.push((si, di));
            } else {
                unique.push((si, di));
            }
        }
    }
    match addr_type {
        AddrType::External => unique.into_iter().chain(overlap).collect(),
        AddrType::Nic => overlap.into_iter().chain(unique).collect(),
    }
}

/// Up to `spec.max_pairs` candidates for one strategy.
#[must_use]
pub fn candidates(
    ours: &PeerAddress,
    theirs: &PeerAddress,
    spec: &StrategySpec,
    addr_types: &[AddrType],
) -> Vec<Candidate> {
    let same_machine = same_machine(ours, theirs);
    let mut out = Vec::new();
    for &addr_type in addr_types {
        // Relays are reached over the WAN only.
        if spec.kind == StrategyKind::Relay && addr_type == AddrType::Nic {
            continue;
        }
        for family in [AddrFamily::V4, AddrFamily::V6] {
            for (si, di) in pair_order(ours, theirs, family, addr_type) {
                if out.len() >= spec.max_pairs {
                    return out;
                }
                let (local, remote) = (ours.interfaces[si], theirs.interfaces[di]);
                let Some(dest_ip) =
                    select_dest_ip(addr_type, same_machine, spec.same_if, (si, &local), (di, &remote))
                else {
                    continue;
                };
                out.push(Candidate {
                    kind: spec.kind,
                    addr_type,
                    src_if: si,
                    dest_if: di,
                    local,
                    remote,
                    dest_ip,
                    same_machine,
                });
            }
        }
    }
    out
}

/// Candidate answering an inbound request: our interface and the peer's
/// are fixed by the request, the first workable address type wins.
#[must_use]
pub fn reply_candidate(
    kind: StrategyKind,
    ours: &PeerAddress,
    theirs: &PeerAddress,
    src_if: usize,
    dest_if: usize,
    addr_types: &[AddrType],
) -> Option<Candidate> {
    let local = *ours.interface(src_if)?;
    let remote = *theirs.interface(dest_if)?;
    let same_machine = same_machine(ours, theirs);
    let same_if = kind.spec().same_if;
    addr_types.iter().find_map(|&addr_type| {
        let dest_ip =
            select_dest_ip(addr_type, same_machine, same_if, (src_if, &local), (dest_if, &remote))?;
        Some(Candidate {
            kind,
            addr_type,
            src_if,
            dest_if,
            local,
            remote,
            dest_ip,
            same_machine,
        })
    })
}
