//! Property-based tests for punchline
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;
use punchline_crypto::PrivateKey;
use punchline_traversal::{NatInfo, PeerAddress, PeerInterface};
use rand::rngs::OsRng;
use std::net::{IpAddr, Ipv4Addr};

fn interface(wan: u8, nic: u8, port: u16) -> PeerInterface {
    PeerInterface {
        wan_ip: IpAddr::V4(Ipv4Addr::new(198, 51, 100, wan)),
        nic_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, nic)),
        port,
        nat: NatInfo::open(),
    }
}

fn address(interfaces: &[(u8, u8)]) -> PeerAddress {
    let key = PrivateKey::generate(&mut OsRng);
    let interfaces = interfaces
        .iter()
        .enumerate()
        .map(|(i, &(wan, nic))| interface(wan, nic, 40000 + i as u16))
        .collect();
    PeerAddress::new(&key.public_key(), interfaces)
}

/// Up to four interfaces drawn from a small address pool so WAN and NIC
/// collisions are common.
fn interfaces() -> impl Strategy<Value = Vec<(u8, u8)>> {
    prop::collection::vec((1u8..4, 1u8..6), 1..=4)
}

// ============================================================================
// Candidate Pair Properties
// ============================================================================

mod candidate_properties {
    use super::*;
    use punchline_traversal::AddrType;
    use punchline_traversal::strategy::{StrategyKind, candidates, select_dest_ip};

    fn kind() -> impl Strategy<Value = StrategyKind> {
        prop::sample::select(StrategyKind::DEFAULT_ORDER.to_vec())
    }

    proptest! {
        /// Never more candidates than the strategy allows, all of its kind
        #[test]
        fn candidates_respect_table(ours in interfaces(), theirs in interfaces(), kind in kind()) {
            let (ours, theirs) = (address(&ours), address(&theirs));
            let spec = kind.spec();
            let found = candidates(&ours, &theirs, &spec, &[AddrType::External, AddrType::Nic]);

            prop_assert!(found.len() <= spec.max_pairs);
            for c in &found {
                prop_assert_eq!(c.kind, kind);
                prop_assert_eq!(c.local, ours.interfaces[c.src_if]);
                prop_assert_eq!(c.remote, theirs.interfaces[c.dest_if]);
            }
        }

        /// Relays are only tried over external addresses
        #[test]
        fn relay_skips_nic(ours in interfaces(), theirs in interfaces()) {
            let (ours, theirs) = (address(&ours), address(&theirs));
            let spec = StrategyKind::Relay.spec();
            let found = candidates(&ours, &theirs, &spec, &[AddrType::External, AddrType::Nic]);
            prop_assert!(found.iter().all(|c| c.addr_type == AddrType::External));
        }

        /// External candidates never target a WAN IP shared with our side
        #[test]
        fn external_needs_distinct_wan(ours in interfaces(), theirs in interfaces(), kind in kind()) {
            let (ours, theirs) = (address(&ours), address(&theirs));
            let found = candidates(&ours, &theirs, &kind.spec(), &[AddrType::External]);
            for c in found {
                prop_assert_ne!(c.local.wan_ip, c.dest_ip);
                prop_assert_eq!(c.dest_ip, c.remote.wan_ip);
            }
        }

        /// Pairs sharing a WAN IP are tried first for NIC addresses
        #[test]
        fn nic_prefers_overlapping_pairs(ours in interfaces(), theirs in interfaces()) {
            let (ours, theirs) = (address(&ours), address(&theirs));
            let mut spec = StrategyKind::Direct.spec();
            spec.max_pairs = usize::MAX;
            let found = candidates(&ours, &theirs, &spec, &[AddrType::Nic]);
            let overlaps: Vec<bool> = found.iter().map(|c| c.same_wan()).collect();
            prop_assert!(overlaps.windows(2).all(|w| w[0] || !w[1]));
        }

        /// On one host with different interfaces, NIC punching meets at the
        /// lower of the two NIC IPs
        #[test]
        fn nic_meets_at_lower_ip(a in 1u8..250, b in 1u8..250) {
            let src = interface(1, a, 1);
            let dest = interface(1, b, 2);
            let ip = select_dest_ip(AddrType::Nic, true, false, (0, &src), (1, &dest)).unwrap();
            prop_assert_eq!(ip, src.nic_ip.min(dest.nic_ip));

            let ip = select_dest_ip(AddrType::Nic, false, false, (0, &src), (1, &dest)).unwrap();
            prop_assert_eq!(ip, dest.nic_ip);
        }
    }
}

// ============================================================================
// Idle Reaper Properties
// ============================================================================

mod reaper_properties {
    use super::*;
    use punchline_traversal::ReaperConfig;
    use punchline_traversal::reaper::idle_threshold;

    proptest! {
        /// The idle threshold stays in range and never grows with load
        #[test]
        fn threshold_monotonic(x in 0.0f64..=1.0, y in 0.0f64..=1.0) {
            let config = ReaperConfig::default();
            let (lo, hi) = if x <= y { (x, y) } else { (y, x) };
            let (t_lo, t_hi) = (idle_threshold(&config, lo), idle_threshold(&config, hi));

            prop_assert!(t_hi <= t_lo);
            prop_assert!(t_hi >= config.min_idle);
            prop_assert!(t_lo <= config.max_idle);
        }

        /// Saturation outside [0, 1] is clamped
        #[test]
        fn threshold_clamps(s in -10.0f64..10.0) {
            let config = ReaperConfig::default();
            let t = idle_threshold(&config, s);
            prop_assert!(t >= config.min_idle && t <= config.max_idle);
        }
    }
}

// ============================================================================
// Signaling Properties
// ============================================================================

mod signaling_properties {
    use super::*;
    use async_trait::async_trait;
    use punchline_traversal::signaling::{PIPE_ID_LEN, RelayChannel, RelayRef, channel_order, new_pipe_id};
    use punchline_traversal::strategy::orchestrator::{ID_LINE_LEN, id_line, parse_id_line};
    use std::sync::Arc;

    struct Channel(bool);

    #[async_trait]
    impl RelayChannel for Channel {
        fn name(&self) -> &str {
            "test"
        }

        fn is_open(&self) -> bool {
            self.0
        }

        async fn send(&self, _dest: &str, _text: &str) -> punchline_traversal::Result<()> {
            Ok(())
        }
    }

    proptest! {
        /// Channel order is a permutation with open channels first
        #[test]
        fn channel_order_is_permutation(open in prop::collection::vec(any::<bool>(), 0..8), counter in 0usize..1000) {
            let channels: Vec<RelayRef> = open.iter().map(|&o| Arc::new(Channel(o)) as RelayRef).collect();
            let order = channel_order(&channels, counter);

            let mut sorted = order.clone();
            sorted.sort_unstable();
            prop_assert_eq!(sorted, (0..channels.len()).collect::<Vec<_>>());

            let states: Vec<bool> = order.iter().map(|&i| open[i]).collect();
            prop_assert!(states.windows(2).all(|w| w[0] || !w[1]));
        }

        /// Any alphanumeric pipe id survives the id line
        #[test]
        fn id_line_carries_pipe_id(id in "[A-Za-z0-9]{15}") {
            let line = id_line(&id);
            prop_assert_eq!(line.len(), ID_LINE_LEN);
            prop_assert_eq!(parse_id_line(&line).unwrap(), id);
        }

        /// Lines of the wrong shape are rejected
        #[test]
        fn id_line_rejects_garbage(bytes in prop::collection::vec(any::<u8>(), 0..40)) {
            if let Ok(id) = parse_id_line(&bytes) {
                prop_assert_eq!(id.len(), PIPE_ID_LEN);
                prop_assert_eq!(id_line(&id), bytes);
            }
        }
    }

    #[test]
    fn generated_pipe_ids_fit_id_line() {
        for _ in 0..100 {
            let id = new_pipe_id();
            assert_eq!(id.len(), PIPE_ID_LEN);
            assert_eq!(parse_id_line(&id_line(&id)).unwrap(), id);
        }
    }
}
