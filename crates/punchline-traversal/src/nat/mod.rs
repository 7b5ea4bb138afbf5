//! NAT discovery: STUN client, classification and the per-interface cache.

pub mod cache;
pub mod classifier;
pub mod stun;
pub mod types;

#[cfg(test)]
pub(crate) mod test_server;

pub use cache::NatCache;
pub use classifier::{NatClassifier, NatDetector, StunConfig, StunServer};
pub use stun::{StunClient, StunError};
pub use types::{Delta, DeltaType, NatInfo, NatType, StunProbeResult};
