//! TCP hole punching.

pub mod burst;
pub mod pool;
pub mod puncher;
pub mod session;

pub use crate::predict::PunchMode;
pub use burst::{BurstConfig, hole_hash, punch_burst};
pub use pool::{PunchPool, PunchSlot};
pub use puncher::{PunchConfig, PunchTarget, TcpPuncher, select_mode};
pub use session::{PunchOffer, PunchOutcome, PunchRole, PunchSession, PunchState};
