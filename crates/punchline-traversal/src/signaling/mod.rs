//! Encrypted, replay-protected signaling over external relays.

pub mod envelope;
pub mod protocol;
pub mod sender;

pub use envelope::{PIPE_ID_LEN, SignalEnvelope, SignalKind, SignalMeta, SignalRouting, new_pipe_id};
pub use protocol::{MessageHandler, SeenCache, Signaling, SignalingConfig};
pub use sender::{RELAY_NO, RelayChannel, RelayRef, SignalSender, channel_order};
