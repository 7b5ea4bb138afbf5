//! Acknowledged datagram delivery.
//!
//! Each outbound datagram is framed with a random 64-bit sequence id and
//! an ack flag:
//!
//! ```text
//! +-----------------+-----+-------------+
//! | seq (u64, BE)   | ack | payload ... |
//! +-----------------+-----+-------------+
//! ```
//!
//! The sender retransmits until the matching ack arrives, `tries` sends
//! have been made or `sock_timeout` elapses. Delivery is at-least-once on
//! the wire and at-most-once to the application (duplicates are dropped),
//! but not ordered.
//!
//! [`PendingTable`] and [`retransmit`] are generic so request/response
//! protocols (STUN) can reuse them with their own key and reply types.

use crate::error::{Result, TraversalError};
use crate::transport::PipeRef;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, trace};

/// Frame header size: 8-byte sequence id plus the ack flag.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Entries kept in pending and duplicate tables before they are reset.
pub const TABLE_LIMIT: usize = 1000;

/// Frame decode errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than nine bytes
    TooShort(usize),
    /// Ack flag was neither 0 nor 1
    BadFlag(u8),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(n) => write!(f, "frame too short: {n} bytes"),
            Self::BadFlag(b) => write!(f, "invalid ack flag: {b}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for TraversalError {
    fn from(err: FrameError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// One framed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence id
    pub seq: u64,
    /// Whether this frame acknowledges `seq`
    pub ack: bool,
    /// Application bytes (empty for acks)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Data frame.
    #[must_use]
    pub fn data(seq: u64, payload: &[u8]) -> Self {
        Self {
            seq,
            ack: false,
            payload: payload.to_vec(),
        }
    }

    /// Ack frame for `seq`.
    #[must_use]
    pub fn ack(seq: u64) -> Self {
        Self {
            seq,
            ack: true,
            payload: Vec::new(),
        }
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.push(u8::from(self.ack));
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode wire bytes.
    ///
    /// # Errors
    ///
    /// Returns `FrameError` for short input or an unknown flag byte.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[..8]);
        let ack = match bytes[8] {
            0 => false,
            1 => true,
            other => return Err(FrameError::BadFlag(other)),
        };
        Ok(Self {
            seq: u64::from_be_bytes(seq),
            ack,
            payload: bytes[FRAME_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Retransmission parameters
#[derive(Debug, Clone)]
pub struct ReliableConfig {
    /// Maximum sends per message
    pub tries: usize,
    /// Wait for a completion after each send
    pub window: Duration,
    /// Overall bound on one send, if any
    pub sock_timeout: Option<Duration>,
    /// Pending/duplicate table size before reset
    pub table_limit: usize,
}

impl ReliableConfig {
    /// Defaults: 3 tries, 3s window, no overall bound.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tries: 3,
            window: Duration::from_secs(3),
            sock_timeout: None,
            table_limit: TABLE_LIMIT,
        }
    }

    /// Set the per-send wait window.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the number of sends.
    #[must_use]
    pub fn with_tries(mut self, tries: usize) -> Self {
        self.tries = tries;
        self
    }

    /// Bound the whole retransmit loop.
    #[must_use]
    pub fn with_sock_timeout(mut self, timeout: Duration) -> Self {
        self.sock_timeout = Some(timeout);
        self
    }
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Outstanding requests waiting for a completion value.
pub struct PendingTable<K, T> {
    waiters: Mutex<HashMap<K, oneshot::Sender<T>>>,
    limit: usize,
}

impl<K: Eq + Hash, T> PendingTable<K, T> {
    /// Empty table reset once it holds more than `limit` entries.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
            limit,
        }
    }

    /// Register `key` and return the completion receiver.
    pub async fn insert(&self, key: K) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        if waiters.len() > self.limit {
            debug!("Pending table over {} entries, resetting", self.limit);
            waiters.clear();
        }
        waiters.insert(key, tx);
        rx
    }

    /// Complete `key` with `value`. Returns false if nothing was waiting.
    pub async fn complete(&self, key: &K, value: T) -> bool {
        match self.waiters.lock().await.remove(key) {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Whether `key` is outstanding.
    pub async fn contains(&self, key: &K) -> bool {
        self.waiters.lock().await.contains_key(key)
    }

    /// Drop `key` without completing it.
    pub async fn remove(&self, key: &K) {
        self.waiters.lock().await.remove(key);
    }

    /// Number of outstanding keys.
    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// Whether the table is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Send with `send` until `key` is completed in `pending`.
///
/// Each send is followed by a wait of up to `config.window`. The loop ends
/// on completion, after `config.tries` sends, or once `config.sock_timeout`
/// has elapsed. The key is always removed afterwards.
///
/// # Errors
///
/// `Timeout` if no completion arrived, or the first error from `send`.
pub async fn retransmit<K, T, F, Fut>(
    pending: &PendingTable<K, T>,
    key: K,
    config: &ReliableConfig,
    mut send: F,
) -> Result<T>
where
    K: Eq + Hash + Clone,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut rx = pending.insert(key.clone()).await;
    let start = Instant::now();

    let outcome = async {
        for attempt in 1..=config.tries.max(1) {
            send().await?;
            trace!("Reliable send attempt {}/{}", attempt, config.tries);

            let wait = match config.sock_timeout {
                Some(limit) => config.window.min(limit.saturating_sub(start.elapsed())),
                None => config.window,
            };
            let waited = tokio::time::timeout(wait, &mut rx).await;
            match waited {
                Ok(Ok(value)) => return Ok(value),
                // Table was reset under us; re-register and keep going.
                Ok(Err(_)) => rx = pending.insert(key.clone()).await,
                Err(_) => {}
            }

            if config
                .sock_timeout
                .is_some_and(|limit| start.elapsed() >= limit)
            {
                break;
            }
        }
        Err(TraversalError::Timeout("reliable send"))
    }
    .await;

    pending.remove(&key).await;
    outcome
}

/// What the receive path did with one inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Ack for one of our sends; nothing for the application
    Acked(u64),
    /// Payload to hand to the application
    Deliver(Vec<u8>),
    /// Duplicate or malformed; dropped
    Dropped,
}

/// Acknowledged datagram socket over a [`PipeRef`].
pub struct ReliableSocket {
    pipe: PipeRef,
    config: ReliableConfig,
    pending: Arc<PendingTable<u64, ()>>,
    seen: Arc<Mutex<HashSet<(IpAddr, u64)>>>,
    rx: Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    receiver: tokio::task::AbortHandle,
}

impl ReliableSocket {
    /// Wrap `pipe` and start the background receive task.
    #[must_use]
    pub fn new(pipe: PipeRef, config: ReliableConfig) -> Self {
        let pending = Arc::new(PendingTable::new(config.table_limit));
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let receiver = Self::spawn_receiver(
            pipe.clone(),
            pending.clone(),
            seen.clone(),
            config.table_limit,
            tx,
        );

        Self {
            pipe,
            config,
            pending,
            seen,
            rx: Mutex::new(rx),
            receiver,
        }
    }

    fn spawn_receiver(
        pipe: PipeRef,
        pending: Arc<PendingTable<u64, ()>>,
        seen: Arc<Mutex<HashSet<(IpAddr, u64)>>>,
        limit: usize,
        tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    ) -> tokio::task::AbortHandle {
        tokio::spawn(async move {
            while !pipe.is_closed() {
                let (data, from) = match pipe.recv(Duration::from_millis(250)).await {
                    Ok(Some(received)) => received,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!("Reliable receiver stopping: {}", e);
                        break;
                    }
                };

                match handle_inbound(&pipe, &pending, &seen, limit, &data, from).await {
                    Inbound::Deliver(payload) => {
                        if tx.send((payload, from)).is_err() {
                            break;
                        }
                    }
                    Inbound::Acked(seq) => trace!("Ack {:016x} from {}", seq, from),
                    Inbound::Dropped => {}
                }
            }
        })
        .abort_handle()
    }

    /// Send `data` to `dest` and wait for its acknowledgement.
    ///
    /// # Errors
    ///
    /// `Timeout` if no ack arrived within the configured tries.
    pub async fn send(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        let seq = loop {
            let seq: u64 = rand::random();
            if seq != 0 {
                break seq;
            }
        };
        let frame = Frame::data(seq, data).encode();
        retransmit(&self.pending, seq, &self.config, || {
            let pipe = self.pipe.clone();
            let frame = frame.clone();
            async move {
                pipe.send(&frame, Some(dest)).await?;
                Ok(())
            }
        })
        .await
    }

    /// Next application payload, or `None` after `timeout`.
    pub async fn recv(&self, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Outstanding sends.
    pub async fn pending_len(&self) -> usize {
        self.pending.len().await
    }

    /// Distinct (source, seq) pairs delivered since the last reset.
    pub async fn seen_len(&self) -> usize {
        self.seen.lock().await.len()
    }

    /// Stop the receiver and close the pipe.
    ///
    /// # Errors
    ///
    /// Propagates the pipe's close error.
    pub async fn close(&self) -> Result<()> {
        self.receiver.abort();
        self.pipe.close().await
    }
}

impl Drop for ReliableSocket {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Receive path for one datagram: complete acks, ack data frames, drop
/// duplicates.
pub async fn handle_inbound(
    pipe: &PipeRef,
    pending: &PendingTable<u64, ()>,
    seen: &Mutex<HashSet<(IpAddr, u64)>>,
    limit: usize,
    data: &[u8],
    from: SocketAddr,
) -> Inbound {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            trace!("Dropping datagram from {}: {}", from, e);
            return Inbound::Dropped;
        }
    };

    if frame.ack {
        pending.complete(&frame.seq, ()).await;
        return Inbound::Acked(frame.seq);
    }

    // A peer echoing our own sequence id counts as the ack; replying
    // with an ack here would loop.
    if !pending.complete(&frame.seq, ()).await {
        if let Err(e) = pipe.send(&Frame::ack(frame.seq).encode(), Some(from)).await {
            debug!("Failed to ack {:016x} to {}: {}", frame.seq, from, e);
        }
    }

    let mut seen = seen.lock().await;
    if seen.len() > limit {
        seen.clear();
    }
    if !seen.insert((from.ip(), frame.seq)) {
        return Inbound::Dropped;
    }
    Inbound::Deliver(frame.payload)
}
