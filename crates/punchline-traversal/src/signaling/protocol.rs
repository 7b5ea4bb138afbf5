//! Inbound signaling pipeline and request/reply correlation.

use super::envelope::{SignalEnvelope, SignalKind, new_pipe_id};
use super::sender::{RELAY_NO, RelayRef, SignalSender};
use crate::addr::PeerAddress;
use crate::clock::SyncClock;
use crate::error::{Result, TraversalError};
use crate::reliable::PendingTable;
use async_trait::async_trait;
use punchline_crypto::PrivateKey;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, trace, warn};

/// Signaling limits
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Relay channels that must accept each message
    pub relay_no: usize,
    /// Entries kept in the seen cache
    pub seen_limit: usize,
    /// Age after which seen entries are purged
    pub seen_window: Duration,
    /// Wait for a `ReturnAddr`
    pub reply_timeout: Duration,
    /// Seal envelopes to the receiver's key
    pub encrypt: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_no: RELAY_NO,
            seen_limit: 1000,
            seen_window: Duration::from_secs(300),
            reply_timeout: Duration::from_secs(5),
            encrypt: true,
        }
    }
}

/// Pipe ids already processed, with when they were first seen.
#[derive(Debug)]
pub struct SeenCache {
    entries: HashMap<String, Instant>,
    limit: usize,
    window: Duration,
}

impl SeenCache {
    /// Empty cache
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            limit: limit.max(1),
            window,
        }
    }

    /// Record `pipe_id`. Returns false if it was already present.
    pub fn insert(&mut self, pipe_id: &str) -> bool {
        if self.entries.contains_key(pipe_id) {
            return false;
        }
        if self.entries.len() >= self.limit {
            self.sweep();
        }
        if self.entries.len() >= self.limit {
            // Still full of fresh ids: drop the oldest.
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(pipe_id.to_string(), Instant::now());
        true
    }

    /// Whether `pipe_id` is present
    #[must_use]
    pub fn contains(&self, pipe_id: &str) -> bool {
        self.entries.contains_key(pipe_id)
    }

    /// Purge entries older than the window.
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        let window = self.window;
        self.entries.retain(|_, at| at.elapsed() < window);
        before - self.entries.len()
    }

    /// Entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Receiver of validated inbound envelopes.
///
/// Handlers run on the inbound path and should hand long work to a task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one envelope.
    async fn handle(&self, envelope: SignalEnvelope);
}

/// One node's signaling endpoint.
pub struct Signaling {
    config: SignalingConfig,
    key: PrivateKey,
    address: RwLock<PeerAddress>,
    clock: SyncClock,
    seen: Mutex<SeenCache>,
    owned: Mutex<HashSet<String>>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    replies: PendingTable<String, SignalEnvelope>,
    sender: SignalSender,
}

impl Signaling {
    /// Endpoint for the node holding `key`, published as `address`.
    /// Spawns the sender worker.
    #[must_use]
    pub fn new(
        config: SignalingConfig,
        key: PrivateKey,
        address: PeerAddress,
        clock: SyncClock,
        channels: Vec<RelayRef>,
    ) -> Self {
        let sender = SignalSender::spawn(channels, config.relay_no);
        let seen = SeenCache::new(config.seen_limit, config.seen_window);
        let replies = PendingTable::new(config.seen_limit);
        Self {
            config,
            key,
            address: RwLock::new(address),
            clock,
            seen: Mutex::new(seen),
            owned: Mutex::new(HashSet::new()),
            handlers: RwLock::new(Vec::new()),
            replies,
            sender,
        }
    }

    /// Our node id
    pub async fn node_id(&self) -> String {
        self.address.read().await.node_id.clone()
    }

    /// Our current address
    pub async fn address(&self) -> PeerAddress {
        self.address.read().await.clone()
    }

    /// Replace our published address.
    pub async fn set_address(&self, address: PeerAddress) {
        *self.address.write().await = address;
    }

    /// Synchronized clock
    #[must_use]
    pub fn clock(&self) -> &SyncClock {
        &self.clock
    }

    /// Add a handler for inbound messages.
    pub async fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().await.push(handler);
    }

    /// Let later messages for `pipe_id` past dedup; our session expects them.
    pub async fn own(&self, pipe_id: &str) {
        self.owned.lock().await.insert(pipe_id.to_string());
    }

    /// Stop exempting `pipe_id`.
    pub async fn disown(&self, pipe_id: &str) {
        self.owned.lock().await.remove(pipe_id);
    }

    /// Envelope from us to `dest` expiring `ttl` from now.
    pub async fn envelope(
        &self,
        kind: SignalKind,
        pipe_id: &str,
        ttl: Duration,
        dest: &PeerAddress,
        payload: Vec<u8>,
    ) -> SignalEnvelope {
        let deadline = self.clock.now() + ttl.as_secs_f64();
        SignalEnvelope::new(kind, pipe_id, deadline, self.address().await, dest, payload)
    }

    /// Reply to `request` from us, expiring `ttl` from now.
    pub async fn reply_to(
        &self,
        request: &SignalEnvelope,
        kind: SignalKind,
        ttl: Duration,
        payload: Vec<u8>,
    ) -> SignalEnvelope {
        let deadline = self.clock.now() + ttl.as_secs_f64();
        request.reply(kind, deadline, self.address().await, payload)
    }

    /// Encode and queue `envelope` for `dest`.
    ///
    /// # Errors
    ///
    /// Encoding or relay failures.
    pub async fn send(&self, envelope: &SignalEnvelope, dest: &PeerAddress) -> Result<usize> {
        let key = dest.public_key();
        let text = envelope.encode(self.config.encrypt.then_some(&key))?;
        debug!(
            "Signal {:?} pipe {} -> {}",
            envelope.kind,
            envelope.pipe_id(),
            dest.node_id
        );
        self.sender.send(&dest.node_id, text).await
    }

    /// Ask `dest` for its current address.
    ///
    /// # Errors
    ///
    /// `Timeout` if no `ReturnAddr` arrives within the reply timeout.
    pub async fn request_addr(&self, dest: &PeerAddress) -> Result<PeerAddress> {
        let pipe_id = new_pipe_id();
        let reply = self.replies.insert(pipe_id.clone()).await;
        self.own(&pipe_id).await;
        let envelope = self
            .envelope(SignalKind::GetAddr, &pipe_id, self.config.reply_timeout, dest, Vec::new())
            .await;

        let result = match self.send(&envelope, dest).await {
            Ok(_) => match tokio::time::timeout(self.config.reply_timeout, reply).await {
                Ok(Ok(answer)) => Ok(answer.meta.source),
                Ok(Err(_)) => Err(TraversalError::Timeout("address reply dropped")),
                Err(_) => Err(TraversalError::Timeout("address reply")),
            },
            Err(e) => Err(e),
        };
        self.replies.remove(&pipe_id).await;
        self.disown(&pipe_id).await;
        result
    }

    /// Run one inbound message through the pipeline.
    ///
    /// Returns the kind of a dispatched message. Dropped messages come back
    /// as errors for the caller to log.
    ///
    /// # Errors
    ///
    /// `Protocol`/`Crypto` for undecodable input or a foreign destination,
    /// `ReplayOrExpired` for expired or already seen pipe ids.
    pub async fn receive(&self, text: &str) -> Result<SignalKind> {
        let envelope = SignalEnvelope::decode(text, &self.key)?;

        let node_id = self.node_id().await;
        if envelope.routing.dest_node_id != node_id {
            return Err(TraversalError::Protocol(format!(
                "envelope for {} reached {}",
                envelope.routing.dest_node_id, node_id
            )));
        }

        let pipe_id = envelope.pipe_id().to_string();
        if envelope.meta.ttl <= self.clock.now() {
            return Err(TraversalError::ReplayOrExpired(pipe_id));
        }

        let owned = self.owned.lock().await.contains(&pipe_id);
        let fresh = self.seen.lock().await.insert(&pipe_id);
        if !fresh && !owned {
            return Err(TraversalError::ReplayOrExpired(pipe_id));
        }

        let kind = envelope.kind;
        if kind == SignalKind::ReturnAddr {
            if !self.replies.complete(&pipe_id, envelope).await {
                trace!("Unrequested address reply {}", pipe_id);
            }
            return Ok(kind);
        }

        let handlers = self.handlers.read().await.clone();
        if handlers.is_empty() {
            debug!("No handler for {:?} pipe {}", kind, pipe_id);
        }
        for handler in handlers {
            handler.handle(envelope.clone()).await;
        }
        Ok(kind)
    }

    /// Feed messages from `rx` through [`receive`](Self::receive) until
    /// the channel closes. Bad messages are logged and skipped.
    pub async fn run_inbound(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<String>) {
        while let Some(text) = rx.recv().await {
            if let Err(e) = self.receive(&text).await {
                warn!("Dropped signal: {}", e);
            }
        }
        debug!("Signal inbound loop stopped");
    }

    /// Purge old seen entries.
    pub async fn sweep(&self) -> usize {
        self.seen.lock().await.sweep()
    }

    /// Stop the sender after queued messages.
    pub fn shutdown(&self) {
        self.sender.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PeerInterface;
    use crate::nat::types::NatInfo;
    use crate::signaling::sender::RelayChannel;
    use rand::rngs::OsRng;
    use std::sync::Mutex as StdMutex;

    /// Relay that hands every message to a node's inbound queue.
    struct Loopback {
        routes: StdMutex<HashMap<String, mpsc::UnboundedSender<String>>>,
    }

    #[async_trait]
    impl RelayChannel for Loopback {
        fn name(&self) -> &str {
            "loopback"
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn send(&self, dest: &str, text: &str) -> Result<()> {
            let routes = self.routes.lock().unwrap();
            let tx = routes
                .get(dest)
                .ok_or_else(|| TraversalError::Protocol("unknown node".into()))?;
            tx.send(text.to_string())
                .map_err(|_| TraversalError::Protocol("node gone".into()))
        }
    }

    struct Collect(mpsc::UnboundedSender<SignalEnvelope>);

    #[async_trait]
    impl MessageHandler for Collect {
        async fn handle(&self, envelope: SignalEnvelope) {
            let _ = self.0.send(envelope);
        }
    }

    fn node(ip: &str, relay: &Arc<Loopback>) -> (Arc<Signaling>, mpsc::UnboundedReceiver<String>) {
        let key = PrivateKey::generate(&mut OsRng);
        let ip = ip.parse().unwrap();
        let address = PeerAddress::new(
            &key.public_key(),
            vec![PeerInterface {
                wan_ip: ip,
                nic_ip: ip,
                port: 20000,
                nat: NatInfo::open(),
            }],
        );
        let (tx, rx) = mpsc::unbounded_channel();
        relay
            .routes
            .lock()
            .unwrap()
            .insert(address.node_id.clone(), tx);
        let channels: Vec<RelayRef> = vec![relay.clone()];
        let signaling = Signaling::new(
            SignalingConfig {
                reply_timeout: Duration::from_millis(500),
                ..SignalingConfig::default()
            },
            key,
            address,
            SyncClock::default(),
            channels,
        );
        (Arc::new(signaling), rx)
    }

    fn relay() -> Arc<Loopback> {
        Arc::new(Loopback {
            routes: StdMutex::new(HashMap::new()),
        })
    }

    #[test]
    fn test_seen_cache_bound() {
        let mut seen = SeenCache::new(2, Duration::from_secs(60));
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert_eq!(seen.len(), 2);
        assert!(seen.contains("c"));

        let mut short = SeenCache::new(10, Duration::ZERO);
        short.insert("x");
        assert_eq!(short.sweep(), 1);
        assert!(short.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_dedup_and_ownership() {
        let relay = relay();
        let (alice, _alice_rx) = node("10.0.0.1", &relay);
        let (bob, mut bob_rx) = node("10.0.0.2", &relay);
        let (tx, mut handled) = mpsc::unbounded_channel();
        bob.register_message_handler(Arc::new(Collect(tx))).await;

        let bob_addr = bob.address().await;
        let env = alice
            .envelope(SignalKind::Con, "pipe1", Duration::from_secs(10), &bob_addr, vec![7])
            .await;
        alice.send(&env, &bob_addr).await.unwrap();
        let text = bob_rx.recv().await.unwrap();

        assert_eq!(bob.receive(&text).await.unwrap(), SignalKind::Con);
        assert_eq!(handled.recv().await.unwrap(), env);

        // Same pipe id again is a replay...
        assert!(matches!(
            bob.receive(&text).await,
            Err(TraversalError::ReplayOrExpired(_))
        ));
        // ...unless a session of ours owns it.
        bob.own("pipe1").await;
        assert!(bob.receive(&text).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_and_misrouted_dropped() {
        let relay = relay();
        let (alice, mut alice_rx) = node("10.0.0.1", &relay);
        let (bob, mut bob_rx) = node("10.0.0.2", &relay);
        let (tx, mut handled) = mpsc::unbounded_channel();
        bob.register_message_handler(Arc::new(Collect(tx))).await;
        let bob_addr = bob.address().await;

        let mut env = alice
            .envelope(SignalKind::TcpPunch, "old", Duration::from_secs(10), &bob_addr, vec![])
            .await;
        env.meta.ttl = bob.clock().now();
        alice.send(&env, &bob_addr).await.unwrap();
        let text = bob_rx.recv().await.unwrap();
        assert!(matches!(
            bob.receive(&text).await,
            Err(TraversalError::ReplayOrExpired(_))
        ));

        // Encrypted to bob, so alice cannot open it.
        assert!(alice.receive(&text).await.is_err());

        // Readable by alice but addressed to bob.
        let plain = env.encode(None).unwrap();
        assert!(matches!(
            alice.receive(&plain).await,
            Err(TraversalError::Protocol(_))
        ));
        assert!(handled.try_recv().is_err());
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_request_addr_round_trip() {
        let relay = relay();
        let (alice, alice_rx) = node("10.0.0.1", &relay);
        let (bob, mut bob_rx) = node("10.0.0.2", &relay);
        tokio::spawn(Arc::clone(&alice).run_inbound(alice_rx));

        let responder = {
            let bob = Arc::clone(&bob);
            let alice_addr = alice.address().await;
            tokio::spawn(async move {
                let text = bob_rx.recv().await.unwrap();
                let request = SignalEnvelope::decode(&text, &bob.key).unwrap();
                assert_eq!(request.kind, SignalKind::GetAddr);
                let reply = bob
                    .reply_to(&request, SignalKind::ReturnAddr, Duration::from_secs(5), vec![])
                    .await;
                bob.send(&reply, &alice_addr).await.unwrap();
            })
        };

        let bob_addr = bob.address().await;
        assert_eq!(alice.request_addr(&bob_addr).await.unwrap(), bob_addr);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_addr_times_out() {
        let relay = relay();
        let (alice, _alice_rx) = node("10.0.0.1", &relay);
        let (bob, _bob_rx) = node("10.0.0.2", &relay);
        assert!(matches!(
            alice.request_addr(&bob.address().await).await,
            Err(TraversalError::Timeout(_))
        ));
    }
}
