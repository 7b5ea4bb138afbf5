//! Connection orchestrator.
//!
//! [`Orchestrator::connect`] walks the strategies in order and, for each,
//! the candidate address pairs, giving every attempt a fresh pipe id and
//! the strategy's timeout. The first pipe wins. Abandoned attempts of
//! strategies with cleanup are cleaned up once.
//!
//! The peer side of each strategy runs from signaling: `Con` makes us dial
//! back, `TcpPunch` runs the punch exchange, `Turn` swaps relayed
//! endpoints and `GetAddr` is answered with our address. Inbound TCP
//! connections open with an `ID <pipe_id>` line that ties them to a
//! waiting attempt; anything else is queued for [`Orchestrator::accept`].

use super::pairs::{Candidate, candidates, reply_candidate};
use super::relay::{RelayAllocator, TurnOffer};
use super::table::{StrategyKind, StrategySpec, default_table};
use crate::addr::{AddrType, PeerAddress};
use crate::error::{Result, TraversalError};
use crate::punch::{PunchOffer, PunchState, PunchTarget, TcpPuncher, select_mode};
use crate::reaper::IdleReaper;
use crate::reliable::PendingTable;
use crate::signaling::{
    MessageHandler, PIPE_ID_LEN, SeenCache, SignalEnvelope, SignalKind, Signaling, new_pipe_id,
};
use crate::transport::{Binder, PipeRef, Protocol, TcpPipe, TokioBinder, bound_tcp_socket};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

const ID_PREFIX: &[u8] = b"ID ";

/// Bytes of the pipe id line: `ID <pipe_id>\n`.
pub const ID_LINE_LEN: usize = ID_PREFIX.len() + PIPE_ID_LEN + 1;

const ACCEPT_BACKLOG: u32 = 128;

const INITIATED_LIMIT: usize = 1024;

/// First bytes sent on a dialed connection.
#[must_use]
pub fn id_line(pipe_id: &str) -> Vec<u8> {
    format!("ID {pipe_id}\n").into_bytes()
}

/// Pipe id from an `ID <pipe_id>\n` line.
///
/// # Errors
///
/// `Protocol` for anything else.
pub fn parse_id_line(line: &[u8]) -> Result<String> {
    let bad = || TraversalError::Protocol("bad pipe id line".into());
    let rest = line.strip_prefix(ID_PREFIX).ok_or_else(bad)?;
    let id = rest.strip_suffix(b"\n").ok_or_else(bad)?;
    if id.len() != PIPE_ID_LEN || !id.iter().all(u8::is_ascii_alphanumeric) {
        return Err(bad());
    }
    String::from_utf8(id.to_vec()).map_err(|_| bad())
}

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Strategy table in default order
    pub strategies: Vec<StrategySpec>,
    /// Address types to try, in order
    pub addr_types: Vec<AddrType>,
    /// Lifetime of `Con` requests
    pub con_ttl: Duration,
    /// Lifetime of `TcpPunch` messages
    pub punch_ttl: Duration,
    /// Lifetime of `Turn` messages
    pub turn_ttl: Duration,
    /// Lifetime of `ReturnAddr` replies
    pub addr_ttl: Duration,
    /// Wait for the pipe id line on inbound connections
    pub id_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            strategies: default_table(),
            addr_types: vec![AddrType::External, AddrType::Nic],
            con_ttl: Duration::from_secs(10),
            punch_ttl: Duration::from_secs(30),
            turn_ttl: Duration::from_secs(30),
            addr_ttl: Duration::from_secs(5),
            id_timeout: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    /// Table entry for `kind`.
    #[must_use]
    pub fn spec(&self, kind: StrategyKind) -> StrategySpec {
        self.strategies
            .iter()
            .find(|s| s.kind == kind)
            .copied()
            .unwrap_or_else(|| kind.spec())
    }

    /// How long a pipe id we started can still draw late replies.
    #[must_use]
    pub fn late_window(&self) -> Duration {
        let longest_attempt = self.strategies.iter().map(|s| s.timeout).max().unwrap_or_default();
        let longest_ttl = self.con_ttl.max(self.punch_ttl).max(self.turn_ttl);
        longest_attempt + longest_ttl
    }

    /// Strategies in table order
    #[must_use]
    pub fn order(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind).collect()
    }
}

/// Replacement for a built-in strategy.
#[async_trait]
pub trait StrategyHandler: Send + Sync {
    /// Try to reach `peer` through `candidate` under `pipe_id`.
    async fn connect(&self, pipe_id: &str, candidate: &Candidate, peer: &PeerAddress) -> Result<PipeRef>;

    /// Undo an abandoned attempt.
    async fn cleanup(&self, _pipe_id: &str, _candidate: &Candidate) {}
}

/// A connection opened by a peer.
#[derive(Clone)]
pub struct Incoming {
    /// Pipe id the peer used
    pub pipe_id: String,
    /// The pipe
    pub pipe: PipeRef,
}

struct Inner {
    config: OrchestratorConfig,
    signaling: Arc<Signaling>,
    puncher: Arc<TcpPuncher>,
    binder: Arc<dyn Binder>,
    relay: Option<Arc<dyn RelayAllocator>>,
    overrides: HashMap<StrategyKind, Arc<dyn StrategyHandler>>,
    reaper: Option<Arc<IdleReaper>>,
    pending: PendingTable<String, PipeRef>,
    /// Pipe ids of our own attempts, finished or not.
    initiated: Mutex<SeenCache>,
    incoming: mpsc::UnboundedSender<Incoming>,
}

impl Inner {
    fn available(&self, kind: StrategyKind) -> bool {
        kind != StrategyKind::Relay || self.relay.is_some() || self.overrides.contains_key(&kind)
    }

    fn relay(&self) -> Result<&Arc<dyn RelayAllocator>> {
        self.relay
            .as_ref()
            .ok_or_else(|| TraversalError::Protocol("no relay allocator".into()))
    }

    async fn started_here(&self, pipe_id: &str) -> bool {
        self.initiated.lock().await.contains(pipe_id)
    }

    /// Hand a peer-opened pipe to the attempt waiting on `pipe_id`, or to
    /// the accept queue. Pipes for our own finished attempts are closed.
    async fn deliver(&self, pipe_id: &str, pipe: PipeRef) {
        if self.pending.complete(&pipe_id.to_string(), pipe.clone()).await {
            trace!("Pipe {} matched a pending attempt", pipe_id);
            return;
        }
        if self.started_here(pipe_id).await {
            debug!("Closing late pipe {} of an abandoned attempt", pipe_id);
            if let Err(e) = pipe.close().await {
                trace!("Close of pipe {} failed: {}", pipe_id, e);
            }
            return;
        }
        if let Some(reaper) = &self.reaper {
            reaper.watch(pipe.clone()).await;
        }
        info!("Accepted pipe {}", pipe_id);
        let incoming = Incoming {
            pipe_id: pipe_id.to_string(),
            pipe,
        };
        if let Err(e) = self.incoming.send(incoming) {
            warn!("Accept queue closed, dropping pipe {}", e.0.pipe_id);
        }
    }

    fn punch_target(pipe_id: &str, candidate: &Candidate) -> PunchTarget {
        PunchTarget {
            pipe_id: pipe_id.to_string(),
            local_ip: candidate.local_ip(),
            peer_ip: candidate.dest_ip,
            ours: candidate.local.nat,
            theirs: candidate.remote.nat,
            mode: select_mode(candidate.same_machine, candidate.same_wan()),
        }
    }

    async fn dial(&self, pipe_id: &str, candidate: &Candidate) -> Result<PipeRef> {
        let route = self.binder.bind(candidate.local_ip(), 0).await?;
        let pipe = self.binder.open(Protocol::Tcp, route, Some(candidate.dest())).await?;
        pipe.send(&id_line(pipe_id), None).await?;
        Ok(pipe)
    }

    async fn request(
        &self,
        kind: SignalKind,
        ttl: Duration,
        pipe_id: &str,
        candidate: &Candidate,
        peer: &PeerAddress,
        payload: Vec<u8>,
    ) -> Result<()> {
        let envelope = self
            .signaling
            .envelope(kind, pipe_id, ttl, peer, payload)
            .await
            .with_interfaces(candidate.src_if, candidate.dest_if)
            .with_addr_types(vec![candidate.addr_type]);
        self.signaling.send(&envelope, peer).await?;
        Ok(())
    }

    async fn attempt(&self, pipe_id: &str, candidate: &Candidate, peer: &PeerAddress) -> Result<PipeRef> {
        if let Some(handler) = self.overrides.get(&candidate.kind) {
            return handler.connect(pipe_id, candidate, peer).await;
        }
        match candidate.kind {
            StrategyKind::Direct => self.dial(pipe_id, candidate).await,
            StrategyKind::Reverse => {
                let ready = self.pending.insert(pipe_id.to_string()).await;
                self.request(SignalKind::Con, self.config.con_ttl, pipe_id, candidate, peer, Vec::new())
                    .await?;
                ready
                    .await
                    .map_err(|_| TraversalError::Protocol(format!("pipe {pipe_id} abandoned")))
            }
            StrategyKind::Punch => {
                let target = Self::punch_target(pipe_id, candidate);
                let offer = self.puncher.initiate(&target).await?;
                // The reply reuses our pipe id.
                self.signaling.own(pipe_id).await;
                let payload = offer.to_payload()?;
                self.request(SignalKind::TcpPunch, self.config.punch_ttl, pipe_id, candidate, peer, payload)
                    .await?;
                let pipe = self.puncher.punch(pipe_id).await;
                self.signaling.disown(pipe_id).await;
                pipe
            }
            StrategyKind::Relay => {
                let relay = self.relay()?;
                let ours = relay.allocate(pipe_id, candidate.local.family()).await?;
                let ready = self.pending.insert(pipe_id.to_string()).await;
                self.signaling.own(pipe_id).await;
                let payload = TurnOffer { relay: ours }.to_payload()?;
                self.request(SignalKind::Turn, self.config.turn_ttl, pipe_id, candidate, peer, payload)
                    .await?;
                let pipe = ready
                    .await
                    .map_err(|_| TraversalError::Protocol(format!("pipe {pipe_id} abandoned")));
                self.signaling.disown(pipe_id).await;
                pipe
            }
        }
    }

    async fn cleanup(&self, pipe_id: &str, candidate: &Candidate) {
        if let Some(handler) = self.overrides.get(&candidate.kind) {
            handler.cleanup(pipe_id, candidate).await;
            return;
        }
        match candidate.kind {
            StrategyKind::Punch => {
                self.puncher.cleanup(pipe_id).await;
                self.signaling.disown(pipe_id).await;
            }
            StrategyKind::Relay => {
                if let Some(relay) = &self.relay {
                    relay.release(pipe_id).await;
                }
                self.signaling.disown(pipe_id).await;
            }
            StrategyKind::Direct | StrategyKind::Reverse => {}
        }
    }

    async fn connect(&self, peer: &PeerAddress, strategies: &[StrategyKind]) -> Result<PipeRef> {
        let ours = self.signaling.address().await;
        for &kind in strategies {
            if !self.available(kind) {
                debug!("Skipping {} to {}: unavailable", kind, peer.node_id);
                continue;
            }
            let spec = self.config.spec(kind);
            let candidates = candidates(&ours, peer, &spec, &self.config.addr_types);
            if candidates.is_empty() {
                debug!("No {} candidates for {}", kind, peer.node_id);
            }
            for candidate in candidates {
                let pipe_id = new_pipe_id();
                self.initiated.lock().await.insert(&pipe_id);
                debug!(
                    "Trying {} to {} via {:?} ({}) pipe {}",
                    kind,
                    peer.node_id,
                    candidate.addr_type,
                    candidate.dest(),
                    pipe_id
                );
                let result = tokio::time::timeout(spec.timeout, self.attempt(&pipe_id, &candidate, peer))
                    .await
                    .map_err(|_| TraversalError::Timeout("strategy attempt"))
                    .and_then(|r| r);
                self.pending.remove(&pipe_id).await;
                match result {
                    Ok(pipe) => {
                        info!("Connected to {} with {} pipe {}", peer.node_id, kind, pipe_id);
                        if let Some(reaper) = &self.reaper {
                            reaper.watch(pipe.clone()).await;
                        }
                        return Ok(pipe);
                    }
                    Err(e) => {
                        debug!("{} to {} failed: {}", kind, candidate.dest(), e);
                        if spec.has_cleanup {
                            self.cleanup(&pipe_id, &candidate).await;
                        }
                    }
                }
            }
        }
        warn!("Could not reach {}", peer.node_id);
        Err(TraversalError::Exhausted)
    }

    async fn on_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        match envelope.kind {
            SignalKind::Con => self.on_con(&envelope).await,
            SignalKind::TcpPunch => self.on_punch(&envelope).await,
            SignalKind::Turn => self.on_turn(&envelope).await,
            SignalKind::GetAddr => {
                let reply = self
                    .signaling
                    .reply_to(&envelope, SignalKind::ReturnAddr, self.config.addr_ttl, Vec::new())
                    .await;
                self.signaling.send(&reply, &envelope.meta.source).await?;
                Ok(())
            }
            // Consumed by signaling.
            SignalKind::ReturnAddr => Ok(()),
        }
    }

    async fn peer_candidate(&self, kind: StrategyKind, envelope: &SignalEnvelope) -> Result<Candidate> {
        let ours = self.signaling.address().await;
        reply_candidate(
            kind,
            &ours,
            &envelope.meta.source,
            envelope.routing.dest_if_index,
            envelope.meta.src_if_index,
            &envelope.meta.addr_types,
        )
        .ok_or_else(|| TraversalError::Protocol(format!("no usable address for {kind} request")))
    }

    async fn on_con(&self, envelope: &SignalEnvelope) -> Result<()> {
        let candidate = self.peer_candidate(StrategyKind::Direct, envelope).await?;
        let pipe_id = envelope.pipe_id();
        let timeout = self.config.spec(StrategyKind::Direct).timeout;
        let pipe = tokio::time::timeout(timeout, self.dial(pipe_id, &candidate))
            .await
            .map_err(|_| TraversalError::Timeout("reverse dial"))??;
        debug!("Dialed back {} for pipe {}", candidate.dest(), pipe_id);
        self.deliver(pipe_id, pipe).await;
        Ok(())
    }

    async fn on_punch(&self, envelope: &SignalEnvelope) -> Result<()> {
        let pipe_id = envelope.pipe_id();
        let offer = PunchOffer::from_payload(&envelope.payload)?;
        if self.puncher.state(pipe_id).await == Some(PunchState::MappingsSent) {
            return self.puncher.receive_reply(pipe_id, &offer).await;
        }
        if self.started_here(pipe_id).await {
            debug!("Late punch reply for abandoned pipe {}", pipe_id);
            return Ok(());
        }

        let candidate = self.peer_candidate(StrategyKind::Punch, envelope).await?;
        let target = Self::punch_target(pipe_id, &candidate);
        let answer = self.puncher.receive_offer(&target, &offer).await?;
        let reply = self
            .signaling
            .reply_to(envelope, SignalKind::TcpPunch, self.config.punch_ttl, answer.to_payload()?)
            .await;
        if let Err(e) = self.signaling.send(&reply, &envelope.meta.source).await {
            self.puncher.cleanup(pipe_id).await;
            return Err(e);
        }
        let pipe = self.puncher.punch(pipe_id).await?;
        self.deliver(pipe_id, pipe).await;
        Ok(())
    }

    async fn on_turn(&self, envelope: &SignalEnvelope) -> Result<()> {
        let pipe_id = envelope.pipe_id();
        let relay = self.relay()?;
        let theirs = TurnOffer::from_payload(&envelope.payload)?;

        if self.pending.contains(&pipe_id.to_string()).await {
            let pipe = relay.connect(pipe_id, theirs.relay).await?;
            self.deliver(pipe_id, pipe).await;
            return Ok(());
        }
        if self.started_here(pipe_id).await {
            debug!("Late relay reply for abandoned pipe {}", pipe_id);
            return Ok(());
        }

        let family = crate::transport::AddrFamily::of(theirs.relay.ip());
        let ours = relay.allocate(pipe_id, family).await?;
        let pipe = match relay.connect(pipe_id, theirs.relay).await {
            Ok(pipe) => pipe,
            Err(e) => {
                relay.release(pipe_id).await;
                return Err(e);
            }
        };
        let reply = self
            .signaling
            .reply_to(envelope, SignalKind::Turn, self.config.turn_ttl, TurnOffer { relay: ours }.to_payload()?)
            .await;
        if let Err(e) = self.signaling.send(&reply, &envelope.meta.source).await {
            relay.release(pipe_id).await;
            return Err(e);
        }
        self.deliver(pipe_id, pipe).await;
        Ok(())
    }

    async fn accept_stream(&self, mut stream: TcpStream) -> Result<()> {
        let mut line = [0u8; ID_LINE_LEN];
        tokio::time::timeout(self.config.id_timeout, stream.read_exact(&mut line))
            .await
            .map_err(|_| TraversalError::Timeout("pipe id line"))??;
        let pipe_id = parse_id_line(&line)?;
        let pipe: PipeRef = Arc::new(TcpPipe::from_stream(stream)?);
        self.deliver(&pipe_id, pipe).await;
        Ok(())
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    if let Err(e) = inner.accept_stream(stream).await {
                        debug!("Rejected connection from {}: {}", from, e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Signaling hook holding the orchestrator weakly.
struct InboundSignals(Weak<Inner>);

#[async_trait]
impl MessageHandler for InboundSignals {
    async fn handle(&self, envelope: SignalEnvelope) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let kind = envelope.kind;
            let pipe_id = envelope.pipe_id().to_string();
            if let Err(e) = inner.on_signal(envelope).await {
                debug!("{:?} for pipe {} failed: {}", kind, pipe_id, e);
            }
        });
    }
}

/// Collaborators for an [`Orchestrator`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    signaling: Arc<Signaling>,
    puncher: Arc<TcpPuncher>,
    binder: Arc<dyn Binder>,
    relay: Option<Arc<dyn RelayAllocator>>,
    overrides: HashMap<StrategyKind, Arc<dyn StrategyHandler>>,
    reaper: Option<Arc<IdleReaper>>,
}

impl OrchestratorBuilder {
    /// Socket binder for dialing (default [`TokioBinder`]).
    #[must_use]
    pub fn binder(mut self, binder: Arc<dyn Binder>) -> Self {
        self.binder = binder;
        self
    }

    /// Enable the relay strategy.
    #[must_use]
    pub fn relay(mut self, relay: Arc<dyn RelayAllocator>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Replace the built-in `kind` strategy.
    #[must_use]
    pub fn handler(mut self, kind: StrategyKind, handler: Arc<dyn StrategyHandler>) -> Self {
        self.overrides.insert(kind, handler);
        self
    }

    /// Watch connected pipes for idleness.
    #[must_use]
    pub fn reaper(mut self, reaper: Arc<IdleReaper>) -> Self {
        self.reaper = Some(reaper);
        self
    }

    /// Build and register for inbound signals.
    pub async fn start(self) -> Orchestrator {
        let (incoming, accepted) = mpsc::unbounded_channel();
        let initiated = SeenCache::new(INITIATED_LIMIT, self.config.late_window());
        let inner = Arc::new(Inner {
            config: self.config,
            signaling: self.signaling,
            puncher: self.puncher,
            binder: self.binder,
            relay: self.relay,
            overrides: self.overrides,
            reaper: self.reaper,
            pending: PendingTable::new(1024),
            initiated: Mutex::new(initiated),
            incoming,
        });
        inner
            .signaling
            .register_message_handler(Arc::new(InboundSignals(Arc::downgrade(&inner))))
            .await;
        Orchestrator {
            inner,
            accepted: Mutex::new(accepted),
            listeners: std::sync::Mutex::new(Vec::new()),
        }
    }
}

/// Runs the connection strategies for one node.
pub struct Orchestrator {
    inner: Arc<Inner>,
    accepted: Mutex<mpsc::UnboundedReceiver<Incoming>>,
    listeners: std::sync::Mutex<Vec<AbortHandle>>,
}

impl Orchestrator {
    /// Start building over `signaling` and `puncher`.
    #[must_use]
    pub fn builder(
        config: OrchestratorConfig,
        signaling: Arc<Signaling>,
        puncher: Arc<TcpPuncher>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            signaling,
            puncher,
            binder: Arc::new(TokioBinder),
            relay: None,
            overrides: HashMap::new(),
            reaper: None,
        }
    }

    /// Settings
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Signaling endpoint
    #[must_use]
    pub fn signaling(&self) -> &Arc<Signaling> {
        &self.inner.signaling
    }

    /// Puncher
    #[must_use]
    pub fn puncher(&self) -> &Arc<TcpPuncher> {
        &self.inner.puncher
    }

    /// Reach `peer` trying `strategies` in order.
    ///
    /// # Errors
    ///
    /// `Exhausted` if every strategy and candidate failed.
    pub async fn connect(&self, peer: &PeerAddress, strategies: &[StrategyKind]) -> Result<PipeRef> {
        self.inner.connect(peer, strategies).await
    }

    /// Reach `peer` with the configured strategy order.
    ///
    /// # Errors
    ///
    /// As for [`Orchestrator::connect`].
    pub async fn connect_default(&self, peer: &PeerAddress) -> Result<PipeRef> {
        let order = self.inner.config.order();
        self.inner.connect(peer, &order).await
    }

    /// Ask `peer` for its current address.
    ///
    /// # Errors
    ///
    /// `Timeout` if it does not answer.
    pub async fn request_addr(&self, peer: &PeerAddress) -> Result<PeerAddress> {
        self.inner.signaling.request_addr(peer).await
    }

    /// Accept inbound connections on `addr`. Returns the bound address.
    ///
    /// # Errors
    ///
    /// `Bind` if the address is unavailable.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let socket = bound_tcp_socket(addr)?;
        let listener = socket.listen(ACCEPT_BACKLOG)?;
        let bound = listener.local_addr()?;
        let handle = tokio::spawn(accept_loop(Arc::clone(&self.inner), listener)).abort_handle();
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(handle);
        }
        info!("Listening on {}", bound);
        Ok(bound)
    }

    /// Next connection opened by a peer, or `None` once shut down.
    pub async fn accept(&self) -> Option<Incoming> {
        self.accepted.lock().await.recv().await
    }

    /// Stop listeners, the puncher and signaling.
    pub fn shutdown(&self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            for handle in listeners.drain(..) {
                handle.abort();
            }
        }
        if let Some(reaper) = &self.inner.reaper {
            reaper.stop();
        }
        self.inner.puncher.shutdown();
        self.inner.signaling.shutdown();
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Ok(mut listeners) = self.listeners.lock() {
            for handle in listeners.drain(..) {
                handle.abort();
            }
        }
    }
}
