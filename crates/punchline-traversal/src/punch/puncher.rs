//! TCP puncher: session table, mapping exchange and the punch queue.
//!
//! One side calls [`TcpPuncher::initiate`] and ships the returned offer to
//! the peer, which answers through [`TcpPuncher::receive_offer`]. The
//! reply goes back into [`TcpPuncher::receive_reply`]. Both sides then
//! call [`TcpPuncher::punch`], which queues the session for a pool slot,
//! sleeps until the agreed time and runs the connect burst.

use super::burst::{BurstConfig, punch_burst};
use super::pool::{PunchPool, default_max_punchers};
use super::session::{PunchOffer, PunchOutcome, PunchRole, PunchSession, PunchState};
use crate::clock::SyncClock;
use crate::error::{Result, TraversalError};
use crate::nat::types::NatInfo;
use crate::predict::{MAX_PREDICT_NO, MappingProbe, NatMapping, PortPredictor, PunchMode};
use crate::transport::{PipeRef, TcpPipe};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Punch timing and limits
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Overall bound on one punch, queueing included
    pub punch_timeout: Duration,
    /// How far ahead of now the initiator schedules the burst
    pub meet_step: Duration,
    /// Unfinished sessions older than this are swept
    pub stale_after: Duration,
    /// Concurrent punch slots
    pub max_punchers: usize,
    /// Mappings to predict when the peer has not sent any
    pub test_no: usize,
    /// Burst timing
    pub burst: BurstConfig,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            punch_timeout: Duration::from_secs(20),
            meet_step: Duration::from_secs(3),
            stale_after: Duration::from_secs(300),
            max_punchers: default_max_punchers(),
            test_no: 8,
            burst: BurstConfig::default(),
        }
    }
}

/// Who is punching whom, and through what.
#[derive(Debug, Clone)]
pub struct PunchTarget {
    /// Connection attempt id
    pub pipe_id: String,
    /// Our IP for the burst
    pub local_ip: IpAddr,
    /// Peer IP for the burst
    pub peer_ip: IpAddr,
    /// Our NAT on `local_ip`'s interface
    pub ours: NatInfo,
    /// The peer's NAT
    pub theirs: NatInfo,
    /// How the peers reach each other
    pub mode: PunchMode,
}

/// Pick the punch mode for a peer.
#[must_use]
pub fn select_mode(same_machine: bool, same_wan: bool) -> PunchMode {
    if same_machine {
        PunchMode::SelfPunch
    } else if same_wan {
        PunchMode::Lan
    } else {
        PunchMode::Remote
    }
}

struct Entry {
    session: PunchSession,
    ready: Arc<Notify>,
}

impl Entry {
    fn ready(&self) -> bool {
        match self.session.state() {
            PunchState::MappingsUpdated => true,
            PunchState::MappingsReceived => !self.session.local_mappings().is_empty(),
            _ => false,
        }
    }
}

struct PunchJob {
    pipe_id: String,
    done: oneshot::Sender<Result<PipeRef>>,
}

struct Inner {
    config: PunchConfig,
    clock: SyncClock,
    prober: Option<Arc<dyn MappingProbe>>,
    sessions: Mutex<HashMap<String, Entry>>,
    predictors: Mutex<HashMap<(IpAddr, PunchMode), (NatInfo, PortPredictor)>>,
    pool: PunchPool,
}

impl Inner {
    async fn predict(
        &self,
        target: &PunchTarget,
        their_maps: Option<&[NatMapping]>,
    ) -> Result<Vec<NatMapping>> {
        let mut predictors = self.predictors.lock().await;
        let key = (target.local_ip, target.mode);
        let stale = predictors.get(&key).is_none_or(|(nat, _)| *nat != target.ours);
        if stale {
            let mut predictor = PortPredictor::new(target.ours, target.mode);
            if let Some(prober) = &self.prober {
                predictor = predictor.with_prober(Arc::clone(prober));
            }
            predictors.insert(key, (target.ours, predictor));
        }
        let (_, predictor) = predictors
            .get_mut(&key)
            .ok_or_else(|| TraversalError::Protocol("predictor missing".into()))?;
        predictor
            .predict_mappings(&target.theirs, their_maps, self.config.test_no)
            .await
    }

    async fn run(&self, pipe_id: &str) -> Result<PipeRef> {
        let ready = {
            let sessions = self.sessions.lock().await;
            let entry = sessions.get(pipe_id).ok_or_else(|| unknown(pipe_id))?;
            Arc::clone(&entry.ready)
        };
        loop {
            {
                let sessions = self.sessions.lock().await;
                let entry = sessions.get(pipe_id).ok_or_else(|| unknown(pipe_id))?;
                if entry.ready() {
                    break;
                }
            }
            ready.notified().await;
        }

        let (start, local_ip, peer_ip, pairs) = {
            let mut sessions = self.sessions.lock().await;
            let entry = sessions.get_mut(pipe_id).ok_or_else(|| unknown(pipe_id))?;
            let start = entry.session.start_punching()?;
            (
                start,
                entry.session.local_ip(),
                entry.session.peer_ip(),
                entry.session.connect_pairs(MAX_PREDICT_NO),
            )
        };

        let wait = start - self.clock.now();
        if wait > 0.0 {
            debug!("Punch {} waiting {:.3}s for meeting time", pipe_id, wait);
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }

        let result = match punch_burst(local_ip, peer_ip, &pairs, &self.config.burst).await {
            Ok(stream) => TcpPipe::from_stream(stream).map(|p| Arc::new(p) as PipeRef),
            Err(e) => Err(e),
        };
        let outcome = if result.is_ok() {
            PunchOutcome::Success
        } else {
            PunchOutcome::Fail
        };
        if let Some(mut entry) = self.sessions.lock().await.remove(pipe_id) {
            entry.session.finish(outcome);
        }
        match &result {
            Ok(_) => info!("Punch {} succeeded to {}", pipe_id, peer_ip),
            Err(e) => debug!("Punch {} failed: {}", pipe_id, e),
        }
        result
    }
}

fn unknown(pipe_id: &str) -> TraversalError {
    TraversalError::Protocol(format!("no punch session {pipe_id}"))
}

async fn queue_worker(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Option<PunchJob>>) {
    while let Some(Some(job)) = rx.recv().await {
        let PunchJob { pipe_id, mut done } = job;
        let slot = match inner.pool.acquire().await {
            Ok(slot) => slot,
            Err(e) => {
                let _ = done.send(Err(e));
                break;
            }
        };
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _slot = slot;
            let limit = inner.config.punch_timeout;
            let result = tokio::select! {
                r = tokio::time::timeout(limit, inner.run(&pipe_id)) => {
                    Some(r.unwrap_or(Err(TraversalError::Timeout("punch"))))
                }
                () = done.closed() => None,
            };
            match result {
                Some(result) => {
                    let _ = done.send(result);
                }
                None => debug!("Punch {} abandoned by caller", pipe_id),
            }
        });
    }
    debug!("Punch queue worker stopped");
}

/// Runs punch sessions for one node.
pub struct TcpPuncher {
    inner: Arc<Inner>,
    queue: mpsc::UnboundedSender<Option<PunchJob>>,
    worker: AbortHandle,
}

impl TcpPuncher {
    /// Start a puncher. Spawns the queue worker, so it must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn new(config: PunchConfig, clock: SyncClock, prober: Option<Arc<dyn MappingProbe>>) -> Self {
        let pool = PunchPool::new(config.max_punchers);
        let inner = Arc::new(Inner {
            config,
            clock,
            prober,
            sessions: Mutex::new(HashMap::new()),
            predictors: Mutex::new(HashMap::new()),
            pool,
        });
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(queue_worker(Arc::clone(&inner), rx)).abort_handle();
        Self {
            inner,
            queue,
            worker,
        }
    }

    /// Config in use
    #[must_use]
    pub fn config(&self) -> &PunchConfig {
        &self.inner.config
    }

    /// Slot pool, for backpressure readers
    #[must_use]
    pub fn pool(&self) -> &PunchPool {
        &self.inner.pool
    }

    /// Synchronized clock
    #[must_use]
    pub fn clock(&self) -> &SyncClock {
        &self.inner.clock
    }

    async fn insert(&self, entry: Entry) -> Result<()> {
        let mut sessions = self.inner.sessions.lock().await;
        let pipe_id = entry.session.pipe_id().to_string();
        if sessions.contains_key(&pipe_id) {
            return Err(TraversalError::Protocol(format!(
                "punch session {pipe_id} already exists"
            )));
        }
        sessions.insert(pipe_id, entry);
        Ok(())
    }

    /// Start a session as initiator. Returns the offer for the peer.
    ///
    /// # Errors
    ///
    /// `Unpredictable` if the NAT pair cannot be punched; `Protocol` if
    /// the pipe id is already in use.
    pub async fn initiate(&self, target: &PunchTarget) -> Result<PunchOffer> {
        let mappings = self.inner.predict(target, None).await?;
        let start = self.inner.clock.now() + self.inner.config.meet_step.as_secs_f64();
        let mut session = PunchSession::new(
            target.pipe_id.clone(),
            PunchRole::Initiator,
            target.mode,
            target.local_ip,
            target.peer_ip,
        );
        session.mappings_sent(mappings.clone(), start)?;
        self.insert(Entry {
            session,
            ready: Arc::new(Notify::new()),
        })
        .await?;
        debug!(
            "Punch {} initiated: {} mappings, meet at {:.3}",
            target.pipe_id,
            mappings.len(),
            start
        );
        Ok(PunchOffer { ntp: start, mappings })
    }

    /// Accept a peer's offer as recipient. Returns our reply.
    ///
    /// # Errors
    ///
    /// As for [`TcpPuncher::initiate`].
    pub async fn receive_offer(&self, target: &PunchTarget, offer: &PunchOffer) -> Result<PunchOffer> {
        let mut session = PunchSession::new(
            target.pipe_id.clone(),
            PunchRole::Recipient,
            target.mode,
            target.local_ip,
            target.peer_ip,
        );
        session.mappings_received(offer)?;
        let mappings = self.inner.predict(target, Some(&offer.mappings)).await?;
        session.set_local_mappings(mappings.clone())?;
        self.insert(Entry {
            session,
            ready: Arc::new(Notify::new()),
        })
        .await?;
        debug!(
            "Punch {} accepted: {} mappings",
            target.pipe_id,
            mappings.len()
        );
        Ok(PunchOffer {
            ntp: offer.ntp,
            mappings,
        })
    }

    /// Feed the recipient's reply to our initiator session.
    ///
    /// # Errors
    ///
    /// `Protocol` for an unknown pipe id or a reply out of turn.
    pub async fn receive_reply(&self, pipe_id: &str, reply: &PunchOffer) -> Result<()> {
        let mut sessions = self.inner.sessions.lock().await;
        let entry = sessions.get_mut(pipe_id).ok_or_else(|| unknown(pipe_id))?;
        entry.session.mappings_updated(reply)?;
        entry.ready.notify_one();
        Ok(())
    }

    /// Queue the session for punching and wait for the result.
    ///
    /// The session is released whatever happens.
    ///
    /// # Errors
    ///
    /// `Timeout` after `punch_timeout`; burst or socket errors otherwise.
    pub async fn punch(&self, pipe_id: &str) -> Result<PipeRef> {
        let (done, rx) = oneshot::channel();
        self.queue
            .send(Some(PunchJob {
                pipe_id: pipe_id.to_string(),
                done,
            }))
            .map_err(|_| TraversalError::Protocol("puncher shut down".into()))?;

        let result = match tokio::time::timeout(self.inner.config.punch_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TraversalError::Protocol("punch worker gone".into())),
            Err(_) => Err(TraversalError::Timeout("punch")),
        };
        if result.is_err() {
            self.cleanup(pipe_id).await;
        }
        result
    }

    /// Fail and drop a session.
    pub async fn cleanup(&self, pipe_id: &str) {
        if let Some(mut entry) = self.inner.sessions.lock().await.remove(pipe_id) {
            entry.session.finish(PunchOutcome::Fail);
            entry.ready.notify_one();
            debug!("Punch {} cleaned up", pipe_id);
        }
    }

    /// Drop sessions that have not finished within `stale_after`.
    /// Returns how many were removed.
    pub async fn cleanup_stale(&self) -> usize {
        let limit = self.inner.config.stale_after;
        let mut sessions = self.inner.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|pipe_id, entry| {
            let keep = entry.session.age() < limit;
            if !keep {
                warn!("Punch {} stale in {:?}", pipe_id, entry.session.state());
                entry.session.finish(PunchOutcome::Fail);
                entry.ready.notify_one();
            }
            keep
        });
        before - sessions.len()
    }

    /// State of a live session
    pub async fn state(&self, pipe_id: &str) -> Option<PunchState> {
        self.inner
            .sessions
            .lock()
            .await
            .get(pipe_id)
            .map(|e| e.session.state())
    }

    /// Live session count
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.lock().await.len()
    }

    /// Stop the queue worker and refuse new punches.
    pub fn shutdown(&self) {
        let _ = self.queue.send(None);
        self.inner.pool.close();
        self.worker.abort();
    }
}

impl Drop for TcpPuncher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
