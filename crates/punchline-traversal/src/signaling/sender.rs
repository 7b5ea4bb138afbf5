//! Outbound signaling queue.
//!
//! A single worker drains the queue in order. Each message is offered to
//! the relay channels, open ones first, until `relay_no` of them have
//! accepted it.

use crate::error::{Result, TraversalError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Channels that must accept a message before it counts as sent.
pub const RELAY_NO: usize = 2;

/// A text-only message relay to other nodes.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Whether a connection to the relay is already up.
    fn is_open(&self) -> bool;

    /// Deliver `text` to the node `dest_node_id`.
    async fn send(&self, dest_node_id: &str, text: &str) -> Result<()>;
}

/// Reference-counted relay channel
pub type RelayRef = Arc<dyn RelayChannel>;

/// Order to try channels for message number `counter`: rotated by
/// `(counter + m - 1) % m` then stably moved so open channels come first.
#[must_use]
pub fn channel_order(channels: &[RelayRef], counter: usize) -> Vec<usize> {
    let m = channels.len();
    if m == 0 {
        return Vec::new();
    }
    let offset = (counter + m - 1) % m;
    let mut order: Vec<usize> = (0..m).map(|i| (offset + i) % m).collect();
    order.sort_by_key(|&i| !channels[i].is_open());
    order
}

struct Outbound {
    dest_node_id: String,
    text: String,
    done: oneshot::Sender<Result<usize>>,
}

async fn deliver(channels: &[RelayRef], order: &[usize], relay_no: usize, msg: &Outbound) -> usize {
    let mut accepted = 0;
    for &i in order {
        if accepted >= relay_no {
            break;
        }
        let channel = &channels[i];
        match channel.send(&msg.dest_node_id, &msg.text).await {
            Ok(()) => {
                accepted += 1;
                trace!("Signal to {} accepted by {}", msg.dest_node_id, channel.name());
            }
            Err(e) => debug!("Relay {} refused signal: {}", channel.name(), e),
        }
    }
    accepted
}

async fn send_worker(channels: Vec<RelayRef>, relay_no: usize, mut rx: mpsc::UnboundedReceiver<Option<Outbound>>) {
    let mut counter = 0usize;
    while let Some(Some(msg)) = rx.recv().await {
        let order = channel_order(&channels, counter);
        counter = counter.wrapping_add(1);
        let accepted = deliver(&channels, &order, relay_no, &msg).await;
        let result = if accepted == 0 {
            warn!("No relay accepted signal for {}", msg.dest_node_id);
            Err(TraversalError::Protocol("no relay channel accepted the signal".into()))
        } else {
            Ok(accepted)
        };
        let _ = msg.done.send(result);
    }
    debug!("Signal sender stopped");
}

/// Handle to the outbound queue
pub struct SignalSender {
    queue: mpsc::UnboundedSender<Option<Outbound>>,
    worker: AbortHandle,
}

impl SignalSender {
    /// Start the worker over `channels`. Must run inside a tokio runtime.
    #[must_use]
    pub fn spawn(channels: Vec<RelayRef>, relay_no: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(send_worker(channels, relay_no.max(1), rx)).abort_handle();
        Self { queue, worker }
    }

    /// Queue `text` for `dest_node_id` and wait until it has been offered
    /// to the relays. Returns how many accepted it.
    ///
    /// # Errors
    ///
    /// `Protocol` if no channel accepted or the sender has stopped.
    pub async fn send(&self, dest_node_id: &str, text: String) -> Result<usize> {
        let (done, rx) = oneshot::channel();
        self.queue
            .send(Some(Outbound {
                dest_node_id: dest_node_id.to_string(),
                text,
                done,
            }))
            .map_err(|_| TraversalError::Protocol("signal sender stopped".into()))?;
        rx.await
            .map_err(|_| TraversalError::Protocol("signal sender stopped".into()))?
    }

    /// Push the stop sentinel; queued messages ahead of it still go out.
    pub fn stop(&self) {
        let _ = self.queue.send(None);
    }

    /// Stop immediately.
    pub fn abort(&self) {
        self.stop();
        self.worker.abort();
    }
}

impl Drop for SignalSender {
    fn drop(&mut self) {
        self.abort();
    }
}
