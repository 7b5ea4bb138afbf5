//! Synchronized TCP connect burst.
//!
//! Every local port in the plan gets a listener and one or more outbound
//! connects, all bound with address and port reuse so they can share the
//! port. Whichever side's SYN gets through first, the other side sees the
//! connection either through its own connect (simultaneous open) or on
//! its listener.

use crate::error::{Result, TraversalError};
use crate::transport::bound_tcp_socket;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::{debug, trace};

/// Burst timing
#[derive(Debug, Clone)]
pub struct BurstConfig {
    /// Delay between successive connects
    pub spacing: Duration,
    /// Bound on one connect attempt, retries included
    pub connect_timeout: Duration,
    /// How long to keep collecting holes after the first one
    pub settle: Duration,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            spacing: Duration::from_millis(5),
            connect_timeout: Duration::from_secs(2),
            settle: Duration::from_millis(100),
        }
    }
}

/// Hash identifying a connection the same way from both ends.
///
/// The endpoint with the higher IP (then port) goes first, so both peers
/// hash the same bytes.
#[must_use]
pub fn hole_hash(local: SocketAddr, peer: SocketAddr) -> [u8; 32] {
    let (hi, lo) = if (peer.ip(), peer.port()) > (local.ip(), local.port()) {
        (peer, local)
    } else {
        (local, peer)
    };
    let mut hasher = blake3::Hasher::new();
    for addr in [hi, lo] {
        match addr.ip() {
            IpAddr::V4(ip) => hasher.update(&ip.octets()),
            IpAddr::V6(ip) => hasher.update(&ip.octets()),
        };
    }
    hasher.update(&hi.port().to_be_bytes());
    hasher.update(&lo.port().to_be_bytes());
    *hasher.finalize().as_bytes()
}

/// Of several open connections keep the one with the highest hole hash.
/// The rest are dropped, which closes them.
#[must_use]
pub fn select_hole(mut holes: Vec<TcpStream>) -> Option<TcpStream> {
    let key = |s: &TcpStream| match (s.local_addr(), s.peer_addr()) {
        (Ok(l), Ok(p)) => hole_hash(l, p),
        _ => [0u8; 32],
    };
    holes.sort_by_cached_key(key);
    let chosen = holes.pop();
    if !holes.is_empty() {
        debug!("Closing {} surplus holes", holes.len());
    }
    chosen
}

async fn connect_with_retry(local: SocketAddr, dest: SocketAddr, limit: Duration) -> Result<TcpStream> {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TraversalError::Timeout("punch connect"));
        }
        let socket = bound_tcp_socket(local)?;
        match tokio::time::timeout(remaining, socket.connect(dest)).await {
            Ok(Ok(stream)) => return Ok(stream),
            // Nothing listening yet on a path without a NAT; try again.
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                tokio::time::sleep(Duration::from_millis(20).min(remaining)).await;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(TraversalError::Timeout("punch connect")),
        }
    }
}

async fn accept_from(local: SocketAddr, peer_ip: IpAddr, limit: Duration) -> Result<TcpStream> {
    let listener = bound_tcp_socket(local)?.listen(16)?;
    let deadline = Instant::now() + limit;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (stream, from) = tokio::time::timeout(remaining, listener.accept())
            .await
            .map_err(|_| TraversalError::Timeout("punch accept"))??;
        if from.ip() == peer_ip {
            return Ok(stream);
        }
        trace!("Ignoring punch connection from {}", from);
    }
}

/// Run the burst for `pairs` of `(local port, peer port)`.
///
/// Listeners stay up for the whole burst. Returns the selected hole.
///
/// # Errors
///
/// `Timeout` if no connection was made.
pub async fn punch_burst(
    local_ip: IpAddr,
    peer_ip: IpAddr,
    pairs: &[(u16, u16)],
    config: &BurstConfig,
) -> Result<TcpStream> {
    if pairs.is_empty() {
        return Err(TraversalError::Protocol("empty punch plan".into()));
    }
    let listen_for = config.spacing * pairs.len() as u32 + config.connect_timeout;

    let mut set = JoinSet::new();
    let local_ports: BTreeSet<u16> = pairs.iter().map(|(l, _)| *l).collect();
    for port in local_ports {
        let local = SocketAddr::new(local_ip, port);
        set.spawn(accept_from(local, peer_ip, listen_for));
    }
    for (i, (local_port, peer_port)) in pairs.iter().enumerate() {
        let local = SocketAddr::new(local_ip, *local_port);
        let dest = SocketAddr::new(peer_ip, *peer_port);
        let delay = config.spacing * i as u32;
        let limit = config.connect_timeout;
        set.spawn(async move {
            tokio::time::sleep(delay).await;
            connect_with_retry(local, dest, limit).await
        });
    }
    debug!(
        "Punch burst: {} connects to {} from {}",
        pairs.len(),
        peer_ip,
        local_ip
    );

    let mut holes = Vec::new();
    let mut settle_until: Option<Instant> = None;
    loop {
        let next = match settle_until {
            Some(until) => {
                let left = until.saturating_duration_since(Instant::now());
                match tokio::time::timeout(left, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => break,
                }
            }
            None => set.join_next().await,
        };
        let Some(joined) = next else {
            break;
        };
        match joined {
            Ok(Ok(stream)) => {
                let duplicate = holes.iter().any(|h: &TcpStream| {
                    h.local_addr().ok() == stream.local_addr().ok()
                        && h.peer_addr().ok() == stream.peer_addr().ok()
                });
                if !duplicate {
                    holes.push(stream);
                }
                settle_until.get_or_insert_with(|| Instant::now() + config.settle);
            }
            Ok(Err(e)) => trace!("Punch attempt failed: {}", e),
            Err(e) => trace!("Punch task ended: {}", e),
        }
    }
    drop(set);

    let hole = select_hole(holes).ok_or(TraversalError::Timeout("punch burst"))?;
    if let (Ok(l), Ok(p)) = (hole.local_addr(), hole.peer_addr()) {
        debug!("Punched {} <-> {}", l, p);
    }
    Ok(hole)
}
