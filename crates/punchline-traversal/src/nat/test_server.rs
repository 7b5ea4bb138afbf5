//! Loopback STUN server for unit tests.
//!
//! Binds a primary and an alternate port on one IP, and the same two
//! ports on an optional secondary IP, so CHANGE-REQUEST can be honoured
//! the way RFC 3489 servers do. The reported mapping can be rewritten to
//! imitate different NAT allocation behaviours.

use crate::nat::stun::{StunAttribute, StunMessage, StunMessageClass};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;

/// How the server reports the mapped address.
#[derive(Debug, Clone)]
pub(crate) enum Mapping {
    /// Source address as seen
    Echo,
    /// Source port with a fixed external IP
    Ip(IpAddr),
    /// Source IP with the port shifted by a constant
    Offset(u16),
    /// Fixed external IP with ports handed out from a counter
    Sequential(Arc<AtomicU16>, u16),
}

impl Mapping {
    pub(crate) fn sequential(start: u16, step: u16) -> Self {
        Self::Sequential(Arc::new(AtomicU16::new(start)), step)
    }

    fn apply(&self, from: SocketAddr) -> SocketAddr {
        match self {
            Self::Echo => from,
            Self::Ip(ip) => SocketAddr::new(*ip, from.port()),
            Self::Offset(k) => {
                let port = (u32::from(from.port()) + u32::from(*k) - 1) % 65535 + 1;
                SocketAddr::new(from.ip(), port as u16)
            }
            Self::Sequential(next, step) => SocketAddr::new(
                IpAddr::from([203, 0, 113, 77]),
                next.fetch_add(*step, Ordering::SeqCst),
            ),
        }
    }
}

pub(crate) struct TestStunServer {
    primary: SocketAddr,
    changed: SocketAddr,
    tasks: Vec<AbortHandle>,
}

impl TestStunServer {
    pub(crate) async fn spawn(ip: IpAddr, secondary: Option<IpAddr>) -> std::io::Result<Self> {
        Self::spawn_with(ip, secondary, Mapping::Echo, true).await
    }

    /// `honor_change = false` drops every request carrying change flags,
    /// like a NAT that filters the server's alternate address would.
    pub(crate) async fn spawn_with(
        ip: IpAddr,
        secondary: Option<IpAddr>,
        mapping: Mapping,
        honor_change: bool,
    ) -> std::io::Result<Self> {
        let a0 = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let a1 = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let (p0, p1) = (a0.local_addr()?.port(), a1.local_addr()?.port());

        // grid[ip_index][port_index]
        let mut grid = vec![vec![Arc::new(a0), Arc::new(a1)]];
        if let Some(alt) = secondary {
            let b0 = UdpSocket::bind(SocketAddr::new(alt, p0)).await?;
            let b1 = UdpSocket::bind(SocketAddr::new(alt, p1)).await?;
            grid.push(vec![Arc::new(b0), Arc::new(b1)]);
        }
        let grid = Arc::new(grid);
        let alt_ip = if grid.len() > 1 { 1 } else { 0 };
        let changed = SocketAddr::new(secondary.unwrap_or(ip), p1);

        let mut tasks = Vec::new();
        for ip_index in 0..grid.len() {
            for port_index in 0..2 {
                let grid = grid.clone();
                let mapping = mapping.clone();
                let task = tokio::spawn(async move {
                    let socket = grid[ip_index][port_index].clone();
                    let mut buf = [0u8; 1500];
                    loop {
                        let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                            break;
                        };
                        let Ok(request) = StunMessage::decode(&buf[..len]) else {
                            continue;
                        };
                        if request.message_class != StunMessageClass::Request {
                            continue;
                        }

                        let change = request.change_request();
                        if (change.change_ip || change.change_port) && !honor_change {
                            continue;
                        }
                        let reply_ip = if change.change_ip { alt_ip } else { ip_index };
                        let reply_port = if change.change_port {
                            1 - port_index
                        } else {
                            port_index
                        };
                        let reply_socket = &grid[reply_ip][reply_port];

                        let mut response = StunMessage::binding_response(&request);
                        response.add_attribute(StunAttribute::XorMappedAddress(mapping.apply(from)));
                        if let Ok(source) = reply_socket.local_addr() {
                            response.add_attribute(StunAttribute::SourceAddress(source));
                        }
                        response.add_attribute(StunAttribute::ChangedAddress(changed));
                        let _ = reply_socket.send_to(&response.encode(), from).await;
                    }
                });
                tasks.push(task.abort_handle());
            }
        }

        Ok(Self {
            primary: SocketAddr::new(ip, p0),
            changed,
            tasks,
        })
    }

    pub(crate) fn primary(&self) -> SocketAddr {
        self.primary
    }

    pub(crate) fn changed(&self) -> SocketAddr {
        self.changed
    }
}

impl Drop for TestStunServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
