//! Pipe, resolver and binder abstractions.
//!
//! Every component above this module talks to the network through
//! [`Pipe`], [`Resolver`] and [`Binder`] so tests can substitute scripted
//! doubles. The tokio implementations here are intentionally thin: they
//! bind, connect and move bytes, nothing more.

use crate::error::{Result, TraversalError};
use async_trait::async_trait;
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::Mutex;

/// Largest datagram or stream chunk read in one `recv`.
pub const RECV_BUF_SIZE: usize = 65_536;

/// Address family of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AddrFamily {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

impl AddrFamily {
    /// Family of `ip`.
    #[must_use]
    pub fn of(ip: IpAddr) -> Self {
        if ip.is_ipv4() { Self::V4 } else { Self::V6 }
    }

    /// Wildcard address of this family.
    #[must_use]
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Transport protocol for [`Binder::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Stream
    Tcp,
    /// Datagram
    Udp,
}

/// A local address chosen for an outbound or listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundRoute {
    /// Local address, port 0 for any
    pub local: SocketAddr,
}

impl BoundRoute {
    /// Route on `ip`, any port.
    #[must_use]
    pub fn new(ip: IpAddr) -> Self {
        Self {
            local: SocketAddr::new(ip, 0),
        }
    }

    /// Same route pinned to `port`.
    #[must_use]
    pub fn with_port(self, port: u16) -> Self {
        Self {
            local: SocketAddr::new(self.local.ip(), port),
        }
    }
}

/// A bidirectional byte pipe (TCP stream or UDP socket).
#[async_trait]
pub trait Pipe: Send + Sync {
    /// Send `buf`. Datagram pipes need `dest` unless connected.
    async fn send(&self, buf: &[u8], dest: Option<SocketAddr>) -> Result<usize>;

    /// Receive one chunk, or `None` if nothing arrived within `timeout`.
    async fn recv(&self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>>;

    /// Close the pipe. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Whether [`Pipe::close`] has run or the peer hung up.
    fn is_closed(&self) -> bool;

    /// Local socket address.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Remote address for connected pipes.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Time since the last send or receive.
    fn idle_for(&self) -> Duration;
}

/// Shared handle to a pipe.
pub type PipeRef = Arc<dyn Pipe>;

/// Name resolution collaborator.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve `host:port` to one address of family `af`.
    async fn resolve(&self, host: &str, port: u16, af: AddrFamily) -> Result<SocketAddr>;
}

/// Socket binding collaborator.
#[async_trait]
pub trait Binder: Send + Sync {
    /// Pick a local route on `ip` (the interface's NIC address).
    async fn bind(&self, ip: IpAddr, port: u16) -> Result<BoundRoute>;

    /// Open a pipe over `route`. TCP requires `dest`.
    async fn open(
        &self,
        protocol: Protocol,
        route: BoundRoute,
        dest: Option<SocketAddr>,
    ) -> Result<PipeRef>;
}

/// Tracks last activity as milliseconds since creation.
#[derive(Debug)]
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

/// Bind a UDP socket through socket2 and hand it to tokio.
///
/// # Errors
///
/// `Bind` if the socket cannot be created or bound.
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    let bind_err = |e: std::io::Error| TraversalError::Bind(format!("{addr}: {e}"));
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::DGRAM,
        Some(SockProtocol::UDP),
    )
    .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}

/// TCP socket bound to `local` with address and port reuse, so the same
/// local port can listen and dial out at once.
///
/// # Errors
///
/// `Bind` if the socket cannot be created or bound.
pub fn bound_tcp_socket(local: SocketAddr) -> Result<TcpSocket> {
    let bind_err = |e: std::io::Error| TraversalError::Bind(format!("{local}: {e}"));
    let socket = Socket::new(
        Domain::for_address(local),
        Type::STREAM,
        Some(SockProtocol::TCP),
    )
    .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.bind(&local.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    let std_stream: std::net::TcpStream = socket.into();
    Ok(TcpSocket::from_std_stream(std_stream))
}

/// Datagram pipe over a tokio `UdpSocket`.
pub struct UdpPipe {
    socket: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    closed: AtomicBool,
    activity: Activity,
}

impl UdpPipe {
    /// Bind a new datagram pipe on `local`.
    ///
    /// # Errors
    ///
    /// `Bind` if binding fails.
    pub fn bind(local: SocketAddr) -> Result<Self> {
        Ok(Self::from_socket(bind_udp(local)?, None))
    }

    /// Wrap an already bound socket; `peer` is the default destination.
    #[must_use]
    pub fn from_socket(socket: UdpSocket, peer: Option<SocketAddr>) -> Self {
        Self {
            socket: Arc::new(socket),
            peer,
            closed: AtomicBool::new(false),
            activity: Activity::new(),
        }
    }
}

#[async_trait]
impl Pipe for UdpPipe {
    async fn send(&self, buf: &[u8], dest: Option<SocketAddr>) -> Result<usize> {
        if self.is_closed() {
            return Err(TraversalError::Io(std::io::ErrorKind::NotConnected.into()));
        }
        let dest = dest
            .or(self.peer)
            .ok_or_else(|| TraversalError::Protocol("datagram send without destination".into()))?;
        let sent = self.socket.send_to(buf, dest).await?;
        self.activity.touch();
        Ok(sent)
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        match tokio::time::timeout(timeout, self.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                self.activity.touch();
                buf.truncate(len);
                Ok(Some((buf, from)))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }
}

/// Stream pipe over a connected `TcpStream`.
pub struct TcpPipe {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    local: SocketAddr,
    peer: SocketAddr,
    closed: AtomicBool,
    activity: Activity,
}

impl TcpPipe {
    /// Wrap a connected stream.
    ///
    /// # Errors
    ///
    /// Fails if the stream has no local or peer address.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            local,
            peer,
            closed: AtomicBool::new(false),
            activity: Activity::new(),
        })
    }

    /// Dial `dest` from `route`.
    ///
    /// # Errors
    ///
    /// `Bind` or `Io` on failure.
    pub async fn connect(route: BoundRoute, dest: SocketAddr) -> Result<Self> {
        let socket = bound_tcp_socket(route.local)?;
        let stream = socket.connect(dest).await?;
        Self::from_stream(stream)
    }
}

#[async_trait]
impl Pipe for TcpPipe {
    async fn send(&self, buf: &[u8], _dest: Option<SocketAddr>) -> Result<usize> {
        if self.is_closed() {
            return Err(TraversalError::Io(std::io::ErrorKind::NotConnected.into()));
        }
        self.writer.lock().await.write_all(buf).await?;
        self.activity.touch();
        Ok(buf.len())
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let mut reader = self.reader.lock().await;
        match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.closed.store(true, Ordering::Relaxed);
                Err(TraversalError::Io(std::io::ErrorKind::UnexpectedEof.into()))
            }
            Ok(Ok(len)) => {
                self.activity.touch();
                buf.truncate(len);
                Ok(Some((buf, self.peer)))
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::Relaxed) {
            // Peer may already be gone.
            let _ = self.writer.lock().await.shutdown().await;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }
}

/// Resolver backed by `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioResolver;

#[async_trait]
impl Resolver for TokioResolver {
    async fn resolve(&self, host: &str, port: u16, af: AddrFamily) -> Result<SocketAddr> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| TraversalError::Resolution(format!("{host}: {e}")))?;
        addrs
            .into_iter()
            .find(|a| AddrFamily::of(a.ip()) == af)
            .ok_or_else(|| TraversalError::Resolution(format!("{host}: no {af:?} address")))
    }
}

/// Binder that opens real sockets on the requested local address.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioBinder;

#[async_trait]
impl Binder for TokioBinder {
    async fn bind(&self, ip: IpAddr, port: u16) -> Result<BoundRoute> {
        Ok(BoundRoute::new(ip).with_port(port))
    }

    async fn open(
        &self,
        protocol: Protocol,
        route: BoundRoute,
        dest: Option<SocketAddr>,
    ) -> Result<PipeRef> {
        match protocol {
            Protocol::Udp => {
                let socket = bind_udp(route.local)?;
                Ok(Arc::new(UdpPipe::from_socket(socket, dest)))
            }
            Protocol::Tcp => {
                let dest = dest
                    .ok_or_else(|| TraversalError::Protocol("tcp open without destination".into()))?;
                Ok(Arc::new(TcpPipe::connect(route, dest).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_udp_pipe_exchange() {
        let a = UdpPipe::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b = UdpPipe::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(b"ping", Some(b_addr)).await.unwrap();
        let (data, from) = b.recv(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(data, b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_recv_timeout_is_none() {
        let a = UdpPipe::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(a.recv(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_udp_send_requires_dest() {
        let a = UdpPipe::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert!(matches!(
            a.send(b"x", None).await,
            Err(TraversalError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_pipe_roundtrip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let client = TokioBinder
            .open(
                Protocol::Tcp,
                BoundRoute::new("127.0.0.1".parse().unwrap()),
                Some(addr),
            )
            .await
            .unwrap();
        let server = TcpPipe::from_stream(accept.await.unwrap()).unwrap();

        client.send(b"hello", None).await.unwrap();
        let (data, _) = server.recv(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(data, b"hello");

        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(server.recv(Duration::from_secs(2)).await.is_err());
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn test_reuse_port_allows_listen_and_dial() {
        let shared = bound_tcp_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = shared.local_addr().unwrap();
        let _listener = shared.listen(16).unwrap();

        // A second socket on the same port binds thanks to reuse.
        assert!(bound_tcp_socket(local).is_ok());
    }

    #[tokio::test]
    async fn test_resolver_localhost() {
        let addr = TokioResolver
            .resolve("127.0.0.1", 3478, AddrFamily::V4)
            .await
            .unwrap();
        assert_eq!(addr, "127.0.0.1:3478".parse().unwrap());
        assert!(
            TokioResolver
                .resolve("127.0.0.1", 3478, AddrFamily::V6)
                .await
                .is_err()
        );
    }

    #[test]
    fn test_activity_idle() {
        let a = Activity::new();
        a.touch();
        assert!(a.idle_for() < Duration::from_secs(1));
    }
}
