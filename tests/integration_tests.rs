//! End-to-end tests for punchline
//!
//! Two nodes on distinct loopback addresses talk through an in-memory
//! relay hub, exercising:
//! - Acknowledged delivery over a lossy pipe
//! - Direct, reverse, punched and relayed connections
//! - Strategy failover and per-attempt cleanup
//! - Address refresh over signaling

use punchline_integration_tests::{LoopbackRelay, RecordingStrategy, RelayHub, ScriptedPipe, TestNode};
use punchline_traversal::nat::{Delta, DeltaType, NatInfo, NatType};
use punchline_traversal::reliable::Frame;
use punchline_traversal::strategy::StrategyHandler;
use punchline_traversal::{
    AddrType, OrchestratorConfig, PipeRef, PortPredictor, PunchMode, ReliableConfig, ReliableSocket,
    StrategyKind, TraversalError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const A: &str = "127.0.0.1";
const B: &str = "127.0.0.2";

fn port_restricted_equal() -> NatInfo {
    NatInfo::new(NatType::RestrictPortNAT, Delta::of(DeltaType::Equal))
}

async fn expect_message(incoming: PipeRef, want: &[u8]) {
    let (data, _) = incoming
        .recv(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("message should arrive");
    assert_eq!(data, want);
}

#[tokio::test]
async fn test_reliable_send_acked_on_third_try() {
    let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
    let peer: SocketAddr = "127.0.0.1:6000".parse().unwrap();

    // Lose the first two frames; acknowledge the third.
    let pipe = ScriptedPipe::new(
        local,
        peer,
        Box::new(|n, bytes| {
            let frame = Frame::decode(bytes).ok()?;
            (n == 3).then(|| Frame::ack(frame.seq).encode())
        }),
    );
    let config = ReliableConfig::new()
        .with_window(Duration::from_millis(100))
        .with_tries(3);
    let socket = ReliableSocket::new(pipe.clone(), config);

    socket.send(b"hello", peer).await.unwrap();

    let sent = pipe.sent();
    assert_eq!(sent.len(), 3);
    // Every retransmission carries the same sequence id.
    let seqs: Vec<u64> = sent.iter().map(|b| Frame::decode(b).unwrap().seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(Frame::decode(&sent[0]).unwrap().payload, b"hello");
    assert_eq!(socket.pending_len().await, 0);
}

#[tokio::test]
async fn test_reliable_send_times_out_without_ack() {
    let local: SocketAddr = "127.0.0.1:5001".parse().unwrap();
    let peer: SocketAddr = "127.0.0.1:6001".parse().unwrap();
    let pipe = ScriptedPipe::new(local, peer, Box::new(|_, _| None));
    let config = ReliableConfig::new()
        .with_window(Duration::from_millis(50))
        .with_tries(3);
    let socket = ReliableSocket::new(pipe.clone(), config);

    let result = socket.send(b"lost", peer).await;
    assert!(matches!(result, Err(TraversalError::Timeout(_))));
    assert_eq!(pipe.sent().len(), 3);
    assert_eq!(socket.pending_len().await, 0);
}

#[tokio::test]
async fn test_open_peers_connect_directly() {
    let hub = RelayHub::new();
    let a = TestNode::start(&hub, A, NatInfo::open(), |b| b).await;
    let b = TestNode::start(&hub, B, NatInfo::open(), |b| b).await;

    let pipe = a.orchestrator.connect_default(&b.address).await.unwrap();
    assert_eq!(pipe.peer_addr().unwrap(), b.address.interfaces[0].listen_addr(AddrType::External));

    // Direct needs no signaling and no punch session.
    assert_eq!(hub.sent(), 0);
    assert_eq!(a.orchestrator.puncher().session_count().await, 0);

    let incoming = tokio::time::timeout(Duration::from_secs(5), b.orchestrator.accept())
        .await
        .unwrap()
        .unwrap();
    pipe.send(b"ping", None).await.unwrap();
    expect_message(incoming.pipe.clone(), b"ping").await;

    incoming.pipe.send(b"pong", None).await.unwrap();
    expect_message(pipe, b"pong").await;
}

#[tokio::test]
async fn test_reverse_connection_dials_back() {
    let hub = RelayHub::new();
    let a = TestNode::start(&hub, A, NatInfo::open(), |b| b).await;
    let b = TestNode::start(&hub, B, NatInfo::open(), |b| b).await;

    let pipe = a
        .orchestrator
        .connect(&b.address, &[StrategyKind::Reverse])
        .await
        .unwrap();
    assert!(hub.sent() >= 1);

    // B dialed A, so A's pipe has B as its peer and B holds the outbound end.
    assert_eq!(pipe.peer_addr().unwrap().ip().to_string(), B);
    let incoming = tokio::time::timeout(Duration::from_secs(5), b.orchestrator.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(incoming.pipe.peer_addr().unwrap(), pipe.local_addr().unwrap());

    incoming.pipe.send(b"dialed back", None).await.unwrap();
    expect_message(pipe, b"dialed back").await;
}

#[tokio::test]
async fn test_port_restricted_equal_peers_punch() {
    let hub = RelayHub::new();
    let a = TestNode::start(&hub, A, port_restricted_equal(), |b| b).await;
    let b = TestNode::start(&hub, B, port_restricted_equal(), |b| b).await;

    let pipe = a
        .orchestrator
        .connect(&b.address, &[StrategyKind::Punch])
        .await
        .unwrap();
    let incoming = tokio::time::timeout(Duration::from_secs(5), b.orchestrator.accept())
        .await
        .unwrap()
        .unwrap();

    // Both ends hold the same TCP connection.
    assert_eq!(incoming.pipe.peer_addr().unwrap(), pipe.local_addr().unwrap());
    pipe.send(b"through the hole", None).await.unwrap();
    expect_message(incoming.pipe, b"through the hole").await;

    assert_eq!(a.orchestrator.puncher().session_count().await, 0);
    assert_eq!(b.orchestrator.puncher().session_count().await, 0);
}

#[tokio::test]
async fn test_equal_delta_predicts_identity_mappings() {
    let mut predictor = PortPredictor::new(port_restricted_equal(), PunchMode::Remote);
    let mappings = predictor
        .predict_mappings(&port_restricted_equal(), None, 3)
        .await
        .unwrap();

    assert!(!mappings.is_empty());
    for mapping in mappings {
        assert_eq!(mapping.local, mapping.remote);
        assert!(mapping.local > 1024);
    }
}

#[tokio::test]
async fn test_all_strategies_fail_with_one_cleanup_each() {
    let hub = RelayHub::new();
    let mut config = OrchestratorConfig::default();
    config.addr_types = vec![AddrType::External];
    for spec in &mut config.strategies {
        spec.has_cleanup = true;
    }

    let handlers: Vec<(StrategyKind, Arc<RecordingStrategy>)> = StrategyKind::DEFAULT_ORDER
        .iter()
        .map(|&kind| (kind, RecordingStrategy::failing()))
        .collect();
    let registered = handlers.clone();
    let a = TestNode::start_with(&hub, A, NatInfo::open(), config, move |mut builder| {
        for (kind, handler) in registered {
            builder = builder.handler(kind, handler as Arc<dyn StrategyHandler>);
        }
        builder
    })
    .await;
    let b = TestNode::start(&hub, B, NatInfo::open(), |b| b).await;

    let result = a.orchestrator.connect_default(&b.address).await;
    assert!(matches!(result, Err(TraversalError::Exhausted)));

    for (kind, handler) in &handlers {
        assert_eq!(handler.connect_count(), 1, "{kind} connects");
        assert_eq!(handler.cleanup_count(), 1, "{kind} cleanups");
        assert_eq!(
            *handler.connects.lock().unwrap(),
            *handler.cleanups.lock().unwrap(),
            "{kind} cleaned up a different pipe"
        );
    }
}

#[tokio::test]
async fn test_default_table_cleans_up_only_signaled_strategies() {
    let hub = RelayHub::new();
    let handlers: Vec<(StrategyKind, Arc<RecordingStrategy>)> = StrategyKind::DEFAULT_ORDER
        .iter()
        .map(|&kind| (kind, RecordingStrategy::failing()))
        .collect();
    let registered = handlers.clone();
    let a = TestNode::start(&hub, A, NatInfo::open(), move |mut builder| {
        for (kind, handler) in registered {
            builder = builder.handler(kind, handler as Arc<dyn StrategyHandler>);
        }
        builder
    })
    .await;
    let b = TestNode::start(&hub, B, NatInfo::open(), |b| b).await;

    let result = a.orchestrator.connect_default(&b.address).await;
    assert!(matches!(result, Err(TraversalError::Exhausted)));

    for (kind, handler) in &handlers {
        assert!(handler.connect_count() >= 1, "{kind} never tried");
        let expected = if kind.spec().has_cleanup {
            handler.connect_count()
        } else {
            0
        };
        assert_eq!(handler.cleanup_count(), expected, "{kind} cleanups");
    }
}

#[tokio::test]
async fn test_failover_stops_at_first_success() {
    let hub = RelayHub::new();
    let direct = RecordingStrategy::failing();
    let reverse = RecordingStrategy::succeeding();
    let punch = RecordingStrategy::failing();

    let (d, r, p) = (direct.clone(), reverse.clone(), punch.clone());
    let a = TestNode::start(&hub, A, NatInfo::open(), move |builder| {
        builder
            .handler(StrategyKind::Direct, d)
            .handler(StrategyKind::Reverse, r)
            .handler(StrategyKind::Punch, p)
    })
    .await;
    let b = TestNode::start(&hub, B, NatInfo::open(), |b| b).await;

    a.orchestrator.connect_default(&b.address).await.unwrap();

    assert!(direct.connect_count() >= 1);
    assert_eq!(reverse.connect_count(), 1);
    assert_eq!(punch.connect_count(), 0);
}

#[tokio::test]
async fn test_relayed_connection_carries_datagrams() {
    let hub = RelayHub::new();
    let relay_a = LoopbackRelay::new(A);
    let relay_b = LoopbackRelay::new(B);

    let ra = relay_a.clone();
    let a = TestNode::start(&hub, A, NatInfo::open(), move |b| b.relay(ra)).await;
    let rb = relay_b.clone();
    let b = TestNode::start(&hub, B, NatInfo::open(), move |b| b.relay(rb)).await;

    let pipe = a
        .orchestrator
        .connect(&b.address, &[StrategyKind::Relay])
        .await
        .unwrap();
    let incoming = tokio::time::timeout(Duration::from_secs(5), b.orchestrator.accept())
        .await
        .unwrap()
        .unwrap();

    pipe.send(b"relayed", None).await.unwrap();
    expect_message(incoming.pipe.clone(), b"relayed").await;
    incoming.pipe.send(b"back", None).await.unwrap();
    expect_message(pipe, b"back").await;

    // Offer and answer both crossed the hub.
    assert!(hub.sent() >= 2);
    assert_eq!(relay_a.allocated(), 0);
    assert_eq!(relay_b.allocated(), 0);
    assert!(relay_a.released.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_skipped_without_allocator() {
    let hub = RelayHub::new();
    let a = TestNode::start(&hub, A, NatInfo::open(), |b| b).await;
    let b = TestNode::start(&hub, B, NatInfo::open(), |b| b).await;

    let result = a.orchestrator.connect(&b.address, &[StrategyKind::Relay]).await;
    assert!(matches!(result, Err(TraversalError::Exhausted)));
    assert_eq!(hub.sent(), 0);
}

#[tokio::test]
async fn test_request_addr_returns_current_address() {
    let hub = RelayHub::new();
    let a = TestNode::start(&hub, A, NatInfo::open(), |b| b).await;
    let b = TestNode::start(&hub, B, NatInfo::open(), |b| b).await;

    let fresh = a.orchestrator.request_addr(&b.address).await.unwrap();
    assert_eq!(fresh.node_id, b.address.node_id);
    assert_eq!(fresh.interfaces, b.address.interfaces);
}
