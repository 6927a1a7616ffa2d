//! Integration tests for the client role: connect outcomes, identity
//! binding, and disconnect in both directions.

use std::time::Duration;

use relaylink::prelude::*;
use relaylink::protocol::{ChannelMap, ControlMessage, WireChannel};
use relaylink::transport::{
    RelayCloseCode, RelayEvent, RelaySession, TransportError,
};

const HOST: PeerId = PeerId(1);
const CLIENT: PeerId = PeerId(10);

// =========================================================================
// Helpers
// =========================================================================

fn config() -> RelayConfig {
    RelayConfig {
        connect_timeout_secs: 2,
        poll_jitter_us: 0,
        disconnect_grace_ms: 20,
        ..RelayConfig::default()
    }
}

async fn start_server(hub: &MemoryHub, max: usize) -> RelayServer {
    RelayServer::builder()
        .config(config())
        .max_connections(max)
        .listen(hub.relay(), HOST)
        .await
        .expect("server should listen")
}

fn control() -> WireChannel {
    ChannelMap::default().control_channel()
}

/// A host that is online but never runs the protocol.
fn silent_host(hub: &MemoryHub) -> RelaySession {
    let session = RelaySession::new(hub.relay());
    session.open(HOST).expect("host should open");
    session
}

async fn receive(conn: &PeerConnection) -> Option<QueuedMessage> {
    tokio::time::timeout(Duration::from_secs(1), conn.receive())
        .await
        .expect("receive should not hang")
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test(start_paused = true)]
async fn test_connect_succeeds_against_server() {
    let hub = MemoryHub::new();
    let _server = start_server(&hub, 2).await;

    let client = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .expect("should connect");
    assert_eq!(client.host(), HOST);
    assert!(client.is_connected());
    assert!(client.is_running());
    assert_eq!(client.connection().peer_id(), HOST);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out_when_host_is_silent() {
    let hub = MemoryHub::new();
    let host = silent_host(&hub);

    let started = tokio::time::Instant::now();
    let err = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "expected timeout, got {err}");
    assert!(matches!(
        err,
        RelaylinkError::Session(SessionError::Timeout { peer: HOST, after })
            if after == Duration::from_secs(2)
    ));
    assert!(started.elapsed() >= Duration::from_secs(2));
    // The client's relay session is gone, and only one Connect ever left.
    assert!(!hub.is_online(CLIENT));
    let connects = std::iter::from_fn(|| host.try_receive(control())).count();
    assert_eq!(connects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out_when_host_is_offline() {
    let hub = MemoryHub::new();
    let err = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(!hub.is_online(CLIENT));
}

#[tokio::test(start_paused = true)]
async fn test_rejected_connect_reports_capacity() {
    let hub = MemoryHub::new();
    let _server = start_server(&hub, 1).await;
    let _first = RelayClient::connect(hub.relay(), PeerId(20), HOST, config())
        .await
        .expect("first client admitted");

    let started = tokio::time::Instant::now();
    let err = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .unwrap_err();
    assert!(err.is_capacity(), "expected capacity error, got {err}");
    // Rejection is answered well before the timeout.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!hub.is_online(CLIENT));
}

#[tokio::test(start_paused = true)]
async fn test_local_id_already_in_use() {
    let hub = MemoryHub::new();
    let _server = start_server(&hub, 2).await;
    let taken = RelaySession::new(hub.relay());
    taken.open(CLIENT).unwrap();

    let err = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RelaylinkError::Transport(TransportError::AlreadyOpen)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_traffic_from_other_peers_is_ignored() {
    let hub = MemoryHub::new();
    let mut server = start_server(&hub, 2).await;
    let client = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .expect("should connect");
    let conn = server.accept().await.expect("admitted");

    let stranger = RelaySession::new(hub.relay());
    stranger.open(PeerId(99)).unwrap();
    stranger.send(
        CLIENT,
        control(),
        Reliability::ReliableOrdered,
        &ControlMessage::Disconnect.encode(),
    );
    stranger.send(CLIENT, WireChannel(0), Reliability::ReliableOrdered, b"spoof");
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(client.is_connected());
    assert_eq!(client.connection().queued(), 0);

    conn.send(LogicalChannel::RELIABLE, b"real").unwrap();
    let msg = receive(client.connection()).await.expect("host traffic");
    assert_eq!(msg.peer, HOST);
    assert_eq!(msg.payload, b"real");
}

#[tokio::test(start_paused = true)]
async fn test_relay_session_from_stranger_is_refused() {
    let hub = MemoryHub::new();
    let mut server = start_server(&hub, 2).await;
    let client = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .expect("should connect");
    let conn = server.accept().await.expect("admitted");

    let stranger = RelaySession::new(hub.relay());
    stranger.open(PeerId(99)).unwrap();
    assert!(stranger.send(
        CLIENT,
        WireChannel(0),
        Reliability::ReliableOrdered,
        b"let me in"
    ));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        stranger.poll_event(),
        Some(RelayEvent::ConnectionClosed {
            peer: CLIENT,
            code: RelayCloseCode::ClosedByPeer,
        })
    );
    assert_eq!(client.connection().state(), HandshakeState::Established);
    assert_eq!(client.connection().peer_id(), HOST);
    assert_eq!(client.connection().queued(), 0);

    conn.send(LogicalChannel::RELIABLE, b"host").unwrap();
    let msg = receive(client.connection()).await.expect("host traffic");
    assert_eq!(msg.peer, HOST);
}

#[tokio::test(start_paused = true)]
async fn test_local_disconnect_ends_connection() {
    let hub = MemoryHub::new();
    let server = start_server(&hub, 2).await;
    let client = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .expect("should connect");

    client.disconnect().await;
    assert_eq!(
        client.connection().state(),
        HandshakeState::Closed(CloseReason::LocalDisconnect)
    );
    assert!(receive(client.connection()).await.is_none());
    let err = client
        .connection()
        .send(LogicalChannel::RELIABLE, b"late")
        .unwrap_err();
    assert!(matches!(err, SessionError::NotConnected(HOST)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_host_shutdown_closes_client() {
    let hub = MemoryHub::new();
    let server = start_server(&hub, 2).await;
    let client = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .expect("should connect");

    let pending = {
        let conn = client.connection().clone();
        tokio::spawn(async move { conn.receive().await })
    };
    server.shutdown().await;

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("receive should unblock")
        .unwrap();
    assert!(result.is_none());
    assert!(!client.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_takes_client_offline() {
    let hub = MemoryHub::new();
    let _server = start_server(&hub, 2).await;
    let client = RelayClient::connect(hub.relay(), CLIENT, HOST, config())
        .await
        .expect("should connect");

    assert!(hub.is_online(CLIENT));
    client.shutdown().await;
    assert!(!hub.is_online(CLIENT));
}

#[tokio::test(start_paused = true)]
async fn test_custom_channel_layout() {
    let hub = MemoryHub::new();
    let channels = vec![
        Reliability::ReliableOrdered,
        Reliability::ReliableUnordered,
        Reliability::Unreliable,
    ];
    let server_config = RelayConfig {
        channels: channels.clone(),
        ..config()
    };
    let mut server = RelayServer::builder()
        .config(server_config.clone())
        .listen(hub.relay(), HOST)
        .await
        .unwrap();
    let client = RelayClient::connect(hub.relay(), CLIENT, HOST, server_config)
        .await
        .expect("should connect");
    let conn = server.accept().await.expect("admitted");

    client.connection().send(LogicalChannel(2), b"third").unwrap();
    let msg = receive(&conn).await.expect("delivered");
    assert_eq!(msg.channel, LogicalChannel(2));
    assert_eq!(msg.payload, b"third");
}
