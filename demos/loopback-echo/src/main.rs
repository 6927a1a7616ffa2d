//! An echo host and two clients talking over an in-process relay.
//!
//! Run with `RUST_LOG=debug` to watch the handshake and demultiplexer.

use std::sync::Arc;
use std::time::Duration;

use relaylink::prelude::*;
use serde::{Deserialize, Serialize};

const HOST: PeerId = PeerId(1);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Line {
    from: u64,
    text: String,
}

fn encode(line: &Line) -> Vec<u8> {
    // A two-field struct of plain strings and integers always serializes.
    serde_json::to_vec(line).unwrap_or_default()
}

fn decode(bytes: &[u8]) -> Option<Line> {
    serde_json::from_slice(bytes).ok()
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Echoes every message back on the channel it came in on, until the peer
/// goes away.
async fn echo(conn: Arc<PeerConnection>) {
    while let Some(msg) = conn.receive().await {
        if let Some(line) = decode(&msg.payload) {
            tracing::info!(peer = %msg.peer, text = %line.text, "echoing");
        }
        if let Err(e) = conn.send(msg.channel, &msg.payload) {
            tracing::debug!(error = %e, "echo failed");
            break;
        }
    }
    tracing::info!(peer = %conn.peer_id(), state = %conn.state(), "echo finished");
}

async fn start_host(hub: &MemoryHub, config: RelayConfig) -> Result<RelayServer, RelaylinkError> {
    RelayServer::builder().config(config).listen(hub.relay(), HOST).await
}

/// Accepts connections forever, one echo task each.
async fn serve(mut server: RelayServer) {
    while let Some(conn) = server.accept().await {
        tokio::spawn(echo(conn));
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

async fn chat(client: &RelayClient, id: u64, text: &str) -> Result<Line, RelaylinkError> {
    let line = Line {
        from: id,
        text: text.to_string(),
    };
    client
        .connection()
        .send(LogicalChannel::RELIABLE, &encode(&line))?;

    let reply = client.connection().receive().await.ok_or(SessionError::Closed {
        peer: client.host(),
        reason: CloseReason::SessionClosed,
    })?;
    Ok(decode(&reply.payload).unwrap_or(Line {
        from: id,
        text: String::new(),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    relaylink::init_tracing("relaylink=info,loopback_echo=info");

    let config = RelayConfig::from_json_str(r#"{ "max_connections": 2 }"#)?;
    let hub = MemoryHub::new();
    let server = start_host(&hub, config.clone()).await?;
    tokio::spawn(serve(server));

    let alice = RelayClient::connect(hub.relay(), PeerId(10), HOST, config.clone()).await?;
    let bob = RelayClient::connect(hub.relay(), PeerId(11), HOST, config.clone()).await?;

    for (id, client, text) in [(10, &alice, "hello from alice"), (11, &bob, "hi, bob here")] {
        let reply = chat(client, id, text).await?;
        eprintln!("peer-{id} got echo: {:?}", reply.text);
    }

    match RelayClient::connect(hub.relay(), PeerId(12), HOST, config).await {
        Err(e) if e.is_capacity() => eprintln!("peer-12 turned away: {e}"),
        Err(e) => return Err(e.into()),
        Ok(_) => eprintln!("peer-12 unexpectedly admitted"),
    }

    alice.shutdown().await;
    bob.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RelayConfig {
        RelayConfig {
            max_connections: 2,
            poll_jitter_us: 0,
            ..RelayConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_echo_round_trip() {
        let hub = MemoryHub::new();
        let server = start_host(&hub, config()).await.unwrap();
        tokio::spawn(serve(server));

        let client = RelayClient::connect(hub.relay(), PeerId(10), HOST, config())
            .await
            .unwrap();
        let reply = chat(&client, 10, "ping").await.unwrap();
        assert_eq!(
            reply,
            Line {
                from: 10,
                text: "ping".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_client_turned_away() {
        let hub = MemoryHub::new();
        let server = start_host(&hub, config()).await.unwrap();
        tokio::spawn(serve(server));

        let _a = RelayClient::connect(hub.relay(), PeerId(10), HOST, config())
            .await
            .unwrap();
        let _b = RelayClient::connect(hub.relay(), PeerId(11), HOST, config())
            .await
            .unwrap();
        let err = RelayClient::connect(hub.relay(), PeerId(12), HOST, config())
            .await
            .unwrap_err();
        assert!(err.is_capacity());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"not json").is_none());
        let line = Line {
            from: 3,
            text: "x".into(),
        };
        assert_eq!(decode(&encode(&line)), Some(line));
    }
}
