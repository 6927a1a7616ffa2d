//! # Relaylink
//!
//! Connection-oriented peer-to-peer transport over a datagram relay.
//!
//! A relay service offers peer-addressed, channel-numbered datagrams and
//! nothing else. Relaylink layers connections on top: a tiny handshake on a
//! dedicated control channel, admission control with a maximum connection
//! count, and per-connection inbound queues a host framework can `send` to
//! and `receive` from like any other transport.
//!
//! ## Quick Start
//!
//! ```rust
//! use relaylink::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RelaylinkError> {
//! let hub = MemoryHub::new();
//! let mut server = RelayServer::builder()
//!     .listen(hub.relay(), PeerId(1))
//!     .await?;
//!
//! let client =
//!     RelayClient::connect(hub.relay(), PeerId(2), PeerId(1), RelayConfig::default())
//!         .await?;
//! let conn = server.accept().await.expect("admitted");
//!
//! client.connection().send(LogicalChannel::RELIABLE, b"hello")?;
//! let msg = conn.receive().await.expect("delivered");
//! assert_eq!(msg.payload, b"hello");
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
pub mod demux;
mod error;
mod logging;
mod server;

pub use client::RelayClient;
pub use config::RelayConfig;
pub use error::RelaylinkError;
pub use logging::init_tracing;
pub use server::{RelayServer, RelayServerBuilder};

pub use relaylink_protocol as protocol;
pub use relaylink_session as session;
pub use relaylink_transport as transport;

/// Everything a host typically needs, in one import.
///
/// The [`Transport`](relaylink_transport::Transport) and
/// [`Connection`](relaylink_transport::Connection) traits are not in here:
/// their async `send`/`close` shadow the inherent methods of
/// `Arc<PeerConnection>`. Import them from [`crate::transport`] when writing code
/// that is generic over transports.
pub mod prelude {
    pub use crate::{
        init_tracing, RelayClient, RelayConfig, RelayServer,
        RelayServerBuilder, RelaylinkError,
    };
    pub use relaylink_protocol::{LogicalChannel, PeerId, Reliability};
    pub use relaylink_session::{
        CloseReason, HandshakeState, PeerConnection, QueuedMessage,
        SessionError,
    };
    pub use relaylink_transport::MemoryHub;
}
