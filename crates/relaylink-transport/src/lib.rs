//! Transport abstraction layer for relaylink.
//!
//! Two contracts meet in this crate:
//!
//! - **Below**: the [`Relay`] trait, the peer-addressed, channel-numbered
//!   datagram primitive offered by an external relay service, and
//!   [`RelaySession`], which owns the local peer's registration with it.
//! - **Above**: the [`Transport`] and [`Connection`] traits a host
//!   networking framework programs against.
//!
//! # Feature Flags
//!
//! - `memory` (default): in-process relay backend ([`MemoryHub`]) used by
//!   tests and demos.

#![allow(async_fn_in_trait)]

mod error;
#[cfg(feature = "memory")]
mod memory;
mod relay;
mod session;

pub use error::TransportError;
#[cfg(feature = "memory")]
pub use memory::{MemoryHub, MemoryRelay};
pub use relay::{InboundPacket, Relay, RelayCloseCode, RelayEvent};
pub use session::RelaySession;

use std::sync::Arc;

use relaylink_protocol::{LogicalChannel, PeerId};

/// Accepts new incoming connections (server role).
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next admitted connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Gracefully shuts down the transport, disconnecting every peer.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A single peer connection that can send and receive channel-tagged bytes.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync;

    /// Sends data to the remote peer on a logical channel.
    async fn send(
        &self,
        channel: LogicalChannel,
        data: &[u8],
    ) -> Result<(), Self::Error>;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` once the connection is no longer connected.
    async fn recv(
        &self,
    ) -> Result<Option<(Vec<u8>, LogicalChannel)>, Self::Error>;

    /// Closes the connection.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Returns the identity of the remote peer.
    fn peer_id(&self) -> PeerId;
}

impl<C: Connection> Connection for Arc<C> {
    type Error = C::Error;

    async fn send(
        &self,
        channel: LogicalChannel,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        (**self).send(channel, data).await
    }

    async fn recv(
        &self,
    ) -> Result<Option<(Vec<u8>, LogicalChannel)>, Self::Error> {
        (**self).recv().await
    }

    async fn close(&self) -> Result<(), Self::Error> {
        (**self).close().await
    }

    fn peer_id(&self) -> PeerId {
        (**self).peer_id()
    }
}
