//! The relay collaborator contract.
//!
//! A relay service delivers byte packets between identified peers on small
//! numbered channels. It resolves identities, traverses NATs, and brings
//! peer sessions up and down; relaylink only consumes it through the
//! [`Relay`] trait below.
//!
//! All methods are non-blocking. In particular [`Relay::try_receive`] must
//! return immediately, which is why relaylink polls it from a loop instead
//! of awaiting it.

use std::fmt;

use relaylink_protocol::{PeerId, Reliability, WireChannel};
use tokio::sync::mpsc;

use crate::TransportError;

/// A packet pulled off the relay. Consumed immediately by the
/// demultiplexer, never stored as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Who sent it.
    pub peer: PeerId,
    /// The wire channel it arrived on.
    pub wire: WireChannel,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// Why the relay tore down its session with a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayCloseCode {
    /// The remote peer closed its side.
    ClosedByPeer,
    /// The relay gave up waiting for the remote peer.
    TimedOut,
    /// No route to the remote peer could be established.
    NoRoute,
    /// The local session was shut down.
    LocalShutdown,
    /// Any backend-specific code relaylink doesn't interpret.
    Other(i32),
}

impl fmt::Display for RelayCloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClosedByPeer => write!(f, "remote peer closed the session"),
            Self::TimedOut => write!(f, "relay session timed out"),
            Self::NoRoute => write!(f, "no route to remote peer"),
            Self::LocalShutdown => write!(f, "local relay session shut down"),
            Self::Other(code) => write!(f, "relay error code {code}"),
        }
    }
}

/// Notifications pushed by the relay while a session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A peer we have no relay session with is trying to reach us.
    IncomingConnectionRequest {
        /// The requesting peer.
        peer: PeerId,
        /// Name of the relay socket the request arrived on.
        socket_name: String,
    },

    /// The relay closed its session with a peer.
    ConnectionClosed {
        /// The peer whose session ended.
        peer: PeerId,
        /// Backend reason.
        code: RelayCloseCode,
    },
}

/// The relay service primitive.
///
/// # Trait bounds
///
/// `Send + Sync + 'static` because a relay handle is shared between the
/// demultiplexer task and every connection that sends through it.
pub trait Relay: Send + Sync + 'static {
    /// Registers `local_id` with the relay and subscribes to its events.
    ///
    /// The returned receiver yields [`RelayEvent`]s until the session is
    /// closed.
    fn open_session(
        &self,
        local_id: PeerId,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>, TransportError>;

    /// Unregisters from the relay. Idempotent.
    fn close_session(&self);

    /// Sends one packet. Fire-and-forget: success means "handed to the
    /// relay", not "delivered".
    fn send_packet(
        &self,
        peer: PeerId,
        wire: WireChannel,
        reliability: Reliability,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Pops the next packet queued on `wire`, if any.
    ///
    /// `Ok(None)` is the normal "nothing queued right now" answer.
    fn try_receive(
        &self,
        wire: WireChannel,
    ) -> Result<Option<InboundPacket>, TransportError>;

    /// Accepts a pending relay-level session request from `peer`.
    fn accept_peer(&self, peer: PeerId) -> Result<(), TransportError>;

    /// Tears down the relay-level session with `peer`. Idempotent.
    fn close_peer(&self, peer: PeerId);
}
