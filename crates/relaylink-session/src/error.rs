//! Error types for the session layer.

use std::time::Duration;

use relaylink_protocol::{LogicalChannel, PeerId};

use crate::CloseReason;

/// Errors that can occur while negotiating or using a peer connection.
///
/// `Capacity` and `Timeout` are the two handshake failures surfaced to the
/// caller of `connect`; they are kept distinct so a client can tell "the
/// server is full" apart from "the server never answered".
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The server's connection table is full.
    #[error("server at capacity, {0} was rejected")]
    Capacity(PeerId),

    /// No Accept arrived within the connect timeout.
    #[error("no accept from {peer} within {after:?}")]
    Timeout {
        /// The host we were trying to reach.
        peer: PeerId,
        /// The configured timeout.
        after: Duration,
    },

    /// Traffic came from a peer other than the one we're bound to.
    #[error("expected traffic from {expected}, got {actual}")]
    IdentityMismatch {
        /// The bound host.
        expected: PeerId,
        /// The peer that actually spoke.
        actual: PeerId,
    },

    /// The connection isn't established (never was, or already closed).
    #[error("{0} is not connected")]
    NotConnected(PeerId),

    /// The host framework used a channel the channel map doesn't define.
    #[error("no wire channel mapped for {0}")]
    UnknownChannel(LogicalChannel),

    /// The connection closed before the handshake completed.
    #[error("connection to {peer} closed: {reason}")]
    Closed {
        /// The remote peer.
        peer: PeerId,
        /// Why it closed.
        reason: CloseReason,
    },
}
