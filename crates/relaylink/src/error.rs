//! Unified error type for relaylink.

use relaylink_protocol::ProtocolError;
use relaylink_session::SessionError;
use relaylink_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant generates a `From` impl, so `?`
/// converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum RelaylinkError {
    /// A relay-level error (open, send, receive).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A wire-level error (malformed control packet, bad channel map).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A connection-level error (capacity, timeout, identity).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl RelaylinkError {
    /// Returns `true` if a server refused the connection for capacity.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Session(SessionError::Capacity(_)))
    }

    /// Returns `true` if the handshake timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Session(SessionError::Timeout { .. }))
    }
}
