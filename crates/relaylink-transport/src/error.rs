use relaylink_protocol::PeerId;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `open` was called on a session that is already open.
    #[error("relay session already open")]
    AlreadyOpen,

    /// An operation needs an open relay session.
    #[error("relay session not open")]
    NotOpen,

    /// The relay refused or failed to send a packet.
    #[error("send to {peer} failed: {reason}")]
    SendFailed {
        /// Destination of the failed send.
        peer: PeerId,
        /// Backend-specific description.
        reason: String,
    },

    /// The relay reported an error other than "nothing queued".
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// The transport was shut down.
    #[error("transport shut down")]
    Shutdown,
}
