//! Error types for the protocol layer.
//!
//! Each crate in relaylink defines its own error enum. When you see a
//! `ProtocolError`, the problem is in how bytes or channels were laid out,
//! not in the relay or in connection state.

use crate::WireChannel;

/// Errors that can occur while interpreting wire data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A control packet did not have the one-byte length.
    #[error("malformed control packet: expected 1 byte, got {len}")]
    MalformedControl {
        /// Length of the offending payload.
        len: usize,
    },

    /// A control packet carried a tag outside the known enumeration.
    #[error("unknown control tag {0}")]
    UnknownControlTag(u8),

    /// A packet arrived on a wire channel the channel map doesn't define.
    #[error("no channel mapped to {0}")]
    UnknownChannel(WireChannel),

    /// The logical-channel configuration can't be turned into a map.
    #[error("invalid channel map: {0}")]
    InvalidChannelMap(String),
}
