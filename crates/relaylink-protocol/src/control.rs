//! Handshake control messages and inbound routing.
//!
//! A control packet is exactly one byte: the [`ControlMessage`] tag.
//! Anything else arriving on the control channel (wrong length or an
//! unknown tag) is malformed and must be discarded by the caller.
//!
//! ```text
//! 0 = Connect      client → server, "let me in"
//! 1 = Disconnect   either way, "I'm leaving"
//! 2 = Accept       server → client, "you're in"
//! 3 = TooManyUsers server → client, "no room left"
//! ```

use crate::{ChannelMap, LogicalChannel, ProtocolError, WireChannel};

/// One-byte handshake message sent on the control wire channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlMessage {
    /// Request a new connection.
    Connect = 0,
    /// Tear the connection down.
    Disconnect = 1,
    /// Connection request admitted.
    Accept = 2,
    /// Connection request refused, the server is at capacity.
    TooManyUsers = 3,
}

impl ControlMessage {
    /// Returns the wire tag for this message.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Encodes the message as its one-byte wire form.
    pub fn encode(self) -> [u8; 1] {
        [self.tag()]
    }

    /// Decodes a control packet payload.
    ///
    /// # Errors
    /// - [`ProtocolError::MalformedControl`] if the payload is not exactly
    ///   one byte.
    /// - [`ProtocolError::UnknownControlTag`] if the byte is not a known tag.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [tag] => Self::try_from(*tag),
            _ => Err(ProtocolError::MalformedControl { len: payload.len() }),
        }
    }
}

impl TryFrom<u8> for ControlMessage {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Disconnect),
            2 => Ok(Self::Accept),
            3 => Ok(Self::TooManyUsers),
            other => Err(ProtocolError::UnknownControlTag(other)),
        }
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "Connect"),
            Self::Disconnect => write!(f, "Disconnect"),
            Self::Accept => write!(f, "Accept"),
            Self::TooManyUsers => write!(f, "TooManyUsers"),
        }
    }
}

// ---------------------------------------------------------------------------
// Route: where an inbound packet goes
// ---------------------------------------------------------------------------

/// Routing decision for a packet, derived from its wire channel alone.
///
/// `Data` is never a wire value. It only marks "this is application
/// traffic, hand it to the addressed connection".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handshake traffic; decode with [`ControlMessage::decode`].
    Control,
    /// Application payload for the given logical channel.
    Data(LogicalChannel),
}

impl Route {
    /// Classifies a wire channel against the channel map.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownChannel`] for wire channels that are
    /// neither the control channel nor a configured data channel.
    pub fn classify(
        map: &ChannelMap,
        wire: WireChannel,
    ) -> Result<Self, ProtocolError> {
        if wire == map.control_channel() {
            return Ok(Self::Control);
        }
        map.logical_channel(wire)
            .map(Self::Data)
            .ok_or(ProtocolError::UnknownChannel(wire))
    }
}
