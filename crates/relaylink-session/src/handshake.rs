//! Handshake state machine and identity rule.
//!
//! ```text
//!            Connect sent          Accept
//!   Idle ───────────────→ AwaitingAccept ──────→ Established
//!    │   (client only)         │                    │
//!    │                         │ TooManyUsers       │ disconnect()
//!    │ admitted (server)       │ / timeout          ▼
//!    └──────────────→ Established            Disconnecting
//!                              │                    │ grace elapsed
//!                              ▼                    ▼
//!                            Closed ←───────────────┘
//! ```
//!
//! A received Disconnect (or a relay-reported close) moves any non-closed
//! state straight to `Closed`. `Closed` is terminal: there is no retry.
//!
//! The server never sits in `AwaitingAccept`: it goes from "Connect
//! observed" directly to `Established` (admitted) or rejects without
//! creating a connection at all.

use std::fmt;

use relaylink_protocol::{ControlMessage, PeerId};
use relaylink_transport::RelayCloseCode;

use crate::SessionError;

// ---------------------------------------------------------------------------
// CloseReason
// ---------------------------------------------------------------------------

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// We called `disconnect()`.
    LocalDisconnect,
    /// The remote peer sent Disconnect.
    RemoteDisconnect,
    /// The server answered TooManyUsers.
    Rejected,
    /// No Accept arrived within the connect timeout.
    TimedOut,
    /// The relay tore the peer session down.
    Relay(RelayCloseCode),
    /// The local relay session was closed underneath the connection.
    SessionClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalDisconnect => write!(f, "disconnected locally"),
            Self::RemoteDisconnect => write!(f, "remote peer disconnected"),
            Self::Rejected => write!(f, "server has too many users"),
            Self::TimedOut => write!(f, "handshake timed out"),
            Self::Relay(code) => write!(f, "relay closed the session: {code}"),
            Self::SessionClosed => write!(f, "local relay session closed"),
        }
    }
}

// ---------------------------------------------------------------------------
// HandshakeState
// ---------------------------------------------------------------------------

/// Lifecycle state of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    /// Created, nothing sent yet.
    Idle,
    /// Client sent Connect and is waiting for the server's answer.
    AwaitingAccept,
    /// Handshake complete; traffic flows both ways.
    Established,
    /// Local disconnect in progress (Disconnect sent, grace wait running).
    Disconnecting,
    /// Terminal.
    Closed(CloseReason),
}

impl HandshakeState {
    /// Returns `true` only when application traffic may flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Established)
    }

    /// Returns `true` once the state is terminal.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    /// Returns `true` if moving to `target` is a legal transition.
    pub fn can_transition_to(&self, target: &Self) -> bool {
        match (self, target) {
            (Self::Closed(_), _) => false,
            (_, Self::Closed(_)) => true,
            (Self::Idle, Self::AwaitingAccept | Self::Established) => true,
            (Self::AwaitingAccept, Self::Established | Self::Disconnecting) => {
                true
            }
            (Self::Established, Self::Disconnecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::AwaitingAccept => write!(f, "AwaitingAccept"),
            Self::Established => write!(f, "Established"),
            Self::Disconnecting => write!(f, "Disconnecting"),
            Self::Closed(_) => write!(f, "Closed"),
        }
    }
}

/// The client's reaction to a control message from its host.
///
/// Returns the state to move to, or `None` if the message doesn't apply in
/// the current state (a stray Accept after establishment, a Connect sent to
/// a client, ...). Identity has already been checked by the caller.
pub fn client_step(
    state: &HandshakeState,
    msg: ControlMessage,
) -> Option<HandshakeState> {
    use ControlMessage::*;
    use HandshakeState::*;

    match (state, msg) {
        (AwaitingAccept, Accept) => Some(Established),
        (AwaitingAccept, TooManyUsers) => Some(Closed(CloseReason::Rejected)),
        (AwaitingAccept | Established | Disconnecting, Disconnect) => {
            Some(Closed(CloseReason::RemoteDisconnect))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Role & identity
// ---------------------------------------------------------------------------

/// Which side of the handshake the local peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Bound to exactly one remote host.
    Client {
        /// The only peer we accept traffic from.
        host: PeerId,
    },
    /// Admits any peer, up to the table's capacity.
    Server,
}

impl Role {
    /// The one identity rule, applied to every control packet, data packet,
    /// and relay notification before it can touch connection state.
    ///
    /// A client accepts traffic only from its bound host. Anything else is
    /// a different relay participant and must not be treated as the host.
    ///
    /// # Errors
    /// Returns [`SessionError::IdentityMismatch`] for a client receiving
    /// from anyone but its host.
    pub fn validate_peer(&self, actual: PeerId) -> Result<(), SessionError> {
        match *self {
            Self::Client { host } if host != actual => {
                Err(SessionError::IdentityMismatch {
                    expected: host,
                    actual,
                })
            }
            _ => Ok(()),
        }
    }

    /// Returns `true` for the server role.
    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server)
    }
}
