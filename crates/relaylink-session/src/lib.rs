//! Connection lifecycle for relaylink.
//!
//! This crate owns everything that happens per remote peer:
//!
//! 1. **Handshake**: the Connect / Accept / TooManyUsers / Disconnect state
//!    machine ([`HandshakeState`], [`client_step`]) and the single identity
//!    rule ([`Role::validate_peer`]).
//! 2. **Peer connections**: one [`PeerConnection`] per remote peer with an
//!    inbound queue, send/receive, and the local disconnect sequence.
//! 3. **Admission**: the [`ConnectionTable`], the only place a connection
//!    can be created, which enforces the maximum connection count.
//!
//! Client and server share all of it. A client is simply a table of
//! capacity 1 that initiates its own Connect; a server is a table of
//! capacity N that admits Connects reactively.
//!
//! # How it fits in the stack
//!
//! ```text
//! relaylink (above)  ← demultiplexer drives handshakes, host uses connections
//!     ↕
//! Session layer (this crate)
//!     ↕
//! Transport layer (below)  ← RelaySession sends/receives packets
//! ```

mod connection;
mod error;
mod handshake;
mod table;

pub use connection::{
    ConnectionOptions, ConnectionStats, PeerConnection, QueuedMessage,
};
pub use error::SessionError;
pub use handshake::{client_step, CloseReason, HandshakeState, Role};
pub use table::{Admission, ConnectionTable};
