//! Wire-level vocabulary for relaylink.
//!
//! This crate defines what travels between two peers over the relay:
//!
//! - **Identity & channel types** ([`PeerId`], [`WireChannel`],
//!   [`LogicalChannel`], [`Reliability`]).
//! - **Channel map** ([`ChannelMap`]): the static assignment of logical
//!   channels and the control channel to relay wire channels.
//! - **Control messages** ([`ControlMessage`], [`Route`]): the one-byte
//!   handshake vocabulary and the routing decision for an inbound packet.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Architecture
//!
//! The protocol layer sits below everything else. It knows nothing about
//! sessions, tasks, or the relay backend, only how bytes are laid out.
//!
//! ```text
//! Relay (bytes + wire channel) → Protocol (Route) → Session (per-peer state)
//! ```

mod channel;
mod control;
mod error;
mod types;

pub use channel::ChannelMap;
pub use control::{ControlMessage, Route};
pub use error::ProtocolError;
pub use types::{LogicalChannel, PeerId, Reliability, WireChannel};
