//! Identity and channel types shared by every layer.
//!
//! These are small `Copy` newtypes. Wrapping the raw integers means a
//! `WireChannel` can never be passed where a `LogicalChannel` is expected,
//! even though both are a `u8` underneath. That distinction matters here:
//! the host framework thinks in logical channels, the relay thinks in wire
//! channels, and mixing them up silently misroutes traffic.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque identifier for a participant on the relay.
///
/// Supplied by the relay backend and stable for the lifetime of a
/// connection. It is the only key used to look connections up.
///
/// `#[serde(transparent)]` makes `PeerId(42)` serialize as `42`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// A channel number understood by the relay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct WireChannel(pub u8);

impl fmt::Display for WireChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire-{}", self.0)
    }
}

/// A channel as seen by the host framework: an index into the configured
/// list of reliability classes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct LogicalChannel(pub u8);

impl LogicalChannel {
    /// Reliable, ordered traffic in the default channel map.
    pub const RELIABLE: Self = Self(0);

    /// Unreliable, unordered traffic in the default channel map.
    pub const UNRELIABLE: Self = Self(1);
}

impl fmt::Display for LogicalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Reliability: delivery hint passed to the relay
// ---------------------------------------------------------------------------

/// The delivery guarantee requested from the relay for a packet.
///
/// Different kinds of traffic need different guarantees. Chat and game
/// events must arrive (reliable); position updates sent many times per
/// second can afford to lose a few (unreliable).
///
/// `#[serde(rename_all = "PascalCase")]` keeps configuration files readable:
/// `"ReliableOrdered"` rather than `"reliable_ordered"`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "PascalCase")]
pub enum Reliability {
    /// Delivered in order, no loss.
    #[default]
    ReliableOrdered,

    /// Delivered (no loss), but may arrive out of order.
    ReliableUnordered,

    /// May be lost, may arrive out of order.
    Unreliable,
}

impl Reliability {
    /// Returns `true` if the relay must retransmit lost packets.
    pub fn is_reliable(self) -> bool {
        !matches!(self, Self::Unreliable)
    }
}

impl fmt::Display for Reliability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReliableOrdered => write!(f, "ReliableOrdered"),
            Self::ReliableUnordered => write!(f, "ReliableUnordered"),
            Self::Unreliable => write!(f, "Unreliable"),
        }
    }
}
