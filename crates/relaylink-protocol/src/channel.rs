//! Static mapping from logical channels to relay wire channels.
//!
//! The layout is fixed once a [`ChannelMap`] is built:
//!
//! ```text
//! logical 0 → wire 0   (reliability[0])
//! logical 1 → wire 1   (reliability[1])
//! ...
//! logical N-1 → wire N-1
//! control     → wire N  ("one past the last data channel")
//! ```
//!
//! Computing the control channel from the data-channel count, instead of
//! hardcoding it, keeps both peers in agreement as long as they share the
//! same channel configuration.

use crate::{LogicalChannel, ProtocolError, Reliability, WireChannel};

/// Assignment of logical channels and the control channel to wire channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    reliabilities: Vec<Reliability>,
}

impl ChannelMap {
    /// Highest number of data channels. The control channel then sits on
    /// wire 254; wire 255 is never used.
    pub const MAX_DATA_CHANNELS: usize = u8::MAX as usize - 1;

    /// Builds a map where logical channel `i` uses `reliabilities[i]`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidChannelMap`] if the list is empty or
    /// has more than [`Self::MAX_DATA_CHANNELS`] entries.
    pub fn new(reliabilities: Vec<Reliability>) -> Result<Self, ProtocolError> {
        if reliabilities.is_empty() {
            return Err(ProtocolError::InvalidChannelMap(
                "at least one data channel is required".into(),
            ));
        }
        if reliabilities.len() > Self::MAX_DATA_CHANNELS {
            return Err(ProtocolError::InvalidChannelMap(format!(
                "{} data channels configured, at most {} allowed",
                reliabilities.len(),
                Self::MAX_DATA_CHANNELS
            )));
        }
        Ok(Self { reliabilities })
    }

    /// Number of data (non-control) channels.
    pub fn data_channel_count(&self) -> usize {
        self.reliabilities.len()
    }

    /// The wire channel reserved for handshake traffic.
    pub fn control_channel(&self) -> WireChannel {
        // `new` guarantees len < 255, so this never truncates.
        WireChannel(self.reliabilities.len() as u8)
    }

    /// Wire channel carrying the given logical channel, if it is configured.
    pub fn wire_channel(&self, channel: LogicalChannel) -> Option<WireChannel> {
        self.reliabilities
            .get(channel.0 as usize)
            .map(|_| WireChannel(channel.0))
    }

    /// Logical channel carried on a wire channel. `None` for the control
    /// channel and for unknown channels.
    pub fn logical_channel(&self, wire: WireChannel) -> Option<LogicalChannel> {
        if (wire.0 as usize) < self.reliabilities.len() {
            Some(LogicalChannel(wire.0))
        } else {
            None
        }
    }

    /// Reliability hint for a logical channel.
    pub fn reliability(&self, channel: LogicalChannel) -> Option<Reliability> {
        self.reliabilities.get(channel.0 as usize).copied()
    }

    /// All data wire channels in ascending order.
    pub fn data_channels(&self) -> impl Iterator<Item = WireChannel> + '_ {
        (0..self.reliabilities.len()).map(|i| WireChannel(i as u8))
    }
}

impl Default for ChannelMap {
    /// Two data channels: reliable-ordered on 0, unreliable on 1.
    /// Control traffic lands on wire channel 2.
    fn default() -> Self {
        Self {
            reliabilities: vec![
                Reliability::ReliableOrdered,
                Reliability::Unreliable,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let map = ChannelMap::default();
        assert_eq!(map.data_channel_count(), 2);
        assert_eq!(map.control_channel(), WireChannel(2));
        assert_eq!(
            map.reliability(LogicalChannel::RELIABLE),
            Some(Reliability::ReliableOrdered)
        );
        assert_eq!(
            map.reliability(LogicalChannel::UNRELIABLE),
            Some(Reliability::Unreliable)
        );
    }

    #[test]
    fn test_control_channel_follows_data_channels() {
        let map = ChannelMap::new(vec![
            Reliability::ReliableOrdered,
            Reliability::ReliableUnordered,
            Reliability::Unreliable,
        ])
        .unwrap();
        assert_eq!(map.control_channel(), WireChannel(3));
        assert_eq!(map.logical_channel(WireChannel(3)), None);
    }

    #[test]
    fn test_logical_and_wire_channels_map_one_to_one() {
        let map = ChannelMap::default();
        for wire in map.data_channels() {
            let logical = map.logical_channel(wire).unwrap();
            assert_eq!(map.wire_channel(logical), Some(wire));
        }
    }

    #[test]
    fn test_unknown_logical_channel() {
        let map = ChannelMap::default();
        assert_eq!(map.wire_channel(LogicalChannel(9)), None);
        assert_eq!(map.reliability(LogicalChannel(9)), None);
    }

    #[test]
    fn test_empty_map_rejected() {
        let err = ChannelMap::new(Vec::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidChannelMap(_)));
    }

    #[test]
    fn test_oversized_map_rejected() {
        let err = ChannelMap::new(vec![Reliability::Unreliable; 255])
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidChannelMap(_)));

        let map = ChannelMap::new(vec![Reliability::Unreliable; 254]).unwrap();
        assert_eq!(map.control_channel(), WireChannel(254));
    }
}
