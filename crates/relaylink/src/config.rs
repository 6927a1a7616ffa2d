//! Runtime configuration shared by the client and server roles.

use std::time::Duration;

use rand::Rng;
use relaylink_protocol::{ChannelMap, ProtocolError, Reliability};
use relaylink_session::ConnectionOptions;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RelaylinkError;

/// Configuration for a relaylink role.
///
/// Every field has a default, so a JSON config only needs to name what it
/// changes:
///
/// ```rust
/// use relaylink::RelayConfig;
///
/// let config = RelayConfig::from_json_str(r#"{ "max_connections": 16 }"#)
///     .unwrap();
/// assert_eq!(config.max_connections, 16);
/// assert_eq!(config.connect_timeout_secs, 25);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long a client waits for Accept. Values below 1 act as 1.
    pub connect_timeout_secs: u64,

    /// Server only: how many peers may be connected at once.
    pub max_connections: usize,

    /// Reliability class of each logical channel, by index. The control
    /// channel is placed right after the last entry.
    pub channels: Vec<Reliability>,

    /// Wait after sending Disconnect before tearing down the relay peer
    /// session, so the Disconnect has a chance to leave.
    pub disconnect_grace_ms: u64,

    /// Period of the demultiplexer's polling loop.
    pub poll_interval_ms: u64,

    /// Upper bound on packets taken from one data channel per sweep.
    /// The control channel is always drained completely.
    pub max_packets_per_sweep: usize,

    /// Inbound queue cap per connection. `None` = unbounded.
    pub max_queued_messages: Option<usize>,

    /// Random offset (0..n µs) added to the first poll so roles started
    /// together don't poll in lock-step.
    pub poll_jitter_us: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 25,
            max_connections: 4,
            channels: vec![Reliability::ReliableOrdered, Reliability::Unreliable],
            disconnect_grace_ms: 100,
            poll_interval_ms: 1,
            max_packets_per_sweep: 256,
            max_queued_messages: None,
            poll_jitter_us: 500,
        }
    }
}

impl RelayConfig {
    /// Parses a JSON configuration and validates it.
    ///
    /// # Errors
    /// Returns [`RelaylinkError::Config`] if the JSON is malformed or has
    /// fields of the wrong type.
    pub fn from_json_str(json: &str) -> Result<Self, RelaylinkError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    /// Clamp and fix any out-of-range values so the config is safe to use.
    ///
    /// Rules:
    /// - `connect_timeout_secs`, `max_connections`, `poll_interval_ms` and
    ///   `max_packets_per_sweep` are at least 1.
    /// - An empty channel list falls back to the default list.
    /// - At most [`ChannelMap::MAX_DATA_CHANNELS`] channels are kept.
    pub fn validated(mut self) -> Self {
        if self.connect_timeout_secs == 0 {
            warn!("connect_timeout_secs is 0, using 1");
            self.connect_timeout_secs = 1;
        }
        if self.max_connections == 0 {
            warn!("max_connections is 0, using 1");
            self.max_connections = 1;
        }
        if self.poll_interval_ms == 0 {
            warn!("poll_interval_ms is 0, using 1");
            self.poll_interval_ms = 1;
        }
        if self.max_packets_per_sweep == 0 {
            warn!("max_packets_per_sweep is 0, using 1");
            self.max_packets_per_sweep = 1;
        }
        if self.channels.is_empty() {
            warn!("no channels configured, using defaults");
            self.channels = Self::default().channels;
        }
        if self.channels.len() > ChannelMap::MAX_DATA_CHANNELS {
            warn!(
                configured = self.channels.len(),
                max = ChannelMap::MAX_DATA_CHANNELS,
                "too many channels, truncating"
            );
            self.channels.truncate(ChannelMap::MAX_DATA_CHANNELS);
        }
        self
    }

    /// Effective connect timeout (never below one second).
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// Effective polling period (never zero).
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Disconnect grace period.
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// A random first-poll offset drawn from `0..poll_jitter_us`.
    pub fn poll_jitter(&self) -> Duration {
        if self.poll_jitter_us == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..self.poll_jitter_us))
    }

    /// Builds the wire channel map.
    ///
    /// # Errors
    /// Returns [`ProtocolError::InvalidChannelMap`] for an empty or
    /// oversized channel list (never after [`validated`](Self::validated)).
    pub fn channel_map(&self) -> Result<ChannelMap, ProtocolError> {
        ChannelMap::new(self.channels.clone())
    }

    /// Per-connection options derived from this config.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            disconnect_grace: self.disconnect_grace(),
            max_queued_messages: self.max_queued_messages,
        }
    }
}
