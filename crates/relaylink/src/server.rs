//! `RelayServer` builder and the server role.
//!
//! This is the entry point for hosting: it ties together all the layers:
//! relay session → demultiplexer → connection table → host framework.

use std::sync::Arc;

use relaylink_protocol::{LogicalChannel, PeerId, Reliability};
use relaylink_session::{ConnectionTable, PeerConnection, Role};
use relaylink_transport::{Relay, RelaySession, Transport, TransportError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::demux::Demultiplexer;
use crate::{RelayConfig, RelaylinkError};

/// Builder for configuring and starting a [`RelayServer`].
///
/// # Example
///
/// ```rust
/// use relaylink::prelude::*;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), RelaylinkError> {
/// let hub = MemoryHub::new();
/// let server = RelayServer::builder()
///     .max_connections(8)
///     .listen(hub.relay(), PeerId(1))
///     .await?;
/// assert_eq!(server.connection_count(), 0);
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct RelayServerBuilder {
    config: RelayConfig,
}

impl RelayServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the maximum number of simultaneously connected peers.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Sets the logical channel list.
    pub fn channels(mut self, channels: Vec<Reliability>) -> Self {
        self.config.channels = channels;
        self
    }

    /// Opens a relay session as `local_id` and starts demultiplexing.
    ///
    /// # Errors
    /// - [`TransportError::AlreadyOpen`] (wrapped) if the relay refuses the
    ///   identity.
    /// - A protocol error if the channel map can't be built.
    pub async fn listen(
        self,
        relay: impl Relay,
        local_id: PeerId,
    ) -> Result<RelayServer, RelaylinkError> {
        let config = self.config.validated();
        let channels = Arc::new(config.channel_map()?);

        let session = Arc::new(RelaySession::new(relay));
        session.open(local_id)?;

        let table = ConnectionTable::new(
            config.max_connections,
            Arc::clone(&session),
            Arc::clone(&channels),
            config.connection_options(),
        );

        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let demux = Demultiplexer::new(
            Role::Server,
            Arc::clone(&session),
            Arc::clone(&table),
            channels,
            config.max_packets_per_sweep,
        )
        .with_accept_queue(accepted_tx);
        let demux = tokio::spawn(demux.run(config.poll_interval(), config.poll_jitter()));

        tracing::info!(
            local = %local_id,
            max_connections = config.max_connections,
            channels = config.channels.len(),
            "relay server listening"
        );

        Ok(RelayServer {
            local_id,
            session,
            table,
            accepted: accepted_rx,
            demux,
            config,
        })
    }
}

/// A running server role.
///
/// Admitted connections are handed out by [`accept`](Self::accept), in the
/// order the Connect messages were processed.
pub struct RelayServer {
    local_id: PeerId,
    session: Arc<RelaySession>,
    table: Arc<ConnectionTable>,
    accepted: mpsc::UnboundedReceiver<Arc<PeerConnection>>,
    demux: JoinHandle<()>,
    config: RelayConfig,
}

impl RelayServer {
    /// Creates a new builder.
    pub fn builder() -> RelayServerBuilder {
        RelayServerBuilder::new()
    }

    /// The identity this server listens as.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The effective (validated) configuration.
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Waits for the next admitted connection.
    ///
    /// A connection that closed before it was taken is still returned; its
    /// `receive()` simply ends right away. Returns `None` once the server
    /// has shut down.
    pub async fn accept(&mut self) -> Option<Arc<PeerConnection>> {
        if !self.session.is_open() {
            return None;
        }
        tokio::select! {
            conn = self.accepted.recv() => conn,
            _ = self.session.closed() => None,
        }
    }

    /// Looks up a connected peer.
    pub fn connection(&self, peer: PeerId) -> Option<Arc<PeerConnection>> {
        self.table.get(peer)
    }

    /// Number of admitted connections.
    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// The underlying connection table.
    pub fn table(&self) -> &Arc<ConnectionTable> {
        &self.table
    }

    /// Runs the local disconnect sequence for one peer.
    /// Returns `false` if the peer wasn't connected.
    pub async fn disconnect(&self, peer: PeerId) -> bool {
        let Some(conn) = self.table.get(peer) else {
            return false;
        };
        conn.disconnect().await;
        true
    }

    /// Sends `payload` to every connected peer. Returns how many sends were
    /// accepted; peers that fail (e.g. mid-close) are skipped.
    pub fn broadcast(&self, channel: LogicalChannel, payload: &[u8]) -> usize {
        let mut sent = 0;
        self.table.for_each(|conn| match conn.send(channel, payload) {
            Ok(()) => sent += 1,
            Err(e) => tracing::debug!(peer = %conn.peer_id(), error = %e, "broadcast skipped peer"),
        });
        sent
    }

    /// Disconnects every peer, then closes the relay session. The
    /// demultiplexer stops on its own once the session is closed.
    pub async fn shutdown(&self) {
        tracing::info!(local = %self.local_id, connections = self.table.len(), "relay server shutting down");
        self.table.disconnect_all().await;
        self.session.close();
    }

    /// Returns `true` until [`shutdown`](Self::shutdown) (or drop).
    pub fn is_running(&self) -> bool {
        self.session.is_open() && !self.demux.is_finished()
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        // The demultiplexer task holds the session; closing it is what lets
        // that task finish.
        self.session.close();
    }
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_id", &self.local_id)
            .field("table", &self.table)
            .finish()
    }
}

impl Transport for RelayServer {
    type Connection = Arc<PeerConnection>;
    type Error = RelaylinkError;

    async fn accept(&mut self) -> Result<Self::Connection, Self::Error> {
        RelayServer::accept(self)
            .await
            .ok_or(RelaylinkError::Transport(TransportError::Shutdown))
    }

    async fn shutdown(&self) -> Result<(), Self::Error> {
        RelayServer::shutdown(self).await;
        Ok(())
    }
}
