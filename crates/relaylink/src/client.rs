//! The client role: one connection to one host.

use std::sync::Arc;

use relaylink_protocol::PeerId;
use relaylink_session::{
    CloseReason, ConnectionTable, HandshakeState, PeerConnection, Role,
    SessionError,
};
use relaylink_transport::{Relay, RelaySession};
use tokio::task::JoinHandle;

use crate::demux::Demultiplexer;
use crate::{RelayConfig, RelaylinkError};

/// A connected client.
///
/// Created by [`RelayClient::connect`], which only returns once the host
/// has answered with Accept. The client owns its relay session; dropping it
/// (or calling [`shutdown`](Self::shutdown)) tears everything down.
pub struct RelayClient {
    host: PeerId,
    session: Arc<RelaySession>,
    conn: Arc<PeerConnection>,
    demux: JoinHandle<()>,
}

impl RelayClient {
    /// Opens a relay session as `local_id`, sends Connect to `host`, and
    /// waits up to `connect_timeout_secs` for the answer.
    ///
    /// # Errors
    /// - [`SessionError::Capacity`] if the host answered TooManyUsers.
    /// - [`SessionError::Timeout`] if no answer arrived in time.
    /// - [`SessionError::Closed`] if the host or relay ended the session
    ///   before the handshake completed.
    /// - Transport or protocol errors from opening the session.
    ///
    /// Every failure is reported exactly once, and the relay session is
    /// closed before returning.
    pub async fn connect(
        relay: impl Relay,
        local_id: PeerId,
        host: PeerId,
        config: RelayConfig,
    ) -> Result<Self, RelaylinkError> {
        let config = config.validated();
        let channels = Arc::new(config.channel_map()?);

        let session = Arc::new(RelaySession::new(relay));
        session.open(local_id)?;

        let table = ConnectionTable::new(
            1,
            Arc::clone(&session),
            Arc::clone(&channels),
            config.connection_options(),
        );
        let conn = match table.try_admit(host, HandshakeState::Idle) {
            Ok(admission) => Arc::clone(admission.connection()),
            Err(e) => {
                session.close();
                return Err(e.into());
            }
        };

        let demux = Demultiplexer::new(
            Role::Client { host },
            Arc::clone(&session),
            table,
            channels,
            config.max_packets_per_sweep,
        );
        let demux = tokio::spawn(demux.run(config.poll_interval(), config.poll_jitter()));

        tracing::info!(local = %local_id, %host, "connecting to host");
        let mut state = conn.watch_state();
        conn.begin_handshake();

        let timeout = config.connect_timeout();
        let outcome = tokio::time::timeout(
            timeout,
            state.wait_for(|s| s.is_connected() || s.is_closed()),
        )
        .await;

        let failure = match outcome {
            Ok(Ok(state)) => match &*state {
                HandshakeState::Established => None,
                HandshakeState::Closed(CloseReason::Rejected) => {
                    Some(SessionError::Capacity(host))
                }
                HandshakeState::Closed(reason) => Some(SessionError::Closed {
                    peer: host,
                    reason: reason.clone(),
                }),
                _ => None,
            },
            // The sender lives in `conn`, which we hold.
            Ok(Err(_)) => Some(SessionError::Closed {
                peer: host,
                reason: CloseReason::SessionClosed,
            }),
            Err(_) => {
                conn.close(CloseReason::TimedOut);
                Some(SessionError::Timeout {
                    peer: host,
                    after: timeout,
                })
            }
        };

        if let Some(err) = failure {
            tracing::warn!(local = %local_id, %host, error = %err, "connect failed");
            session.close();
            return Err(err.into());
        }

        tracing::info!(local = %local_id, %host, "connected to host");
        Ok(Self {
            host,
            session,
            conn,
            demux,
        })
    }

    /// The host this client is bound to.
    pub fn host(&self) -> PeerId {
        self.host
    }

    /// The connection to the host.
    pub fn connection(&self) -> &Arc<PeerConnection> {
        &self.conn
    }

    /// Returns `true` while connected to the host.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Runs the local disconnect sequence (the host gets a Disconnect).
    pub async fn disconnect(&self) {
        self.conn.disconnect().await;
    }

    /// Disconnects and closes the relay session.
    pub async fn shutdown(self) {
        self.conn.disconnect().await;
        self.session.close();
    }

    /// Returns `true` while the relay session and demultiplexer are alive.
    pub fn is_running(&self) -> bool {
        self.session.is_open() && !self.demux.is_finished()
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.session.close();
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("host", &self.host)
            .field("conn", &self.conn)
            .finish()
    }
}
