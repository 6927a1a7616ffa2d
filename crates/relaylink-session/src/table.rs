//! The connection table: peer id → connection, with admission control.
//!
//! [`ConnectionTable::try_admit`] is the *only* way a [`PeerConnection`]
//! comes into existence, which makes it the single enforcement point for
//! the maximum connection count. The capacity check and the insert happen
//! under one lock, so concurrent admissions and removals can't push the
//! table past its limit.
//!
//! Connections remove themselves (through a weak back-reference) the moment
//! they start closing, so a slot frees up without waiting for the grace
//! period of a local disconnect to run out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use relaylink_protocol::{ChannelMap, PeerId};
use relaylink_transport::RelaySession;
use tokio::task::JoinSet;

use crate::{
    CloseReason, ConnectionOptions, HandshakeState, PeerConnection,
    SessionError,
};

/// Result of a successful [`ConnectionTable::try_admit`].
#[derive(Debug, Clone)]
pub enum Admission {
    /// A new connection was created and inserted.
    New(Arc<PeerConnection>),
    /// The peer already had a connection; nothing changed.
    Existing(Arc<PeerConnection>),
}

impl Admission {
    /// The connection, new or existing.
    pub fn connection(&self) -> &Arc<PeerConnection> {
        match self {
            Self::New(conn) | Self::Existing(conn) => conn,
        }
    }

    /// Returns `true` if this admission created the connection.
    pub fn is_new(&self) -> bool {
        matches!(self, Self::New(_))
    }
}

/// Maps peer ids to their connection and enforces `max_connections`.
pub struct ConnectionTable {
    max_connections: usize,
    session: Arc<RelaySession>,
    channels: Arc<ChannelMap>,
    options: ConnectionOptions,
    connections: Mutex<HashMap<PeerId, Arc<PeerConnection>>>,
    /// Handed to each connection so it can remove itself.
    this: Weak<ConnectionTable>,
}

impl ConnectionTable {
    /// Creates an empty table. A `max_connections` of 0 is treated as 1.
    pub fn new(
        max_connections: usize,
        session: Arc<RelaySession>,
        channels: Arc<ChannelMap>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            max_connections: max_connections.max(1),
            session,
            channels,
            options,
            connections: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, Arc<PeerConnection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits `peer`, creating its connection in `initial` state.
    ///
    /// An already admitted peer is returned as [`Admission::Existing`]
    /// without touching the table, so a duplicate Connect is a no-op even
    /// when the table is full.
    ///
    /// # Errors
    /// Returns [`SessionError::Capacity`] if the table already holds
    /// `max_connections` entries. Nothing is created in that case.
    pub fn try_admit(
        &self,
        peer: PeerId,
        initial: HandshakeState,
    ) -> Result<Admission, SessionError> {
        let mut connections = self.lock();
        if let Some(existing) = connections.get(&peer) {
            return Ok(Admission::Existing(Arc::clone(existing)));
        }
        if connections.len() >= self.max_connections {
            return Err(SessionError::Capacity(peer));
        }

        let conn = Arc::new(PeerConnection::new(
            peer,
            initial,
            Arc::clone(&self.session),
            Arc::clone(&self.channels),
            self.options.clone(),
            self.this.clone(),
        ));
        connections.insert(peer, Arc::clone(&conn));
        tracing::info!(
            %peer,
            connections = connections.len(),
            max = self.max_connections,
            "peer admitted"
        );
        Ok(Admission::New(conn))
    }

    /// Looks up a peer's connection.
    pub fn get(&self, peer: PeerId) -> Option<Arc<PeerConnection>> {
        self.lock().get(&peer).cloned()
    }

    /// Removes a peer's entry and returns it. The connection itself is left
    /// as-is; callers decide how to close it.
    pub fn remove(&self, peer: PeerId) -> Option<Arc<PeerConnection>> {
        let removed = self.lock().remove(&peer);
        if removed.is_some() {
            tracing::debug!(%peer, "peer removed from connection table");
        }
        removed
    }

    /// Removes `conn`'s entry, but only if the table still maps its peer to
    /// this very connection (a newer connection for the same peer stays).
    pub(crate) fn release(&self, conn: &PeerConnection) {
        let peer = conn.peer_id();
        let mut connections = self.lock();
        let same = connections
            .get(&peer)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), conn));
        if same {
            connections.remove(&peer);
            tracing::debug!(%peer, "peer released its table slot");
        }
    }

    /// Closes the relay peer session behind `conn`, unless the table now
    /// maps its peer to a newer connection that still needs that session.
    ///
    /// The check and the close happen under the table lock, so a Connect
    /// admitted concurrently can't lose its session.
    pub(crate) fn close_relay_peer(&self, conn: &PeerConnection) {
        let peer = conn.peer_id();
        let connections = self.lock();
        let superseded = connections
            .get(&peer)
            .is_some_and(|entry| !std::ptr::eq(Arc::as_ptr(entry), conn));
        if superseded {
            tracing::debug!(%peer, "relay peer session kept for newer connection");
            return;
        }
        self.session.close_peer(peer);
    }

    /// Number of admitted connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no connection is admitted.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// The admission limit.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// A stable copy of the current connections.
    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.lock().values().cloned().collect()
    }

    /// Runs `action` on every connection.
    ///
    /// Iterates a snapshot taken up front, so `action` may remove entries
    /// (directly or by closing connections) without affecting the walk.
    pub fn for_each(&self, mut action: impl FnMut(&Arc<PeerConnection>)) {
        for conn in self.snapshot() {
            action(&conn);
        }
    }

    /// Runs the local disconnect sequence on every connection concurrently
    /// and waits for all of them.
    pub async fn disconnect_all(&self) {
        let mut tasks = JoinSet::new();
        self.for_each(|conn| {
            let conn = Arc::clone(conn);
            tasks.spawn(async move { conn.disconnect().await });
        });
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "disconnect task failed");
            }
        }
    }

    /// Closes every connection immediately, without sending anything.
    pub fn close_all(&self, reason: CloseReason) {
        self.for_each(|conn| {
            conn.close(reason.clone());
        });
    }
}

impl std::fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("len", &self.len())
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use relaylink_transport::MemoryHub;

    use super::*;

    fn table(max: usize) -> (MemoryHub, Arc<ConnectionTable>) {
        let hub = MemoryHub::new();
        let session = Arc::new(RelaySession::new(hub.relay()));
        session.open(PeerId(100)).unwrap();
        let table = ConnectionTable::new(
            max,
            session,
            Arc::new(ChannelMap::default()),
            ConnectionOptions {
                disconnect_grace: Duration::from_millis(10),
                max_queued_messages: None,
            },
        );
        (hub, table)
    }

    fn admit(table: &ConnectionTable, id: u64) -> Result<Admission, SessionError> {
        table.try_admit(PeerId(id), HandshakeState::Established)
    }

    #[test]
    fn test_admit_until_full_then_capacity_error() {
        let (_hub, table) = table(2);
        assert!(admit(&table, 1).unwrap().is_new());
        assert!(admit(&table, 2).unwrap().is_new());

        let err = admit(&table, 3).unwrap_err();
        assert!(matches!(err, SessionError::Capacity(PeerId(3))));
        assert_eq!(table.len(), 2);
        assert!(table.get(PeerId(3)).is_none());
    }

    #[test]
    fn test_duplicate_admit_returns_existing() {
        let (_hub, table) = table(1);
        let first = admit(&table, 1).unwrap();
        let second = admit(&table, 1).unwrap();
        assert!(!second.is_new());
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_zero_capacity_treated_as_one() {
        let (_hub, table) = table(0);
        assert_eq!(table.capacity(), 1);
        assert!(admit(&table, 1).is_ok());
    }

    #[test]
    fn test_closing_connection_releases_slot() {
        let (_hub, table) = table(1);
        let conn = admit(&table, 1).unwrap().connection().clone();
        assert!(conn.close(CloseReason::RemoteDisconnect));
        assert!(table.is_empty());
        assert!(admit(&table, 2).unwrap().is_new());
    }

    #[test]
    fn test_release_keeps_newer_connection_for_same_peer() {
        let (_hub, table) = table(2);
        let old = admit(&table, 1).unwrap().connection().clone();
        table.remove(PeerId(1));
        let new = admit(&table, 1).unwrap().connection().clone();

        old.close(CloseReason::RemoteDisconnect);
        let current = table.get(PeerId(1)).unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readmission_during_grace_keeps_relay_session() {
        let (hub, table) = table(1);
        let remote = RelaySession::new(hub.relay());
        remote.open(PeerId(1)).unwrap();
        let old = admit(&table, 1).unwrap().connection().clone();

        let leaving = {
            let old = Arc::clone(&old);
            tokio::spawn(async move { old.disconnect().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(table.is_empty(), "slot is released when disconnect starts");
        while remote.poll_event().is_some() {}

        let new = admit(&table, 1).unwrap().connection().clone();
        leaving.await.unwrap();

        assert_eq!(
            old.state(),
            HandshakeState::Closed(CloseReason::LocalDisconnect)
        );
        assert!(new.is_connected());
        assert!(Arc::ptr_eq(&table.get(PeerId(1)).unwrap(), &new));
        // The remote side never saw its relay session torn down.
        assert!(remote.poll_event().is_none());
    }

    #[test]
    fn test_for_each_tolerates_removal() {
        let (_hub, table) = table(3);
        for id in 1..=3 {
            admit(&table, id).unwrap();
        }
        let mut visited = 0;
        table.for_each(|conn| {
            visited += 1;
            conn.close(CloseReason::SessionClosed);
        });
        assert_eq!(visited, 3);
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_all_closes_everyone() {
        let (_hub, table) = table(3);
        let conns: Vec<_> = (1..=3)
            .map(|id| admit(&table, id).unwrap().connection().clone())
            .collect();

        table.disconnect_all().await;
        assert!(table.is_empty());
        for conn in conns {
            assert_eq!(
                conn.state(),
                HandshakeState::Closed(CloseReason::LocalDisconnect)
            );
        }
    }
}
