//! The demultiplexing loop: relay wire traffic → handshake or connection.
//!
//! One [`Demultiplexer`] runs per local role, in its own task. Each sweep:
//!
//!   1. takes every pending relay event (session requests, closes);
//!   2. drains the control channel **completely**;
//!   3. takes up to `max_packets_per_sweep` packets from each data channel.
//!
//! A Connect or Disconnect never waits behind application traffic, and no
//! single data channel can take over a sweep.
//!
//! Nothing here returns an error. A bad packet is logged and dropped; a
//! broken connection never stops the loop or affects other peers.

use std::sync::Arc;
use std::time::Duration;

use relaylink_protocol::{
    ChannelMap, ControlMessage, LogicalChannel, PeerId, Reliability, Route,
};
use relaylink_session::{
    client_step, Admission, CloseReason, ConnectionTable, HandshakeState,
    PeerConnection, Role, SessionError,
};
use relaylink_transport::{InboundPacket, RelayEvent, RelaySession};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};

/// Counts from one [`Demultiplexer::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Relay events handled.
    pub events: usize,
    /// Control packets handled (including discarded ones).
    pub control: usize,
    /// Data packets handled (including dropped ones).
    pub data: usize,
    /// Packets discarded as malformed or from the wrong peer.
    pub discarded: usize,
}

impl SweepStats {
    /// Total packets and events seen in the sweep.
    pub fn total(&self) -> usize {
        self.events + self.control + self.data
    }
}

/// Routes inbound relay traffic for one local role.
pub struct Demultiplexer {
    role: Role,
    session: Arc<RelaySession>,
    table: Arc<ConnectionTable>,
    channels: Arc<ChannelMap>,
    max_packets_per_sweep: usize,
    /// Server: newly admitted connections go to the host through here.
    accepted: Option<mpsc::UnboundedSender<Arc<PeerConnection>>>,
}

impl Demultiplexer {
    /// Creates a demultiplexer. It does nothing until swept or run.
    pub fn new(
        role: Role,
        session: Arc<RelaySession>,
        table: Arc<ConnectionTable>,
        channels: Arc<ChannelMap>,
        max_packets_per_sweep: usize,
    ) -> Self {
        Self {
            role,
            session,
            table,
            channels,
            max_packets_per_sweep: max_packets_per_sweep.max(1),
            accepted: None,
        }
    }

    /// Hands every newly admitted connection to `tx`.
    pub fn with_accept_queue(
        mut self,
        tx: mpsc::UnboundedSender<Arc<PeerConnection>>,
    ) -> Self {
        self.accepted = Some(tx);
        self
    }

    /// Polls the relay every `period` until the relay session closes, then
    /// closes every remaining connection so pending receives end.
    ///
    /// The first poll is delayed by `jitter`; missed periods are skipped,
    /// never caught up in a burst.
    pub async fn run(self, period: Duration, jitter: Duration) {
        let mut ticker = time::interval_at(Instant::now() + jitter, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(role = ?self.role, ?period, "demultiplexer started");

        loop {
            tokio::select! {
                _ = self.session.closed() => break,
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        self.table.close_all(CloseReason::SessionClosed);
        tracing::debug!(role = ?self.role, "demultiplexer stopped");
    }

    /// One full pass over events, the control channel, and data channels.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();

        while let Some(event) = self.session.poll_event() {
            stats.events += 1;
            self.handle_event(event);
        }

        self.drain_control(&mut stats);

        for wire in self.channels.data_channels() {
            let Ok(Route::Data(channel)) = Route::classify(&self.channels, wire) else {
                continue;
            };
            for _ in 0..self.max_packets_per_sweep {
                let Some(packet) = self.session.try_receive(wire) else {
                    break;
                };
                stats.data += 1;
                self.handle_data(packet, channel, &mut stats);
            }
        }

        if stats.total() > 0 {
            tracing::trace!(?stats, "sweep complete");
        }
        stats
    }

    fn drain_control(&self, stats: &mut SweepStats) {
        let control = self.channels.control_channel();
        while let Some(packet) = self.session.try_receive(control) {
            stats.control += 1;
            self.handle_control(packet, stats);
        }
    }

    // -----------------------------------------------------------------
    // Relay events
    // -----------------------------------------------------------------

    fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::IncomingConnectionRequest { peer, socket_name } => {
                match self.role.validate_peer(peer) {
                    Ok(()) => {
                        tracing::debug!(%peer, %socket_name, "accepting relay session");
                        self.session.accept_peer(peer);
                    }
                    Err(e) => {
                        tracing::warn!(%peer, %socket_name, error = %e, "refusing relay session");
                        self.session.close_peer(peer);
                    }
                }
            }
            RelayEvent::ConnectionClosed { peer, code } => {
                let Some(conn) = self.table.get(peer) else {
                    tracing::debug!(%peer, %code, "relay closed session with unknown peer");
                    return;
                };
                tracing::info!(%peer, reason = %code, "relay closed peer session");
                conn.close(CloseReason::Relay(code));
            }
        }
    }

    // -----------------------------------------------------------------
    // Control channel
    // -----------------------------------------------------------------

    fn handle_control(&self, packet: InboundPacket, stats: &mut SweepStats) {
        let peer = packet.peer;
        if let Err(e) = self.role.validate_peer(peer) {
            tracing::warn!(%peer, error = %e, "control packet from unexpected peer discarded");
            stats.discarded += 1;
            return;
        }
        let msg = match ControlMessage::decode(&packet.payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed control packet discarded");
                stats.discarded += 1;
                return;
            }
        };
        tracing::debug!(%peer, %msg, "control message received");

        if self.role.is_server() {
            self.server_control(peer, msg);
        } else {
            self.client_control(peer, msg);
        }
    }

    fn server_control(&self, peer: PeerId, msg: ControlMessage) {
        match msg {
            ControlMessage::Connect => {
                match self.table.try_admit(peer, HandshakeState::Established) {
                    Ok(Admission::New(conn)) => {
                        if let Some(accepted) = &self.accepted {
                            if accepted.send(Arc::clone(&conn)).is_err() {
                                tracing::debug!(%peer, "no listener for accepted connections");
                            }
                        }
                        conn.send_control(ControlMessage::Accept);
                    }
                    Ok(Admission::Existing(_)) => {
                        tracing::debug!(%peer, "duplicate connect ignored");
                    }
                    Err(SessionError::Capacity(_)) => {
                        tracing::warn!(
                            %peer,
                            max = self.table.capacity(),
                            "server full, rejecting connect"
                        );
                        self.session.send(
                            peer,
                            self.channels.control_channel(),
                            Reliability::ReliableOrdered,
                            &ControlMessage::TooManyUsers.encode(),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "admission failed");
                    }
                }
            }
            ControlMessage::Disconnect => match self.table.get(peer) {
                Some(conn) => {
                    conn.close(CloseReason::RemoteDisconnect);
                }
                None => tracing::debug!(%peer, "disconnect from unknown peer ignored"),
            },
            ControlMessage::Accept | ControlMessage::TooManyUsers => {
                tracing::debug!(%peer, %msg, "client-bound control message ignored by server");
            }
        }
    }

    fn client_control(&self, peer: PeerId, msg: ControlMessage) {
        let Some(conn) = self.table.get(peer) else {
            tracing::debug!(%peer, %msg, "control message with no pending connection ignored");
            return;
        };
        match client_step(&conn.state(), msg) {
            Some(next) => {
                conn.apply(next);
            }
            None => {
                tracing::debug!(%peer, %msg, state = %conn.state(), "control message ignored in this state");
            }
        }
    }

    // -----------------------------------------------------------------
    // Data channels
    // -----------------------------------------------------------------

    fn handle_data(
        &self,
        packet: InboundPacket,
        channel: LogicalChannel,
        stats: &mut SweepStats,
    ) {
        let peer = packet.peer;
        if let Err(e) = self.role.validate_peer(peer) {
            tracing::warn!(%peer, error = %e, "data packet from unexpected peer discarded");
            stats.discarded += 1;
            return;
        }
        let Some(conn) = self.table.get(peer) else {
            tracing::trace!(%peer, %channel, "data from peer without a connection dropped");
            return;
        };

        // The Accept may have landed after this sweep drained control but
        // before this data packet; settle the handshake before routing.
        if conn.state() == HandshakeState::AwaitingAccept {
            self.drain_control(stats);
        }

        tracing::trace!(%peer, %channel, len = packet.payload.len(), "routing data");
        conn.deliver(channel, packet.payload);
    }
}

#[cfg(test)]
mod tests {
    use relaylink_protocol::WireChannel;
    use relaylink_session::ConnectionOptions;
    use relaylink_transport::MemoryHub;

    use super::*;

    const SERVER: PeerId = PeerId(1);
    const CONTROL: WireChannel = WireChannel(2);

    struct Harness {
        hub: MemoryHub,
        table: Arc<ConnectionTable>,
        demux: Demultiplexer,
        accepted: mpsc::UnboundedReceiver<Arc<PeerConnection>>,
    }

    fn server(max: usize) -> Harness {
        let hub = MemoryHub::new();
        let session = Arc::new(RelaySession::new(hub.relay()));
        session.open(SERVER).unwrap();
        let channels = Arc::new(ChannelMap::default());
        let table = ConnectionTable::new(
            max,
            Arc::clone(&session),
            Arc::clone(&channels),
            ConnectionOptions::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let demux = Demultiplexer::new(
            Role::Server,
            session,
            Arc::clone(&table),
            channels,
            256,
        )
        .with_accept_queue(tx);
        Harness {
            hub,
            table,
            demux,
            accepted: rx,
        }
    }

    fn peer(hub: &MemoryHub, id: u64) -> RelaySession {
        let session = RelaySession::new(hub.relay());
        session.open(PeerId(id)).unwrap();
        session
    }

    fn send_control(from: &RelaySession, msg: ControlMessage) {
        assert!(from.send(
            SERVER,
            CONTROL,
            Reliability::ReliableOrdered,
            &msg.encode()
        ));
    }

    fn control_reply(peer: &RelaySession) -> Option<ControlMessage> {
        peer.try_receive(CONTROL)
            .map(|p| ControlMessage::decode(&p.payload).unwrap())
    }

    #[test]
    fn test_connect_admits_and_accepts_once() {
        let mut h = server(2);
        let a = peer(&h.hub, 10);
        send_control(&a, ControlMessage::Connect);

        h.demux.sweep();
        assert_eq!(h.table.len(), 1);
        assert_eq!(control_reply(&a), Some(ControlMessage::Accept));
        assert_eq!(control_reply(&a), None);
        assert_eq!(h.accepted.try_recv().unwrap().peer_id(), PeerId(10));
    }

    #[test]
    fn test_duplicate_connect_is_noop() {
        let mut h = server(2);
        let a = peer(&h.hub, 10);
        send_control(&a, ControlMessage::Connect);
        send_control(&a, ControlMessage::Connect);

        h.demux.sweep();
        assert_eq!(h.table.len(), 1);
        assert_eq!(control_reply(&a), Some(ControlMessage::Accept));
        assert_eq!(control_reply(&a), None);
        assert!(h.accepted.try_recv().is_ok());
        assert!(h.accepted.try_recv().is_err());
    }

    #[test]
    fn test_full_table_rejects_without_creating() {
        let h = server(2);
        let peers: Vec<_> = (10..13).map(|id| peer(&h.hub, id)).collect();
        for p in &peers {
            send_control(p, ControlMessage::Connect);
        }

        h.demux.sweep();
        assert_eq!(h.table.len(), 2);
        assert_eq!(control_reply(&peers[0]), Some(ControlMessage::Accept));
        assert_eq!(control_reply(&peers[1]), Some(ControlMessage::Accept));
        assert_eq!(control_reply(&peers[2]), Some(ControlMessage::TooManyUsers));
        assert!(h.table.get(PeerId(12)).is_none());
    }

    #[test]
    fn test_malformed_control_discarded_and_loop_continues() {
        let h = server(2);
        let a = peer(&h.hub, 10);
        assert!(h.hub.inject(PeerId(10), SERVER, CONTROL, &[0, 0]));
        send_control(&a, ControlMessage::Connect);

        let stats = h.demux.sweep();
        assert_eq!(stats.control, 2);
        assert_eq!(stats.discarded, 1);
        assert_eq!(h.table.len(), 1);
        assert_eq!(control_reply(&a), Some(ControlMessage::Accept));
    }

    #[test]
    fn test_data_routed_to_connection_with_logical_channel() {
        let h = server(2);
        let a = peer(&h.hub, 10);
        send_control(&a, ControlMessage::Connect);
        h.demux.sweep();

        a.send(SERVER, WireChannel(1), Reliability::Unreliable, b"\x00\xffpos");
        h.demux.sweep();

        let conn = h.table.get(PeerId(10)).unwrap();
        assert_eq!(conn.queued(), 1);
    }

    #[test]
    fn test_data_from_unknown_peer_dropped() {
        let h = server(2);
        let stranger = peer(&h.hub, 99);
        stranger.send(SERVER, WireChannel(0), Reliability::ReliableOrdered, b"hi");
        let stats = h.demux.sweep();
        assert_eq!(stats.data, 1);
        assert!(h.table.is_empty());
    }

    #[test]
    fn test_disconnect_removes_peer() {
        let h = server(2);
        let a = peer(&h.hub, 10);
        send_control(&a, ControlMessage::Connect);
        h.demux.sweep();
        let conn = h.table.get(PeerId(10)).unwrap();

        send_control(&a, ControlMessage::Disconnect);
        h.demux.sweep();
        assert!(h.table.is_empty());
        assert!(!conn.is_connected());
        assert_eq!(
            conn.state(),
            HandshakeState::Closed(CloseReason::RemoteDisconnect)
        );
    }

    #[test]
    fn test_relay_close_event_closes_connection() {
        let h = server(2);
        let a = peer(&h.hub, 10);
        send_control(&a, ControlMessage::Connect);
        h.demux.sweep();
        let conn = h.table.get(PeerId(10)).unwrap();

        a.close();
        h.demux.sweep();
        assert!(h.table.is_empty());
        assert!(matches!(
            conn.state(),
            HandshakeState::Closed(CloseReason::Relay(_))
        ));
    }

    #[test]
    fn test_control_drained_before_data() {
        let h = server(2);
        let a = peer(&h.hub, 10);
        // Data first, then Connect: the Connect still wins because control
        // is drained before data, so the data finds an established peer.
        a.send(SERVER, WireChannel(0), Reliability::ReliableOrdered, b"early");
        send_control(&a, ControlMessage::Connect);

        h.demux.sweep();
        assert_eq!(h.table.get(PeerId(10)).unwrap().queued(), 1);
    }

    #[test]
    fn test_data_cap_per_sweep() {
        let hub = MemoryHub::new();
        let session = Arc::new(RelaySession::new(hub.relay()));
        session.open(SERVER).unwrap();
        let channels = Arc::new(ChannelMap::default());
        let table = ConnectionTable::new(
            1,
            Arc::clone(&session),
            Arc::clone(&channels),
            ConnectionOptions::default(),
        );
        let demux = Demultiplexer::new(Role::Server, session, table, channels, 2);

        let a = peer(&hub, 10);
        for _ in 0..5 {
            a.send(SERVER, WireChannel(0), Reliability::ReliableOrdered, b"x");
        }
        assert_eq!(demux.sweep().data, 2);
        assert_eq!(demux.sweep().data, 2);
        assert_eq!(demux.sweep().data, 1);
    }
}
