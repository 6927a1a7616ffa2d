//! One connection per remote peer.
//!
//! A [`PeerConnection`] is shared through an `Arc` by two parties:
//!
//! - the **demultiplexer**, which drives its handshake and pushes inbound
//!   data with [`deliver`](PeerConnection::deliver) (single producer);
//! - the **host framework**, which calls [`send`](PeerConnection::send),
//!   [`receive`](PeerConnection::receive) (single consumer) and
//!   [`disconnect`](PeerConnection::disconnect).
//!
//! The handshake state lives in a `watch` channel, so a pending `receive()`
//! wakes up the moment the connection stops being connected instead of
//! waiting for a packet that will never arrive.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use relaylink_protocol::{
    ChannelMap, ControlMessage, LogicalChannel, PeerId, Reliability,
};
use relaylink_transport::{Connection, RelaySession};
use tokio::sync::{mpsc, watch, Mutex};

use crate::{CloseReason, ConnectionTable, HandshakeState, SessionError};

/// A data payload waiting in a connection's inbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Sender.
    pub peer: PeerId,
    /// Logical channel it arrived on.
    pub channel: LogicalChannel,
    /// Payload, byte-for-byte as sent.
    pub payload: Vec<u8>,
}

/// Per-connection tunables, shared by every connection a table creates.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// How long to wait after sending Disconnect before tearing down the
    /// relay peer session.
    pub disconnect_grace: Duration,
    /// Inbound queue cap. `None` means unbounded.
    pub max_queued_messages: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            disconnect_grace: Duration::from_millis(100),
            max_queued_messages: None,
        }
    }
}

/// Traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Data packets handed to the relay.
    pub packets_sent: u64,
    /// Payload bytes handed to the relay.
    pub bytes_sent: u64,
    /// Data packets taken by the host framework.
    pub packets_received: u64,
    /// Payload bytes taken by the host framework.
    pub bytes_received: u64,
    /// Inbound packets dropped because the queue was full.
    pub dropped_inbound: u64,
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    dropped_inbound: AtomicU64,
}

/// A logical connection to one remote peer.
pub struct PeerConnection {
    peer: PeerId,
    session: Arc<RelaySession>,
    channels: Arc<ChannelMap>,
    options: ConnectionOptions,
    state: watch::Sender<HandshakeState>,
    inbound_tx: mpsc::UnboundedSender<QueuedMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    queued: AtomicUsize,
    /// Set once a close sequence (local or remote) has begun.
    closing: AtomicBool,
    counters: Counters,
    /// The table this connection lives in; weak to avoid a cycle.
    table: Weak<ConnectionTable>,
}

impl PeerConnection {
    /// Only [`ConnectionTable::try_admit`] builds connections.
    pub(crate) fn new(
        peer: PeerId,
        initial: HandshakeState,
        session: Arc<RelaySession>,
        channels: Arc<ChannelMap>,
        options: ConnectionOptions,
        table: Weak<ConnectionTable>,
    ) -> Self {
        let (state, _) = watch::channel(initial);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            peer,
            session,
            channels,
            options,
            state,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            queued: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            counters: Counters::default(),
            table,
        }
    }

    /// The remote peer's identity.
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// Snapshot of the current handshake state.
    pub fn state(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    /// Returns `true` while application traffic may flow.
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// Subscribes to handshake state changes.
    pub fn watch_state(&self) -> watch::Receiver<HandshakeState> {
        self.state.subscribe()
    }

    /// Number of messages waiting in the inbound queue.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Traffic counters.
    pub fn stats(&self) -> ConnectionStats {
        let c = &self.counters;
        ConnectionStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            dropped_inbound: c.dropped_inbound.load(Ordering::Relaxed),
        }
    }

    // -----------------------------------------------------------------
    // Host-facing operations
    // -----------------------------------------------------------------

    /// Sends `payload` on a logical channel.
    ///
    /// Relay-level failures are logged and otherwise ignored; the relay is
    /// fire-and-forget.
    ///
    /// # Errors
    /// - [`SessionError::NotConnected`] unless the handshake is established.
    /// - [`SessionError::UnknownChannel`] if `channel` isn't mapped.
    pub fn send(
        &self,
        channel: LogicalChannel,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected(self.peer));
        }
        let (wire, reliability) = self
            .channels
            .wire_channel(channel)
            .zip(self.channels.reliability(channel))
            .ok_or(SessionError::UnknownChannel(channel))?;

        if self.session.send(self.peer, wire, reliability, payload) {
            self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_sent
                .fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Waits for the next inbound message.
    ///
    /// Returns `None` (end-of-stream) as soon as the connection is not
    /// connected, including while a receive is already pending. Messages
    /// still queued at that point are never returned.
    pub async fn receive(&self) -> Option<QueuedMessage> {
        let mut state = self.state.subscribe();
        let mut inbound = self.inbound_rx.lock().await;

        loop {
            if !state.borrow_and_update().is_connected() {
                return None;
            }
            tokio::select! {
                // State first: a close must win over a racing packet.
                biased;
                changed = state.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
                msg = inbound.recv() => {
                    let msg = msg?;
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .bytes_received
                        .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
                    return Some(msg);
                }
            }
        }
    }

    /// Runs the local disconnect sequence exactly once:
    ///
    /// 1. stop accepting traffic and leave the connection table;
    /// 2. send Disconnect to the remote peer;
    /// 3. wait the grace period so the Disconnect has a chance to leave;
    /// 4. tear down the relay peer session and mark the state `Closed`.
    ///
    /// Concurrent or repeated calls wait for the first one to finish. If the
    /// first call is dropped during the grace period, step 4 still runs.
    pub async fn disconnect(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            let mut state = self.state.subscribe();
            let _ = state.wait_for(HandshakeState::is_closed).await;
            return;
        }
        if !self.transition(HandshakeState::Disconnecting) {
            // Nothing negotiated yet, or a remote close got there first.
            self.close(CloseReason::LocalDisconnect);
            return;
        }
        self.leave_table();

        // Finishes the sequence even if this future is dropped mid-grace.
        let _finish = FinishDisconnect(self);
        tracing::info!(peer = %self.peer, "disconnecting");
        self.send_control(ControlMessage::Disconnect);
        tokio::time::sleep(self.options.disconnect_grace).await;
    }

    // -----------------------------------------------------------------
    // Demultiplexer-facing operations
    // -----------------------------------------------------------------

    /// Pushes an inbound data packet onto the queue (single producer).
    ///
    /// Returns `false` if the packet was dropped: the connection isn't
    /// connected or the queue is at its cap.
    pub fn deliver(&self, channel: LogicalChannel, payload: Vec<u8>) -> bool {
        if !self.is_connected() {
            tracing::debug!(peer = %self.peer, %channel, "data for unconnected peer dropped");
            return false;
        }
        if let Some(max) = self.options.max_queued_messages {
            if self.queued() >= max {
                self.counters.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(peer = %self.peer, %channel, max, "inbound queue full, packet dropped");
                return false;
            }
        }

        let msg = QueuedMessage {
            peer: self.peer,
            channel,
            payload,
        };
        self.queued.fetch_add(1, Ordering::AcqRel);
        if self.inbound_tx.send(msg).is_err() {
            // The receiver lives in `self`; this only happens mid-drop.
            self.queued.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Sends a control message to the remote peer on the control channel.
    pub fn send_control(&self, msg: ControlMessage) -> bool {
        tracing::debug!(peer = %self.peer, %msg, "sending control message");
        self.session.send(
            self.peer,
            self.channels.control_channel(),
            Reliability::ReliableOrdered,
            &msg.encode(),
        )
    }

    /// Client side: sends Connect and moves `Idle → AwaitingAccept`.
    pub fn begin_handshake(&self) -> bool {
        if !self.transition(HandshakeState::AwaitingAccept) {
            return false;
        }
        self.send_control(ControlMessage::Connect);
        true
    }

    /// Applies a handshake transition computed elsewhere (`client_step`).
    /// Transitions into `Closed` go through [`close`](Self::close).
    pub fn apply(&self, next: HandshakeState) -> bool {
        match next {
            HandshakeState::Closed(reason) => self.close(reason),
            other => self.transition(other),
        }
    }

    /// Closes the connection without sending anything: the remote side
    /// already knows (it sent Disconnect, rejected us, or the relay dropped
    /// it), or there is nobody left to tell.
    ///
    /// Leaves the connection table, tears down the relay peer session, and
    /// wakes any pending `receive()`. Returns `false` if already closed.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.closing.store(true, Ordering::Release);
        let peer = self.peer;
        let closed = self.transition(HandshakeState::Closed(reason.clone()));
        if closed {
            tracing::info!(%peer, %reason, "connection closed");
            self.leave_table();
            self.close_relay_peer();
        }
        closed
    }

    fn leave_table(&self) {
        if let Some(table) = self.table.upgrade() {
            table.release(self);
        }
    }

    /// Tears down the relay peer session unless a newer connection for the
    /// same peer has been admitted in the meantime.
    fn close_relay_peer(&self) {
        match self.table.upgrade() {
            Some(table) => table.close_relay_peer(self),
            None => self.session.close_peer(self.peer),
        }
    }

    /// Moves to `next` if the transition is legal. Returns whether it did.
    fn transition(&self, next: HandshakeState) -> bool {
        let peer = self.peer;
        self.state.send_if_modified(|state| {
            if !state.can_transition_to(&next) {
                tracing::debug!(%peer, from = %state, to = %next, "ignored handshake transition");
                return false;
            }
            tracing::debug!(%peer, from = %state, to = %next, "handshake transition");
            *state = next;
            true
        })
    }
}

/// Tail of [`PeerConnection::disconnect`], run on drop.
struct FinishDisconnect<'a>(&'a PeerConnection);

impl Drop for FinishDisconnect<'_> {
    fn drop(&mut self) {
        let conn = self.0;
        if conn.state.borrow().is_closed() {
            return;
        }
        conn.close_relay_peer();
        conn.transition(HandshakeState::Closed(CloseReason::LocalDisconnect));
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("peer", &self.peer)
            .field("state", &*self.state.borrow())
            .field("queued", &self.queued())
            .finish()
    }
}

impl Connection for PeerConnection {
    type Error = SessionError;

    async fn send(
        &self,
        channel: LogicalChannel,
        data: &[u8],
    ) -> Result<(), Self::Error> {
        PeerConnection::send(self, channel, data)
    }

    async fn recv(
        &self,
    ) -> Result<Option<(Vec<u8>, LogicalChannel)>, Self::Error> {
        Ok(self.receive().await.map(|msg| (msg.payload, msg.channel)))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.disconnect().await;
        Ok(())
    }

    fn peer_id(&self) -> PeerId {
        self.peer
    }
}
