//! The local peer's registration with the relay.
//!
//! A [`RelaySession`] is an explicitly constructed value wrapping one
//! [`Relay`] handle. It is shared (via `Arc`) by the demultiplexer and by
//! every connection, and its lifetime is the lifetime of the local role:
//! closing it is the cancellation signal for everything built on top.
//!
//! ```text
//!   new() ──open(id)──→ [Open] ──close()──→ [Closed] ──open(id)──→ [Open]
//!                         │  ↑
//!                  open() │  │ AlreadyOpen
//!                         └──┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relaylink_protocol::{PeerId, Reliability, WireChannel};
use tokio::sync::{mpsc, watch};

use crate::{InboundPacket, Relay, RelayEvent, TransportError};

#[derive(Default)]
struct SessionInner {
    local_id: Option<PeerId>,
    events: Option<mpsc::UnboundedReceiver<RelayEvent>>,
}

/// Owns the lifetime of the local peer's relay registration.
pub struct RelaySession {
    relay: Arc<dyn Relay>,
    inner: Mutex<SessionInner>,
    /// `true` while open. Waiters on [`closed`](Self::closed) watch this.
    open: watch::Sender<bool>,
}

impl RelaySession {
    /// Wraps a relay backend. The session starts closed.
    pub fn new(relay: impl Relay) -> Self {
        Self::from_arc(Arc::new(relay))
    }

    /// Wraps an already shared relay backend.
    pub fn from_arc(relay: Arc<dyn Relay>) -> Self {
        let (open, _) = watch::channel(false);
        Self {
            relay,
            inner: Mutex::new(SessionInner::default()),
            open,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `local_id` with the relay and subscribes to its events.
    ///
    /// # Errors
    /// - [`TransportError::AlreadyOpen`] if called twice without `close`.
    /// - Any error the backend reports while opening.
    pub fn open(&self, local_id: PeerId) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if inner.local_id.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        let events = self.relay.open_session(local_id)?;
        inner.local_id = Some(local_id);
        inner.events = Some(events);
        drop(inner);

        self.open.send_replace(true);
        tracing::info!(local = %local_id, "relay session opened");
        Ok(())
    }

    /// Unregisters from the relay. Calling it on a closed session is a no-op.
    pub fn close(&self) {
        let mut inner = self.lock();
        let Some(local_id) = inner.local_id.take() else {
            return;
        };
        inner.events = None;
        drop(inner);

        self.relay.close_session();
        self.open.send_replace(false);
        tracing::info!(local = %local_id, "relay session closed");
    }

    /// Returns `true` between a successful `open` and the next `close`.
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// The local peer identity, while open.
    pub fn local_id(&self) -> Option<PeerId> {
        self.lock().local_id
    }

    /// Resolves once the session is closed (immediately if it already is).
    pub async fn closed(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so this can't fail while we borrow it.
        let _ = rx.wait_for(|open| !*open).await;
    }

    /// Sends one packet. Failures are logged and reported as `false`; the
    /// caller is not expected to act on them.
    pub fn send(
        &self,
        peer: PeerId,
        wire: WireChannel,
        reliability: Reliability,
        payload: &[u8],
    ) -> bool {
        if !self.is_open() {
            tracing::debug!(%peer, %wire, "send on closed relay session dropped");
            return false;
        }
        match self.relay.send_packet(peer, wire, reliability, payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%peer, %wire, error = %e, "relay send failed");
                false
            }
        }
    }

    /// Pops the next packet queued on `wire`, without blocking.
    ///
    /// Backend errors are treated as transient: logged, and reported as
    /// "nothing available" so the caller simply polls again later.
    pub fn try_receive(&self, wire: WireChannel) -> Option<InboundPacket> {
        if !self.is_open() {
            return None;
        }
        match self.relay.try_receive(wire) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(%wire, error = %e, "relay receive failed");
                None
            }
        }
    }

    /// Takes the next pending relay event, without blocking.
    pub fn poll_event(&self) -> Option<RelayEvent> {
        self.lock().events.as_mut()?.try_recv().ok()
    }

    /// Accepts a relay-level session request. Returns `false` on failure.
    pub fn accept_peer(&self, peer: PeerId) -> bool {
        match self.relay.accept_peer(peer) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "relay refused session accept");
                false
            }
        }
    }

    /// Tears down the relay-level session with one peer.
    pub fn close_peer(&self, peer: PeerId) {
        if self.is_open() {
            self.relay.close_peer(peer);
        }
    }
}

impl Drop for RelaySession {
    fn drop(&mut self) {
        self.close();
    }
}
