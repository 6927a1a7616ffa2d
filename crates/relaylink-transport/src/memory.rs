//! In-process relay backend.
//!
//! [`MemoryHub`] plays the part of the relay service: every
//! [`MemoryRelay`] created from the same hub can reach every other one by
//! [`PeerId`]. Packets sit in per-peer, per-wire-channel FIFO queues until
//! the receiver polls them, which mirrors how a real relay buffers traffic
//! for a non-blocking receive call.
//!
//! Relay-level session behaviour is modelled too:
//! - the first packet from a peer we've never talked to raises
//!   [`RelayEvent::IncomingConnectionRequest`] at the receiver;
//! - closing a peer session (or the whole session) raises
//!   [`RelayEvent::ConnectionClosed`] at the remote side.
//!
//! An optional loss rate drops a fraction of *unreliable* packets, which is
//! handy for exercising code paths that must tolerate loss.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use relaylink_protocol::{PeerId, Reliability, WireChannel};
use tokio::sync::mpsc;

use crate::{InboundPacket, Relay, RelayCloseCode, RelayEvent, TransportError};

/// Socket name reported with incoming connection requests.
const SOCKET_NAME: &str = "memory";

struct Endpoint {
    queues: HashMap<WireChannel, VecDeque<InboundPacket>>,
    events: mpsc::UnboundedSender<RelayEvent>,
    /// Peers we currently have a relay-level session with.
    sessions: HashSet<PeerId>,
}

impl Endpoint {
    fn notify(&self, event: RelayEvent) {
        // The receiver is gone only while the owning session is closing.
        let _ = self.events.send(event);
    }
}

struct HubState {
    endpoints: HashMap<PeerId, Endpoint>,
    loss_rate: f64,
}

/// A shared in-memory relay. Cheap to clone; clones share the same network.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Creates a lossless hub.
    pub fn new() -> Self {
        Self::with_loss_rate(0.0)
    }

    /// Creates a hub that drops `loss_rate` (0.0–1.0) of unreliable packets.
    pub fn with_loss_rate(loss_rate: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                endpoints: HashMap::new(),
                loss_rate: loss_rate.clamp(0.0, 1.0),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a relay handle attached to this hub. It has no identity
    /// until its session is opened.
    pub fn relay(&self) -> MemoryRelay {
        MemoryRelay {
            hub: self.clone(),
            local: Mutex::new(None),
        }
    }

    /// Returns `true` if a session is open for `peer`.
    pub fn is_online(&self, peer: PeerId) -> bool {
        self.lock().endpoints.contains_key(&peer)
    }

    /// Number of packets waiting for `peer` on `wire`.
    pub fn queued(&self, peer: PeerId, wire: WireChannel) -> usize {
        self.lock()
            .endpoints
            .get(&peer)
            .and_then(|ep| ep.queues.get(&wire))
            .map_or(0, VecDeque::len)
    }

    /// Places a raw packet in `to`'s queue as if `from` had sent it,
    /// bypassing loss and session bookkeeping. Returns `false` if `to` is
    /// offline.
    pub fn inject(
        &self,
        from: PeerId,
        to: PeerId,
        wire: WireChannel,
        payload: &[u8],
    ) -> bool {
        let mut state = self.lock();
        let Some(endpoint) = state.endpoints.get_mut(&to) else {
            return false;
        };
        endpoint.queues.entry(wire).or_default().push_back(InboundPacket {
            peer: from,
            wire,
            payload: payload.to_vec(),
        });
        true
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant on a [`MemoryHub`].
pub struct MemoryRelay {
    hub: MemoryHub,
    local: Mutex<Option<PeerId>>,
}

impl MemoryRelay {
    fn local(&self) -> Option<PeerId> {
        *self.local.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Relay for MemoryRelay {
    fn open_session(
        &self,
        local_id: PeerId,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>, TransportError> {
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.hub.lock();
        if local.is_some() || state.endpoints.contains_key(&local_id) {
            return Err(TransportError::AlreadyOpen);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.endpoints.insert(
            local_id,
            Endpoint {
                queues: HashMap::new(),
                events: tx,
                sessions: HashSet::new(),
            },
        );
        *local = Some(local_id);
        tracing::debug!(%local_id, "memory relay endpoint registered");
        Ok(rx)
    }

    fn close_session(&self) {
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(local_id) = local.take() else {
            return;
        };
        let mut state = self.hub.lock();
        let Some(endpoint) = state.endpoints.remove(&local_id) else {
            return;
        };
        for peer in endpoint.sessions {
            if let Some(remote) = state.endpoints.get_mut(&peer) {
                if remote.sessions.remove(&local_id) {
                    remote.notify(RelayEvent::ConnectionClosed {
                        peer: local_id,
                        code: RelayCloseCode::ClosedByPeer,
                    });
                }
            }
        }
        tracing::debug!(%local_id, "memory relay endpoint removed");
    }

    fn send_packet(
        &self,
        peer: PeerId,
        wire: WireChannel,
        reliability: Reliability,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let local_id = self.local().ok_or(TransportError::NotOpen)?;
        let mut state = self.hub.lock();

        if !state.endpoints.contains_key(&peer) {
            return Err(TransportError::SendFailed {
                peer,
                reason: "peer is not online".into(),
            });
        }

        if let Some(me) = state.endpoints.get_mut(&local_id) {
            me.sessions.insert(peer);
        }

        let lost = !reliability.is_reliable()
            && state.loss_rate > 0.0
            && rand::rng().random_bool(state.loss_rate);

        let Some(remote) = state.endpoints.get_mut(&peer) else {
            return Ok(());
        };
        if remote.sessions.insert(local_id) {
            remote.notify(RelayEvent::IncomingConnectionRequest {
                peer: local_id,
                socket_name: SOCKET_NAME.to_string(),
            });
        }
        if lost {
            tracing::trace!(from = %local_id, to = %peer, %wire, "simulated packet loss");
            return Ok(());
        }
        remote.queues.entry(wire).or_default().push_back(InboundPacket {
            peer: local_id,
            wire,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn try_receive(
        &self,
        wire: WireChannel,
    ) -> Result<Option<InboundPacket>, TransportError> {
        let local_id = self.local().ok_or(TransportError::NotOpen)?;
        let mut state = self.hub.lock();
        let endpoint = state
            .endpoints
            .get_mut(&local_id)
            .ok_or(TransportError::NotOpen)?;
        Ok(endpoint.queues.get_mut(&wire).and_then(VecDeque::pop_front))
    }

    fn accept_peer(&self, peer: PeerId) -> Result<(), TransportError> {
        let local_id = self.local().ok_or(TransportError::NotOpen)?;
        let mut state = self.hub.lock();
        if let Some(me) = state.endpoints.get_mut(&local_id) {
            me.sessions.insert(peer);
        }
        Ok(())
    }

    fn close_peer(&self, peer: PeerId) {
        let Some(local_id) = self.local() else {
            return;
        };
        let mut state = self.hub.lock();
        if let Some(me) = state.endpoints.get_mut(&local_id) {
            me.sessions.remove(&peer);
            // Anything still buffered from that peer is stale now.
            for queue in me.queues.values_mut() {
                queue.retain(|packet| packet.peer != peer);
            }
        }
        if let Some(remote) = state.endpoints.get_mut(&peer) {
            if remote.sessions.remove(&local_id) {
                remote.notify(RelayEvent::ConnectionClosed {
                    peer: local_id,
                    code: RelayCloseCode::ClosedByPeer,
                });
            }
        }
    }
}
