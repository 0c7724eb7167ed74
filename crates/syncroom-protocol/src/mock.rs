//! In-process loopback transport for testing.
//!
//! A [`MemoryNetwork`] is a shared switchboard; every [`MemoryTransport`]
//! created from it can claim ids, dial other transports and exchange
//! payloads without touching the OS. Tests drive failures through the
//! network handle: severing links and making ids unreachable.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use syncroom_types::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProtocolError;
use crate::transport::{PeerTransport, TransportEvent, TransportEvents, EVENT_CHANNEL_CAPACITY};

type LinkKey = (PeerId, PeerId);

fn link_key(a: &PeerId, b: &PeerId) -> LinkKey {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

#[derive(Default)]
struct NetworkState {
    routes: HashMap<PeerId, mpsc::Sender<TransportEvent>>,
    links: HashSet<LinkKey>,
    unreachable: HashSet<PeerId>,
    stalled: HashSet<PeerId>,
    sent: u64,
}

/// Shared switchboard for [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Create a transport attached to this network.
    pub fn transport(&self, local: PeerId) -> (MemoryTransport, TransportEvents) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = MemoryTransport {
            network: self.clone(),
            identity: Arc::new(Mutex::new(local)),
            events,
        };
        (transport, rx)
    }

    /// Drop the link between `a` and `b`, notifying both ends.
    pub async fn sever(&self, a: &PeerId, b: &PeerId) {
        let targets = {
            let mut state = self.state();
            if !state.links.remove(&link_key(a, b)) {
                return;
            }
            [
                (state.routes.get(a).cloned(), b.clone()),
                (state.routes.get(b).cloned(), a.clone()),
            ]
        };
        debug!(a = %a, b = %b, "severing link");
        for (route, gone) in targets {
            if let Some(route) = route {
                let _ = route.send(TransportEvent::PeerDisconnected(gone)).await;
            }
        }
    }

    /// Make dials towards `id` fail (or succeed again).
    pub fn set_unreachable(&self, id: &PeerId, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(id.clone());
        } else {
            state.unreachable.remove(id);
        }
    }

    /// Make sends towards `id` hang, as if it stopped reading.
    pub fn set_stalled(&self, id: &PeerId, stalled: bool) {
        let mut state = self.state();
        if stalled {
            state.stalled.insert(id.clone());
        } else {
            state.stalled.remove(id);
        }
    }

    /// Whether `a` and `b` currently share a link.
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state().links.contains(&link_key(a, b))
    }

    /// Total payloads delivered so far.
    pub fn delivered(&self) -> u64 {
        self.state().sent
    }
}

/// A [`PeerTransport`] living on a [`MemoryNetwork`].
///
/// Its identity starts as the id it was created with and becomes the claimed
/// id once [`PeerTransport::listen`] succeeds.
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    identity: Arc<Mutex<PeerId>>,
    events: mpsc::Sender<TransportEvent>,
}

impl MemoryTransport {
    fn identity(&self) -> PeerId {
        self.identity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn owns(&self, route: &mpsc::Sender<TransportEvent>) -> bool {
        route.same_channel(&self.events)
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.identity()
    }

    async fn listen(&self, id: &PeerId) -> Result<(), ProtocolError> {
        {
            let mut state = self.network.state();
            match state.routes.get(id).map(|route| self.owns(route)) {
                Some(false) => return Err(ProtocolError::AddressInUse(id.clone())),
                Some(true) => {}
                None => {
                    state.routes.insert(id.clone(), self.events.clone());
                }
            }
        }
        *self
            .identity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = id.clone();
        debug!(id = %id, "memory transport listening");
        Ok(())
    }

    async fn connect(&self, id: &PeerId) -> Result<(), ProtocolError> {
        let me = self.identity();
        let remote = {
            let mut state = self.network.state();
            if state.unreachable.contains(id) {
                return Err(ProtocolError::Unreachable(id.clone()));
            }
            let remote = state
                .routes
                .get(id)
                .cloned()
                .ok_or_else(|| ProtocolError::Unreachable(id.clone()))?;
            match state.routes.get(&me).map(|route| self.owns(route)) {
                Some(false) => {
                    return Err(ProtocolError::Handshake(format!(
                        "peer id {me} is already in use"
                    )));
                }
                Some(true) => {}
                None => {
                    state.routes.insert(me.clone(), self.events.clone());
                }
            }
            state.links.insert(link_key(&me, id));
            remote
        };
        let _ = remote.send(TransportEvent::PeerConnected(me)).await;
        let _ = self
            .events
            .send(TransportEvent::PeerConnected(id.clone()))
            .await;
        Ok(())
    }

    async fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), ProtocolError> {
        let me = self.identity();
        let (route, stalled) = {
            let mut state = self.network.state();
            if !state.links.contains(&link_key(&me, peer)) {
                return Err(ProtocolError::NotConnected(peer.clone()));
            }
            let route = state
                .routes
                .get(peer)
                .cloned()
                .ok_or_else(|| ProtocolError::NotConnected(peer.clone()))?;
            let stalled = state.stalled.contains(peer);
            if !stalled {
                state.sent += 1;
            }
            (route, stalled)
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        route
            .send(TransportEvent::Data { peer: me, data })
            .await
            .map_err(|_| ProtocolError::StreamClosed)
    }

    fn is_open(&self, peer: &PeerId) -> bool {
        let me = self.identity();
        self.network.state().links.contains(&link_key(&me, peer))
    }

    fn peers(&self) -> Vec<PeerId> {
        let me = self.identity();
        self.network
            .state()
            .links
            .iter()
            .filter_map(|(a, b)| {
                if *a == me {
                    Some(b.clone())
                } else if *b == me {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    async fn disconnect(&self, peer: &PeerId) {
        let me = self.identity();
        self.network.sever(&me, peer).await;
    }

    async fn close(&self) {
        let me = self.identity();
        for peer in self.peers() {
            self.network.sever(&me, &peer).await;
        }
        let mut state = self.network.state();
        state.routes.retain(|_, route| !route.same_channel(&self.events));
    }
}
