//! QUIC implementation of [`PeerTransport`].
//!
//! The listening side binds a UDP port derived from the id it claims, so any
//! participant that knows the session can compute where the host lives. Each
//! link is a single bidirectional stream of length-prefixed JSON frames; the
//! dialing side opens it with a [`TransportHello`] naming itself.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use quinn::{Connection, Endpoint};
use syncroom_types::{PeerId, TransportHello, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{FrameReceiver, FrameSender};
use crate::error::ProtocolError;
use crate::tls;
use crate::transport::{PeerTransport, TransportEvent, TransportEvents, EVENT_CHANNEL_CAPACITY};

/// Where listeners bind and dialers look.
#[derive(Debug, Clone)]
pub struct QuicSettings {
    /// Local interface the listening side binds to.
    pub bind_ip: IpAddr,
    /// Address of the machine running the host.
    pub host_ip: IpAddr,
    /// First port of the derived range.
    pub port_base: u16,
    /// Number of ports in the derived range.
    pub port_span: u16,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            host_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_base: 24900,
            port_span: 1000,
        }
    }
}

/// Map a peer id onto `[port_base, port_base + port_span)`.
///
/// FNV-1a keeps the mapping identical across builds and platforms.
pub fn derive_port(id: &PeerId, port_base: u16, port_span: u16) -> u16 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in id.as_str().bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let span = u32::from(port_span.max(1));
    let offset = u16::try_from(hash % span).unwrap_or(0);
    port_base.saturating_add(offset)
}

#[derive(Clone)]
struct Link {
    connection: Connection,
    sender: Arc<tokio::sync::Mutex<FrameSender>>,
}

struct Inner {
    local: PeerId,
    settings: QuicSettings,
    endpoint: tokio::sync::Mutex<Option<Endpoint>>,
    links: Mutex<HashMap<PeerId, Link>>,
    events: mpsc::Sender<TransportEvent>,
}

impl Inner {
    fn links(&self) -> MutexGuard<'_, HashMap<PeerId, Link>> {
        self.links
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn register(&self, peer: PeerId, connection: Connection, sender: FrameSender) {
        let link = Link {
            connection,
            sender: Arc::new(tokio::sync::Mutex::new(sender)),
        };
        let previous = self.links().insert(peer.clone(), link);
        if let Some(old) = previous {
            debug!(peer = %peer, "replacing stale link");
            old.connection.close(quinn::VarInt::from_u32(0), b"replaced");
        }
        let _ = self.events.send(TransportEvent::PeerConnected(peer)).await;
    }

    /// Forward frames until the stream ends, then retire the link.
    async fn read_loop(self: Arc<Self>, peer: PeerId, connection: Connection, mut rx: FrameReceiver) {
        loop {
            match rx.recv().await {
                Ok(Some(data)) => {
                    let event = TransportEvent::Data {
                        peer: peer.clone(),
                        data,
                    };
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "link read failed");
                    break;
                }
            }
        }

        let removed = {
            let mut links = self.links();
            let current = links
                .get(&peer)
                .is_some_and(|l| l.connection.stable_id() == connection.stable_id());
            if current {
                links.remove(&peer);
            }
            current
        };
        if removed {
            info!(peer = %peer, "link closed");
            let _ = self
                .events
                .send(TransportEvent::PeerDisconnected(peer))
                .await;
        }
    }

    async fn accept_loop(self: Arc<Self>, endpoint: Endpoint) {
        while let Some(incoming) = endpoint.accept().await {
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = inner.handle_incoming(incoming).await {
                    warn!(error = %e, "inbound link rejected");
                }
            });
        }
        debug!("accept loop finished");
    }

    async fn handle_incoming(self: Arc<Self>, incoming: quinn::Incoming) -> Result<(), ProtocolError> {
        let connection = incoming.await?;
        let (send, recv) = connection.accept_bi().await?;
        let mut rx = FrameReceiver::new(recv);

        let hello_bytes = rx.recv().await?.ok_or(ProtocolError::StreamClosed)?;
        let hello: TransportHello = serde_json::from_slice(&hello_bytes)
            .map_err(|e| ProtocolError::Handshake(format!("bad hello: {e}")))?;
        if hello.version.major != PROTOCOL_VERSION.major {
            connection.close(quinn::VarInt::from_u32(1), b"version");
            return Err(ProtocolError::VersionMismatch {
                remote: hello.version.to_string(),
                local: PROTOCOL_VERSION.to_string(),
            });
        }

        let peer = hello.peer_id;
        debug!(peer = %peer, remote = %connection.remote_address(), "accepted link");
        self.register(peer.clone(), connection.clone(), FrameSender::new(send))
            .await;
        self.read_loop(peer, connection, rx).await;
        Ok(())
    }
}

/// QUIC transport for syncroom peers.
#[derive(Clone)]
pub struct QuicTransport {
    inner: Arc<Inner>,
}

impl QuicTransport {
    /// Create a transport presenting `local` to peers.
    pub fn new(local: PeerId, settings: QuicSettings) -> (Self, TransportEvents) {
        // Install the default crypto provider if not already done
        let _ = rustls::crypto::ring::default_provider().install_default();

        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Inner {
            local,
            settings,
            endpoint: tokio::sync::Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Socket address a listener claiming `id` binds to.
    pub fn listen_addr(&self, id: &PeerId) -> SocketAddr {
        let s = &self.inner.settings;
        SocketAddr::new(s.bind_ip, derive_port(id, s.port_base, s.port_span))
    }

    /// Socket address a dialer uses to reach `id`.
    pub fn dial_addr(&self, id: &PeerId) -> SocketAddr {
        let s = &self.inner.settings;
        SocketAddr::new(s.host_ip, derive_port(id, s.port_base, s.port_span))
    }

    fn link(&self, peer: &PeerId) -> Option<Link> {
        self.inner.links().get(peer).cloned()
    }

    async fn client_endpoint(&self) -> Result<Endpoint, ProtocolError> {
        let mut slot = self.inner.endpoint.lock().await;
        if let Some(endpoint) = slot.as_ref() {
            return Ok(endpoint.clone());
        }
        let mut endpoint = Endpoint::client(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .map_err(|e| ProtocolError::Connection(e.to_string()))?;
        endpoint.set_default_client_config(tls::client_config()?);
        *slot = Some(endpoint.clone());
        Ok(endpoint)
    }
}

#[async_trait]
impl PeerTransport for QuicTransport {
    fn local_id(&self) -> PeerId {
        self.inner.local.clone()
    }

    async fn listen(&self, id: &PeerId) -> Result<(), ProtocolError> {
        let addr = self.listen_addr(id);
        let mut endpoint = Endpoint::server(tls::server_config()?, addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ProtocolError::AddressInUse(id.clone())
            } else {
                ProtocolError::Connection(e.to_string())
            }
        })?;
        endpoint.set_default_client_config(tls::client_config()?);

        *self.inner.endpoint.lock().await = Some(endpoint.clone());
        tokio::spawn(Arc::clone(&self.inner).accept_loop(endpoint));

        info!(id = %id, addr = %addr, "QUIC transport listening");
        Ok(())
    }

    async fn connect(&self, id: &PeerId) -> Result<(), ProtocolError> {
        let endpoint = self.client_endpoint().await?;
        let addr = self.dial_addr(id);
        let connection = endpoint
            .connect(addr, tls::SERVER_NAME)
            .map_err(|e| ProtocolError::Connection(e.to_string()))?
            .await?;
        let (send, recv) = connection.open_bi().await?;

        let mut sender = FrameSender::new(send);
        let hello = TransportHello {
            version: PROTOCOL_VERSION,
            peer_id: self.inner.local.clone(),
        };
        let hello_bytes =
            serde_json::to_vec(&hello).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        sender.send(&hello_bytes).await?;

        debug!(peer = %id, remote = %addr, "dialed peer");
        self.inner
            .register(id.clone(), connection.clone(), sender)
            .await;
        tokio::spawn(Arc::clone(&self.inner).read_loop(
            id.clone(),
            connection,
            FrameReceiver::new(recv),
        ));
        Ok(())
    }

    async fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), ProtocolError> {
        let link = self
            .link(peer)
            .ok_or_else(|| ProtocolError::NotConnected(peer.clone()))?;
        let mut sender = link.sender.lock().await;
        sender.send(&data).await
    }

    fn is_open(&self, peer: &PeerId) -> bool {
        self.link(peer)
            .is_some_and(|l| l.connection.close_reason().is_none())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.inner.links().keys().cloned().collect()
    }

    async fn disconnect(&self, peer: &PeerId) {
        let removed = self.inner.links().remove(peer);
        if let Some(link) = removed {
            link.connection.close(quinn::VarInt::from_u32(0), b"bye");
            let _ = self
                .inner
                .events
                .send(TransportEvent::PeerDisconnected(peer.clone()))
                .await;
        }
    }

    async fn close(&self) {
        let links: Vec<Link> = self.inner.links().drain().map(|(_, l)| l).collect();
        for link in links {
            link.connection.close(quinn::VarInt::from_u32(0), b"shutdown");
        }
        if let Some(endpoint) = self.inner.endpoint.lock().await.take() {
            endpoint.close(quinn::VarInt::from_u32(0), b"shutdown");
        }
        info!("QUIC transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncroom_types::SessionId;

    #[test]
    fn derived_port_is_stable_and_in_range() {
        let session = SessionId::new("movie-night").unwrap();
        let id = PeerId::host_for(&session);
        let a = derive_port(&id, 24900, 1000);
        let b = derive_port(&id, 24900, 1000);
        assert_eq!(a, b);
        assert!((24900..25900).contains(&a));
    }

    #[test]
    fn different_sessions_usually_differ() {
        let a = PeerId::host_for(&SessionId::new("alpha").unwrap());
        let b = PeerId::host_for(&SessionId::new("bravo").unwrap());
        assert_ne!(derive_port(&a, 24900, 1000), derive_port(&b, 24900, 1000));
    }

    #[test]
    fn zero_span_collapses_to_base() {
        let id = PeerId::new("x");
        assert_eq!(derive_port(&id, 30000, 0), 30000);
    }
}
