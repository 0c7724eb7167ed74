//! The peer transport capability the engine is written against.

use async_trait::async_trait;
use syncroom_types::PeerId;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ProtocolError;

/// Capacity of the event channel every transport hands out.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A link to `PeerId` is open (either direction).
    PeerConnected(PeerId),
    /// A payload arrived from a connected peer.
    Data { peer: PeerId, data: Vec<u8> },
    /// The link to `PeerId` went away.
    PeerDisconnected(PeerId),
}

/// Receiving half of a transport's event channel.
pub type TransportEvents = mpsc::Receiver<TransportEvent>;

/// Ordered, reliable, point-to-point links between named peers.
///
/// Implementations deliver [`TransportEvent`]s on the channel returned by
/// their constructor. Delivery is best effort: a `send` that returns `Ok`
/// may still be lost if the link drops right after.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Identity this transport presents to peers.
    fn local_id(&self) -> PeerId;

    /// Claim `id` and accept inbound links addressed to it.
    async fn listen(&self, id: &PeerId) -> Result<(), ProtocolError>;

    /// Open a link to the peer that claimed `id`.
    async fn connect(&self, id: &PeerId) -> Result<(), ProtocolError>;

    /// Send one payload to a connected peer.
    async fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), ProtocolError>;

    /// Send the same payload to every connected peer.
    ///
    /// A failure towards one peer does not stop delivery to the others.
    async fn broadcast(&self, data: Vec<u8>) -> Result<(), ProtocolError> {
        for peer in self.peers() {
            if let Err(e) = self.send(&peer, data.clone()).await {
                debug!(peer = %peer, error = %e, "broadcast send failed");
            }
        }
        Ok(())
    }

    /// Whether the link to `peer` is currently usable.
    fn is_open(&self, peer: &PeerId) -> bool;

    /// Currently linked peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Drop the link to `peer`, if any.
    async fn disconnect(&self, peer: &PeerId);

    /// Drop every link and stop accepting new ones.
    async fn close(&self);
}
