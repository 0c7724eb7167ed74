//! Shared types for syncroom.
//!
//! This crate contains the types shared across the syncroom workspace:
//! session and peer identifiers, participant roles, the peer-to-peer control
//! vocabulary, and the opaque upstream records the engine relays.

pub mod id;
pub mod message;
pub mod record;

pub use id::{IdError, PeerId, Role, SessionId};
pub use message::{PeerMessage, ProtocolVersion, TransportHello, PROTOCOL_VERSION};
pub use record::{RecordError, UpstreamRecord};
