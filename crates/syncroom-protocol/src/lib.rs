//! Peer transport layer and wire protocol for syncroom.
//!
//! This crate defines the [`PeerTransport`] capability the engine is written
//! against, the JSON codec for the peer control vocabulary, and a QUIC
//! implementation (via quinn) where the host's address is derived from the
//! session it serves. An in-memory implementation for tests lives behind the
//! `mock` feature.

pub mod connection;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod quic;
pub mod tls;
pub mod transport;
pub mod wire;

pub use error::ProtocolError;
pub use quic::{derive_port, QuicSettings, QuicTransport};
pub use transport::{PeerTransport, TransportEvent, TransportEvents};
pub use wire::{decode_message, encode_message};
