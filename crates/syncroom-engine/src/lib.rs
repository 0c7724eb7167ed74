//! Peer orchestration and synchronisation engine for syncroom.
//!
//! One host and any number of followers share a time-sensitive session. The
//! host owns the session state and timing: it onboards each follower (clock
//! priming, registration, replay of the session snapshot), relays upstream
//! records, and runs the start and completion barriers. Followers keep a link
//! to the host, estimate their clock offset against it and answer the
//! barriers.
//!
//! The engine is written against three collaborators: a
//! [`syncroom_protocol::PeerTransport`], a [`PlaybackSurface`] and an
//! [`upstream`] channel pair.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
mod follower;
pub mod gate;
pub mod handshake;
mod host;
pub mod relay;
pub mod setup;
pub mod snapshot;
pub mod state;
pub mod surface;
pub mod upstream;

pub use clock::{ClockSync, MonotonicClock, TimeSource};
pub use config::Config;
pub use engine::Engine;
pub use error::EngineError;
pub use events::{EngineStatus, SessionEvent};
pub use state::PeerStatus;
pub use surface::{ManualSurface, PlaybackSurface};
pub use upstream::{UpstreamHandle, UpstreamLink};
