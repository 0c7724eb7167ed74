//! What the engine reports to the application.

use std::time::Duration;

use syncroom_types::{PeerId, Role, SessionId};

use crate::state::PeerStatus;

/// Capacity of the session event broadcast channel.
pub const SESSION_EVENT_CAPACITY: usize = 256;

/// Notifications emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Host: a follower finished onboarding.
    PeerJoined {
        peer: PeerId,
        awaiting_session_end: bool,
    },
    /// Host: a follower went away.
    PeerLeft(PeerId),
    /// Host: followers that joined mid-activity now take part.
    PeersPromoted(Vec<PeerId>),
    /// Follower: link to the host is up.
    Connected(PeerId),
    /// Follower: link to the host dropped.
    Disconnected(PeerId),
    /// Follower: next connection attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Follower: the host confirmed our membership.
    SessionConfirmed(SessionId),
    /// Start playback at this instant of the local clock.
    StartAt { local_time_ms: i64 },
    /// Results may be shown.
    RevealResults { finished: Vec<PeerId>, forced: bool },
}

/// Point-in-time view of the engine, published on a watch channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStatus {
    pub role: Option<Role>,
    pub session: Option<SessionId>,
    /// Follower: linked to the host. Host: listening.
    pub connected: bool,
    /// Host: known followers.
    pub peers: Vec<(PeerId, PeerStatus)>,
    /// Follower: current `local - host` clock estimate.
    pub clock_offset_ms: Option<f64>,
    /// Host: an activity is running.
    pub mid_activity: bool,
}
