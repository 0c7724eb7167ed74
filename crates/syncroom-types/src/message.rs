//! Peer-to-peer control vocabulary.
//!
//! These records travel only between syncroom participants, never upstream.
//! Each is a flat JSON object discriminated by `__type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{PeerId, SessionId};
use crate::record::UpstreamRecord;

/// Current protocol version.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

/// Protocol version for compatibility negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// First frame a dialing peer sends so the listener learns who it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHello {
    pub version: ProtocolVersion,
    pub peer_id: PeerId,
}

/// Control messages exchanged between host and followers.
///
/// Timestamps are milliseconds on the sender's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__type", rename_all = "camelCase")]
pub enum PeerMessage {
    /// Host → follower latency probe sent during onboarding.
    #[serde(rename_all = "camelCase")]
    RttProbe { seq: u32, sent_at: i64 },

    /// Follower → host echo of an [`PeerMessage::RttProbe`], unchanged.
    #[serde(rename_all = "camelCase")]
    RttEcho { seq: u32, sent_at: i64 },

    /// Host → follower initial clock baseline.
    #[serde(rename_all = "camelCase")]
    ClockPrime { server_now: i64, latency_ms: f64 },

    /// Host → follower: you are registered in this session.
    #[serde(rename_all = "camelCase")]
    SessionConfirm { session_id: SessionId },

    /// Host → follower fan-out of an upstream record.
    Relay { record: UpstreamRecord },

    /// Follower → host: local surface is buffered and ready to start.
    ReadyToStart,

    /// Host → follower: begin playback at this instant of the host clock.
    #[serde(rename_all = "camelCase")]
    StartAt { host_time: i64 },

    /// Follower → host: local activity finished, waiting for the reveal.
    ReadyForResults,

    /// Host → follower: everyone may show results now.
    RevealResults,

    /// Follower → host envelope around a follower-originated upstream record.
    ///
    /// The payload is kept raw; the host validates it before relaying.
    Forward { payload: Value },

    /// Follower → host clock synchronisation request.
    ClockPing { t1: i64 },

    /// Host → follower reply carrying the host clock at reception.
    #[serde(rename_all = "camelCase")]
    ClockPong { t1: i64, server_now: i64 },
}

impl PeerMessage {
    /// Discriminant as it appears on the wire, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RttProbe { .. } => "rttProbe",
            Self::RttEcho { .. } => "rttEcho",
            Self::ClockPrime { .. } => "clockPrime",
            Self::SessionConfirm { .. } => "sessionConfirm",
            Self::Relay { .. } => "relay",
            Self::ReadyToStart => "readyToStart",
            Self::StartAt { .. } => "startAt",
            Self::ReadyForResults => "readyForResults",
            Self::RevealResults => "revealResults",
            Self::Forward { .. } => "forward",
            Self::ClockPing { .. } => "clockPing",
            Self::ClockPong { .. } => "clockPong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unit_variants_are_flat_objects() {
        let value = serde_json::to_value(PeerMessage::ReadyToStart).unwrap();
        assert_eq!(value, json!({"__type": "readyToStart"}));
    }

    #[test]
    fn fields_are_camel_case() {
        let value = serde_json::to_value(PeerMessage::ClockPong {
            t1: 10,
            server_now: 20,
        })
        .unwrap();
        assert_eq!(value, json!({"__type": "clockPong", "t1": 10, "serverNow": 20}));
    }

    #[test]
    fn relay_carries_record_inline() {
        let msg = PeerMessage::Relay {
            record: UpstreamRecord::new("selectSong").with("id", "S1"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"__type": "relay", "record": {"func": "selectSong", "id": "S1"}})
        );
        let back: PeerMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        let parsed = serde_json::from_value::<PeerMessage>(json!({"__type": "teleport"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn kind_matches_wire_tag() {
        let msg = PeerMessage::StartAt { host_time: 5 };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["__type"], msg.kind());
    }

    #[test]
    fn protocol_version_display() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "1.0");
    }
}
