//! Host-side onboarding of a newly connected follower.
//!
//! [`Handshake`] is a pure state machine; the host actor drives it by feeding
//! timer wake-ups and RTT echoes and carrying out the [`Step`]s it returns.
//! Before every send the actor checks the peer is still connected and drops
//! the handshake if it isn't.

use std::collections::VecDeque;
use std::time::Duration;

use syncroom_types::{PeerMessage, SessionId};

use crate::clock::median;
use crate::config::HandshakeConfig;
use crate::snapshot::{Category, SessionSnapshot};

/// Onboarding progress of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Stabilizing,
    MeasuringRtt,
    Priming,
    Registering,
    Confirming,
    Replaying,
    Ready,
}

impl std::fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stabilizing => write!(f, "Stabilizing"),
            Self::MeasuringRtt => write!(f, "MeasuringRtt"),
            Self::Priming => write!(f, "Priming"),
            Self::Registering => write!(f, "Registering"),
            Self::Confirming => write!(f, "Confirming"),
            Self::Replaying => write!(f, "Replaying"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// What the actor should do next for this peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Send `message`, then wake the handshake after `next`.
    Send { message: PeerMessage, next: Duration },
    /// Wake the handshake after the given pause.
    Pause(Duration),
    /// Onboarding finished.
    Complete { awaiting_session_end: bool },
}

#[derive(Debug, Clone)]
pub struct Handshake {
    config: HandshakeConfig,
    stage: HandshakeStage,
    epoch: u64,
    probes_sent: u32,
    /// Sequence number and send time of the unanswered probe.
    outstanding: Option<(u32, i64)>,
    rtts: Vec<f64>,
    latency_ms: Option<f64>,
    replay: VecDeque<Category>,
    awaiting_session_end: bool,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            stage: HandshakeStage::Stabilizing,
            epoch: 0,
            probes_sent: 0,
            outstanding: None,
            rtts: Vec::new(),
            latency_ms: None,
            replay: VecDeque::new(),
            awaiting_session_end: false,
        }
    }

    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Delay before the first wake-up.
    pub fn initial_delay(&self) -> Duration {
        self.config.settle_delay()
    }

    /// Timer generation; wake-ups carrying another epoch are stale.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Measured one-way latency, once RTT measurement is done.
    pub fn latency_ms(&self) -> Option<f64> {
        self.latency_ms
    }

    /// Advance after a timer fired.
    ///
    /// In [`HandshakeStage::MeasuringRtt`] a wake-up means the outstanding
    /// probe timed out.
    pub fn on_wake(&mut self, now_ms: i64, snapshot: &SessionSnapshot, session: &SessionId) -> Step {
        match self.stage {
            HandshakeStage::Stabilizing => {
                self.stage = HandshakeStage::MeasuringRtt;
                self.next_probe(now_ms)
            }
            HandshakeStage::MeasuringRtt => {
                self.outstanding = None;
                self.after_probe(now_ms)
            }
            HandshakeStage::Priming => {
                self.stage = HandshakeStage::Registering;
                Step::Send {
                    message: PeerMessage::ClockPrime {
                        server_now: now_ms,
                        latency_ms: self.latency_ms.unwrap_or(self.config.default_latency_ms),
                    },
                    next: self.config.settle_delay(),
                }
            }
            HandshakeStage::Registering => {
                self.stage = HandshakeStage::Confirming;
                match snapshot.registration() {
                    Some(record) => Step::Send {
                        message: PeerMessage::Relay {
                            record: record.clone(),
                        },
                        next: self.config.settle_delay(),
                    },
                    None => self.on_wake(now_ms, snapshot, session),
                }
            }
            HandshakeStage::Confirming => {
                self.stage = HandshakeStage::Replaying;
                self.awaiting_session_end = snapshot.is_mid_activity();
                self.replay = snapshot.replay_plan().into();
                Step::Send {
                    message: PeerMessage::SessionConfirm {
                        session_id: session.clone(),
                    },
                    next: self.config.settle_delay(),
                }
            }
            HandshakeStage::Replaying => {
                // An activity started mid-replay: the joiner sits it out.
                if !self.awaiting_session_end && snapshot.is_mid_activity() {
                    self.awaiting_session_end = true;
                    self.replay.retain(|c| !c.is_activity_scoped());
                }
                // Slots are read at send time so a joiner gets the freshest
                // record; empty slots are skipped.
                while let Some(category) = self.replay.pop_front() {
                    if let Some(record) = snapshot.get(category) {
                        return Step::Send {
                            message: PeerMessage::Relay {
                                record: record.clone(),
                            },
                            next: self.config.replay_spacing(),
                        };
                    }
                }
                self.stage = HandshakeStage::Ready;
                Step::Complete {
                    awaiting_session_end: self.awaiting_session_end,
                }
            }
            HandshakeStage::Ready => Step::Complete {
                awaiting_session_end: self.awaiting_session_end,
            },
        }
    }

    /// Handle an `rttEcho`. Echoes that don't match the outstanding probe
    /// (both `seq` and the echoed send time) return `None`.
    ///
    /// The RTT is measured against our own record of the send time.
    #[allow(clippy::cast_precision_loss)]
    pub fn on_echo(&mut self, seq: u32, sent_at: i64, now_ms: i64) -> Option<Step> {
        if self.stage != HandshakeStage::MeasuringRtt {
            return None;
        }
        let (expected_seq, probe_sent_at) = self.outstanding?;
        if expected_seq != seq || probe_sent_at != sent_at {
            return None;
        }
        self.outstanding = None;
        self.rtts.push(now_ms.saturating_sub(probe_sent_at).max(0) as f64);
        Some(self.after_probe(now_ms))
    }

    fn next_probe(&mut self, now_ms: i64) -> Step {
        let seq = self.probes_sent;
        self.probes_sent += 1;
        self.outstanding = Some((seq, now_ms));
        Step::Send {
            message: PeerMessage::RttProbe {
                seq,
                sent_at: now_ms,
            },
            next: self.config.probe_timeout(),
        }
    }

    fn after_probe(&mut self, now_ms: i64) -> Step {
        if self.probes_sent < self.config.probe_count {
            return self.next_probe(now_ms);
        }
        // Every echoed probe counts; no outlier filtering on this side.
        self.latency_ms = Some(
            median(self.rtts.iter().copied())
                .map_or(self.config.default_latency_ms, |rtt| rtt / 2.0),
        );
        self.stage = HandshakeStage::Priming;
        Step::Pause(self.config.settle_delay())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Catalog;
    use syncroom_types::UpstreamRecord;

    fn session() -> SessionId {
        SessionId::new("room").unwrap()
    }

    fn handshake() -> Handshake {
        Handshake::new(HandshakeConfig::default())
    }

    fn sent(step: Step) -> PeerMessage {
        match step {
            Step::Send { message, .. } => message,
            other => panic!("expected send, got {other:?}"),
        }
    }

    /// Run the three probes, echoing each after `rtt` ms.
    fn measure(hs: &mut Handshake, snap: &SessionSnapshot, rtts: [i64; 3]) -> Step {
        let mut now = 0;
        let mut step = hs.on_wake(now, snap, &session());
        for rtt in rtts {
            let PeerMessage::RttProbe { seq, sent_at } = sent(step) else {
                panic!("expected probe");
            };
            now += rtt;
            step = hs.on_echo(seq, sent_at, now).unwrap();
        }
        step
    }

    fn drive_to_end(hs: &mut Handshake, snap: &SessionSnapshot) -> (Vec<PeerMessage>, bool) {
        let mut out = Vec::new();
        loop {
            match hs.on_wake(10_000, snap, &session()) {
                Step::Send { message, .. } => out.push(message),
                Step::Pause(_) => {}
                Step::Complete {
                    awaiting_session_end,
                } => return (out, awaiting_session_end),
            }
        }
    }

    #[test]
    fn latency_is_half_median_rtt() {
        let mut hs = handshake();
        let snap = SessionSnapshot::new();
        let step = measure(&mut hs, &snap, [40, 400, 60]);
        assert_eq!(step, Step::Pause(Duration::from_millis(500)));
        assert_eq!(hs.stage(), HandshakeStage::Priming);
        // No outlier rejection: median of {40, 400, 60} is 60.
        assert_eq!(hs.latency_ms(), Some(30.0));
    }

    #[test]
    fn silent_peer_gets_default_latency() {
        let mut hs = handshake();
        let snap = SessionSnapshot::new();
        let mut step = hs.on_wake(0, &snap, &session());
        for _ in 0..3 {
            assert!(matches!(sent(step), PeerMessage::RttProbe { .. }));
            step = hs.on_wake(1_000, &snap, &session());
        }
        assert_eq!(step, Step::Pause(Duration::from_millis(500)));
        assert_eq!(hs.latency_ms(), Some(50.0));

        let prime = sent(hs.on_wake(2_000, &snap, &session()));
        assert_eq!(
            prime,
            PeerMessage::ClockPrime {
                server_now: 2_000,
                latency_ms: 50.0
            }
        );
    }

    #[test]
    fn stale_or_unexpected_echo_is_ignored() {
        let mut hs = handshake();
        let snap = SessionSnapshot::new();
        assert_eq!(hs.on_echo(0, 0, 10), None);
        hs.on_wake(0, &snap, &session());
        assert_eq!(hs.on_echo(7, 0, 10), None);
    }

    #[test]
    fn full_sequence_replays_in_order() {
        let catalog = Catalog::default();
        let mut snap = SessionSnapshot::new();
        snap.ingest(&catalog, &UpstreamRecord::new("registerSession").with("room", "r"));
        snap.ingest(&catalog, &UpstreamRecord::new("selectSong").with("id", "S1"));
        snap.ingest(&catalog, &UpstreamRecord::new("launchSong").with("id", "L1"));

        let mut hs = handshake();
        measure(&mut hs, &snap, [20, 20, 20]);
        let (messages, awaiting) = drive_to_end(&mut hs, &snap);
        assert!(!awaiting);
        assert_eq!(hs.stage(), HandshakeStage::Ready);

        let kinds: Vec<String> = messages
            .iter()
            .map(|m| match m {
                PeerMessage::Relay { record } => record.func().to_string(),
                other => other.kind().to_string(),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "clockPrime",
                "registerSession",
                "sessionConfirm",
                "selectSong",
                "launchSong"
            ]
        );
    }

    #[test]
    fn mid_activity_joiner_waits_for_session_end() {
        let catalog = Catalog::default();
        let mut snap = SessionSnapshot::new();
        snap.ingest(&catalog, &UpstreamRecord::new("navigate").with("to", "stage"));
        snap.ingest(&catalog, &UpstreamRecord::new("selectSong").with("id", "S1"));
        snap.ingest(&catalog, &UpstreamRecord::new("launchSong").with("id", "L1"));
        snap.ingest(&catalog, &UpstreamRecord::new("startSong").with("id", "L1"));

        let mut hs = handshake();
        measure(&mut hs, &snap, [20, 20, 20]);
        let (messages, awaiting) = drive_to_end(&mut hs, &snap);
        assert!(awaiting);
        let relayed: Vec<&str> = messages
            .iter()
            .filter_map(|m| match m {
                PeerMessage::Relay { record } => Some(record.func()),
                _ => None,
            })
            .collect();
        assert_eq!(relayed, vec!["navigate"]);
    }

    #[test]
    fn echo_with_forged_send_time_is_ignored() {
        let mut hs = handshake();
        let snap = SessionSnapshot::new();
        let PeerMessage::RttProbe { seq, .. } = sent(hs.on_wake(1_000, &snap, &session())) else {
            panic!("expected probe");
        };
        assert_eq!(hs.on_echo(seq, i64::MIN, 1_020), None);
        assert_eq!(hs.on_echo(seq, i64::MAX, 1_020), None);
        assert_eq!(hs.stage(), HandshakeStage::MeasuringRtt);

        // The genuine echo still counts.
        let step = hs.on_echo(seq, 1_000, 1_040).unwrap();
        assert!(matches!(sent(step), PeerMessage::RttProbe { seq: 1, .. }));
    }

    #[test]
    fn start_during_replay_turns_joiner_into_late_joiner() {
        let catalog = Catalog::default();
        let mut snap = SessionSnapshot::new();
        snap.ingest(&catalog, &UpstreamRecord::new("navigate").with("to", "stage"));
        snap.ingest(&catalog, &UpstreamRecord::new("selectSong").with("id", "S1"));
        snap.ingest(&catalog, &UpstreamRecord::new("launchSong").with("id", "L1"));

        let mut hs = handshake();
        measure(&mut hs, &snap, [20, 20, 20]);
        hs.on_wake(0, &snap, &session()); // prime
        hs.on_wake(0, &snap, &session()); // confirm
        let first = sent(hs.on_wake(0, &snap, &session()));
        assert!(matches!(first, PeerMessage::Relay { ref record } if record.func() == "navigate"));
        let second = sent(hs.on_wake(0, &snap, &session()));
        assert!(matches!(second, PeerMessage::Relay { ref record } if record.func() == "selectSong"));

        // The host starts the activity before the launch slot goes out.
        snap.ingest(&catalog, &UpstreamRecord::new("startSong").with("id", "L1"));

        let (rest, awaiting) = drive_to_end(&mut hs, &snap);
        assert!(rest.is_empty(), "unexpected replay {rest:?}");
        assert!(awaiting);
    }

    #[test]
    fn replay_spacing_between_records() {
        let catalog = Catalog::default();
        let mut snap = SessionSnapshot::new();
        snap.ingest(&catalog, &UpstreamRecord::new("selectSong").with("id", "S1"));
        let mut hs = handshake();
        measure(&mut hs, &snap, [20, 20, 20]);
        hs.on_wake(0, &snap, &session()); // prime
        hs.on_wake(0, &snap, &session()); // confirm (no registration)
        match hs.on_wake(0, &snap, &session()) {
            Step::Send { next, .. } => assert_eq!(next, Duration::from_millis(300)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
