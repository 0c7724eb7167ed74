//! Host actor.
//!
//! Owns the session snapshot, the peer table, every onboarding handshake and
//! both barriers. All of it is mutated from this one task; followers only
//! influence it through messages.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use syncroom_protocol::{decode_message, TransportEvent};
use syncroom_types::{PeerId, PeerMessage, Role, UpstreamRecord};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::{ActorContext, Command};
use crate::events::{EngineStatus, SessionEvent};
use crate::gate::{Gate, Resolution};
use crate::handshake::{Handshake, Step};
use crate::relay::{fan_out, validate_forwarded};
use crate::snapshot::{Category, SessionSnapshot};
use crate::state::{PeerRegistry, PeerStatus};

/// A handshake timer firing.
#[derive(Debug)]
struct Wake {
    peer: PeerId,
    epoch: u64,
}

pub(crate) struct HostActor {
    ctx: ActorContext,
    peers: PeerRegistry,
    handshakes: HashMap<PeerId, Handshake>,
    snapshot: SessionSnapshot,
    start_gate: Gate,
    completion_gate: Gate,
    next_epoch: u64,
    wake_tx: mpsc::Sender<Wake>,
    wake_rx: mpsc::Receiver<Wake>,
}

impl HostActor {
    pub(crate) fn new(ctx: ActorContext) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(256);
        Self {
            ctx,
            peers: PeerRegistry::new(),
            handshakes: HashMap::new(),
            snapshot: SessionSnapshot::new(),
            start_gate: Gate::new(),
            completion_gate: Gate::new(),
            next_epoch: 0,
            wake_tx,
            wake_rx,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut poll = tokio::time::interval(self.ctx.config.barriers.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(session = %self.ctx.session, id = %self.ctx.transport.local_id(), "host running");
        self.publish_status();

        loop {
            tokio::select! {
                event = self.ctx.transport_events.recv() => {
                    if let Some(event) = event {
                        self.handle_transport_event(event).await;
                    } else {
                        warn!("transport event channel closed");
                        break;
                    }
                }
                Some(record) = self.ctx.upstream.observed.recv() => {
                    self.handle_observed(record).await;
                }
                Some(wake) = self.wake_rx.recv() => {
                    self.handle_wake(wake).await;
                }
                _ = poll.tick() => {
                    self.poll_barriers().await;
                }
                command = self.ctx.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            info!("host shutting down");
                            break;
                        }
                    }
                }
            }
            self.publish_status();
        }

        self.ctx.transport.close().await;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) => self.on_peer_connected(peer),
            TransportEvent::Data { peer, data } => match decode_message(&data) {
                Ok(msg) => self.on_peer_message(peer, msg).await,
                Err(e) => warn!(peer = %peer, error = %e, "dropping malformed peer message"),
            },
            TransportEvent::PeerDisconnected(peer) => self.on_peer_disconnected(&peer).await,
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId) {
        if self.peers.insert_initializing(peer.clone()) {
            debug!(peer = %peer, "peer reconnected, restarting onboarding");
        }
        let handshake = Handshake::new(self.ctx.config.handshake.clone());
        let delay = handshake.initial_delay();
        self.handshakes.insert(peer.clone(), handshake);
        self.schedule_wake(&peer, delay);
        info!(peer = %peer, "peer connected, onboarding");
    }

    async fn on_peer_disconnected(&mut self, peer: &PeerId) {
        self.handshakes.remove(peer);
        if let Some(status) = self.peers.remove(peer) {
            info!(peer = %peer, status = %status, "peer disconnected");
            self.ctx.emit(SessionEvent::PeerLeft(peer.clone()));
            self.evaluate_gates().await;
        }
    }

    async fn on_peer_message(&mut self, peer: PeerId, msg: PeerMessage) {
        debug!(peer = %peer, kind = msg.kind(), "peer message");
        match msg {
            PeerMessage::RttEcho { seq, sent_at } => {
                let now = self.ctx.now_ms();
                let step = self
                    .handshakes
                    .get_mut(&peer)
                    .and_then(|hs| hs.on_echo(seq, sent_at, now));
                match step {
                    Some(step) => self.execute_step(&peer, step).await,
                    None => debug!(peer = %peer, seq, "ignoring unexpected rtt echo"),
                }
            }
            PeerMessage::ClockPing { t1 } => {
                let pong = PeerMessage::ClockPong {
                    t1,
                    server_now: self.ctx.now_ms(),
                };
                self.ctx.send(&peer, &pong).await;
            }
            PeerMessage::ReadyToStart => {
                if self.accepts_signal(&peer) && self.start_gate.signal(&peer) {
                    debug!(peer = %peer, "peer ready to start");
                    self.evaluate_gates().await;
                }
            }
            PeerMessage::ReadyForResults => {
                if self.accepts_signal(&peer) && self.completion_gate.signal(&peer) {
                    debug!(peer = %peer, "peer finished");
                    self.completion_gate
                        .arm_deadline(Instant::now(), self.ctx.config.barriers.timeout());
                    self.evaluate_gates().await;
                }
            }
            PeerMessage::Forward { payload } => self.on_forward(&peer, payload),
            other => {
                warn!(peer = %peer, kind = other.kind(), "unexpected message for host");
            }
        }
    }

    /// Barrier signals only count from fully onboarded, active peers.
    fn accepts_signal(&self, peer: &PeerId) -> bool {
        let status = self.peers.status(peer);
        if status.is_some_and(PeerStatus::is_active) {
            true
        } else {
            debug!(peer = %peer, status = ?status, "ignoring barrier signal from inactive peer");
            false
        }
    }

    fn on_forward(&mut self, peer: &PeerId, payload: Value) {
        match validate_forwarded(payload) {
            Ok(record) => {
                debug!(peer = %peer, func = record.func(), "forwarding follower record upstream");
                self.ctx.deliver(record);
            }
            Err(e) => warn!(peer = %peer, error = %e, "dropping malformed forwarded payload"),
        }
    }

    async fn handle_wake(&mut self, wake: Wake) {
        let now = self.ctx.now_ms();
        let Some(handshake) = self.handshakes.get_mut(&wake.peer) else {
            return;
        };
        if handshake.epoch() != wake.epoch {
            debug!(peer = %wake.peer, "discarding stale handshake timer");
            return;
        }
        let stage = handshake.stage();
        let step = handshake.on_wake(now, &self.snapshot, &self.ctx.session);
        debug!(peer = %wake.peer, stage = %stage, "handshake step");
        self.execute_step(&wake.peer, step).await;
    }

    async fn execute_step(&mut self, peer: &PeerId, step: Step) {
        match step {
            Step::Send { message, next } => {
                if !self.ctx.transport.is_open(peer) || !self.ctx.send(peer, &message).await {
                    self.abort_handshake(peer);
                    return;
                }
                self.schedule_wake(peer, next);
            }
            Step::Pause(delay) => {
                if !self.ctx.transport.is_open(peer) {
                    self.abort_handshake(peer);
                    return;
                }
                self.schedule_wake(peer, delay);
            }
            Step::Complete {
                awaiting_session_end,
            } => {
                self.handshakes.remove(peer);
                // The activity may have ended while we were replaying.
                let status = if awaiting_session_end && self.snapshot.is_mid_activity() {
                    PeerStatus::AwaitingSessionEnd
                } else {
                    PeerStatus::Active
                };
                self.peers.set_status(peer, status);
                info!(peer = %peer, status = %status, "peer onboarded");
                self.ctx.emit(SessionEvent::PeerJoined {
                    peer: peer.clone(),
                    awaiting_session_end: status == PeerStatus::AwaitingSessionEnd,
                });
                self.evaluate_gates().await;
            }
        }
    }

    fn abort_handshake(&mut self, peer: &PeerId) {
        self.handshakes.remove(peer);
        if self.peers.remove(peer).is_some() {
            info!(peer = %peer, "peer left during onboarding");
            self.ctx.emit(SessionEvent::PeerLeft(peer.clone()));
        }
    }

    fn schedule_wake(&mut self, peer: &PeerId, after: Duration) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        if let Some(handshake) = self.handshakes.get_mut(peer) {
            handshake.set_epoch(epoch);
        }
        let tx = self.wake_tx.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Wake { peer, epoch }).await;
        });
    }

    async fn handle_observed(&mut self, record: UpstreamRecord) {
        let category = self.snapshot.ingest(&self.ctx.config.catalog, &record);
        debug!(func = record.func(), category = ?category, "observed upstream record");

        match category {
            Category::Launch => {
                let deadline = Instant::now().checked_add(self.ctx.config.barriers.timeout());
                self.start_gate.open(deadline);
                self.completion_gate.reset();
                info!(func = record.func(), "start gate open");
            }
            Category::End => {
                let promoted = self.peers.promote_awaiting();
                if !promoted.is_empty() {
                    info!(count = promoted.len(), "activity ended, late joiners now active");
                    self.ctx.emit(SessionEvent::PeersPromoted(promoted));
                }
            }
            _ => {}
        }

        let targets = self.peers.relay_targets(category.is_gameplay());
        let message = PeerMessage::Relay { record };
        let send_timeout = self.ctx.config.network.send_timeout();
        if let Err(e) = fan_out(&self.ctx.transport, &targets, &message, send_timeout).await {
            warn!(error = %e, "failed to relay upstream record");
        }
    }

    async fn poll_barriers(&mut self) {
        if self.start_gate.is_pending() && self.ctx.surface.is_ready() {
            self.start_gate.set_local_ready();
        }
        if self.completion_gate.is_pending() && self.ctx.surface.is_finished() {
            self.completion_gate.set_local_ready();
            self.completion_gate
                .arm_deadline(Instant::now(), self.ctx.config.barriers.timeout());
        }
        self.evaluate_gates().await;
    }

    async fn evaluate_gates(&mut self) {
        let now = Instant::now();
        let active = self.peers.active();
        if let Some(resolution) = self.start_gate.evaluate(&active, now) {
            self.on_start_resolved(&resolution, &active).await;
        }
        let active = self.peers.active();
        if let Some(resolution) = self.completion_gate.evaluate(&active, now) {
            self.on_completion_resolved(resolution).await;
        }
    }

    async fn on_start_resolved(&mut self, resolution: &Resolution, active: &[PeerId]) {
        let lead = i64::try_from(self.ctx.config.barriers.start_lead_ms).unwrap_or(i64::MAX);
        let host_time = self.ctx.now_ms().saturating_add(lead);
        info!(
            host_time,
            forced = resolution.forced,
            ready = resolution.signaled.len(),
            active = active.len(),
            "start gate resolved"
        );
        if let Err(e) = fan_out(
            &self.ctx.transport,
            active,
            &PeerMessage::StartAt { host_time },
            self.ctx.config.network.send_timeout(),
        )
        .await
        {
            warn!(error = %e, "failed to broadcast start instant");
        }
        self.ctx.emit(SessionEvent::StartAt {
            local_time_ms: host_time,
        });
        self.completion_gate.open(None);
    }

    async fn on_completion_resolved(&mut self, resolution: Resolution) {
        let targets = self.peers.initialized();
        info!(
            forced = resolution.forced,
            finished = resolution.signaled.len(),
            recipients = targets.len(),
            "completion gate resolved"
        );
        if let Err(e) = fan_out(
            &self.ctx.transport,
            &targets,
            &PeerMessage::RevealResults,
            self.ctx.config.network.send_timeout(),
        )
        .await {
            warn!(error = %e, "failed to broadcast reveal");
        }
        self.ctx.emit(SessionEvent::RevealResults {
            finished: resolution.signaled,
            forced: resolution.forced,
        });
    }

    fn publish_status(&self) {
        self.ctx.publish(EngineStatus {
            role: Some(Role::Host),
            session: Some(self.ctx.session.clone()),
            connected: true,
            peers: self
                .peers
                .iter()
                .map(|(id, status)| (id.clone(), status))
                .collect(),
            clock_offset_ms: None,
            mid_activity: self.snapshot.is_mid_activity(),
        });
    }
}
