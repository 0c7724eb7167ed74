//! Follower actor.
//!
//! Keeps a link to the host alive (with backoff), estimates the clock offset,
//! applies relayed records locally and answers the host's barriers.

use std::sync::Arc;

use syncroom_protocol::{decode_message, ProtocolError, TransportEvent};
use syncroom_types::{PeerId, PeerMessage, Role, UpstreamRecord};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::clock::{ClockSync, SampleOutcome};
use crate::engine::{ActorContext, Command};
use crate::events::{EngineStatus, SessionEvent};
use crate::snapshot::Category;

/// Local side of the host's barriers for the current activity.
#[derive(Debug, Default)]
struct LocalBarriers {
    /// A launch was relayed; report readiness once the surface is buffered.
    awaiting_start: bool,
    sent_ready: bool,
    /// Playback started; report when the surface finishes.
    watching_finish: bool,
    sent_finished: bool,
    /// Reveal on our own if the host stays silent past this point.
    reveal_deadline: Option<Instant>,
    revealed: bool,
}

pub(crate) struct FollowerActor {
    ctx: ActorContext,
    host: PeerId,
    connected: bool,
    connecting: bool,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    attempt_tx: mpsc::Sender<Result<(), ProtocolError>>,
    attempt_rx: mpsc::Receiver<Result<(), ProtocolError>>,
    clock_sync: ClockSync,
    next_sync: Option<Instant>,
    pending_ping: Option<i64>,
    barriers: LocalBarriers,
}

impl FollowerActor {
    pub(crate) fn new(ctx: ActorContext) -> Self {
        let (attempt_tx, attempt_rx) = mpsc::channel(4);
        Self {
            host: PeerId::host_for(&ctx.session),
            backoff: Backoff::new(&ctx.config.reconnect),
            clock_sync: ClockSync::new(&ctx.config.clock),
            ctx,
            connected: false,
            connecting: false,
            reconnect_at: None,
            attempt_tx,
            attempt_rx,
            next_sync: None,
            pending_ping: None,
            barriers: LocalBarriers::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        let mut poll = tokio::time::interval(self.ctx.config.barriers.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(session = %self.ctx.session, host = %self.host, id = %self.ctx.transport.local_id(), "follower running");
        self.start_attempt();
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
                Some(result) = self.attempt_rx.recv() => {
                    self.on_attempt_result(result);
                }
                Some(record) = self.ctx.upstream.observed.recv() => {
                    self.forward(record).await;
                }
                () = wait_until(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.start_attempt();
                }
                () = wait_until(self.next_sync) => {
                    self.request_sync().await;
                }
                () = wait_until(self.barriers.reveal_deadline) => {
                    warn!("no reveal from host in time, revealing locally");
                    self.reveal(true);
                }
                _ = poll.tick() => {
                    self.poll_barriers().await;
                }
                command = self.ctx.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => {
                            info!("follower shutting down");
                            break;
                        }
                    }
                }
            }
            self.publish_status();
        }

        self.ctx.transport.close().await;
    }

    fn start_attempt(&mut self) {
        if self.connected || self.connecting {
            return;
        }
        self.connecting = true;
        let transport = Arc::clone(&self.ctx.transport);
        let host = self.host.clone();
        let tx = self.attempt_tx.clone();
        let budget = self.ctx.config.reconnect.attempt_timeout();
        debug!(host = %host, attempt = self.backoff.attempt() + 1, "connecting to host");
        tokio::spawn(async move {
            let result = match tokio::time::timeout(budget, transport.connect(&host)).await {
                Ok(result) => result,
                Err(_) => Err(ProtocolError::Connection(format!(
                    "attempt timed out after {}ms",
                    budget.as_millis()
                ))),
            };
            let _ = tx.send(result).await;
        });
    }

    fn on_attempt_result(&mut self, result: Result<(), ProtocolError>) {
        self.connecting = false;
        match result {
            Ok(()) => self.on_connected(),
            Err(e) if !self.connected => {
                warn!(host = %self.host, error = %e, "connection attempt failed");
                self.schedule_reconnect();
            }
            Err(e) => debug!(error = %e, "late attempt failure while connected"),
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        self.reconnect_at = Some(Instant::now() + delay);
        info!(attempt, delay_ms = delay.as_millis(), "scheduling reconnect");
        self.ctx.emit(SessionEvent::Reconnecting { attempt, delay });
    }

    fn on_connected(&mut self) {
        if self.connected {
            return;
        }
        self.connected = true;
        self.backoff.reset();
        self.reconnect_at = None;
        self.pending_ping = None;
        self.next_sync = Some(Instant::now() + self.ctx.config.clock.initial_sync_delay());
        info!(host = %self.host, "connected to host");
        self.ctx.emit(SessionEvent::Connected(self.host.clone()));
    }

    fn on_disconnected(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        self.next_sync = None;
        self.pending_ping = None;
        warn!(host = %self.host, "lost connection to host");
        self.ctx.emit(SessionEvent::Disconnected(self.host.clone()));
        self.schedule_reconnect();
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PeerConnected(peer) if peer == self.host => self.on_connected(),
            TransportEvent::PeerDisconnected(peer) if peer == self.host => self.on_disconnected(),
            TransportEvent::Data { peer, data } if peer == self.host => {
                match decode_message(&data) {
                    Ok(msg) => self.on_host_message(msg).await,
                    Err(e) => warn!(error = %e, "dropping malformed message from host"),
                }
            }
            TransportEvent::Data { peer, .. } => {
                warn!(peer = %peer, "dropping data from a peer that is not the host");
            }
            TransportEvent::PeerConnected(peer) | TransportEvent::PeerDisconnected(peer) => {
                debug!(peer = %peer, "ignoring link event for non-host peer");
            }
        }
    }

    async fn on_host_message(&mut self, msg: PeerMessage) {
        debug!(kind = msg.kind(), "host message");
        match msg {
            PeerMessage::RttProbe { seq, sent_at } => {
                self.send_to_host(&PeerMessage::RttEcho { seq, sent_at }).await;
            }
            PeerMessage::ClockPrime {
                server_now,
                latency_ms,
            } => {
                let baseline = self
                    .clock_sync
                    .prime(server_now, latency_ms, self.ctx.now_ms());
                debug!(baseline_ms = baseline, latency_ms, "clock primed");
            }
            PeerMessage::SessionConfirm { session_id } => {
                if session_id == self.ctx.session {
                    info!(session = %session_id, "session confirmed by host");
                    self.ctx.emit(SessionEvent::SessionConfirmed(session_id));
                } else {
                    warn!(expected = %self.ctx.session, got = %session_id, "host confirmed a different session");
                }
            }
            PeerMessage::Relay { record } => self.on_relay(record),
            PeerMessage::StartAt { host_time } => self.on_start_at(host_time),
            PeerMessage::RevealResults => self.reveal(false),
            PeerMessage::ClockPong { t1, server_now } => self.on_pong(t1, server_now),
            other => warn!(kind = other.kind(), "unexpected message for follower"),
        }
    }

    fn on_relay(&mut self, record: UpstreamRecord) {
        if self.ctx.config.catalog.classify(record.func()) == Category::Launch {
            self.barriers = LocalBarriers {
                awaiting_start: true,
                ..LocalBarriers::default()
            };
            debug!(func = record.func(), "launch relayed, watching readiness");
        }
        self.ctx.deliver(record);
    }

    fn on_start_at(&mut self, host_time: i64) {
        let local_time_ms = self.clock_sync.to_local(host_time);
        info!(
            host_time,
            local_time_ms,
            offset_ms = ?self.clock_sync.offset_ms(),
            "start instant received"
        );
        self.barriers = LocalBarriers {
            watching_finish: true,
            ..LocalBarriers::default()
        };
        self.ctx.emit(SessionEvent::StartAt { local_time_ms });
    }

    fn reveal(&mut self, forced: bool) {
        if self.barriers.revealed {
            return;
        }
        self.barriers.revealed = true;
        self.barriers.watching_finish = false;
        self.barriers.reveal_deadline = None;
        let finished = if self.barriers.sent_finished {
            vec![self.ctx.transport.local_id()]
        } else {
            Vec::new()
        };
        info!(forced, "revealing results");
        self.ctx.emit(SessionEvent::RevealResults { finished, forced });
    }

    async fn request_sync(&mut self) {
        self.next_sync = Some(Instant::now() + self.ctx.config.clock.sync_interval());
        if !self.connected {
            return;
        }
        let t1 = self.ctx.now_ms();
        // A newer ping supersedes any unanswered one.
        self.pending_ping = Some(t1);
        self.send_to_host(&PeerMessage::ClockPing { t1 }).await;
    }

    fn on_pong(&mut self, t1: i64, server_now: i64) {
        if self.pending_ping != Some(t1) {
            debug!(t1, "ignoring unmatched clock pong");
            return;
        }
        self.pending_ping = None;
        let t4 = self.ctx.now_ms();
        match self.clock_sync.record(t1, server_now, t4) {
            SampleOutcome::Accepted { offset_ms } => {
                debug!(offset_ms, samples = self.clock_sync.len(), "clock sample accepted");
            }
            SampleOutcome::Rejected {
                rtt_ms,
                median_rtt_ms,
            } => {
                debug!(rtt_ms, median_rtt_ms, "clock sample rejected as outlier");
            }
        }
    }

    async fn poll_barriers(&mut self) {
        if self.barriers.awaiting_start
            && !self.barriers.sent_ready
            && self.connected
            && self.ctx.surface.is_ready()
            && self.send_to_host(&PeerMessage::ReadyToStart).await
        {
            debug!("reported ready to start");
            self.barriers.sent_ready = true;
        }

        if self.barriers.watching_finish
            && !self.barriers.sent_finished
            && self.ctx.surface.is_finished()
        {
            self.barriers.sent_finished = true;
            self.barriers.reveal_deadline =
                Instant::now().checked_add(self.ctx.config.barriers.reveal_deadline());
            if self.send_to_host(&PeerMessage::ReadyForResults).await {
                debug!("reported finished");
            }
        }
    }

    async fn forward(&mut self, record: UpstreamRecord) {
        if !self.connected {
            debug!(func = record.func(), "not connected, dropping outbound record");
            return;
        }
        let message = PeerMessage::Forward {
            payload: record.to_value(),
        };
        self.send_to_host(&message).await;
    }

    async fn send_to_host(&self, message: &PeerMessage) -> bool {
        self.ctx.send(&self.host, message).await
    }

    fn publish_status(&self) {
        self.ctx.publish(EngineStatus {
            role: Some(Role::Follower),
            session: Some(self.ctx.session.clone()),
            connected: self.connected,
            peers: Vec::new(),
            clock_offset_ms: self.clock_sync.offset_ms(),
            mid_activity: false,
        });
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
