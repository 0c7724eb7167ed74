//! The engine façade: role-aware initialisation and the running actor.

use std::sync::Arc;

use syncroom_protocol::{encode_message, PeerTransport, ProtocolError, TransportEvents};
use syncroom_types::{PeerId, PeerMessage, Role, SessionId, UpstreamRecord};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::TimeSource;
use crate::config::Config;
use crate::error::EngineError;
use crate::events::{EngineStatus, SessionEvent, SESSION_EVENT_CAPACITY};
use crate::follower::FollowerActor;
use crate::host::HostActor;
use crate::surface::PlaybackSurface;
use crate::upstream::UpstreamLink;

/// Requests from the façade to the running actor.
#[derive(Debug)]
pub(crate) enum Command {
    Shutdown,
}

/// Everything an actor owns while it runs.
pub(crate) struct ActorContext {
    pub(crate) config: Arc<Config>,
    pub(crate) session: SessionId,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) transport_events: TransportEvents,
    pub(crate) surface: Arc<dyn PlaybackSurface>,
    pub(crate) clock: Arc<dyn TimeSource>,
    pub(crate) upstream: UpstreamLink,
    pub(crate) events: broadcast::Sender<SessionEvent>,
    pub(crate) status: watch::Sender<EngineStatus>,
    pub(crate) commands: mpsc::Receiver<Command>,
}

impl ActorContext {
    pub(crate) fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Send one control message; failures are logged and reported as `false`.
    ///
    /// A send that stalls past the configured timeout drops the link.
    pub(crate) async fn send(&self, peer: &PeerId, message: &PeerMessage) -> bool {
        let data = match encode_message(message) {
            Ok(data) => data,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode message");
                return false;
            }
        };
        let send_timeout = self.config.network.send_timeout();
        let Ok(result) = tokio::time::timeout(send_timeout, self.transport.send(peer, data)).await
        else {
            warn!(peer = %peer, kind = message.kind(), "send stalled, dropping link");
            self.transport.disconnect(peer).await;
            return false;
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %peer, kind = message.kind(), error = %e, "send failed");
                false
            }
        }
    }

    /// Hand a record to the local upstream sink without blocking the actor.
    pub(crate) fn deliver(&self, record: UpstreamRecord) {
        match self.upstream.deliver.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(func = record.func(), "upstream sink full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("upstream sink closed");
            }
        }
    }

    pub(crate) fn publish(&self, status: EngineStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

struct Running {
    role: Role,
    session: SessionId,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// A participant in a synchronised session.
///
/// Construct with its collaborators, then [`Engine::initialize`] as host or
/// follower. Progress is reported through [`Engine::event_receiver`] and
/// [`Engine::status_receiver`].
pub struct Engine {
    config: Arc<Config>,
    transport: Arc<dyn PeerTransport>,
    surface: Arc<dyn PlaybackSurface>,
    clock: Arc<dyn TimeSource>,
    /// Handed to the actor on initialisation.
    pending: Option<(TransportEvents, UpstreamLink, watch::Sender<EngineStatus>)>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<EngineStatus>,
    running: Option<Running>,
}

impl Engine {
    pub fn new(
        config: Config,
        transport: Arc<dyn PeerTransport>,
        transport_events: TransportEvents,
        surface: Arc<dyn PlaybackSurface>,
        upstream: UpstreamLink,
        clock: Arc<dyn TimeSource>,
    ) -> Self {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(EngineStatus::default());
        Self {
            config: Arc::new(config),
            transport,
            surface,
            clock,
            pending: Some((transport_events, upstream, status_tx)),
            events,
            status,
            running: None,
        }
    }

    /// Start participating in `session`.
    ///
    /// A host first claims the session's well-known identity, retrying a few
    /// times before failing with [`EngineError::IdentityConflict`]. A follower
    /// returns at once and keeps (re)connecting in the background.
    ///
    /// Calling this again while running is a no-op.
    pub async fn initialize(&mut self, role: Role, session: SessionId) -> Result<(), EngineError> {
        if let Some(running) = &self.running {
            if running.role == role && running.session == session {
                debug!(role = %role, session = %session, "engine already initialized");
            } else {
                warn!(
                    role = %role,
                    session = %session,
                    running_role = %running.role,
                    running_session = %running.session,
                    "engine already initialized, ignoring"
                );
            }
            return Ok(());
        }
        if self.pending.is_none() {
            return Err(EngineError::ShutDown);
        }

        if role.is_host() {
            self.claim_host_identity(&session).await?;
        }

        let (transport_events, upstream, status) =
            self.pending.take().ok_or(EngineError::ShutDown)?;
        let (commands_tx, commands) = mpsc::channel(8);
        let ctx = ActorContext {
            config: Arc::clone(&self.config),
            session: session.clone(),
            transport: Arc::clone(&self.transport),
            transport_events,
            surface: Arc::clone(&self.surface),
            clock: Arc::clone(&self.clock),
            upstream,
            events: self.events.clone(),
            status,
            commands,
        };

        let task = match role {
            Role::Host => tokio::spawn(HostActor::new(ctx).run()),
            Role::Follower => tokio::spawn(FollowerActor::new(ctx).run()),
        };
        info!(role = %role, session = %session, name = %self.config.identity.name, "engine initialized");

        self.running = Some(Running {
            role,
            session,
            commands: commands_tx,
            task,
        });
        Ok(())
    }

    async fn claim_host_identity(&self, session: &SessionId) -> Result<(), EngineError> {
        let id = PeerId::host_for(session);
        let attempts = self.config.reconnect.host_claim_attempts.max(1);
        for attempt in 1..=attempts {
            match self.transport.listen(&id).await {
                Ok(()) => {
                    info!(id = %id, "claimed host identity");
                    return Ok(());
                }
                Err(ProtocolError::AddressInUse(_)) => {
                    warn!(id = %id, attempt, attempts, "host identity already in use");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.reconnect.host_claim_delay()).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::IdentityConflict { id, attempts })
    }

    /// Stop the actor and close the transport.
    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        // The actor may already be gone; joining tells us either way.
        let _ = running.commands.send(Command::Shutdown).await;
        running
            .task
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?;
        info!(role = %running.role, session = %running.session, "engine stopped");
        Ok(())
    }

    /// Subscribe to session events from now on.
    pub fn event_receiver(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn status_receiver(&self) -> watch::Receiver<EngineStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.running.as_ref().map(|r| r.role)
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.running.as_ref().map(|r| &r.session)
    }

    pub fn is_initialized(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_id(&self) -> PeerId {
        self.transport.local_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.task.abort();
        }
    }
}
