//! syncroom CLI: host or join a synchronised session from a terminal.
//!
//! stdin carries the upstream side: each line is either a JSON record
//! (`{"func": "...", ...}`) observed locally, or a surface command
//! (`!ready`, `!finished`, `!reset`, `!status`). Records the engine delivers
//! are printed to stdout as JSON lines; everything else goes to the log.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use syncroom_engine::upstream::{self, UPSTREAM_CHANNEL_CAPACITY};
use syncroom_engine::{Config, Engine, EngineStatus, ManualSurface, MonotonicClock, SessionEvent};
use syncroom_protocol::QuicTransport;
use syncroom_types::{PeerId, Role, SessionId, UpstreamRecord};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "syncroom",
    about = "Keep a host and its followers in lockstep",
    version,
    propagate_version = true
)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session.
    Host {
        /// Session identifier shared with followers.
        #[arg(short, long)]
        session: String,
    },

    /// Join a session as a follower.
    Join {
        /// Session identifier to join.
        #[arg(short, long)]
        session: String,

        /// Address of the machine hosting the session.
        #[arg(long)]
        host_address: Option<IpAddr>,
    },

    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = syncroom_engine::setup::load_config(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.identity.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Host { session } => run(config, Role::Host, &session, None).await,
        Commands::Join {
            session,
            host_address,
        } => run(config, Role::Follower, &session, host_address).await,
        Commands::InitConfig { force } => {
            let path = syncroom_engine::setup::write_default_config(cli.config.as_deref(), force)?;
            println!("Config: {}", path.display());
            Ok(())
        }
    }
}

async fn run(
    config: Config,
    role: Role,
    session: &str,
    host_address: Option<IpAddr>,
) -> anyhow::Result<()> {
    let session = SessionId::new(session).context("invalid session id")?;
    let local = match role {
        Role::Host => PeerId::host_for(&session),
        Role::Follower => PeerId::follower_for(&session),
    };
    let mut settings = config.network.quic_settings();
    if let Some(addr) = host_address {
        settings.host_ip = addr;
    }

    let (transport, transport_events) = QuicTransport::new(local.clone(), settings);
    let surface = ManualSurface::new();
    let (handle, link) = upstream::channel(UPSTREAM_CHANNEL_CAPACITY);
    let mut engine = Engine::new(
        config,
        Arc::new(transport),
        transport_events,
        Arc::new(surface.clone()),
        link,
        Arc::new(MonotonicClock::new()),
    );
    let mut events = engine.event_receiver();
    let status = engine.status_receiver();

    engine.initialize(role, session.clone()).await?;
    info!(role = %role, session = %session, id = %local, "session started, reading stdin");

    let (observed, mut delivered) = handle.into_parts();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) => handle_line(&line, &surface, &observed, &status).await,
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }
            Some(record) = delivered.recv() => {
                println!("{}", serde_json::to_string(&record)?);
            }
            event = events.recv() => {
                match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = &mut ctrl_c => {
                info!("interrupted");
                break;
            }
        }
    }

    engine.shutdown().await?;
    Ok(())
}

async fn handle_line(
    line: &str,
    surface: &ManualSurface,
    observed: &mpsc::Sender<UpstreamRecord>,
    status: &watch::Receiver<EngineStatus>,
) {
    match line.trim() {
        "" => {}
        "!ready" => surface.set_ready(true),
        "!finished" => surface.set_finished(true),
        "!reset" => surface.reset(),
        "!status" => {
            let status = status.borrow().clone();
            eprintln!("{status:#?}");
        }
        text => match UpstreamRecord::from_json(text) {
            Ok(record) => {
                if observed.send(record).await.is_err() {
                    warn!("engine stopped, record not sent");
                }
            }
            Err(e) => warn!(error = %e, "ignoring input line"),
        },
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::PeerJoined {
            peer,
            awaiting_session_end,
        } => info!(peer = %peer, awaiting_session_end, "peer joined"),
        SessionEvent::PeerLeft(peer) => info!(peer = %peer, "peer left"),
        SessionEvent::PeersPromoted(peers) => info!(count = peers.len(), "late joiners active"),
        SessionEvent::Connected(host) => info!(host = %host, "connected"),
        SessionEvent::Disconnected(host) => warn!(host = %host, "disconnected"),
        SessionEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis(), "reconnecting");
        }
        SessionEvent::SessionConfirmed(session) => info!(session = %session, "session confirmed"),
        SessionEvent::StartAt { local_time_ms } => info!(local_time_ms, "start"),
        SessionEvent::RevealResults { finished, forced } => {
            info!(finished = finished.len(), forced, "reveal results");
        }
    }
}
