//! Engine configuration loaded from TOML.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syncroom_protocol::QuicSettings;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub barriers: BarrierConfig,
    #[serde(default)]
    pub catalog: Catalog,
}

/// Participant identity, used for logging only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Where the QUIC transport binds and dials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_host_address")]
    pub host_address: IpAddr,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_port_span")]
    pub port_span: u16,
    /// A send that can't complete in this time drops the link.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            host_address: default_host_address(),
            port_base: default_port_base(),
            port_span: default_port_span(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl NetworkConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }

    pub fn quic_settings(&self) -> QuicSettings {
        QuicSettings {
            bind_ip: self.bind,
            host_ip: self.host_address,
            port_base: self.port_base,
            port_span: self.port_span,
        }
    }
}

/// Follower clock synchronisation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    /// Delay between (re)connecting and the first sync exchange.
    #[serde(default = "default_initial_sync_delay_ms")]
    pub initial_sync_delay_ms: u64,
    /// Period of the drift-correcting sync exchange.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Samples kept in the rolling buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// A sample whose RTT exceeds this multiple of the median RTT is dropped.
    #[serde(default = "default_outlier_factor")]
    pub outlier_factor: f64,
    /// Samples required before outlier rejection kicks in.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            initial_sync_delay_ms: default_initial_sync_delay_ms(),
            sync_interval_ms: default_sync_interval_ms(),
            buffer_size: default_buffer_size(),
            outlier_factor: default_outlier_factor(),
            min_samples: default_min_samples(),
        }
    }
}

impl ClockConfig {
    pub fn initial_sync_delay(&self) -> Duration {
        Duration::from_millis(self.initial_sync_delay_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Follower reconnection and host identity claiming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Budget for a single connection attempt.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Tries at claiming the host address before giving up.
    #[serde(default = "default_host_claim_attempts")]
    pub host_claim_attempts: u32,
    #[serde(default = "default_host_claim_delay_ms")]
    pub host_claim_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            host_claim_attempts: default_host_claim_attempts(),
            host_claim_delay_ms: default_host_claim_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn host_claim_delay(&self) -> Duration {
        Duration::from_millis(self.host_claim_delay_ms)
    }
}

/// Host-side onboarding of new followers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    /// Pause before each onboarding step.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_probe_count")]
    pub probe_count: u32,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// One-way latency assumed when no probe came back.
    #[serde(default = "default_latency_ms")]
    pub default_latency_ms: f64,
    /// Spacing between replayed snapshot records.
    #[serde(default = "default_replay_spacing_ms")]
    pub replay_spacing_ms: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            probe_count: default_probe_count(),
            probe_timeout_ms: default_probe_timeout_ms(),
            default_latency_ms: default_latency_ms(),
            replay_spacing_ms: default_replay_spacing_ms(),
        }
    }
}

impl HandshakeConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn replay_spacing(&self) -> Duration {
        Duration::from_millis(self.replay_spacing_ms)
    }
}

/// Start and completion gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BarrierConfig {
    #[serde(default = "default_gate_timeout_ms")]
    pub timeout_ms: u64,
    /// How often readiness and deadlines are re-checked.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Distance between gate resolution and the shared start instant.
    #[serde(default = "default_start_lead_ms")]
    pub start_lead_ms: u64,
    /// Extra wait a follower grants the host's reveal before revealing alone.
    #[serde(default = "default_reveal_grace_ms")]
    pub reveal_grace_ms: u64,
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_gate_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            start_lead_ms: default_start_lead_ms(),
            reveal_grace_ms: default_reveal_grace_ms(),
        }
    }
}

impl BarrierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reveal_deadline(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.saturating_add(self.reveal_grace_ms))
    }
}

/// Upstream `func` values the engine understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default = "default_registration")]
    pub registration: String,
    #[serde(default = "default_navigation")]
    pub navigation: String,
    #[serde(default = "default_selection")]
    pub selection: String,
    #[serde(default = "default_launch")]
    pub launch: String,
    #[serde(default = "default_start")]
    pub start: String,
    #[serde(default = "default_end")]
    pub end: String,
    /// Traffic withheld from peers that joined mid-activity.
    #[serde(default = "default_gameplay")]
    pub gameplay: Vec<String>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            registration: default_registration(),
            navigation: default_navigation(),
            selection: default_selection(),
            launch: default_launch(),
            start: default_start(),
            end: default_end(),
            gameplay: default_gameplay(),
        }
    }
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "syncroom".to_string())
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind() -> IpAddr {
    QuicSettings::default().bind_ip
}

fn default_host_address() -> IpAddr {
    QuicSettings::default().host_ip
}

fn default_port_base() -> u16 {
    24900
}

fn default_port_span() -> u16 {
    1000
}

fn default_send_timeout_ms() -> u64 {
    2000
}

fn default_initial_sync_delay_ms() -> u64 {
    1000
}

fn default_sync_interval_ms() -> u64 {
    30_000
}

fn default_buffer_size() -> usize {
    7
}

fn default_outlier_factor() -> f64 {
    2.5
}

fn default_min_samples() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    1.5
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_host_claim_attempts() -> u32 {
    3
}

fn default_host_claim_delay_ms() -> u64 {
    1000
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_probe_count() -> u32 {
    3
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_latency_ms() -> f64 {
    50.0
}

fn default_replay_spacing_ms() -> u64 {
    300
}

fn default_gate_timeout_ms() -> u64 {
    15_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_start_lead_ms() -> u64 {
    1000
}

fn default_reveal_grace_ms() -> u64 {
    2000
}

fn default_registration() -> String {
    "registerSession".to_string()
}

fn default_navigation() -> String {
    "navigate".to_string()
}

fn default_selection() -> String {
    "selectSong".to_string()
}

fn default_launch() -> String {
    "launchSong".to_string()
}

fn default_start() -> String {
    "startSong".to_string()
}

fn default_end() -> String {
    "endSong".to_string()
}

fn default_gameplay() -> Vec<String> {
    vec!["gameplayEvent".to_string(), "scoreUpdate".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("port_base = 24900"));
        assert!(toml_str.contains("timeout_ms = 15000"));
    }

    #[test]
    fn parse_partial_config() {
        let toml_str = r#"
[identity]
name = "living-room"

[network]
host_address = "192.168.1.42"

[reconnect]
max_delay_ms = 30000

[catalog]
launch = "playVideo"
gameplay = ["tick"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.identity.name, "living-room");
        assert_eq!(config.network.host_address.to_string(), "192.168.1.42");
        assert_eq!(config.network.port_base, 24900);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert!((config.reconnect.multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(config.catalog.launch, "playVideo");
        assert_eq!(config.catalog.start, "startSong");
        assert_eq!(config.catalog.gameplay, vec!["tick".to_string()]);
        assert_eq!(config.clock.buffer_size, 7);
    }

    #[test]
    fn durations_follow_fields() {
        let barriers = BarrierConfig::default();
        assert_eq!(barriers.timeout(), Duration::from_secs(15));
        assert_eq!(barriers.reveal_deadline(), Duration::from_secs(17));
        let clock = ClockConfig::default();
        assert_eq!(clock.sync_interval(), Duration::from_secs(30));
        assert_eq!(
            NetworkConfig::default().send_timeout(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn huge_reveal_grace_saturates() {
        let barriers = BarrierConfig {
            timeout_ms: u64::MAX,
            reveal_grace_ms: 2000,
            ..BarrierConfig::default()
        };
        assert_eq!(barriers.reveal_deadline(), Duration::from_millis(u64::MAX));
    }
}
