//! Configuration management
//!
//! Loaded from an optional TOML file, then overridden by `MESHCALL__*`
//! environment variables (`MESHCALL__TIMING__SETUP_DELAY_MS=500`).

use crate::domain::media::MediaConstraints;
use crate::domain::negotiation::RenegotiationPolicy;
use crate::domain::shared::{DomainError, Result, RoomId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment override prefix
pub const ENV_PREFIX: &str = "MESHCALL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default)]
    pub room: RoomConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub hub_url: String,
    pub display_name: String,
    /// Delays before each automatic reconnect attempt; the connection is
    /// closed for good once the list is exhausted
    pub reconnect_delays_ms: Vec<u64>,
    /// Delay between initial connect attempts
    pub connect_retry_ms: u64,
    /// 0 means retry until cancelled
    pub connect_max_attempts: u32,
    pub invoke_timeout_ms: u64,
    pub keep_alive_ms: u64,
    pub server_timeout_ms: u64,
    /// Connect straight to the WebSocket endpoint without the negotiate
    /// request; the relay then assigns no connection identifier
    pub skip_negotiation: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            hub_url: "http://localhost:5000/hub/webrtc".to_string(),
            display_name: "Anonymous".to_string(),
            reconnect_delays_ms: vec![0, 2000, 10000, 30000],
            connect_retry_ms: 5000,
            connect_max_attempts: 0,
            invoke_timeout_ms: 15000,
            keep_alive_ms: 15000,
            server_timeout_ms: 30000,
            skip_negotiation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomConfig {
    pub default_room: String,
    pub rejoin_default_after_hangup: bool,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            default_room: "room_123".to_string(),
            rejoin_default_after_hangup: true,
        }
    }
}

/// Heuristic delays; none of them is needed for correctness
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after a participant joins before the initiator offers
    pub setup_delay_ms: u64,
    /// Grace period for a disconnected transport before recovery
    pub disconnect_grace_ms: u64,
    /// Delay before a renegotiation replaces an unavailable ICE restart
    pub renegotiate_delay_ms: u64,
    /// Outbound rounds without an answer are abandoned after this
    pub negotiation_timeout_ms: u64,
    /// How long an ICE restart may take before it counts as ineffective
    pub ice_restart_timeout_ms: u64,
    /// Delay before an automatic full reset
    pub recovery_delay_ms: u64,
    /// Periodic health sampling; 0 disables it
    pub monitor_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            setup_delay_ms: 1000,
            disconnect_grace_ms: 2000,
            renegotiate_delay_ms: 1000,
            negotiation_timeout_ms: 10000,
            ice_restart_timeout_ms: 5000,
            recovery_delay_ms: 1000,
            monitor_interval_ms: 5000,
        }
    }
}

impl TimingConfig {
    pub fn setup_delay(&self) -> Duration {
        Duration::from_millis(self.setup_delay_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn renegotiate_delay(&self) -> Duration {
        Duration::from_millis(self.renegotiate_delay_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn ice_restart_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_restart_timeout_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn monitor_interval(&self) -> Option<Duration> {
        match self.monitor_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub renegotiation: RenegotiationPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Run a full reset automatically when the monitor recommends one
    pub auto_reset: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { auto_reset: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub video: bool,
    pub audio: bool,
    pub width: u32,
    pub height: u32,
    pub facing_mode: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        let c = MediaConstraints::default();
        Self {
            video: c.video,
            audio: c.audio,
            width: c.width,
            height: c.height,
            facing_mode: c.facing_mode,
        }
    }
}

impl MediaConfig {
    pub fn constraints(&self) -> MediaConstraints {
        MediaConstraints {
            video: self.video,
            audio: self.audio,
            width: self.width,
            height: self.height,
            facing_mode: self.facing_mode.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub servers: Vec<IceServerConfig>,
    pub candidate_pool_size: u8,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                ],
                username: None,
                credential: None,
            }],
            candidate_pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus listener, e.g. `127.0.0.1:9100`
    pub listen: Option<String>,
}

impl Config {
    /// Load from an optional file plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DomainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| DomainError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DomainError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.signaling.hub_url.is_empty() {
            return Err(DomainError::Config("signaling.hub_url is empty".to_string()));
        }
        if self.room.default_room.is_empty() {
            return Err(DomainError::Config("room.default_room is empty".to_string()));
        }
        if self.ice.servers.iter().any(|s| s.urls.is_empty()) {
            return Err(DomainError::Config(
                "every ice server needs at least one url".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_room(&self) -> RoomId {
        RoomId::new(self.room.default_room.clone())
    }
}
