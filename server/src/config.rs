use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ws::heartbeat::HeartbeatSettings;

/// Chatroom presence server
///
/// Flags left unset fall through to the TOML file, environment and defaults.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "chatroom-server", version, about = "Chatroom presence and message fan-out server")]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "CHATROOM_PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long, env = "CHATROOM_BIND_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = "./chatroom.toml")]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "CHATROOM_JSON_LOGS")]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip)]
    pub generate_config: bool,

    /// Data directory for the SQLite database
    #[arg(long, env = "CHATROOM_DATA_DIR")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

/// Effective server configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    #[serde(default)]
    pub json_logs: bool,
    pub data_dir: String,
    /// Presence, heartbeat and delivery settings ([presence] section)
    #[serde(default)]
    pub presence: PresenceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            data_dir: "./data".to_string(),
            presence: PresenceConfig::default(),
        }
    }
}

/// Whether a declared username must belong to a known account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityPolicy {
    /// The profile resolver must know the username before it is bound.
    Verified,
    /// Any non-empty username is accepted.
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Seconds between heartbeat probes (default: 30)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Seconds of inbound silence before a connection is evicted (default: 40)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,

    /// Target value meaning "everyone" (default: "all")
    #[serde(default = "default_broadcast_target")]
    pub broadcast_target: String,

    /// Frames buffered per connection before the peer counts as dead (default: 256)
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Identity binding policy (default: verified)
    #[serde(default = "default_identity_policy")]
    pub identity_policy: IdentityPolicy,

    /// Seconds between invalid-session sweeps (default: 60)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Maximum number of messages served by the history endpoint (default: 100)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            liveness_timeout_secs: default_liveness_timeout(),
            broadcast_target: default_broadcast_target(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            identity_policy: default_identity_policy(),
            sweep_interval_secs: default_sweep_interval(),
            history_limit: default_history_limit(),
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// True if `target` addresses the whole room.
    pub fn is_broadcast(&self, target: &str) -> bool {
        target == self.broadcast_target
    }
}

fn default_probe_interval() -> u64 {
    30
}

fn default_liveness_timeout() -> u64 {
    40
}

fn default_broadcast_target() -> String {
    "all".to_string()
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_identity_policy() -> IdentityPolicy {
    IdentityPolicy::Verified
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_history_limit() -> usize {
    100
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] figment::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (CHATROOM_*) < CLI args
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let config: Config = Self::figment(cli).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Nested keys use a double underscore, e.g. `CHATROOM_PRESENCE__PROBE_INTERVAL_SECS`.
    pub fn figment(cli: &Cli) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Env::prefixed("CHATROOM_").split("__"))
            .merge(Serialized::defaults(cli))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let presence = &self.presence;
        if presence.probe_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "presence.probe_interval_secs must be greater than 0".to_string(),
            ));
        }
        if presence.liveness_timeout_secs <= presence.probe_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "presence.liveness_timeout_secs ({}) must exceed presence.probe_interval_secs ({})",
                presence.liveness_timeout_secs, presence.probe_interval_secs
            )));
        }
        if presence.broadcast_target.is_empty() {
            return Err(ConfigError::Invalid(
                "presence.broadcast_target must not be empty".to_string(),
            ));
        }
        if presence.outbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "presence.outbound_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if presence.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "presence.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if presence.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "presence.history_limit must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Chatroom Server Configuration
# Place this file at ./chatroom.toml or specify with --config <path>
# Settings can be overridden via environment variables (CHATROOM_PORT,
# CHATROOM_PRESENCE__PROBE_INTERVAL_SECS, etc.) or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database (users, chat log)
# data_dir = "./data"

# ---- Presence ----
# [presence]

# Heartbeat probe interval and liveness timeout in seconds.
# The timeout must be larger than the interval.
# probe_interval_secs = 30
# liveness_timeout_secs = 40

# Message target that means "everyone"
# broadcast_target = "all"

# Frames buffered per connection; a client that falls this far behind is dropped
# outbound_queue_capacity = 256

# "verified": usernames must exist in the users table
# "open": any non-empty username may chat
# identity_policy = "verified"

# Interval in seconds between invalid-session sweeps
# sweep_interval_secs = 60

# Maximum number of messages returned by /api/messages/recent
# history_limit = 100
"#
    .to_string()
}
