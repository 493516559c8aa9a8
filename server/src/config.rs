use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Command-line flags. Only flags that were actually given are layered
/// over the file and environment.
#[derive(Parser, Serialize, Clone, Debug, Default)]
#[command(name = "agora-server", version, about = "Agora real-time messaging server")]
pub struct CliArgs {
    /// Port to listen on [default: 1984]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<String>,

    /// Path to TOML config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    #[serde(skip)]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub generate_config: bool,

    /// Data directory for the SQLite database [default: ./data]
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

const DEFAULT_CONFIG_PATH: &str = "./agora.toml";

/// Effective server configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub json_logs: bool,
    #[serde(default)]
    pub generate_config: bool,
    pub data_dir: String,

    /// Delivery and presence tuning ([messaging] section in TOML)
    #[serde(default)]
    pub messaging: MessagingConfig,
}

/// Tuning for connections, presence and the notification queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Frames a connection may have waiting before it is evicted (default: 100)
    #[serde(default = "default_send_queue_depth")]
    pub send_queue_depth: usize,

    /// Server ping and idle sweep interval in seconds (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Seconds without client activity before online becomes away (default: 90)
    #[serde(default = "default_away_timeout")]
    pub away_timeout_secs: u64,

    /// Seconds after the last connection closes before the user goes offline (default: 15)
    #[serde(default = "default_offline_grace")]
    pub offline_grace_secs: u64,

    /// Seconds without any inbound frame before a connection is dropped (default: 120)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Maximum unacknowledged notifications per user (default: 1000)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Milliseconds between delivery worker rounds (default: 500)
    #[serde(default = "default_delivery_interval")]
    pub delivery_interval_ms: u64,

    /// Days to keep acknowledged notifications before purge (default: 30)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Interval in seconds between retention cleanup runs (default: 3600 = 1 hour)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Maximum message body length in characters (default: 4000)
    #[serde(default = "default_max_body_length")]
    pub max_body_length: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            send_queue_depth: default_send_queue_depth(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            away_timeout_secs: default_away_timeout(),
            offline_grace_secs: default_offline_grace(),
            idle_timeout_secs: default_idle_timeout(),
            queue_capacity: default_queue_capacity(),
            delivery_interval_ms: default_delivery_interval(),
            retention_days: default_retention_days(),
            cleanup_interval_secs: default_cleanup_interval(),
            max_body_length: default_max_body_length(),
        }
    }
}

impl MessagingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn away_timeout(&self) -> Duration {
        Duration::from_secs(self.away_timeout_secs)
    }

    pub fn offline_grace(&self) -> Duration {
        Duration::from_secs(self.offline_grace_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.delivery_interval_ms.max(10))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

fn default_send_queue_depth() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_away_timeout() -> u64 {
    90
}

fn default_offline_grace() -> u64 {
    15
}

fn default_idle_timeout() -> u64 {
    120
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_delivery_interval() -> u64 {
    500
}

fn default_retention_days() -> u32 {
    30
}

fn default_cleanup_interval() -> u64 {
    3600
}

fn default_max_body_length() -> usize {
    4000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 1984,
            bind_address: "0.0.0.0".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            messaging: MessagingConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (AGORA_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = CliArgs::parse();
        Self::figment(&cli).extract()
    }

    /// The layered provider stack for `cli`.
    pub fn figment(cli: &CliArgs) -> Figment {
        let config_path = if cli.config.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            cli.config.as_str()
        };

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("AGORA_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Agora Messaging Server Configuration
# Place this file at ./agora.toml or specify with --config <path>
# All settings can be overridden via environment variables (AGORA_PORT,
# AGORA_MESSAGING__QUEUE_CAPACITY, etc.) or CLI flags (--port, etc.)

# Server port (default: 1984)
# port = 1984

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database
# data_dir = "./data"

# ---- Delivery and Presence ----
# [messaging]

# Frames a connection may have waiting before it is evicted as a slow consumer
# send_queue_depth = 100

# Server ping and idle sweep interval in seconds
# heartbeat_interval_secs = 30

# Seconds without client activity before online becomes away
# away_timeout_secs = 90

# Seconds after the last connection closes before the user is shown offline
# offline_grace_secs = 15

# Seconds without any inbound frame before a connection is dropped
# idle_timeout_secs = 120

# Maximum unacknowledged notifications per user; further writes are rejected
# queue_capacity = 1000

# Milliseconds between delivery worker rounds
# delivery_interval_ms = 500

# Days to keep acknowledged notifications before purge
# retention_days = 30

# Interval in seconds between retention cleanup runs (default: 3600 = 1 hour)
# cleanup_interval_secs = 3600

# Maximum message body length in characters
# max_body_length = 4000
"#
    .to_string()
}
