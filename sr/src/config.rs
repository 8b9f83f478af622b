//! StreamRelay configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stream::{LossThresholds, SessionSettings};

/// Main StreamRelay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-stream timing and bus sizing
    pub relay: RelayConfig,

    /// Loss detection thresholds
    pub loss: LossConfig,

    /// Device binding
    pub binding: BindingConfig,

    /// HTTP/SSE listener
    pub server: ServerConfig,

    /// Upstream agent socket
    #[serde(rename = "agent-link")]
    pub agent_link: AgentLinkConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.relay.poll_interval_ms == 0 {
            return Err(eyre::eyre!("relay.poll-interval-ms must be greater than zero"));
        }
        if self.relay.idle_timeout_ms == 0 {
            return Err(eyre::eyre!("relay.idle-timeout-ms must be greater than zero"));
        }
        if self.relay.channel_capacity == 0 {
            return Err(eyre::eyre!("relay.channel-capacity must be greater than zero"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, it must load
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: ./streamrelay.yml
        let local_config = PathBuf::from("streamrelay.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/streamrelay/streamrelay.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("streamrelay").join("streamrelay.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Session knobs derived from `relay` and `loss`
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            idle_timeout: Duration::from_millis(self.relay.idle_timeout_ms),
            poll_interval: Duration::from_millis(self.relay.poll_interval_ms),
            summary_grace: Duration::from_millis(self.relay.summary_grace_ms),
            thresholds: self.loss.thresholds(),
        }
    }
}

/// Per-stream timing and bus sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upstream silence before a stream is timed out
    #[serde(rename = "idle-timeout-ms")]
    pub idle_timeout_ms: u64,

    /// Bounded wait on the inbound queue
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// How long to wait for a summary after the end marker (0 disables)
    #[serde(rename = "summary-grace-ms")]
    pub summary_grace_ms: u64,

    /// Per-topic bus buffer
    #[serde(rename = "channel-capacity")]
    pub channel_capacity: usize,

    /// Mirror downstream frames onto `observer_{destination}`
    pub observer: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
            poll_interval_ms: 100,
            summary_grace_ms: 1000,
            channel_capacity: 1024,
            observer: true,
        }
    }
}

/// Loss detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossConfig {
    #[serde(rename = "min-fragment-gap")]
    pub min_fragment_gap: u64,

    #[serde(rename = "min-content-gap")]
    pub min_content_gap: u64,
}

impl Default for LossConfig {
    fn default() -> Self {
        let thresholds = LossThresholds::default();
        Self {
            min_fragment_gap: thresholds.min_fragment_gap,
            min_content_gap: thresholds.min_content_gap,
        }
    }
}

impl LossConfig {
    pub fn thresholds(&self) -> LossThresholds {
        LossThresholds {
            min_fragment_gap: self.min_fragment_gap,
            min_content_gap: self.min_content_gap,
        }
    }
}

/// Device binding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Lifetime of an issued token
    #[serde(rename = "token-ttl-secs")]
    pub token_ttl_secs: u64,

    /// How long a stream stays marked as awaiting a photo
    #[serde(rename = "offer-ttl-secs")]
    pub offer_ttl_secs: u64,

    /// Optical code decode endpoint
    #[serde(rename = "decoder-url")]
    pub decoder_url: String,

    #[serde(rename = "decoder-timeout-ms")]
    pub decoder_timeout_ms: u64,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 300,
            offer_ttl_secs: 600,
            decoder_url: "https://api.2dcode.biz/v1/read-qr-code".to_string(),
            decoder_timeout_ms: 10_000,
        }
    }
}

impl BindingConfig {
    pub fn token_ttl_ms(&self) -> i64 {
        (self.token_ttl_secs as i64).saturating_mul(1000)
    }

    pub fn offer_ttl(&self) -> Duration {
        Duration::from_secs(self.offer_ttl_secs)
    }

    pub fn decoder_timeout(&self) -> Duration {
        Duration::from_millis(self.decoder_timeout_ms)
    }
}

/// HTTP/SSE listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub bind: String,

    /// Accepted bearer keys; empty disables the check
    #[serde(rename = "access-keys")]
    pub access_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            access_keys: Vec::new(),
        }
    }
}

/// Upstream agent socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLinkConfig {
    /// Unix socket the agents connect to
    #[serde(rename = "socket-path")]
    pub socket_path: PathBuf,

    /// A destination unseen for longer than this is offline (0 disables)
    #[serde(rename = "presence-window-secs")]
    pub presence_window_secs: u64,
}

impl Default for AgentLinkConfig {
    fn default() -> Self {
        // Use XDG runtime directory when available, else the temp dir
        let socket_path = dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("streamrelay.sock");

        Self {
            socket_path,
            presence_window_secs: 300,
        }
    }
}

impl AgentLinkConfig {
    pub fn presence_window_ms(&self) -> i64 {
        (self.presence_window_secs as i64).saturating_mul(1000)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the relay store
    #[serde(rename = "store-dir")]
    pub store_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // Use XDG data directory (~/.local/share/streamrelay on Linux)
        let store_dir = dirs::data_dir()
            .map(|d| d.join("streamrelay"))
            .unwrap_or_else(|| PathBuf::from(".streamrelay"))
            .to_string_lossy()
            .into_owned();

        Self { store_dir }
    }
}
