//! Configuration system for rasterlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $RASTERLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/rasterlink/config.toml
//!   3. ~/.config/rasterlink/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::CHUNK_SIZE;

/// Largest raster whose chunk indices all fit the u32 index field.
pub const MAX_RASTER_BYTES_LIMIT: u64 = u32::MAX as u64 * CHUNK_SIZE as u64;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterLinkConfig {
    pub network: NetworkConfig,
    pub transfer: TransferConfig,
    pub relay: RelayConfig,
    pub files: FilesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Where the receiver accepts transfers.
    pub receiver_listen: String,
    /// Where the relay accepts senders.
    pub relay_listen: String,
    /// The relay's fixed upstream target (the receiver).
    pub upstream: String,
    /// Where the sender connects (the relay).
    pub relay_addr: String,
    /// Deadline for a single receive. 0 = block indefinitely.
    pub receive_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Probability the sender silently skips a requested resend.
    /// Models an unreliable uplink for retries, on top of relay loss.
    pub resend_drop_probability: f64,
    /// Largest raster a receiver will allocate for.
    pub max_raster_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Probability a chunk message is discarded entirely.
    pub drop_probability: f64,
    /// Per-byte probability a forwarded pixel is zeroed.
    pub noise_probability: f64,
    /// Seed for every random source. `None` = seeded from the OS.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Image the sender transmits. `.png` is read as PNG, anything else as PGM.
    pub source_image: PathBuf,
    /// Where the receiver writes completed transfers.
    pub output_dir: PathBuf,
    pub unfiltered_name: String,
    pub filtered_name: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            receiver_listen: "0.0.0.0:12345".to_string(),
            relay_listen: "0.0.0.0:54321".to_string(),
            upstream: "127.0.0.1:12345".to_string(),
            relay_addr: "127.0.0.1:54321".to_string(),
            receive_timeout_secs: 0,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            resend_drop_probability: 0.05,
            max_raster_bytes: 256 * 1024 * 1024,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            drop_probability: 0.1,
            noise_probability: 0.1,
            seed: None,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            source_image: PathBuf::from("256.pgm"),
            output_dir: PathBuf::from("."),
            unfiltered_name: "unfiltered.pgm".to_string(),
            filtered_name: "filtered.pgm".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn receive_timeout(&self) -> Option<Duration> {
        (self.receive_timeout_secs > 0).then(|| Duration::from_secs(self.receive_timeout_secs))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("rasterlink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("{field} must be within [0, 1], got {value}")]
    InvalidProbability { field: &'static str, value: f64 },
    #[error("transfer.max_raster_bytes must be at most {limit}, got {value}")]
    RasterLimitTooLarge { value: u64, limit: u64 },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl RasterLinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RasterLinkConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("RASTERLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RasterLinkConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject probabilities a Bernoulli trial cannot take, and raster
    /// limits beyond what a u32 chunk index can address.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.max_raster_bytes > MAX_RASTER_BYTES_LIMIT {
            return Err(ConfigError::RasterLimitTooLarge {
                value: self.transfer.max_raster_bytes,
                limit: MAX_RASTER_BYTES_LIMIT,
            });
        }
        let probabilities = [
            (
                "transfer.resend_drop_probability",
                self.transfer.resend_drop_probability,
            ),
            ("relay.drop_probability", self.relay.drop_probability),
            ("relay.noise_probability", self.relay.noise_probability),
        ];
        for (field, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { field, value });
            }
        }
        Ok(())
    }

    /// Apply RASTERLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RASTERLINK_NETWORK__RECEIVER_LISTEN") {
            self.network.receiver_listen = v;
        }
        if let Some(v) = lookup("RASTERLINK_NETWORK__RELAY_LISTEN") {
            self.network.relay_listen = v;
        }
        if let Some(v) = lookup("RASTERLINK_NETWORK__UPSTREAM") {
            self.network.upstream = v;
        }
        if let Some(v) = lookup("RASTERLINK_NETWORK__RELAY_ADDR") {
            self.network.relay_addr = v;
        }
        if let Some(v) = lookup("RASTERLINK_NETWORK__RECEIVE_TIMEOUT_SECS") {
            if let Ok(secs) = v.parse() {
                self.network.receive_timeout_secs = secs;
            }
        }
        if let Some(v) = lookup("RASTERLINK_TRANSFER__RESEND_DROP_PROBABILITY") {
            if let Ok(p) = v.parse() {
                self.transfer.resend_drop_probability = p;
            }
        }
        if let Some(v) = lookup("RASTERLINK_RELAY__DROP_PROBABILITY") {
            if let Ok(p) = v.parse() {
                self.relay.drop_probability = p;
            }
        }
        if let Some(v) = lookup("RASTERLINK_RELAY__NOISE_PROBABILITY") {
            if let Ok(p) = v.parse() {
                self.relay.noise_probability = p;
            }
        }
        if let Some(v) = lookup("RASTERLINK_RELAY__SEED") {
            self.relay.seed = v.parse().ok();
        }
        if let Some(v) = lookup("RASTERLINK_FILES__OUTPUT_DIR") {
            self.files.output_dir = PathBuf::from(v);
        }
    }
}
