//! Configuration for the multicast transport and both sessions
//!
//! Loaded from TOML; every field has a default so a partial file (or none at
//! all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::buffer::{MAX_CAPACITY_EXPONENT, MIN_CAPACITY_EXPONENT};
use crate::audio::wav::WaveFormat;
use crate::constants::*;
use crate::error::ConfigError;

/// Top-level application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

/// Multicast group membership settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Multicast group address or host name
    pub group: String,
    /// UDP port shared by sender and receivers
    pub port: u16,
    /// Local address to bind
    pub bind_address: String,
    /// Outbound/membership IPv4 interface address; the OS picks when unset
    pub interface: Option<String>,
    /// Multicast TTL (hop limit for IPv6 groups)
    pub ttl: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_MULTICAST_GROUP.to_string(),
            port: DEFAULT_UDP_PORT,
            bind_address: "0.0.0.0".to_string(),
            interface: None,
            ttl: DEFAULT_TTL,
        }
    }
}

/// Sender loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Bytes per datagram
    pub chunk_size: usize,
    /// Send cadence in milliseconds; 0 derives it from the source byte rate
    pub period_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            period_ms: 0,
        }
    }
}

impl SenderConfig {
    /// Period between datagrams for a source of the given format
    pub fn period_for(&self, format: &WaveFormat) -> Duration {
        if self.period_ms > 0 {
            return Duration::from_millis(self.period_ms);
        }
        format
            .base()
            .duration_of(self.chunk_size)
            .max(Duration::from_millis(1))
    }
}

/// Receiver loop and jitter buffer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Jitter buffer holds `2^capacity_exponent` bytes
    pub capacity_exponent: u32,
    /// Cancellation wait between socket drains
    pub poll_interval_ms: u64,
    /// Initial receive scratch buffer size
    pub initial_scratch: usize,
    /// Scratch buffer growth cap
    pub max_scratch: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            capacity_exponent: DEFAULT_CAPACITY_EXPONENT,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            initial_scratch: DEFAULT_CHUNK_SIZE,
            max_scratch: MAX_DATAGRAM_SIZE,
        }
    }
}

impl ReceiverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl AppConfig {
    /// Load and validate a TOML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: AppConfig = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file at [`AppConfig::default_path`], or defaults when absent
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/lan-multicast-audio/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-multicast-audio")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values the engine cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.group.trim().is_empty() {
            return Err(ConfigError::Invalid("network.group is empty".into()));
        }
        if self.network.ttl == 0 || self.network.ttl > 255 {
            return Err(ConfigError::Invalid(format!(
                "network.ttl must be within 1..=255, got {}",
                self.network.ttl
            )));
        }
        if self.sender.chunk_size == 0 || self.sender.chunk_size > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::Invalid(format!(
                "sender.chunk_size must be within 1..={}, got {}",
                MAX_DATAGRAM_SIZE, self.sender.chunk_size
            )));
        }
        if !(MIN_CAPACITY_EXPONENT..=MAX_CAPACITY_EXPONENT)
            .contains(&self.receiver.capacity_exponent)
        {
            return Err(ConfigError::Invalid(format!(
                "receiver.capacity_exponent must be within {}..={}, got {}",
                MIN_CAPACITY_EXPONENT, MAX_CAPACITY_EXPONENT, self.receiver.capacity_exponent
            )));
        }
        if self.receiver.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "receiver.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.receiver.initial_scratch == 0
            || self.receiver.max_scratch < self.receiver.initial_scratch
        {
            return Err(ConfigError::Invalid(format!(
                "receiver scratch sizes must satisfy 0 < initial ({}) <= max ({})",
                self.receiver.initial_scratch, self.receiver.max_scratch
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wav::PcmFormat;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.group, "239.255.77.77");
        assert_eq!(config.receiver.capacity_exponent, 16);
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            group = "239.1.2.3"
            ttl = 4

            [receiver]
            capacity_exponent = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.network.group, "239.1.2.3");
        assert_eq!(config.network.ttl, 4);
        assert_eq!(config.network.port, DEFAULT_UDP_PORT);
        assert_eq!(config.receiver.capacity_exponent, 12);
        assert_eq!(config.sender, SenderConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let mut config = AppConfig::default();
        config.receiver.capacity_exponent = 17;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = AppConfig::default();
        config.sender.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.receiver.max_scratch = config.receiver.initial_scratch - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_period_for_format() {
        let format = WaveFormat::Pcm(PcmFormat::pcm16(2, 48000).unwrap());
        let mut sender = SenderConfig {
            chunk_size: 1920,
            period_ms: 0,
        };
        assert_eq!(sender.period_for(&format), Duration::from_millis(10));

        sender.period_ms = 3;
        assert_eq!(sender.period_for(&format), Duration::from_millis(3));
    }
}
