//! Configuration types for the device-side bridge
//!
//! Covers the GATT peripheral identity, framing limits, supervisor
//! timing and bridge loop timing. Every `Duration` serializes as a
//! humantime string (`"5s"`, `"250ms"`).

use keymaster_protocol::{
    CHUNK_HEADER_RESERVE, DEFAULT_CHUNK_PAYLOAD, DEFAULT_CHUNK_TIMEOUT_MS, DEFAULT_LINE_LIMIT,
    DEFAULT_NOTIFY_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{LinkError, Result};

/// Default advertised device name
pub const DEFAULT_DEVICE_NAME: &str = "KeyMaster";

/// GATT service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xa0e1b2c3_d4e5_f6a7_b8c9_0a1b2c3d4e50);

/// Device to peer characteristic (notify)
pub const TX_UUID: Uuid = Uuid::from_u128(0xa0e1b2c3_d4e5_f6a7_b8c9_0a1b2c3d4e51);

/// Peer to device characteristic (write)
pub const RX_UUID: Uuid = Uuid::from_u128(0xa0e1b2c3_d4e5_f6a7_b8c9_0a1b2c3d4e52);

/// Main configuration for the device-side bridge
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Peripheral identity
    #[serde(default)]
    pub peripheral: PeripheralConfig,

    /// Framing limits
    #[serde(default)]
    pub framing: FramingConfig,

    /// Connection supervisor timing
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Bridge loop timing
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl LinkConfig {
    /// Load a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: LinkConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent limits
    pub fn validate(&self) -> Result<()> {
        let framing = &self.framing;
        if framing.chunk_payload <= CHUNK_HEADER_RESERVE {
            return Err(LinkError::InvalidConfig(format!(
                "chunk_payload {} must exceed the {}-byte header reserve",
                framing.chunk_payload, CHUNK_HEADER_RESERVE
            )));
        }
        if framing.notify_size == 0 {
            return Err(LinkError::InvalidConfig("notify_size must be > 0".into()));
        }
        if framing.line_limit == 0 {
            return Err(LinkError::InvalidConfig("line_limit must be > 0".into()));
        }
        if framing.chunk_timeout.is_zero() {
            return Err(LinkError::InvalidConfig("chunk_timeout must be > 0".into()));
        }
        if self.supervisor.liveness_interval.is_zero() {
            return Err(LinkError::InvalidConfig(
                "liveness_interval must be > 0".into(),
            ));
        }
        if self.bridge.poll_interval.is_zero() || self.bridge.write_wait.is_zero() {
            return Err(LinkError::InvalidConfig(
                "poll_interval and write_wait must be > 0".into(),
            ));
        }
        if self.peripheral.device_name.is_empty() {
            return Err(LinkError::InvalidConfig("device_name is empty".into()));
        }
        Ok(())
    }
}

/// GATT peripheral identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeripheralConfig {
    /// Advertised local name
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Service UUID
    #[serde(default = "default_service_uuid")]
    pub service_uuid: Uuid,

    /// Notify characteristic (device to peer)
    #[serde(default = "default_tx_uuid")]
    pub tx_uuid: Uuid,

    /// Write characteristic (peer to device)
    #[serde(default = "default_rx_uuid")]
    pub rx_uuid: Uuid,

    /// Advertising interval
    #[serde(with = "humantime_serde", default = "default_advertise_interval")]
    pub advertise_interval: Duration,
}

fn default_device_name() -> String {
    DEFAULT_DEVICE_NAME.to_string()
}

fn default_service_uuid() -> Uuid {
    SERVICE_UUID
}

fn default_tx_uuid() -> Uuid {
    TX_UUID
}

fn default_rx_uuid() -> Uuid {
    RX_UUID
}

fn default_advertise_interval() -> Duration {
    Duration::from_millis(250)
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            service_uuid: SERVICE_UUID,
            tx_uuid: TX_UUID,
            rx_uuid: RX_UUID,
            advertise_interval: default_advertise_interval(),
        }
    }
}

/// Framing limits shared by the splitter, fragmenter and reassembler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramingConfig {
    /// Largest host line sent without chunk framing, terminator excluded
    #[serde(default = "default_chunk_payload")]
    pub chunk_payload: usize,

    /// Largest single notification
    #[serde(default = "default_notify_size")]
    pub notify_size: usize,

    /// Host line buffer limit
    #[serde(default = "default_line_limit")]
    pub line_limit: usize,

    /// Partial reassembly lifetime
    #[serde(with = "humantime_serde", default = "default_chunk_timeout")]
    pub chunk_timeout: Duration,
}

fn default_chunk_payload() -> usize {
    DEFAULT_CHUNK_PAYLOAD
}

fn default_notify_size() -> usize {
    DEFAULT_NOTIFY_SIZE
}

fn default_line_limit() -> usize {
    DEFAULT_LINE_LIMIT
}

fn default_chunk_timeout() -> Duration {
    Duration::from_millis(DEFAULT_CHUNK_TIMEOUT_MS)
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            chunk_payload: DEFAULT_CHUNK_PAYLOAD,
            notify_size: DEFAULT_NOTIFY_SIZE,
            line_limit: DEFAULT_LINE_LIMIT,
            chunk_timeout: default_chunk_timeout(),
        }
    }
}

/// Connection supervisor timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How often a live connection is checked
    #[serde(with = "humantime_serde", default = "default_liveness_interval")]
    pub liveness_interval: Duration,

    /// Pause after an advertise/connection error
    #[serde(with = "humantime_serde", default = "default_error_backoff")]
    pub error_backoff: Duration,
}

fn default_liveness_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_error_backoff() -> Duration {
    Duration::from_secs(1)
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            liveness_interval: default_liveness_interval(),
            error_backoff: default_error_backoff(),
        }
    }
}

/// Bridge loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host read poll interval, also the chunk timeout check tick
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// How long one inbound wait blocks
    #[serde(with = "humantime_serde", default = "default_write_wait")]
    pub write_wait: Duration,

    /// Pause after an inbound wait timed out
    #[serde(with = "humantime_serde", default = "default_idle_backoff")]
    pub idle_backoff: Duration,

    /// Pause after an inbound wait found no peer
    #[serde(with = "humantime_serde", default = "default_disconnected_backoff")]
    pub disconnected_backoff: Duration,

    /// Wait before discarding boot noise on the host link (zero disables)
    #[serde(with = "humantime_serde", default = "default_startup_flush")]
    pub startup_flush: Duration,

    /// Characters of a message passed to the activity observer
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_write_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_idle_backoff() -> Duration {
    Duration::from_millis(50)
}

fn default_disconnected_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_startup_flush() -> Duration {
    Duration::from_millis(500)
}

fn default_preview_chars() -> usize {
    40
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            write_wait: default_write_wait(),
            idle_backoff: default_idle_backoff(),
            disconnected_backoff: default_disconnected_backoff(),
            startup_flush: default_startup_flush(),
            preview_chars: default_preview_chars(),
        }
    }
}

/// Builder for LinkConfig
#[derive(Debug, Default)]
pub struct LinkConfigBuilder {
    config: LinkConfig,
}

impl LinkConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised name
    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.config.peripheral.device_name = name.into();
        self
    }

    /// Set the unchunked payload limit
    pub fn chunk_payload(mut self, bytes: usize) -> Self {
        self.config.framing.chunk_payload = bytes;
        self
    }

    /// Set the notification size
    pub fn notify_size(mut self, bytes: usize) -> Self {
        self.config.framing.notify_size = bytes;
        self
    }

    /// Set the host line buffer limit
    pub fn line_limit(mut self, bytes: usize) -> Self {
        self.config.framing.line_limit = bytes;
        self
    }

    /// Set the reassembly timeout
    pub fn chunk_timeout(mut self, timeout: Duration) -> Self {
        self.config.framing.chunk_timeout = timeout;
        self
    }

    /// Set the liveness poll interval
    pub fn liveness_interval(mut self, interval: Duration) -> Self {
        self.config.supervisor.liveness_interval = interval;
        self
    }

    /// Set the error backoff
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.supervisor.error_backoff = backoff;
        self
    }

    /// Set the host poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.bridge.poll_interval = interval;
        self
    }

    /// Set the startup flush wait
    pub fn startup_flush(mut self, wait: Duration) -> Self {
        self.config.bridge.startup_flush = wait;
        self
    }

    /// Build the configuration
    pub fn build(self) -> LinkConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::default();
        assert_eq!(config.peripheral.device_name, "KeyMaster");
        assert_eq!(config.framing.chunk_payload, 480);
        assert_eq!(config.framing.notify_size, 200);
        assert_eq!(config.framing.chunk_timeout, Duration::from_secs(5));
        assert_eq!(config.supervisor.error_backoff, Duration::from_secs(1));
        assert_eq!(config.bridge.poll_interval, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "a0e1b2c3-d4e5-f6a7-b8c9-0a1b2c3d4e50"
        );
        assert_eq!(TX_UUID.to_string(), "a0e1b2c3-d4e5-f6a7-b8c9-0a1b2c3d4e51");
        assert_eq!(RX_UUID.to_string(), "a0e1b2c3-d4e5-f6a7-b8c9-0a1b2c3d4e52");
    }

    #[test]
    fn test_config_builder() {
        let config = LinkConfigBuilder::new()
            .device_name("Bench")
            .chunk_timeout(Duration::from_secs(2))
            .startup_flush(Duration::ZERO)
            .build();

        assert_eq!(config.peripheral.device_name, "Bench");
        assert_eq!(config.framing.chunk_timeout, Duration::from_secs(2));
        assert!(config.bridge.startup_flush.is_zero());
    }

    #[test]
    fn test_validate_rejects_small_payload() {
        let config = LinkConfigBuilder::new().chunk_payload(20).build();
        assert!(matches!(
            config.validate(),
            Err(LinkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_notify() {
        let config = LinkConfigBuilder::new().notify_size(0).build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_humantime_durations() {
        let json = r#"{
            "framing": { "chunk_timeout": "3s" },
            "bridge": { "startup_flush": "0s", "poll_interval": "20ms" }
        }"#;
        let config: LinkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.framing.chunk_timeout, Duration::from_secs(3));
        assert_eq!(config.framing.chunk_payload, 480);
        assert!(config.bridge.startup_flush.is_zero());
        assert_eq!(config.bridge.poll_interval, Duration::from_millis(20));

        let out = serde_json::to_string(&config).unwrap();
        assert!(out.contains("\"3s\""));
    }
}
