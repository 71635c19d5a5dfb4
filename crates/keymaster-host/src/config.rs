//! Host transport configuration
//!
//! Defaults match the bridge firmware: 115200 baud, 5 s response timeout,
//! 400 ms settle window. Durations serialize as humantime strings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{HostError, Result};

/// Environment variable naming the serial port
pub const ENV_PORT: &str = "KEYMASTER_PORT";

/// Environment variable for the baud rate
pub const ENV_BAUD: &str = "KEYMASTER_BAUD";

/// Environment variable for the response timeout in seconds
pub const ENV_TIMEOUT: &str = "KEYMASTER_TIMEOUT";

/// Default serial baud rate
pub const DEFAULT_BAUD: u32 = 115_200;

/// Largest message accepted by the device line buffer, terminator excluded
pub const MAX_MESSAGE_LEN: usize = 4095;

/// Host transport and correlator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Serial port path; auto-detected when unset
    #[serde(default)]
    pub port: Option<String>,

    /// Baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,

    /// How long to wait for the first response line
    #[serde(with = "humantime_serde", default = "default_response_timeout")]
    pub response_timeout: Duration,

    /// Extra wait after the first response line
    #[serde(with = "humantime_serde", default = "default_settle")]
    pub settle: Duration,

    /// Timeout for slow commands like `get_context`
    #[serde(with = "humantime_serde", default = "default_long_timeout")]
    pub long_timeout: Duration,

    /// Correlator queue poll interval
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Blocking read timeout on the port
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Wait between closing a failed handle and reopening
    #[serde(with = "humantime_serde", default = "default_reconnect_cooldown")]
    pub reconnect_cooldown: Duration,

    /// Wait before retrying a failed reconnect
    #[serde(with = "humantime_serde", default = "default_reconnect_retry")]
    pub reconnect_retry: Duration,

    /// Device boot settle time after opening the port
    #[serde(with = "humantime_serde", default = "default_open_settle")]
    pub open_settle: Duration,

    /// Received lines kept before the oldest is evicted
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bytes requested per read
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,

    /// Largest outgoing message, terminator excluded
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_response_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_settle() -> Duration {
    Duration::from_millis(400)
}

fn default_long_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_reconnect_cooldown() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_retry() -> Duration {
    Duration::from_secs(2)
}

fn default_open_settle() -> Duration {
    Duration::from_millis(500)
}

fn default_queue_capacity() -> usize {
    500
}

fn default_read_chunk() -> usize {
    512
}

fn default_max_message_len() -> usize {
    MAX_MESSAGE_LEN
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_baud(),
            response_timeout: default_response_timeout(),
            settle: default_settle(),
            long_timeout: default_long_timeout(),
            poll_interval: default_poll_interval(),
            read_timeout: default_read_timeout(),
            reconnect_cooldown: default_reconnect_cooldown(),
            reconnect_retry: default_reconnect_retry(),
            open_settle: default_open_settle(),
            queue_capacity: default_queue_capacity(),
            read_chunk: default_read_chunk(),
            max_message_len: default_max_message_len(),
        }
    }
}

impl HostConfig {
    /// Defaults overridden by `KEYMASTER_PORT`, `KEYMASTER_BAUD` and
    /// `KEYMASTER_TIMEOUT`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = lookup(ENV_PORT) {
            let port = port.trim();
            if !port.is_empty() {
                config.port = Some(port.to_string());
            }
        }

        if let Some(baud) = lookup(ENV_BAUD) {
            config.baud = baud.trim().parse().map_err(|_| {
                HostError::InvalidConfig(format!("{}={:?} is not a baud rate", ENV_BAUD, baud))
            })?;
        }

        if let Some(timeout) = lookup(ENV_TIMEOUT) {
            config.response_timeout = parse_seconds(&timeout).ok_or_else(|| {
                HostError::InvalidConfig(format!(
                    "{}={:?} is not a number of seconds",
                    ENV_TIMEOUT, timeout
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the transport cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.baud == 0 {
            return Err(HostError::InvalidConfig("baud must be non-zero".into()));
        }
        if self.response_timeout.is_zero() {
            return Err(HostError::InvalidConfig(
                "response_timeout must be non-zero".into(),
            ));
        }
        if self.poll_interval.is_zero() || self.read_timeout.is_zero() {
            return Err(HostError::InvalidConfig(
                "poll_interval and read_timeout must be non-zero".into(),
            ));
        }
        if self.queue_capacity == 0 || self.read_chunk == 0 || self.max_message_len == 0 {
            return Err(HostError::InvalidConfig(
                "queue_capacity, read_chunk and max_message_len must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_seconds(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

/// Builder for HostConfig
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the port path
    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.config.port = Some(port.into());
        self
    }

    /// Set the baud rate
    pub fn baud(mut self, baud: u32) -> Self {
        self.config.baud = baud;
        self
    }

    /// Set the response timeout
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the settle window
    pub fn settle(mut self, settle: Duration) -> Self {
        self.config.settle = settle;
        self
    }

    /// Set the timeout for slow commands
    pub fn long_timeout(mut self, timeout: Duration) -> Self {
        self.config.long_timeout = timeout;
        self
    }

    /// Set the queue poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the port read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    /// Set the reconnect cooldown
    pub fn reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.reconnect_cooldown = cooldown;
        self
    }

    /// Set the reconnect retry delay
    pub fn reconnect_retry(mut self, retry: Duration) -> Self {
        self.config.reconnect_retry = retry;
        self
    }

    /// Set the settle time after opening
    pub fn open_settle(mut self, settle: Duration) -> Self {
        self.config.open_settle = settle;
        self
    }

    /// Set the receive queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Build the configuration
    pub fn build(self) -> HostConfig {
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
