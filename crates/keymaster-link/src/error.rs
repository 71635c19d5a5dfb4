//! Error types for the device-side bridge
//!
//! Errors fall into four groups. Radio and host link errors are transient
//! and recovered by the supervisor and bridge loops. Protocol errors are
//! turned into visible marker lines. Configuration errors stop startup.

use keymaster_protocol::ProtocolError;
use thiserror::Error;

/// Main error type for device-side bridge operations
#[derive(Error, Debug)]
pub enum LinkError {
    // ===== Radio Errors =====
    /// No usable Bluetooth adapter
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// Advertising could not be started
    #[error("Advertising failed: {0}")]
    AdvertiseFailed(String),

    /// Peer went away during an operation
    #[error("Peer disconnected")]
    Disconnected,

    /// Operation needs a connected peer
    #[error("No peer connected")]
    NotConnected,

    /// Notification could not be delivered
    #[error("Notification failed: {0}")]
    NotifyFailed(String),

    /// Other radio stack failure
    #[error("Radio error: {0}")]
    Radio(String),

    // ===== Host Link Errors =====
    /// Host serial port open failed
    #[error("Failed to open host port {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// Host link read error
    #[error("Host link read error: {0}")]
    HostRead(String),

    /// Host link write error
    #[error("Host link write error: {0}")]
    HostWrite(String),

    // ===== Protocol Errors =====
    /// Framing error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== General Errors =====
    /// Bridge control channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// JSON error (configuration files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Check if this error is transient and handled by a retry loop
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LinkError::AdvertiseFailed(_)
                | LinkError::Disconnected
                | LinkError::NotConnected
                | LinkError::NotifyFailed(_)
                | LinkError::Radio(_)
                | LinkError::HostRead(_)
                | LinkError::HostWrite(_)
                | LinkError::Io(_)
        )
    }

    /// Check if this error means the peer is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, LinkError::Disconnected | LinkError::NotConnected)
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            LinkError::AdapterUnavailable(_) => "ADAPTER_UNAVAILABLE",
            LinkError::AdvertiseFailed(_) => "ADVERTISE_FAILED",
            LinkError::Disconnected => "DISCONNECTED",
            LinkError::NotConnected => "NOT_CONNECTED",
            LinkError::NotifyFailed(_) => "NOTIFY_FAILED",
            LinkError::Radio(_) => "RADIO_ERROR",
            LinkError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            LinkError::HostRead(_) => "HOST_READ_ERROR",
            LinkError::HostWrite(_) => "HOST_WRITE_ERROR",
            LinkError::Protocol(_) => "PROTOCOL_ERROR",
            LinkError::InvalidConfig(_) => "INVALID_CONFIG",
            LinkError::ChannelClosed => "CHANNEL_CLOSED",
            LinkError::Json(_) => "JSON_ERROR",
            LinkError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for device-side operations
pub type Result<T> = std::result::Result<T, LinkError>;

// Conversion from BlueZ errors (only when ble feature is enabled)
#[cfg(feature = "ble")]
impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        LinkError::Radio(err.to_string())
    }
}

// Conversion from tokio mpsc send error
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for LinkError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        LinkError::ChannelClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(LinkError::Disconnected.error_code(), "DISCONNECTED");
        assert_eq!(
            LinkError::InvalidConfig("x".into()).error_code(),
            "INVALID_CONFIG"
        );
    }

    #[test]
    fn test_is_retriable() {
        assert!(LinkError::Disconnected.is_retriable());
        assert!(LinkError::AdvertiseFailed("busy".into()).is_retriable());
        assert!(!LinkError::InvalidConfig("x".into()).is_retriable());
        assert!(!LinkError::Protocol(ProtocolError::NotAChunk).is_retriable());
    }

    #[test]
    fn test_is_disconnect() {
        assert!(LinkError::NotConnected.is_disconnect());
        assert!(!LinkError::Radio("x".into()).is_disconnect());
    }
}
