//! Error types for the host-side transport

use keymaster_protocol::ProtocolError;
use thiserror::Error;

/// Main error type for host-side operations
#[derive(Error, Debug)]
pub enum HostError {
    // ===== Connection Errors =====
    /// No port given and none detected
    #[error("Bridge device not found. Set KEYMASTER_PORT (e.g. COM5 or /dev/ttyACM0) or plug in the device")]
    DeviceNotFound,

    /// Port could not be opened
    #[error("Failed to open {port}: {reason}")]
    PortOpenFailed {
        /// Port path
        port: String,
        /// Failure reason
        reason: String,
    },

    /// No open port
    #[error("Not connected")]
    NotConnected,

    // ===== I/O Errors =====
    /// Write to the port failed
    #[error("Write error: {0}")]
    Write(String),

    /// Read from the port failed
    #[error("Read error: {0}")]
    Read(String),

    // ===== Caller Errors =====
    /// Outgoing message exceeds the device line limit
    #[error("Message too long: {len} bytes (max {max})")]
    MessageTooLong {
        /// Message length without terminator
        len: usize,
        /// Allowed length
        max: usize,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ===== Protocol Errors =====
    /// Command layer error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Check if this error is transient and may succeed after reconnecting
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            HostError::NotConnected
                | HostError::Write(_)
                | HostError::Read(_)
                | HostError::PortOpenFailed { .. }
                | HostError::Io(_)
        )
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            HostError::DeviceNotFound => "DEVICE_NOT_FOUND",
            HostError::PortOpenFailed { .. } => "PORT_OPEN_FAILED",
            HostError::NotConnected => "NOT_CONNECTED",
            HostError::Write(_) => "WRITE_ERROR",
            HostError::Read(_) => "READ_ERROR",
            HostError::MessageTooLong { .. } => "MESSAGE_TOO_LONG",
            HostError::InvalidConfig(_) => "INVALID_CONFIG",
            HostError::Protocol(_) => "PROTOCOL_ERROR",
            HostError::Json(_) => "JSON_ERROR",
            HostError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for host-side operations
pub type Result<T> = std::result::Result<T, HostError>;

// Conversion from serialport errors (only when serial feature is enabled)
#[cfg(feature = "serial")]
impl From<serialport::Error> for HostError {
    fn from(err: serialport::Error) -> Self {
        HostError::Io(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(HostError::DeviceNotFound.error_code(), "DEVICE_NOT_FOUND");
        assert_eq!(
            HostError::MessageTooLong { len: 5000, max: 4095 }.error_code(),
            "MESSAGE_TOO_LONG"
        );
    }

    #[test]
    fn test_is_retriable() {
        assert!(HostError::Write("broken pipe".into()).is_retriable());
        assert!(!HostError::DeviceNotFound.is_retriable());
        assert!(!HostError::MessageTooLong { len: 1, max: 0 }.is_retriable());
    }

    #[test]
    fn test_not_found_message_mentions_env() {
        assert!(HostError::DeviceNotFound.to_string().contains("KEYMASTER_PORT"));
    }
}
