//! Error types for KeyMaster wire protocol handling
//!
//! Protocol errors never travel over the link as Rust values. The bridge
//! turns them into visible `RAW:` / `ERR:` marker lines instead, so these
//! variants are mostly consumed by the device bridge and the host command
//! layer.

use thiserror::Error;

/// Main error type for framing and command-layer operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    // ===== Framing Errors =====
    /// Message does not start with the `CHUNK:` prefix
    #[error("Not a chunk frame")]
    NotAChunk,

    /// `CHUNK:` header could not be parsed
    #[error("Malformed chunk header: {0}")]
    MalformedChunk(String),

    /// Chunk index outside `1..=total`
    #[error("Chunk index {index} out of range for total {total}")]
    ChunkOutOfRange {
        /// Announced chunk index
        index: usize,
        /// Announced chunk total
        total: usize,
    },

    /// Chunk size too small to carry any payload after the header
    #[error("Chunk size {0} leaves no room for payload")]
    ChunkSizeTooSmall(usize),

    // ===== Command Layer Errors =====
    /// Command name empty or containing a reserved character
    #[error("Invalid command name: {0:?}")]
    InvalidCommandName(String),

    /// JSON payload encode/decode failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Check if this error came from a malformed frame on the wire
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotAChunk
                | ProtocolError::MalformedChunk(_)
                | ProtocolError::ChunkOutOfRange { .. }
        )
    }
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_classification() {
        assert!(ProtocolError::MalformedChunk("x".into()).is_framing_error());
        assert!(ProtocolError::ChunkOutOfRange { index: 4, total: 3 }.is_framing_error());
        assert!(!ProtocolError::InvalidCommandName(String::new()).is_framing_error());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = ProtocolError::ChunkOutOfRange { index: 4, total: 3 };
        assert!(err.to_string().contains('4'));
        assert!(err.to_string().contains('3'));
    }
}
