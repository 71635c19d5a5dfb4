//! Wire protocol for the KeyMaster serial/BLE bridge
//!
//! This crate holds everything both ends of the bridge must agree on, with
//! no I/O and no runtime:
//!
//! 1. **Framing** ([`frame`]) - `CHUNK:n/N:` frames, `RAW:` and
//!    `ERR:CHUNK_TIMEOUT:` marker lines, link-level fragmentation
//! 2. **Reassembly** ([`reassembly`]) - single-slot chunk reassembly with
//!    timeout reporting
//! 3. **Line buffering** ([`line`]) - bounded newline splitting for byte
//!    streams
//! 4. **Command layer** ([`command`]) - `CMD:` / `RSP:` / `ACK:` / `ERR:`
//!    lines used by host tools on top of the opaque line transport
//!
//! # Example
//!
//! ```rust
//! use keymaster_protocol::{Chunk, ChunkSplitter, Progress, Reassembler};
//! use std::time::Instant;
//!
//! let splitter = ChunkSplitter::default();
//! let message = "x".repeat(1200);
//!
//! let mut reassembler = Reassembler::default();
//! let mut result = None;
//! for frame in splitter.frames(&message) {
//!     let chunk = Chunk::parse(&frame).unwrap();
//!     if let Progress::Complete(text) = reassembler.accept(chunk, Instant::now()) {
//!         result = Some(text);
//!     }
//! }
//! assert_eq!(result.unwrap().trim_end(), message);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod command;
pub mod error;
pub mod frame;
pub mod line;
pub mod reassembly;

pub use command::{Command, Response};
pub use error::{ProtocolError, Result};
pub use frame::{
    chunk_timeout_line, fragments, is_chunk, preview, raw_line, terminated, Chunk, ChunkSplitter,
};
pub use line::{LineBuffer, Overflow};
pub use reassembly::{Expired, Progress, Reassembler};

// Protocol constants re-exports
pub use frame::{
    CHUNK_HEADER_RESERVE, CHUNK_PREFIX, CHUNK_TIMEOUT_PREFIX, DEFAULT_CHUNK_PAYLOAD,
    DEFAULT_CHUNK_TIMEOUT_MS, DEFAULT_LINE_LIMIT, DEFAULT_NOTIFY_SIZE, LINE_TERMINATOR, RAW_PREFIX,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
