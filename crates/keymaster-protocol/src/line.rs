//! Newline-delimited line buffer with a hard size limit
//!
//! Bytes arrive in arbitrary pieces. Complete lines are split out without
//! their terminator. If the buffer grows past the limit and holds no
//! terminator at all, its contents are discarded instead of growing forever.

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::frame::DEFAULT_LINE_LIMIT;

/// Report of an unterminated line thrown away by the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    /// Bytes discarded
    pub discarded: usize,
}

/// Accumulates bytes and yields terminated lines
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    limit: usize,
}

impl LineBuffer {
    /// Create a buffer that discards unterminated data beyond `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(DEFAULT_LINE_LIMIT)),
            limit,
        }
    }

    /// Append received bytes
    ///
    /// Returns `Some(Overflow)` when the buffer exceeded the limit without a
    /// terminator and was cleared.
    pub fn push(&mut self, data: &[u8]) -> Option<Overflow> {
        self.buf.extend_from_slice(data);

        if self.buf.len() > self.limit && !self.buf.contains(&b'\n') {
            let discarded = self.buf.len();
            warn!(discarded, limit = self.limit, "Line buffer overflow, clearing");
            self.buf.clear();
            return Some(Overflow { discarded });
        }

        None
    }

    /// Split out the next complete line, without its terminator
    pub fn next_line(&mut self) -> Option<Bytes> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(pos + 1);
        line.truncate(pos);
        Some(line.freeze())
    }

    /// Discard everything buffered
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Configured limit
    pub fn limit(&self) -> usize {
        self.limit
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_LIMIT)
    }
}
