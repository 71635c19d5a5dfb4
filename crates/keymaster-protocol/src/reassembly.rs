//! Reassembly of inbound `CHUNK:n/N:` frames
//!
//! At most one message is reassembled at a time. A chunk announcing a
//! different total than the sequence in progress starts over, and a sequence
//! older than the timeout is expired by [`Reassembler::expire`] so the caller
//! can report the loss instead of dropping it silently.
//!
//! The reassembler does not read a clock; callers pass `now` so the same
//! code runs under a paused test clock.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::frame::{Chunk, DEFAULT_CHUNK_TIMEOUT_MS};

/// Outcome of feeding one chunk to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// More chunks are needed
    Pending {
        /// Distinct chunks held so far
        received: usize,
        /// Chunks expected
        total: usize,
    },
    /// All chunks arrived; payloads concatenated by ascending index
    Complete(String),
}

/// A sequence abandoned because it did not complete in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Distinct chunks that had arrived
    pub received: usize,
    /// Chunks that were expected
    pub total: usize,
}

#[derive(Debug)]
struct Sequence {
    total: usize,
    received: BTreeMap<usize, String>,
    first_seen: Instant,
}

/// Single-slot chunk reassembly buffer
#[derive(Debug)]
pub struct Reassembler {
    timeout: Duration,
    sequence: Option<Sequence>,
}

impl Reassembler {
    /// Create a reassembler with the given chunk timeout
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sequence: None,
        }
    }

    /// Configured chunk timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Add a chunk received at `now`
    ///
    /// Callers should run [`Reassembler::expire`] first so a stale sequence
    /// is reported before a new chunk replaces it.
    pub fn accept(&mut self, chunk: Chunk<'_>, now: Instant) -> Progress {
        if let Some(seq) = &self.sequence {
            if seq.total != chunk.total {
                warn!(
                    old_total = seq.total,
                    new_total = chunk.total,
                    discarded = seq.received.len(),
                    "Chunk total changed, restarting reassembly"
                );
                self.sequence = None;
            }
        }

        let seq = self.sequence.get_or_insert_with(|| Sequence {
            total: chunk.total,
            received: BTreeMap::new(),
            first_seen: now,
        });

        if seq.received.insert(chunk.index, chunk.data.to_string()).is_some() {
            debug!(index = chunk.index, "Duplicate chunk replaced");
        }

        trace!(
            index = chunk.index,
            total = seq.total,
            received = seq.received.len(),
            "Chunk accepted"
        );

        if seq.received.len() < seq.total {
            return Progress::Pending {
                received: seq.received.len(),
                total: seq.total,
            };
        }

        let complete: String = match self.sequence.take() {
            Some(seq) => seq.received.into_values().collect(),
            None => String::new(),
        };
        debug!(bytes = complete.len(), "Chunked message reassembled");
        Progress::Complete(complete)
    }

    /// Discard the sequence if it is older than the timeout at `now`
    pub fn expire(&mut self, now: Instant) -> Option<Expired> {
        let seq = self.sequence.as_ref()?;
        if seq.received.is_empty() || now.saturating_duration_since(seq.first_seen) <= self.timeout
        {
            return None;
        }
        let expired = Expired {
            received: seq.received.len(),
            total: seq.total,
        };
        self.sequence = None;
        warn!(
            received = expired.received,
            total = expired.total,
            "Chunk reassembly timed out"
        );
        Some(expired)
    }

    /// Drop any sequence in progress, returning what was discarded
    pub fn reset(&mut self) -> Option<Expired> {
        self.sequence.take().map(|seq| Expired {
            received: seq.received.len(),
            total: seq.total,
        })
    }

    /// `(received, total)` of the sequence in progress
    pub fn in_progress(&self) -> Option<(usize, usize)> {
        self.sequence
            .as_ref()
            .map(|seq| (seq.received.len(), seq.total))
    }

    /// Whether no sequence is in progress
    pub fn is_idle(&self) -> bool {
        self.sequence.is_none()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CHUNK_TIMEOUT_MS))
    }
}
