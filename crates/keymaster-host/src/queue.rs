//! Bounded queue of received lines
//!
//! The reader thread pushes, the correlator drains. Each entry carries the
//! instant it was received so a request only collects lines that arrived
//! after it was sent.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A received line and when it arrived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxEntry {
    /// Receive instant
    pub at: Instant,
    /// Line text, trimmed
    pub line: String,
}

/// Thread-safe FIFO of received lines that evicts the oldest when full
#[derive(Debug)]
pub struct RxQueue {
    entries: Mutex<VecDeque<RxEntry>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl RxQueue {
    /// Create a queue holding at most `capacity` lines
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    /// Append a line received now
    pub fn push(&self, line: impl Into<String>) {
        self.push_at(Instant::now(), line);
    }

    /// Append a line with an explicit receive instant
    pub fn push_at(&self, at: Instant, line: impl Into<String>) {
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(RxEntry {
            at,
            line: line.into(),
        });
    }

    /// Remove everything, returning lines received at or after `since`
    pub fn drain_since(&self, since: Instant) -> Vec<String> {
        self.entries
            .lock()
            .drain(..)
            .filter(|entry| entry.at >= since)
            .map(|entry| entry.line)
            .collect()
    }

    /// Remove and return every buffered line
    pub fn drain_all(&self) -> Vec<String> {
        self.entries.lock().drain(..).map(|entry| entry.line).collect()
    }

    /// Discard every buffered line
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of buffered lines
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Maximum number of buffered lines
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines evicted because the queue was full
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_keeps_most_recent_when_full() {
        let queue = RxQueue::new(500);
        for i in 0..501 {
            queue.push(format!("line {}", i));
        }

        assert_eq!(queue.len(), 500);
        assert_eq!(queue.evicted(), 1);

        let lines = queue.drain_all();
        assert_eq!(lines.first().map(String::as_str), Some("line 1"));
        assert_eq!(lines.last().map(String::as_str), Some("line 500"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_since_filters_stale() {
        let queue = RxQueue::new(10);
        let t0 = Instant::now();
        queue.push_at(t0 - Duration::from_millis(10), "stale");
        queue.push_at(t0, "boundary");
        queue.push_at(t0 + Duration::from_millis(5), "fresh");

        assert_eq!(queue.drain_since(t0), vec!["boundary", "fresh"]);
        // Stale entries are removed too
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_push() {
        let queue = std::sync::Arc::new(RxQueue::new(1000));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        queue.push(format!("{}:{}", t, i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(queue.len(), 400);
    }

    #[test]
    fn test_zero_capacity_holds_one() {
        let queue = RxQueue::new(0);
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.drain_all(), vec!["b"]);
    }
}
