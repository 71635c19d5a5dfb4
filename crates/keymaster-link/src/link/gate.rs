//! Per-connection gating of queued notifications
//!
//! Notifications travel through a queue to whichever notifier session the
//! radio stack runs for the subscribed peer. Each queued item carries the
//! connection epoch it was produced in; releasing a connection advances the
//! epoch so nothing queued for one peer is ever delivered to the next.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks notifier sessions and the current connection epoch
#[derive(Debug, Default)]
pub struct NotifyGate {
    epoch: AtomicU64,
    subscribers: AtomicUsize,
}

impl NotifyGate {
    /// Fresh gate, no subscribers
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a notifier session for as long as the guard lives
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        self.subscribers.fetch_add(1, Ordering::SeqCst);
        Subscription { gate: self.clone() }
    }

    /// Whether any peer is listening
    pub fn is_open(&self) -> bool {
        self.subscribers.load(Ordering::SeqCst) > 0
    }

    /// Epoch to stamp on an item queued now
    pub fn stamp(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether an item stamped `epoch` belongs to the current connection
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// End the current connection; everything stamped before is stale
    pub fn advance(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// Active notifier session
#[derive(Debug)]
pub struct Subscription {
    gate: Arc<NotifyGate>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.gate.subscribers.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_without_subscriber() {
        let gate = NotifyGate::new();
        assert!(!gate.is_open());

        let session = gate.subscribe();
        assert!(gate.is_open());
        drop(session);
        assert!(!gate.is_open());
    }

    #[test]
    fn test_overlapping_sessions() {
        let gate = NotifyGate::new();
        let old = gate.subscribe();
        let new = gate.subscribe();
        drop(old);
        assert!(gate.is_open());
        drop(new);
        assert!(!gate.is_open());
    }

    #[test]
    fn test_items_from_previous_connection_are_stale() {
        let gate = NotifyGate::new();
        let _session = gate.subscribe();

        // Queued for peer A just before it dropped
        let queued = gate.stamp();
        gate.advance();

        // Peer B subscribes and the old item is still in the queue
        assert!(!gate.is_current(queued));
        assert!(gate.is_current(gate.stamp()));
    }
}
