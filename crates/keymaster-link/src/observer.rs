//! Status and activity observers
//!
//! The display and the status LED watch the bridge through
//! [`BridgeObserver`]. Observer failures are logged and counted, never
//! propagated: a broken display must not take the link down.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::link::PeerInfo;

/// Result returned by observer callbacks
pub type ObserverResult = std::result::Result<(), String>;

/// Connection lifecycle event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Advertising started
    Advertising,
    /// A peer connected
    Connected(PeerInfo),
    /// The peer is gone
    Disconnected,
    /// Advertise or connection failure
    Error(String),
}

impl StatusEvent {
    /// Event name as shown to collaborators
    pub fn name(&self) -> &'static str {
        match self {
            StatusEvent::Advertising => "advertising",
            StatusEvent::Connected(_) => "connected",
            StatusEvent::Disconnected => "disconnected",
            StatusEvent::Error(_) => "error",
        }
    }

    /// Event detail, empty when there is none
    pub fn detail(&self) -> String {
        match self {
            StatusEvent::Connected(peer) => peer.to_string(),
            StatusEvent::Error(detail) => detail.clone(),
            _ => String::new(),
        }
    }
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Connected(peer) => write!(f, "connected: {}", peer),
            StatusEvent::Error(detail) => write!(f, "error: {}", detail),
            other => f.write_str(other.name()),
        }
    }
}

/// Direction of forwarded traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host line forwarded to the peer
    SerialIn,
    /// Peer message forwarded to the host
    BleIn,
}

impl Direction {
    /// Wire name of the direction
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SerialIn => "serial_in",
            Direction::BleIn => "ble_in",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Collaborator watching the bridge
pub trait BridgeObserver: Send + Sync {
    /// Connection lifecycle changed
    fn on_status(&self, _event: &StatusEvent) -> ObserverResult {
        Ok(())
    }

    /// A message moved through the bridge; `preview` is truncated
    fn on_activity(&self, _direction: Direction, _preview: &str) -> ObserverResult {
        Ok(())
    }
}

/// Observer that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl BridgeObserver for LoggingObserver {
    fn on_status(&self, event: &StatusEvent) -> ObserverResult {
        info!(status = event.name(), detail = %event.detail(), "Link status");
        Ok(())
    }

    fn on_activity(&self, direction: Direction, preview: &str) -> ObserverResult {
        debug!(direction = %direction, preview, "Bridge activity");
        Ok(())
    }
}

/// Fan-out to several observers
///
/// Each observer is called even when an earlier one failed; all failures
/// are joined into one error.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn BridgeObserver>>,
}

impl ObserverSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer
    pub fn with(mut self, observer: Arc<dyn BridgeObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Number of observers
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn each<F>(&self, call: F) -> ObserverResult
    where
        F: Fn(&dyn BridgeObserver) -> ObserverResult,
    {
        let failures: Vec<String> = self
            .observers
            .iter()
            .filter_map(|observer| guarded(|| call(observer.as_ref())).err())
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}

impl BridgeObserver for ObserverSet {
    fn on_status(&self, event: &StatusEvent) -> ObserverResult {
        self.each(|observer| observer.on_status(event))
    }

    fn on_activity(&self, direction: Direction, preview: &str) -> ObserverResult {
        self.each(|observer| observer.on_activity(direction, preview))
    }
}

/// Run a callback, turning a panic into an error
fn guarded<F>(call: F) -> ObserverResult
where
    F: FnOnce() -> ObserverResult,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "observer panicked".to_string());
            Err(reason)
        }
    }
}

/// Optional observer shared by the supervisor and the bridge
///
/// Swallows and counts every failure.
pub struct ObserverHub {
    observer: Option<Arc<dyn BridgeObserver>>,
    failures: AtomicU64,
}

impl ObserverHub {
    /// Create a hub around an optional observer
    pub fn new(observer: Option<Arc<dyn BridgeObserver>>) -> Self {
        Self {
            observer,
            failures: AtomicU64::new(0),
        }
    }

    /// Deliver a status event
    pub fn status(&self, event: &StatusEvent) {
        let Some(observer) = &self.observer else {
            return;
        };
        if let Err(e) = guarded(|| observer.on_status(event)) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(event = event.name(), error = %e, "Status observer failed");
        }
    }

    /// Deliver an activity event
    pub fn activity(&self, direction: Direction, preview: &str) {
        let Some(observer) = &self.observer else {
            return;
        };
        if let Err(e) = guarded(|| observer.on_activity(direction, preview)) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(direction = %direction, error = %e, "Activity observer failed");
        }
    }

    /// Failed or panicked callbacks so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl Default for ObserverHub {
    fn default() -> Self {
        Self::new(None)
    }
}
