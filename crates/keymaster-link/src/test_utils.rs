//! Test doubles for the device-side bridge
//!
//! [`MockPeripheral`] stands in for the radio: tests script what each
//! advertise call returns, inject peer writes, drop the peer and inspect
//! every notification sent. [`RecordingObserver`] captures the status and
//! activity stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use keymaster_link::test_utils::MockPeripheral;
//! use keymaster_link::PeerInfo;
//!
//! let mock = Arc::new(MockPeripheral::new());
//! mock.fail_advertise(LinkError::AdvertiseFailed("busy".into()));
//! mock.accept_peer(PeerInfo::new("AA:BB:CC:DD:EE:FF"));
//! // second advertise call connects
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{LinkError, Result};
use crate::link::{PeerInfo, PeripheralLink};
use crate::observer::{BridgeObserver, Direction, ObserverResult, StatusEvent};

/// Scripted in-memory [`PeripheralLink`]
///
/// Advertise calls consume scripted outcomes in order and wait when the
/// script is empty. Peer writes are queued until the bridge reads them.
pub struct MockPeripheral {
    name: String,
    connected: AtomicBool,
    fail_notify: AtomicBool,
    liveness_error: Mutex<Option<LinkError>>,
    advertise_tx: mpsc::UnboundedSender<Result<PeerInfo>>,
    advertise_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<PeerInfo>>>,
    write_tx: mpsc::UnboundedSender<Bytes>,
    write_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    notifications: Mutex<Vec<Vec<u8>>>,
    advertise_log: Mutex<Vec<Instant>>,
    releases: AtomicUsize,
}

impl MockPeripheral {
    /// Create a disconnected mock with an empty script
    pub fn new() -> Self {
        let (advertise_tx, advertise_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Self {
            name: "mock".to_string(),
            connected: AtomicBool::new(false),
            fail_notify: AtomicBool::new(false),
            liveness_error: Mutex::new(None),
            advertise_tx,
            advertise_rx: tokio::sync::Mutex::new(advertise_rx),
            write_tx,
            write_rx: tokio::sync::Mutex::new(write_rx),
            notifications: Mutex::new(Vec::new()),
            advertise_log: Mutex::new(Vec::new()),
            releases: AtomicUsize::new(0),
        }
    }

    /// Next advertise call connects `peer`
    pub fn accept_peer(&self, peer: PeerInfo) {
        let _ = self.advertise_tx.send(Ok(peer));
    }

    /// Next advertise call fails with `err`
    pub fn fail_advertise(&self, err: LinkError) {
        let _ = self.advertise_tx.send(Err(err));
    }

    /// Queue a message written by the peer
    pub fn peer_write(&self, data: impl Into<Bytes>) {
        let _ = self.write_tx.send(data.into());
    }

    /// Peer leaves; the next liveness check sees it
    pub fn drop_peer(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Next liveness check fails with `err`
    pub fn fail_liveness(&self, err: LinkError) {
        *self.liveness_error.lock() = Some(err);
    }

    /// Force the connection flag
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make every notification fail
    pub fn set_fail_notify(&self, fail: bool) {
        self.fail_notify.store(fail, Ordering::SeqCst);
    }

    /// Notifications sent so far, one entry per notify call
    pub fn notifications(&self) -> Vec<Vec<u8>> {
        self.notifications.lock().clone()
    }

    /// All notifications concatenated as text
    pub fn notified_text(&self) -> String {
        let joined: Vec<u8> = self.notifications.lock().concat();
        String::from_utf8_lossy(&joined).into_owned()
    }

    /// When each advertise call started
    pub fn advertise_instants(&self) -> Vec<Instant> {
        self.advertise_log.lock().clone()
    }

    /// Number of release calls
    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Default for MockPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeripheralLink for MockPeripheral {
    async fn advertise(&self) -> Result<PeerInfo> {
        self.advertise_log.lock().push(Instant::now());
        let outcome = {
            let mut script = self.advertise_rx.lock().await;
            script.recv().await
        };
        match outcome {
            Some(Ok(peer)) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(peer)
            }
            Some(Err(e)) => Err(e),
            None => Err(LinkError::ChannelClosed),
        }
    }

    async fn is_connected(&self) -> Result<bool> {
        if let Some(err) = self.liveness_error.lock().take() {
            return Err(err);
        }
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn notify(&self, data: &[u8]) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(LinkError::NotifyFailed("simulated".into()));
        }
        self.notifications.lock().push(data.to_vec());
        Ok(())
    }

    async fn written(&self, wait: Duration) -> Result<Option<Bytes>> {
        let mut writes = self.write_rx.lock().await;
        match tokio::time::timeout(wait, writes.recv()).await {
            Ok(Some(data)) => Ok(Some(data)),
            Ok(None) => Err(LinkError::Disconnected),
            Err(_) => Ok(None),
        }
    }

    async fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Observer that records everything it sees
#[derive(Default)]
pub struct RecordingObserver {
    statuses: Mutex<Vec<StatusEvent>>,
    activities: Mutex<Vec<(String, String)>>,
    fail: bool,
}

impl RecordingObserver {
    /// Create a recording observer
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an observer that records, then reports failure
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Status events received
    pub fn statuses(&self) -> Vec<StatusEvent> {
        self.statuses.lock().clone()
    }

    /// Status event names received
    pub fn status_names(&self) -> Vec<String> {
        self.statuses
            .lock()
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// `(direction, preview)` pairs received
    pub fn activities(&self) -> Vec<(String, String)> {
        self.activities.lock().clone()
    }

    fn outcome(&self) -> ObserverResult {
        if self.fail {
            Err("simulated observer failure".into())
        } else {
            Ok(())
        }
    }
}

impl BridgeObserver for RecordingObserver {
    fn on_status(&self, event: &StatusEvent) -> ObserverResult {
        self.statuses.lock().push(event.clone());
        self.outcome()
    }

    fn on_activity(&self, direction: Direction, preview: &str) -> ObserverResult {
        self.activities
            .lock()
            .push((direction.as_str().to_string(), preview.to_string()));
        self.outcome()
    }
}
