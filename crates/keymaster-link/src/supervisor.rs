//! Connection supervisor
//!
//! Runs the advertise, connect, monitor, disconnect cycle forever. It is
//! the only writer of the shared [`ConnectionState`]; the bridge reads it
//! through a `watch` receiver.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{LinkError, Result};
use crate::link::{ConnectionState, PeripheralLink};
use crate::observer::{ObserverHub, StatusEvent};

/// Drives one [`PeripheralLink`] through its connection lifecycle
pub struct ConnectionSupervisor<L> {
    link: Arc<L>,
    observers: Arc<ObserverHub>,
    config: SupervisorConfig,
    state_tx: watch::Sender<ConnectionState>,
    connections: AtomicU64,
    errors: AtomicU64,
}

impl<L: PeripheralLink> ConnectionSupervisor<L> {
    /// Create a supervisor in the `Disconnected` state
    pub fn new(link: Arc<L>, observers: Arc<ObserverHub>, config: SupervisorConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            link,
            observers,
            config,
            state_tx,
            connections: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// The supervised link
    pub fn link(&self) -> &Arc<L> {
        &self.link
    }

    /// Peers accepted so far
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Advertise/connection errors so far
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Run the lifecycle loop; never returns
    pub async fn run(&self) {
        loop {
            self.set_state(ConnectionState::Advertising);
            info!(name = self.link.name(), "Advertising");
            self.observers.status(&StatusEvent::Advertising);

            match self.serve_peer().await {
                Ok(()) => {}
                Err(LinkError::Disconnected) => {
                    debug!("Peer dropped while connecting");
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        error = %e,
                        code = e.error_code(),
                        backoff = ?self.config.error_backoff,
                        "Link error"
                    );
                    self.observers.status(&StatusEvent::Error(e.to_string()));
                    sleep(self.config.error_backoff).await;
                }
            }

            if let Err(e) = self.link.release().await {
                warn!(error = %e, "Failed to release link");
            }
            self.set_state(ConnectionState::Disconnected);
            info!("Disconnected");
            self.observers.status(&StatusEvent::Disconnected);
        }
    }

    /// Advertise, accept one peer and hold until it leaves
    async fn serve_peer(&self) -> Result<()> {
        let peer = self.link.advertise().await?;

        self.connections.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
        info!(peer = %peer, "Peer connected");
        self.observers.status(&StatusEvent::Connected(peer));

        while self.link.is_connected().await? {
            sleep(self.config.liveness_interval).await;
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::PeerInfo;
    use crate::test_utils::{MockPeripheral, RecordingObserver};
    use std::time::Duration;

    fn supervisor(
        mock: &Arc<MockPeripheral>,
        observer: &Arc<RecordingObserver>,
    ) -> ConnectionSupervisor<MockPeripheral> {
        let hub = Arc::new(ObserverHub::new(Some(observer.clone())));
        ConnectionSupervisor::new(mock.clone(), hub, SupervisorConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_then_liveness_drop() {
        let mock = Arc::new(MockPeripheral::new());
        let observer = Arc::new(RecordingObserver::new());
        let sup = supervisor(&mock, &observer);
        let mut state = sup.subscribe();

        mock.accept_peer(PeerInfo::new("AA:BB"));
        let run = sup.run();
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => unreachable!(),
            res = state.wait_for(|s| s.is_connected()) => { res.unwrap(); }
        }
        assert_eq!(sup.connections(), 1);

        mock.drop_peer();
        tokio::select! {
            _ = &mut run => unreachable!(),
            _ = sleep(Duration::from_millis(600)) => {}
        }

        // Back to advertising after one liveness tick
        assert_eq!(sup.state(), ConnectionState::Advertising);
        assert_eq!(mock.release_count(), 1);
        assert_eq!(
            observer.status_names(),
            vec!["advertising", "connected", "disconnected", "advertising"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_radio_fault_while_connected_reports_and_backs_off() {
        let mock = Arc::new(MockPeripheral::new());
        let observer = Arc::new(RecordingObserver::new());
        let sup = supervisor(&mock, &observer);
        let mut state = sup.subscribe();

        mock.accept_peer(PeerInfo::new("AA:BB"));
        let run = sup.run();
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => unreachable!(),
            res = state.wait_for(|s| s.is_connected()) => { res.unwrap(); }
        }

        mock.fail_liveness(LinkError::Radio("adapter gone".into()));
        tokio::select! {
            _ = &mut run => unreachable!(),
            _ = sleep(Duration::from_millis(600)) => {}
        }

        // Error reported, still inside the backoff
        assert_eq!(sup.errors(), 1);
        assert_eq!(
            observer.status_names(),
            vec!["advertising", "connected", "error"]
        );
        assert_eq!(mock.release_count(), 0);

        tokio::select! {
            _ = &mut run => unreachable!(),
            _ = sleep(Duration::from_secs(1)) => {}
        }
        assert_eq!(mock.release_count(), 1);
        assert_eq!(sup.state(), ConnectionState::Advertising);
        assert_eq!(
            observer.status_names(),
            vec!["advertising", "connected", "error", "disconnected", "advertising"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connect_skips_backoff() {
        let mock = Arc::new(MockPeripheral::new());
        let observer = Arc::new(RecordingObserver::new());
        let sup = supervisor(&mock, &observer);

        mock.fail_advertise(LinkError::Disconnected);
        let run = sup.run();
        tokio::pin!(run);
        tokio::select! {
            _ = &mut run => unreachable!(),
            _ = sleep(Duration::from_millis(10)) => {}
        }

        let instants = mock.advertise_instants();
        assert_eq!(instants.len(), 2);
        assert!(instants[1] - instants[0] < Duration::from_millis(10));
        assert_eq!(sup.errors(), 0);
        assert!(!observer.status_names().contains(&"error".to_string()));
    }
}
