//! LinkBridge - device-side bridge service
//!
//! Ties a [`PeripheralLink`], a host byte stream and an optional observer
//! together:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         LinkBridge                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────┐    ┌──────────────┐    ┌────────────────┐    │
//! │  │ Host stream│◄──►│ DuplexBridge │◄──►│ PeripheralLink │    │
//! │  │ (serial)   │    │ Splitter     │    │ (BLE)          │    │
//! │  └────────────┘    │ Reassembler  │    └───────▲────────┘    │
//! │                    └──────▲───────┘            │             │
//! │                           │ state    ┌─────────┴────────┐    │
//! │                           └──────────┤ Supervisor       │    │
//! │                                      └──────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on the task that awaits [`LinkBridge::run`]; the
//! supervisor, both bridge directions and the command channel are polled
//! together with `tokio::select!`.
//!
//! # Example
//!
//! ```rust,ignore
//! let (bridge, handle) = LinkBridge::new(link, stdin, stdout, Some(observer), &config)?;
//! tokio::spawn(async move { handle.wait_for(ConnectionState::Connected).await });
//! bridge.run().await?;
//! ```

use std::future::pending;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::config::LinkConfig;
use crate::duplex::{BridgeStats, DuplexBridge};
use crate::error::{LinkError, Result};
use crate::link::{ConnectionState, PeripheralLink};
use crate::observer::{BridgeObserver, ObserverHub};
use crate::supervisor::ConnectionSupervisor;

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Shutdown the bridge
    Shutdown,
}

/// Handle for controlling a running [`LinkBridge`]
#[derive(Clone)]
pub struct LinkHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl LinkHandle {
    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(BridgeCommand::GetStats(tx))
            .await
            .map_err(|_| LinkError::ChannelClosed)?;
        rx.await.map_err(|_| LinkError::ChannelClosed)
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the connection reaches `target`
    pub async fn wait_for(&self, target: ConnectionState) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        state_rx
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| LinkError::ChannelClosed)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(BridgeCommand::Shutdown)
            .await
            .map_err(|_| LinkError::ChannelClosed)
    }
}

/// Device-side bridge service
pub struct LinkBridge<L, R, W> {
    supervisor: ConnectionSupervisor<L>,
    duplex: DuplexBridge<L, W>,
    observers: Arc<ObserverHub>,
    host_rx: R,
    command_rx: mpsc::Receiver<BridgeCommand>,
}

impl<L, R, W> LinkBridge<L, R, W>
where
    L: PeripheralLink,
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a bridge over `link` and the host stream halves
    pub fn new(
        link: Arc<L>,
        host_rx: R,
        host_tx: W,
        observer: Option<Arc<dyn BridgeObserver>>,
        config: &LinkConfig,
    ) -> Result<(Self, LinkHandle)> {
        config.validate()?;

        let observers = Arc::new(ObserverHub::new(observer));
        let supervisor =
            ConnectionSupervisor::new(link.clone(), observers.clone(), config.supervisor.clone());
        let duplex = DuplexBridge::new(
            link,
            host_tx,
            supervisor.subscribe(),
            observers.clone(),
            config.framing.clone(),
            config.bridge.clone(),
        )?;

        let (command_tx, command_rx) = mpsc::channel(16);
        let handle = LinkHandle {
            command_tx,
            state_rx: supervisor.subscribe(),
        };

        let bridge = Self {
            supervisor,
            duplex,
            observers,
            host_rx,
            command_rx,
        };
        Ok((bridge, handle))
    }

    /// Run until shutdown is requested
    pub async fn run(self) -> Result<()> {
        let LinkBridge {
            supervisor,
            duplex,
            observers,
            host_rx,
            mut command_rx,
        } = self;

        info!(link = supervisor.link().name(), "Starting link bridge");

        let snapshot = || {
            let mut stats = duplex.stats();
            stats.connections = supervisor.connections();
            stats.link_errors = supervisor.errors();
            stats.observer_errors = observers.failures();
            stats
        };

        let commands = async {
            loop {
                match command_rx.recv().await {
                    Some(BridgeCommand::GetStats(tx)) => {
                        let _ = tx.send(snapshot());
                    }
                    Some(BridgeCommand::Shutdown) => {
                        info!("Bridge shutdown requested");
                        break;
                    }
                    // Every handle dropped; keep bridging
                    None => pending::<()>().await,
                }
            }
        };

        tokio::select! {
            _ = supervisor.run() => {}
            _ = duplex.run(host_rx) => {}
            _ = commands => {}
        }

        if let Err(e) = supervisor.link().release().await {
            warn!(error = %e, "Error releasing link");
        }

        let stats = snapshot();
        info!(
            from_host = stats.lines_from_host,
            from_peer = stats.messages_from_peer,
            connections = stats.connections,
            "Link bridge stopped"
        );
        Ok(())
    }
}
