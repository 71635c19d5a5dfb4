//! Wireless link implementations for the device side
//!
//! The bridge only needs a handful of peripheral primitives: advertise
//! until a peer connects, check liveness, notify, wait for a write and
//! release per-connection state. [`PeripheralLink`] captures exactly that.
//!
//! - [`BluerPeripheral`] - BlueZ GATT peripheral (requires `ble` feature)
//! - [`serial::open_host_port`] - host side serial port (requires `serial` feature)
//!
//! # Feature Requirements
//!
//! - `ble`: Requires BlueZ development files on Linux
//!   ```bash
//!   apt install libdbus-1-dev
//!   ```
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux

#[cfg(feature = "ble")]
mod ble;
#[cfg(feature = "ble")]
pub use ble::BluerPeripheral;

#[cfg(feature = "serial")]
pub mod serial;

mod gate;
pub use gate::{NotifyGate, Subscription};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Wireless peripheral primitive used by the supervisor and the bridge
///
/// All methods take `&self`; implementations keep their connection state
/// behind interior mutability so the supervisor and both bridge directions
/// can share one link.
#[async_trait]
pub trait PeripheralLink: Send + Sync {
    /// Advertise and resolve once a peer connects
    ///
    /// Returns `Err(LinkError::Disconnected)` if the peer vanished while
    /// the connection was being set up.
    async fn advertise(&self) -> Result<PeerInfo>;

    /// Whether the current peer is still connected
    ///
    /// `Ok(false)` is a clean disconnect; `Err` is a radio fault.
    async fn is_connected(&self) -> Result<bool>;

    /// Send one notification of at most the configured notification size
    async fn notify(&self, data: &[u8]) -> Result<()>;

    /// Wait up to `wait` for the next peer write
    ///
    /// Returns `Ok(None)` when nothing arrived in time and
    /// `Err(LinkError::NotConnected)` when there is no peer.
    async fn written(&self, wait: Duration) -> Result<Option<Bytes>>;

    /// Drop the connection handle and any per-connection buffers
    async fn release(&self) -> Result<()>;

    /// Get the link name (for logging)
    fn name(&self) -> &str;
}

/// Identity of a connected peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Peer address as reported by the radio stack
    pub address: String,
    /// Peer name, if it advertised one
    pub name: Option<String>,
}

impl PeerInfo {
    /// Peer with an address only
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    /// Attach a peer name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", self.address, name),
            None => f.write_str(&self.address),
        }
    }
}

/// Connection state of the device side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No peer, not advertising
    #[default]
    Disconnected,
    /// Waiting for a peer
    Advertising,
    /// A peer is connected
    Connected,
}

impl ConnectionState {
    /// Whether traffic may flow to the peer
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Advertising => write!(f, "advertising"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}
