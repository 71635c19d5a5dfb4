//! Device-side USB serial to BLE bridge
//!
//! Runs on the device that sits between a host computer (over a serial
//! line) and a phone or companion (over a BLE peripheral link). Lines from
//! the host are forwarded to the peer, messages from the peer are written
//! to the host, and a supervisor keeps the peripheral advertising and
//! reconnecting without ever giving up.
//!
//! # Architecture
//!
//! 1. **Wireless link** ([`link`]) - the [`PeripheralLink`] primitive, with a
//!    BlueZ implementation behind the `ble` feature
//! 2. **Connection supervisor** ([`supervisor`]) - advertise, connect,
//!    monitor, back off, repeat
//! 3. **Duplex bridge** ([`duplex`]) - line buffering, chunking,
//!    fragmentation and reassembly in both directions
//! 4. **Service** ([`bridge`]) - runs everything on one task and exposes a
//!    [`LinkHandle`] for stats and shutdown
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: keymaster-link = { version = "0.1", features = ["ble"] }
//! use keymaster_link::{BluerPeripheral, LinkBridge, LinkConfig, LoggingObserver};
//! use std::sync::Arc;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = LinkConfig::default();
//!     let link = Arc::new(BluerPeripheral::new(config.peripheral.clone()).await?);
//!
//!     let (bridge, _handle) = LinkBridge::new(
//!         link,
//!         tokio::io::stdin(),
//!         tokio::io::stdout(),
//!         Some(Arc::new(LoggingObserver)),
//!         &config,
//!     )?;
//!     bridge.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `ble` - BlueZ GATT peripheral (requires `libdbus-1-dev` on Linux)
//! - `serial` - bridge a named serial port instead of stdio (requires
//!   `libudev-dev` on Linux)
//! - `full` - Enable both

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod link;
pub mod observer;

pub mod duplex;
pub mod supervisor;

pub mod bridge;

pub mod test_utils;

pub use config::{
    BridgeConfig, FramingConfig, LinkConfig, LinkConfigBuilder, PeripheralConfig,
    SupervisorConfig,
};
pub use error::{LinkError, Result};
pub use link::{ConnectionState, PeerInfo, PeripheralLink};

#[cfg(feature = "ble")]
pub use link::BluerPeripheral;

pub use observer::{
    BridgeObserver, Direction, LoggingObserver, ObserverHub, ObserverResult, ObserverSet,
    StatusEvent,
};

pub use duplex::{BridgeStats, DuplexBridge};
pub use supervisor::ConnectionSupervisor;

pub use bridge::{BridgeCommand, LinkBridge, LinkHandle};

pub use config::{DEFAULT_DEVICE_NAME, RX_UUID, SERVICE_UUID, TX_UUID};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
