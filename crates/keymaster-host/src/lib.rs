//! Host-side client for the KeyMaster serial bridge
//!
//! Talks to the bridge device over a USB serial port. A background reader
//! thread queues every received line; requests are correlated with their
//! answers by time (whatever arrives after the send, plus a short settle
//! window). The port is reopened automatically after I/O errors.
//!
//! # Layers
//!
//! 1. [`port`] - [`PortOpener`]/[`SerialLink`] seam and device detection
//! 2. [`transport`] - [`HostTransport`]: reader thread, reconnect, guarded
//!    writes
//! 3. [`correlator`] - [`Correlator::send_and_wait`]
//! 4. [`client`] - [`CommandClient`]: `CMD:`/`RSP:`/`ACK:`/`ERR:` commands
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: keymaster-host = { version = "0.1", features = ["serial"] }
//! use keymaster_host::{CommandClient, Correlator, HostConfig, HostTransport};
//! use std::sync::Arc;
//!
//! let transport = Arc::new(HostTransport::system(HostConfig::from_env()?));
//! let client = CommandClient::new(Correlator::new(transport));
//! match client.status()? {
//!     Some(response) => println!("{}", response),
//!     None => println!("No response (timeout)"),
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod port;
pub mod queue;

pub mod transport;

pub mod client;
pub mod correlator;

pub mod test_utils;

pub use config::{HostConfig, HostConfigBuilder, DEFAULT_BAUD, MAX_MESSAGE_LEN};
pub use error::{HostError, Result};
pub use port::{detect_port, list_ports, PortCandidate, PortOpener, SerialLink};
pub use queue::{RxEntry, RxQueue};

#[cfg(feature = "serial")]
pub use port::SystemPorts;

pub use transport::{ConnectionInfo, HostTransport};

pub use client::{Activity, CommandClient, ComputerInfo, Note, Search, Session, SessionEnd};
pub use correlator::Correlator;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
