//! Serial port abstraction and device detection
//!
//! [`PortOpener`] opens handles and enumerates ports; [`SerialLink`] is the
//! open handle. The transport only talks to these traits so tests can run
//! against [`MockSerial`](crate::test_utils::MockSerial) and production runs
//! against [`SystemPorts`] (`serial` feature).

use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::Result;

/// USB vendor id of the bridge board (Espressif native USB)
pub const BRIDGE_VENDOR_ID: u16 = 0x303A;

/// Description fragment identifying the bridge board
pub const BRIDGE_DESCRIPTION_MATCH: &str = "ESP32";

/// Paths listed alongside enumerated ports
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/ttyACM*",
    "/dev/ttyUSB*",
    // macOS
    "/dev/cu.usbmodem*",
];

/// An open serial handle
///
/// Reads block for at most the read timeout given at open time and then
/// fail with `TimedOut` (or return 0).
pub trait SerialLink: Read + Write + Send {
    /// A second handle to the same port, used by the reader thread
    fn try_clone_link(&self) -> std::io::Result<Box<dyn SerialLink>>;

    /// Drop bytes already received but not yet read
    fn discard_input(&mut self) -> std::io::Result<()>;
}

/// Opens ports and lists candidates
pub trait PortOpener: Send + Sync {
    /// Open `port` at `baud` with the given blocking read timeout
    fn open(&self, port: &str, baud: u32, read_timeout: Duration) -> Result<Box<dyn SerialLink>>;

    /// Enumerate the ports the system knows about
    fn available_ports(&self) -> Vec<PortCandidate>;
}

/// A port seen during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// Path or name (e.g. `/dev/ttyACM0`, `COM5`)
    pub path: String,
    /// USB vendor id
    pub vendor_id: Option<u16>,
    /// USB product id
    pub product_id: Option<u16>,
    /// Product or description string
    pub description: Option<String>,
}

impl PortCandidate {
    /// A port with no USB information
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            vendor_id: None,
            product_id: None,
            description: None,
        }
    }

    /// Attach USB ids
    pub fn with_usb(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Whether this looks like the bridge board
    pub fn is_likely_bridge(&self) -> bool {
        if self.vendor_id == Some(BRIDGE_VENDOR_ID) {
            return true;
        }
        self.description
            .as_deref()
            .map(|d| d.to_uppercase().contains(BRIDGE_DESCRIPTION_MATCH))
            .unwrap_or(false)
    }
}

impl std::fmt::Display for PortCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)?;
        if let (Some(vid), Some(pid)) = (self.vendor_id, self.product_id) {
            write!(f, " [{:04X}:{:04X}]", vid, pid)?;
        }
        if let Some(description) = &self.description {
            write!(f, " {}", description)?;
        }
        Ok(())
    }
}

/// First enumerated port that looks like the bridge
pub fn select_port(candidates: &[PortCandidate]) -> Option<String> {
    candidates
        .iter()
        .find(|port| port.is_likely_bridge())
        .map(|port| {
            info!(port = %port, "Found likely bridge device");
            port.path.clone()
        })
}

/// Existing paths matching the common device patterns
pub fn glob_candidates() -> Vec<String> {
    let mut paths = Vec::new();
    for pattern in COMMON_DEVICE_PATHS {
        if let Ok(entries) = glob::glob(pattern) {
            for entry in entries.flatten() {
                if entry.exists() {
                    paths.push(entry.to_string_lossy().to_string());
                }
            }
        }
    }
    paths
}

/// Find the bridge among enumerated ports
///
/// Unidentified ports are never picked; set the port explicitly to use one.
pub fn detect_port(opener: &dyn PortOpener) -> Option<String> {
    let ports = opener.available_ports();
    let found = select_port(&ports);
    if found.is_none() {
        debug!(enumerated = ports.len(), "No port matches the bridge vendor id or description");
    }
    found
}

/// Every enumerated port, plus common paths enumeration missed
pub fn list_ports(opener: &dyn PortOpener) -> Vec<PortCandidate> {
    let mut ports = opener.available_ports();
    for path in glob_candidates() {
        if !ports.iter().any(|p| p.path == path) {
            ports.push(PortCandidate::new(path));
        }
    }
    ports
}

#[cfg(feature = "serial")]
pub use system::SystemPorts;

#[cfg(feature = "serial")]
mod system {
    use super::{PortCandidate, PortOpener, SerialLink};
    use crate::error::{HostError, Result};
    use serialport::{ClearBuffer, SerialPort, SerialPortType};
    use std::io::{Read, Write};
    use std::time::Duration;

    /// Ports provided by the operating system
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemPorts;

    impl PortOpener for SystemPorts {
        fn open(
            &self,
            port: &str,
            baud: u32,
            read_timeout: Duration,
        ) -> Result<Box<dyn SerialLink>> {
            let handle = serialport::new(port, baud)
                .timeout(read_timeout)
                .open()
                .map_err(|e| HostError::PortOpenFailed {
                    port: port.to_string(),
                    reason: e.to_string(),
                })?;
            Ok(Box::new(SystemLink(handle)))
        }

        fn available_ports(&self) -> Vec<PortCandidate> {
            serialport::available_ports()
                .map(|ports| {
                    ports
                        .into_iter()
                        .map(|port| match port.port_type {
                            SerialPortType::UsbPort(usb) => {
                                let mut candidate = PortCandidate::new(port.port_name)
                                    .with_usb(usb.vid, usb.pid);
                                candidate.description = usb.product.or(usb.manufacturer);
                                candidate
                            }
                            _ => PortCandidate::new(port.port_name),
                        })
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    struct SystemLink(Box<dyn SerialPort>);

    impl Read for SystemLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for SystemLink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write(buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.0.flush()
        }
    }

    impl SerialLink for SystemLink {
        fn try_clone_link(&self) -> std::io::Result<Box<dyn SerialLink>> {
            let clone = self.0.try_clone().map_err(std::io::Error::from)?;
            Ok(Box::new(SystemLink(clone)))
        }

        fn discard_input(&mut self) -> std::io::Result<()> {
            self.0
                .clear(ClearBuffer::Input)
                .map_err(std::io::Error::from)
        }
    }
}
