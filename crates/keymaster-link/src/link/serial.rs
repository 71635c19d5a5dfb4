//! Serial port host link
//!
//! By default the device binary bridges stdio. With the `serial` feature it
//! can bridge a named port instead, such as a USB gadget tty.

use tokio::io::{ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::info;

use crate::error::{LinkError, Result};

/// Read and write halves of an open host port
pub type HostPort = (ReadHalf<SerialStream>, WriteHalf<SerialStream>);

/// Open `path` at `baud` and split it for the two bridge directions
pub fn open_host_port(path: &str, baud: u32) -> Result<HostPort> {
    let stream = tokio_serial::new(path, baud)
        .open_native_async()
        .map_err(|e| LinkError::PortOpenFailed {
            port: path.to_string(),
            reason: e.to_string(),
        })?;

    info!(port = %path, baud, "Host serial link opened");
    Ok(tokio::io::split(stream))
}
