//! Serial transport with a background reader and automatic reconnect
//!
//! One reader thread per transport owns the read path and pushes trimmed,
//! non-empty lines into the [`RxQueue`]. Writes go through a mutex. Any I/O
//! failure on either side closes both handles, waits the reconnect cooldown
//! and reopens the same port. A generation counter makes sure concurrent
//! failures on the same handles trigger only one reconnect.

use keymaster_protocol::LineBuffer;
use parking_lot::{Mutex, MutexGuard};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::port::{detect_port, PortOpener, SerialLink};
use crate::queue::RxQueue;

/// Longest line kept by the reader before it is discarded
const READER_LINE_LIMIT: usize = 256 * 1024;

/// Serial transport to the bridge device
pub struct HostTransport {
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    opener: Arc<dyn PortOpener>,
    config: HostConfig,
    queue: RxQueue,
    writer: Mutex<Option<Box<dyn SerialLink>>>,
    reader: Mutex<Option<Box<dyn SerialLink>>>,
    target: Mutex<Option<Target>>,
    generation: AtomicU64,
    reconnect_lock: Mutex<()>,
    cycle_lock: Mutex<()>,
    reconnects: AtomicU64,
    active: AtomicBool,
    shutdown: AtomicBool,
}

/// Snapshot of the transport's connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Port in use, or last used
    pub port: Option<String>,
    /// Baud rate of that port
    pub baud: Option<u32>,
    /// Whether a handle is open
    pub connected: bool,
    /// Lines waiting in the receive queue
    pub buffered: usize,
    /// Completed reconnects
    pub reconnects: u64,
}

impl std::fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.port, self.connected) {
            (Some(port), true) => {
                writeln!(f, "Connected: {}", port)?;
                if let Some(baud) = self.baud {
                    writeln!(f, "Baud: {}", baud)?;
                }
                write!(f, "Buffered messages: {}", self.buffered)?;
                if self.reconnects > 0 {
                    write!(f, "\nReconnects: {}", self.reconnects)?;
                }
                Ok(())
            }
            (Some(port), false) => write!(f, "Status: Not connected (last port {})", port),
            (None, _) => f.write_str("Status: Not connected"),
        }
    }
}

#[derive(Debug, Clone)]
struct Target {
    port: String,
    baud: u32,
}

impl HostTransport {
    /// Create an unconnected transport
    pub fn new(opener: Arc<dyn PortOpener>, config: HostConfig) -> Self {
        let queue = RxQueue::new(config.queue_capacity);
        Self {
            shared: Arc::new(Shared {
                opener,
                config,
                queue,
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                target: Mutex::new(None),
                generation: AtomicU64::new(0),
                reconnect_lock: Mutex::new(()),
                cycle_lock: Mutex::new(()),
                reconnects: AtomicU64::new(0),
                active: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
            reader: Mutex::new(None),
        }
    }

    /// Transport over the system's serial ports
    #[cfg(feature = "serial")]
    pub fn system(config: HostConfig) -> Self {
        Self::new(Arc::new(crate::port::SystemPorts), config)
    }

    /// Open the port and start the reader
    ///
    /// Port resolution order: `port`, the previously used port, the
    /// configured port, auto-detection. Does nothing when already connected.
    pub fn connect(&self, port: Option<&str>, baud: Option<u32>) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let previous = self.shared.target.lock().clone();
        let port = port
            .map(str::to_string)
            .or_else(|| previous.as_ref().map(|t| t.port.clone()))
            .or_else(|| self.shared.config.port.clone())
            .or_else(|| detect_port(self.shared.opener.as_ref()))
            .ok_or(HostError::DeviceNotFound)?;
        let baud = baud
            .or_else(|| previous.map(|t| t.baud))
            .unwrap_or(self.shared.config.baud);

        {
            let _guard = self.shared.reconnect_lock.lock();
            // The reader may have reopened the port while we waited
            if self.is_connected() {
                return Ok(());
            }
            self.shared.open(&port, baud)?;
            *self.shared.target.lock() = Some(Target {
                port: port.clone(),
                baud,
            });
            self.shared.active.store(true, Ordering::SeqCst);
        }

        self.start_reader()?;
        info!(port = %port, baud, "Connected");
        Ok(())
    }

    /// Close the port; the reader idles until the next connect
    pub fn disconnect(&self) {
        let _guard = self.shared.reconnect_lock.lock();
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.close();
        info!("Disconnected");
    }

    /// Whether a port handle is open
    pub fn is_connected(&self) -> bool {
        self.shared.writer.lock().is_some()
    }

    /// Port in use, or last used
    pub fn port_name(&self) -> Option<String> {
        self.shared.target.lock().as_ref().map(|t| t.port.clone())
    }

    /// Send one line, connecting first if needed
    ///
    /// A write failure reconnects once and retries the write once.
    pub fn send(&self, message: &str) -> Result<()> {
        let body = message.strip_suffix('\n').unwrap_or(message);
        let max = self.shared.config.max_message_len;
        if body.len() > max {
            return Err(HostError::MessageTooLong {
                len: body.len(),
                max,
            });
        }

        if !self.is_connected() {
            self.connect(None, None)?;
        }

        let mut payload = String::with_capacity(body.len() + 1);
        payload.push_str(body);
        payload.push('\n');

        let generation = self.shared.generation.load(Ordering::SeqCst);
        match self.shared.write(payload.as_bytes()) {
            Ok(()) => {
                debug!(bytes = payload.len(), "Sent");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Write failed, reconnecting");
                self.shared.reconnect(generation)?;
                self.shared.write(payload.as_bytes())?;
                debug!(bytes = payload.len(), "Sent after reconnect");
                Ok(())
            }
        }
    }

    /// Port, baud, connection state and queue depth
    pub fn connection_info(&self) -> ConnectionInfo {
        let target = self.shared.target.lock().clone();
        ConnectionInfo {
            port: target.as_ref().map(|t| t.port.clone()),
            baud: target.map(|t| t.baud),
            connected: self.is_connected(),
            buffered: self.buffered_count(),
            reconnects: self.reconnect_count(),
        }
    }

    /// Take every buffered line without sending anything
    pub fn read_pending(&self) -> Vec<String> {
        self.shared.queue.drain_all()
    }

    /// Number of buffered lines
    pub fn buffered_count(&self) -> usize {
        self.shared.queue.len()
    }

    /// Number of completed reconnects
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnects.load(Ordering::Relaxed)
    }

    /// Transport configuration
    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    pub(crate) fn queue(&self) -> &RxQueue {
        &self.shared.queue
    }

    /// Serializes request/response cycles on this transport
    pub(crate) fn begin_cycle(&self) -> MutexGuard<'_, ()> {
        self.shared.cycle_lock.lock()
    }

    fn start_reader(&self) -> Result<()> {
        let mut reader = self.reader.lock();
        if reader.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("keymaster-rx".into())
            .spawn(move || shared.reader_loop())?;
        *reader = Some(handle);
        Ok(())
    }
}

impl Drop for HostTransport {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
        self.shared.close();
    }
}

impl Shared {
    /// Open the port, let the device settle, discard boot output and
    /// install both handles. Caller holds the reconnect lock.
    fn open(&self, port: &str, baud: u32) -> Result<()> {
        let mut link = self
            .opener
            .open(port, baud, self.config.read_timeout)?;

        if !self.config.open_settle.is_zero() {
            thread::sleep(self.config.open_settle);
        }
        if let Err(e) = link.discard_input() {
            debug!(error = %e, "Could not discard pending input");
        }

        let reader = link.try_clone_link()?;
        *self.reader.lock() = Some(reader);
        *self.writer.lock() = Some(link);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.writer.lock().take();
        self.reader.lock().take();
    }

    /// Replace the handles of `observed` generation with fresh ones
    ///
    /// Returns immediately if another thread already reconnected.
    fn reconnect(&self, observed: u64) -> Result<()> {
        let _guard = self.reconnect_lock.lock();
        if self.generation.load(Ordering::SeqCst) != observed {
            return Ok(());
        }
        if !self.active.load(Ordering::SeqCst) {
            return Err(HostError::NotConnected);
        }
        let target = self
            .target
            .lock()
            .clone()
            .ok_or(HostError::NotConnected)?;

        info!(port = %target.port, "Reconnecting");
        self.close();
        thread::sleep(self.config.reconnect_cooldown);
        self.open(&target.port, target.baud)?;
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        info!(port = %target.port, "Reconnected");
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        let link = writer.as_mut().ok_or(HostError::NotConnected)?;
        link.write_all(bytes)
            .and_then(|_| link.flush())
            .map_err(|e| HostError::Write(e.to_string()))
    }

    fn reader_loop(self: Arc<Self>) {
        let mut lines = LineBuffer::new(READER_LINE_LIMIT);
        let mut buf = vec![0u8; self.config.read_chunk];
        let mut seen = self.generation.load(Ordering::SeqCst);

        debug!("Reader started");
        while !self.shutdown.load(Ordering::SeqCst) {
            let generation = self.generation.load(Ordering::SeqCst);
            if generation != seen {
                // Partial line from the old handle is meaningless now
                lines.clear();
                seen = generation;
            }

            let result = {
                let mut reader = self.reader.lock();
                reader.as_mut().map(|link| link.read(&mut buf))
            };

            match result {
                Some(Ok(0)) => {}
                Some(Ok(n)) => {
                    if let Some(overflow) = lines.push(&buf[..n]) {
                        warn!(discarded = overflow.discarded, "Receive line too long, discarded");
                    }
                    while let Some(line) = lines.next_line() {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        if !text.is_empty() {
                            trace!(line = %text, "Received");
                            self.queue.push(text);
                        }
                    }
                }
                Some(Err(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Read failed");
                    self.recover(generation);
                }
                None if self.active.load(Ordering::SeqCst) => {
                    // A previous reconnect attempt left us without handles
                    self.recover(generation);
                }
                None => thread::sleep(self.config.read_timeout),
            }
        }
        debug!("Reader stopped");
    }

    fn recover(&self, generation: u64) {
        if let Err(e) = self.reconnect(generation) {
            if self.active.load(Ordering::SeqCst) {
                warn!(error = %e, retry = ?self.config.reconnect_retry, "Reconnect failed");
                thread::sleep(self.config.reconnect_retry);
            }
        }
    }
}

impl std::fmt::Debug for HostTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTransport")
            .field("port", &self.port_name())
            .field("connected", &self.is_connected())
            .field("buffered", &self.buffered_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfigBuilder;
    use crate::test_utils::{fast_config, wait_until, MockSerial};
    use std::time::Duration;

    fn transport(mock: &Arc<MockSerial>) -> HostTransport {
        HostTransport::new(mock.clone(), fast_config())
    }

    #[test]
    fn test_connect_uses_configured_port() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        transport.connect(None, None).unwrap();

        assert!(transport.is_connected());
        assert_eq!(transport.port_name().as_deref(), Some("mock0"));
        assert_eq!(mock.open_count(), 1);
    }

    #[test]
    fn test_connect_detects_enumerated_bridge() {
        let mock = Arc::new(MockSerial::new());
        mock.set_ports(vec![
            crate::port::PortCandidate::new("mock-other"),
            crate::port::PortCandidate::new("mock-esp").with_usb(0x303A, 0x1001),
        ]);
        let config = HostConfigBuilder::new().open_settle(Duration::ZERO).build();
        let transport = HostTransport::new(mock.clone(), config);

        transport.connect(None, None).unwrap();
        assert_eq!(transport.port_name().as_deref(), Some("mock-esp"));
    }

    #[test]
    fn test_connect_refuses_unidentified_port() {
        let mock = Arc::new(MockSerial::new());
        mock.set_ports(vec![crate::port::PortCandidate::new("mock-arduino")
            .with_usb(0x2341, 0x0043)
            .with_description("Arduino Uno")]);
        let config = HostConfigBuilder::new().open_settle(Duration::ZERO).build();
        let transport = HostTransport::new(mock.clone(), config);

        assert!(matches!(
            transport.connect(None, None),
            Err(HostError::DeviceNotFound)
        ));
        assert_eq!(mock.open_count(), 0);
    }

    #[test]
    fn test_open_failure_reported() {
        let mock = Arc::new(MockSerial::new());
        mock.fail_next_opens(1);
        let transport = transport(&mock);

        assert!(matches!(
            transport.connect(None, None),
            Err(HostError::PortOpenFailed { .. })
        ));
        assert!(!transport.is_connected());
        transport.connect(None, None).unwrap();
    }

    #[test]
    fn test_message_too_long_rejected_before_connect() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);

        let result = transport.send(&"x".repeat(4096));
        assert!(matches!(
            result,
            Err(HostError::MessageTooLong { len: 4096, max: 4095 })
        ));
        assert_eq!(mock.open_count(), 0);

        // Exactly at the limit is fine
        transport.send(&"x".repeat(4095)).unwrap();
        assert_eq!(mock.written_lines(), vec!["x".repeat(4095)]);
    }

    #[test]
    fn test_send_appends_single_terminator() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        transport.send("CMD:ping").unwrap();
        transport.send("already\n").unwrap();

        assert_eq!(mock.written(), b"CMD:ping\nalready\n");
    }

    #[test]
    fn test_reader_splits_and_trims() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        transport.connect(None, None).unwrap();

        mock.inject_bytes(b"  first  \r\n\r\nsec");
        mock.inject_bytes(b"ond\n");

        assert!(wait_until(Duration::from_secs(2), || transport.buffered_count() == 2));
        assert_eq!(transport.read_pending(), vec!["first", "second"]);
    }

    #[test]
    fn test_open_discards_boot_output() {
        let mock = Arc::new(MockSerial::new());
        mock.inject_line("rst:0x1 (POWERON_RESET)");
        let transport = transport(&mock);
        transport.connect(None, None).unwrap();

        std::thread::sleep(Duration::from_millis(100));
        assert!(transport.read_pending().is_empty());
    }

    #[test]
    fn test_read_failure_reconnects() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        transport.connect(None, None).unwrap();

        mock.fail_next_reads(1);
        assert!(wait_until(Duration::from_secs(2), || transport.reconnect_count() == 1));
        assert_eq!(mock.open_count(), 2);

        mock.inject_line("after");
        assert!(wait_until(Duration::from_secs(2), || transport.buffered_count() == 1));
    }

    #[test]
    fn test_write_failure_retried_once() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        transport.connect(None, None).unwrap();

        mock.fail_next_writes(1);
        transport.send("hello").unwrap();

        assert_eq!(mock.written_lines(), vec!["hello"]);
        assert_eq!(transport.reconnect_count(), 1);
    }

    #[test]
    fn test_persistent_write_failure_surfaces() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        transport.connect(None, None).unwrap();

        mock.fail_next_writes(2);
        assert!(matches!(transport.send("hello"), Err(HostError::Write(_))));
        assert!(mock.written_lines().is_empty());
    }

    #[test]
    fn test_send_during_reader_reconnect_opens_once() {
        let mock = Arc::new(MockSerial::new());
        let config = HostConfigBuilder::new()
            .port("mock0")
            .read_timeout(Duration::from_millis(20))
            .reconnect_cooldown(Duration::from_millis(300))
            .open_settle(Duration::from_millis(5))
            .build();
        let transport = HostTransport::new(mock.clone(), config);
        transport.connect(None, None).unwrap();

        mock.fail_next_reads(1);
        assert!(wait_until(Duration::from_secs(2), || !transport.is_connected()));

        transport.send("hello").unwrap();

        assert_eq!(mock.open_count(), 2);
        assert_eq!(transport.reconnect_count(), 1);
        assert_eq!(mock.written_lines(), vec!["hello"]);
    }

    #[test]
    fn test_connection_info_tracks_state() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        let info = transport.connection_info();
        assert_eq!(info.port, None);
        assert!(!info.connected);
        assert_eq!(info.to_string(), "Status: Not connected");

        transport.connect(Some("mock3"), Some(57600)).unwrap();
        mock.inject_line("unsolicited");
        assert!(wait_until(Duration::from_secs(2), || transport.buffered_count() == 1));

        let info = transport.connection_info();
        assert_eq!(info.port.as_deref(), Some("mock3"));
        assert_eq!(info.baud, Some(57600));
        assert!(info.connected);
        assert_eq!(info.buffered, 1);
        assert_eq!(
            info.to_string(),
            "Connected: mock3\nBaud: 57600\nBuffered messages: 1"
        );

        transport.disconnect();
        assert!(!transport.connection_info().connected);
    }

    #[test]
    fn test_disconnect_then_send_reconnects() {
        let mock = Arc::new(MockSerial::new());
        let transport = transport(&mock);
        transport.connect(Some("mock7"), Some(9600)).unwrap();
        transport.disconnect();
        assert!(!transport.is_connected());

        transport.send("again").unwrap();
        assert!(transport.is_connected());
        assert_eq!(transport.port_name().as_deref(), Some("mock7"));
        assert_eq!(mock.opened_ports(), vec![("mock7".to_string(), 9600); 2]);
    }
}
