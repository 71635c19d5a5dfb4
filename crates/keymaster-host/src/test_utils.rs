//! Test utilities for the host transport
//!
//! [`MockSerial`] stands in for the bridge device behind a serial port. It
//! answers written lines through an optional responder, lets tests inject
//! unsolicited output and fail reads, writes or opens on demand, and counts
//! every open.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{HostConfig, HostConfigBuilder};
use crate::error::{HostError, Result};
use crate::port::{PortCandidate, PortOpener, SerialLink};

type Responder = Box<dyn Fn(&str) -> Vec<String> + Send + Sync>;

/// Simulated bridge device
#[derive(Default)]
pub struct MockSerial {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    inbound: Mutex<VecDeque<u8>>,
    data_ready: Condvar,
    written: Mutex<Vec<u8>>,
    partial: Mutex<Vec<u8>>,
    responder: Mutex<Option<Responder>>,
    ports: Mutex<Vec<PortCandidate>>,
    opened: Mutex<Vec<(String, u32)>>,
    fail_writes: AtomicUsize,
    fail_reads: AtomicUsize,
    fail_opens: AtomicUsize,
    generation: AtomicU64,
}

impl MockSerial {
    /// A device that never answers
    pub fn new() -> Self {
        Self::default()
    }

    /// A device answering each written line with `respond(line)`
    pub fn with_responder<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        let mock = Self::new();
        mock.set_responder(respond);
        mock
    }

    /// Replace the responder
    pub fn set_responder<F>(&self, respond: F)
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        *self.state.responder.lock() = Some(Box::new(respond));
    }

    /// Ports reported by enumeration
    pub fn set_ports(&self, ports: Vec<PortCandidate>) {
        *self.state.ports.lock() = ports;
    }

    /// Device output, delivered on the next read
    pub fn inject_bytes(&self, data: &[u8]) {
        self.state.inject(data);
    }

    /// Device output line, terminator added
    pub fn inject_line(&self, line: &str) {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.state.inject(&data);
    }

    /// Fail the next `n` writes with a broken pipe
    pub fn fail_next_writes(&self, n: usize) {
        self.state.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads with a broken pipe
    pub fn fail_next_reads(&self, n: usize) {
        self.state.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` opens
    pub fn fail_next_opens(&self, n: usize) {
        self.state.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Simulate the device resetting: every open handle starts failing
    pub fn invalidate_handles(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.data_ready.notify_all();
    }

    /// Everything successfully written so far
    pub fn written(&self) -> Vec<u8> {
        self.state.written.lock().clone()
    }

    /// Written data split into lines
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.state.written.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.state.opened.lock().len()
    }

    /// Port and baud of every successful open
    pub fn opened_ports(&self) -> Vec<(String, u32)> {
        self.state.opened.lock().clone()
    }
}

impl MockState {
    fn inject(&self, data: &[u8]) {
        self.inbound.lock().extend(data.iter().copied());
        self.data_ready.notify_all();
    }

    fn respond(&self, data: &[u8]) {
        let lines: Vec<String> = {
            let mut partial = self.partial.lock();
            partial.extend_from_slice(data);
            let mut lines = Vec::new();
            while let Some(pos) = partial.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = partial.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&line[..pos]).to_string());
            }
            lines
        };

        let replies: Vec<String> = {
            let responder = self.responder.lock();
            match responder.as_ref() {
                Some(respond) => lines.iter().flat_map(|line| respond(line)).collect(),
                None => Vec::new(),
            }
        };
        for reply in replies {
            let mut bytes = reply.into_bytes();
            bytes.push(b'\n');
            self.inject(&bytes);
        }
    }
}

impl PortOpener for MockSerial {
    fn open(&self, port: &str, baud: u32, read_timeout: Duration) -> Result<Box<dyn SerialLink>> {
        let remaining = self.state.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(HostError::PortOpenFailed {
                port: port.to_string(),
                reason: "device busy".into(),
            });
        }
        self.state.opened.lock().push((port.to_string(), baud));
        Ok(Box::new(MockLink {
            state: self.state.clone(),
            generation: self.state.generation.load(Ordering::SeqCst),
            read_timeout,
        }))
    }

    fn available_ports(&self) -> Vec<PortCandidate> {
        self.state.ports.lock().clone()
    }
}

struct MockLink {
    state: Arc<MockState>,
    generation: u64,
    read_timeout: Duration,
}

impl MockLink {
    fn check_valid(&self) -> io::Result<()> {
        if self.state.generation.load(Ordering::SeqCst) != self.generation {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device reset"));
        }
        Ok(())
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_valid()?;
        if take_failure(&self.state.fail_reads) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "read failed"));
        }

        let deadline = Instant::now() + self.read_timeout;
        let mut inbound = self.state.inbound.lock();
        while inbound.is_empty() {
            if self
                .state
                .data_ready
                .wait_until(&mut inbound, deadline)
                .timed_out()
            {
                break;
            }
            self.check_valid()?;
        }
        if inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }

        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_valid()?;
        if take_failure(&self.state.fail_writes) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
        }
        self.state.written.lock().extend_from_slice(buf);
        self.state.respond(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_valid()
    }
}

impl SerialLink for MockLink {
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>> {
        self.check_valid()?;
        Ok(Box::new(MockLink {
            state: self.state.clone(),
            generation: self.generation,
            read_timeout: self.read_timeout,
        }))
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.state.inbound.lock().clear();
        Ok(())
    }
}

/// Configuration for the mock device with short real timings
pub fn fast_config() -> HostConfig {
    HostConfigBuilder::new()
        .port("mock0")
        .response_timeout(Duration::from_millis(500))
        .settle(Duration::from_millis(100))
        .poll_interval(Duration::from_millis(10))
        .read_timeout(Duration::from_millis(20))
        .reconnect_cooldown(Duration::from_millis(20))
        .reconnect_retry(Duration::from_millis(50))
        .open_settle(Duration::from_millis(5))
        .build()
}

/// Poll `condition` until it holds or `limit` passes
pub fn wait_until<F: Fn() -> bool>(limit: Duration, condition: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_answers_complete_lines() {
        let mock = MockSerial::with_responder(|line| vec![format!("echo:{}", line)]);
        let mut link = mock.open("mock0", 115_200, Duration::from_millis(10)).unwrap();

        link.write_all(b"par").unwrap();
        link.write_all(b"tial\n").unwrap();

        let mut buf = [0u8; 64];
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo:partial\n");
    }

    #[test]
    fn test_read_times_out_when_idle() {
        let mock = MockSerial::new();
        let mut link = mock.open("mock0", 115_200, Duration::from_millis(10)).unwrap();
        let mut buf = [0u8; 8];
        let err = link.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_invalidated_handles_fail() {
        let mock = MockSerial::new();
        let mut link = mock.open("mock0", 115_200, Duration::from_millis(10)).unwrap();
        mock.invalidate_handles();

        assert!(link.write_all(b"x\n").is_err());
        assert!(mock.written().is_empty());

        let mut fresh = mock.open("mock0", 115_200, Duration::from_millis(10)).unwrap();
        fresh.write_all(b"x\n").unwrap();
        assert_eq!(mock.open_count(), 2);
    }

    #[test]
    fn test_failure_counters() {
        let mock = MockSerial::new();
        mock.fail_next_writes(1);
        let mut link = mock.open("mock0", 9600, Duration::from_millis(10)).unwrap();
        assert!(link.write_all(b"a\n").is_err());
        link.write_all(b"b\n").unwrap();
        assert_eq!(mock.written_lines(), vec!["b"]);
        assert_eq!(mock.opened_ports(), vec![("mock0".to_string(), 9600)]);
    }
}
