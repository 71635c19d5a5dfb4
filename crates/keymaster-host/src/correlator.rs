//! Request/response correlation over the line transport
//!
//! The device answers on the same line stream it uses for everything else,
//! so a response is "whatever arrives after we sent". One cycle at a time
//! per transport: clear the queue, send, poll for lines newer than the send
//! instant, wait a settle window after the first one, drain.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;
use crate::transport::HostTransport;

/// Sends a line and collects the lines that answer it
#[derive(Debug, Clone)]
pub struct Correlator {
    transport: Arc<HostTransport>,
}

impl Correlator {
    /// Correlate over `transport`
    pub fn new(transport: Arc<HostTransport>) -> Self {
        Self { transport }
    }

    /// Underlying transport
    pub fn transport(&self) -> &Arc<HostTransport> {
        &self.transport
    }

    /// Send with the configured response timeout and settle window
    pub fn request(&self, message: &str) -> Result<Vec<String>> {
        self.send_and_wait(message, None, None)
    }

    /// Send `message` and collect its response lines
    ///
    /// Returns an empty vector when nothing arrives within `timeout`. After
    /// the first line arrives, keeps collecting for `settle` and returns.
    pub fn send_and_wait(
        &self,
        message: &str,
        timeout: Option<Duration>,
        settle: Option<Duration>,
    ) -> Result<Vec<String>> {
        let config = self.transport.config();
        let timeout = timeout.unwrap_or(config.response_timeout);
        let settle = settle.unwrap_or(config.settle);
        let poll = config.poll_interval;

        let _cycle = self.transport.begin_cycle();
        let queue = self.transport.queue();

        let sent_at = Instant::now();
        queue.clear();
        self.transport.send(message)?;

        let deadline = sent_at + timeout;
        let mut lines = Vec::new();
        let mut first_at: Option<Instant> = None;

        loop {
            let fresh = queue.drain_since(sent_at);
            if !fresh.is_empty() && first_at.is_none() {
                first_at = Some(Instant::now());
            }
            lines.extend(fresh);

            let now = Instant::now();
            match first_at {
                Some(first) if now.duration_since(first) >= settle => break,
                None if now >= deadline => break,
                _ => {}
            }
            thread::sleep(poll);
        }

        // Anything that landed during the last sleep
        lines.extend(queue.drain_since(sent_at));

        debug!(
            lines = lines.len(),
            elapsed = ?sent_at.elapsed(),
            "Request complete"
        );
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{fast_config, MockSerial};

    fn correlator(mock: MockSerial) -> (Arc<MockSerial>, Correlator) {
        let mock = Arc::new(mock);
        let transport = Arc::new(HostTransport::new(mock.clone(), fast_config()));
        (mock, Correlator::new(transport))
    }

    #[test]
    fn test_single_reply() {
        let (_mock, correlator) = correlator(MockSerial::with_responder(|line| {
            if line == "CMD:ping" {
                vec!["RSP:ping:pong".into()]
            } else {
                Vec::new()
            }
        }));

        let started = Instant::now();
        let lines = correlator.request("CMD:ping").unwrap();
        assert_eq!(lines, vec!["RSP:ping:pong"]);
        // Settle window, not the full timeout
        assert!(started.elapsed() < Duration::from_millis(450));
    }

    #[test]
    fn test_multi_line_reply_collected() {
        let (_mock, correlator) = correlator(MockSerial::with_responder(|_| {
            vec!["ACK:note:7".into(), "RSP:note:{\"ok\":true}".into()]
        }));
        let lines = correlator.request("CMD:note").unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_no_reply_returns_empty_after_timeout() {
        let (_mock, correlator) = correlator(MockSerial::new());

        let started = Instant::now();
        let lines = correlator
            .send_and_wait("CMD:ping", Some(Duration::from_millis(200)), None)
            .unwrap();
        let elapsed = started.elapsed();

        assert!(lines.is_empty());
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[test]
    fn test_settle_collects_late_lines() {
        let (mock, correlator) = correlator(MockSerial::with_responder(|_| vec!["first".into()]));
        let injector = {
            let mock = mock.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(40));
                mock.inject_line("second");
            })
        };

        let lines = correlator
            .send_and_wait("go", None, Some(Duration::from_millis(150)))
            .unwrap();
        injector.join().unwrap();
        assert_eq!(lines, vec!["first", "second"]);
    }
}
