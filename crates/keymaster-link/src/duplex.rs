//! Duplex bridge between the host line stream and the wireless link
//!
//! ## Host to peer
//!
//! Bytes from the host are split into lines. A line up to the chunk payload
//! limit goes out as one message with its terminator; a longer line is sent
//! as `CHUNK:n/N:` frames. Every message is cut into notifications of at
//! most the notification size. Nothing is queued while disconnected.
//!
//! ## Peer to host
//!
//! Plain messages are written to the host with a terminator. Chunk frames
//! go through the [`Reassembler`]; a malformed frame is forwarded as a
//! `RAW:` line and an abandoned sequence becomes an `ERR:CHUNK_TIMEOUT:`
//! line. The timeout check runs on every host poll tick.
//!
//! Both directions run as futures on the caller's task. The reassembler
//! lock is never held across an await point.

use keymaster_protocol::{
    chunk_timeout_line, fragments, is_chunk, preview, raw_line, terminated, Chunk, ChunkSplitter,
    Expired, LineBuffer, Progress, Reassembler,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{BridgeConfig, FramingConfig};
use crate::error::{LinkError, Result};
use crate::link::{ConnectionState, PeripheralLink};
use crate::observer::{Direction, ObserverHub};

/// Bytes requested from the host per read
const READ_CHUNK: usize = 512;

/// Characters of a chunked message shown in the activity preview
const CHUNK_PREVIEW_CHARS: usize = 30;

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Complete lines read from the host
    pub lines_from_host: u64,
    /// Host lines sent as a single message
    pub unchunked_sends: u64,
    /// Host lines sent as chunk frames
    pub chunked_messages: u64,
    /// Chunk frames sent
    pub chunks_sent: u64,
    /// Host lines (or remaining frames) dropped without a peer
    pub dropped_while_disconnected: u64,
    /// Messages written by the peer
    pub messages_from_peer: u64,
    /// Chunk frames accepted for reassembly
    pub chunks_reassembled: u64,
    /// Chunked messages completed
    pub messages_reassembled: u64,
    /// Chunk frames forwarded as `RAW:`
    pub malformed_chunks: u64,
    /// Sequences abandoned on timeout
    pub chunk_timeouts: u64,
    /// Unterminated host data discarded
    pub buffer_overflows: u64,
    /// Failed notifications
    pub notify_errors: u64,
    /// Failed host writes
    pub host_write_errors: u64,
    /// Peers accepted by the supervisor
    pub connections: u64,
    /// Advertise/connection errors
    pub link_errors: u64,
    /// Failed observer callbacks
    pub observer_errors: u64,
}

/// Moves traffic in both directions over one link
pub struct DuplexBridge<L, W> {
    link: Arc<L>,
    host_tx: tokio::sync::Mutex<W>,
    state_rx: watch::Receiver<ConnectionState>,
    observers: Arc<ObserverHub>,
    splitter: ChunkSplitter,
    reassembler: Mutex<Reassembler>,
    stats: Mutex<BridgeStats>,
    framing: FramingConfig,
    config: BridgeConfig,
    was_connected: AtomicBool,
}

impl<L, W> DuplexBridge<L, W>
where
    L: PeripheralLink,
    W: AsyncWrite + Unpin + Send,
{
    /// Create a bridge writing host-bound lines to `host_tx`
    pub fn new(
        link: Arc<L>,
        host_tx: W,
        state_rx: watch::Receiver<ConnectionState>,
        observers: Arc<ObserverHub>,
        framing: FramingConfig,
        config: BridgeConfig,
    ) -> Result<Self> {
        let splitter = ChunkSplitter::new(framing.chunk_payload)?;
        Ok(Self {
            link,
            host_tx: tokio::sync::Mutex::new(host_tx),
            state_rx,
            observers,
            splitter,
            reassembler: Mutex::new(Reassembler::new(framing.chunk_timeout)),
            stats: Mutex::new(BridgeStats::default()),
            framing,
            config,
            was_connected: AtomicBool::new(false),
        })
    }

    /// Snapshot of the traffic counters
    pub fn stats(&self) -> BridgeStats {
        self.stats.lock().clone()
    }

    /// `(received, total)` of the reassembly in progress
    pub fn reassembly_progress(&self) -> Option<(usize, usize)> {
        self.reassembler.lock().in_progress()
    }

    /// Run both directions until the host link or the link fails for good
    ///
    /// In practice this never returns; callers cancel it.
    pub async fn run<R>(&self, host_rx: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        tokio::join!(self.outbound_loop(host_rx), self.inbound_loop());
    }

    // ------------------------------------------------------------------
    // Host to peer
    // ------------------------------------------------------------------

    async fn outbound_loop<R>(&self, mut host_rx: R)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut lines = LineBuffer::new(self.framing.line_limit);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut host_open = self.flush_startup(&mut host_rx, &mut buf).await;

        loop {
            if host_open {
                match timeout(self.config.poll_interval, host_rx.read(&mut buf)).await {
                    Err(_) => {}
                    Ok(Ok(0)) => {
                        warn!("Host link closed");
                        host_open = false;
                    }
                    Ok(Ok(n)) => {
                        trace!(bytes = n, "Host bytes");
                        if lines.push(&buf[..n]).is_some() {
                            self.stats.lock().buffer_overflows += 1;
                        }
                        while let Some(line) = lines.next_line() {
                            self.handle_host_line(&line).await;
                        }
                    }
                    Ok(Err(e)) => {
                        let err = LinkError::HostRead(e.to_string());
                        warn!(error = %err, "Host read failed");
                        sleep(self.config.poll_interval).await;
                    }
                }
            } else {
                sleep(self.config.poll_interval).await;
            }

            self.check_chunk_timeout().await;
            self.track_connection();
            tokio::task::yield_now().await;
        }
    }

    /// Discard boot noise pending on the host link
    ///
    /// Returns `false` if the host link closed during the flush.
    async fn flush_startup<R>(&self, host_rx: &mut R, buf: &mut [u8]) -> bool
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.config.startup_flush.is_zero() {
            info!("Host link ready");
            return true;
        }

        sleep(self.config.startup_flush).await;
        let mut discarded = 0usize;
        loop {
            match timeout(Duration::ZERO, host_rx.read(buf)).await {
                Ok(Ok(0)) => {
                    warn!("Host link closed during startup flush");
                    return false;
                }
                Ok(Ok(n)) => discarded += n,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        info!(discarded, "Host link flushed, ready");
        true
    }

    /// Forward one host line, terminator already stripped
    pub async fn handle_host_line(&self, line: &[u8]) {
        self.stats.lock().lines_from_host += 1;

        if !self.is_connected() {
            self.stats.lock().dropped_while_disconnected += 1;
            debug!(bytes = line.len(), "No peer, dropping host line");
            return;
        }

        if self.splitter.needs_chunking(line) {
            self.send_chunked(line).await;
            return;
        }

        let text = String::from_utf8_lossy(line);
        self.observers.activity(
            Direction::SerialIn,
            &preview(&text, self.config.preview_chars),
        );

        let mut payload = Vec::with_capacity(line.len() + 1);
        payload.extend_from_slice(line);
        payload.push(b'\n');
        if self.send_payload(&payload).await {
            self.stats.lock().unchunked_sends += 1;
            debug!(bytes = payload.len(), "Host line sent");
        }
    }

    async fn send_chunked(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let frames = self.splitter.frames(&text);
        let total = frames.len();

        self.observers.activity(
            Direction::SerialIn,
            &format!("CHUNK 1/{} {}", total, preview(&text, CHUNK_PREVIEW_CHARS)),
        );

        let mut sent = 0u64;
        for frame in &frames {
            if !self.send_payload(frame.as_bytes()).await {
                break;
            }
            sent += 1;
        }

        let mut stats = self.stats.lock();
        stats.chunks_sent += sent;
        if sent as usize == total {
            stats.chunked_messages += 1;
            debug!(bytes = line.len(), chunks = total, "Host line sent chunked");
        } else {
            warn!(sent, total, "Chunked send interrupted");
        }
    }

    /// Notify one message in fragments; `false` if it could not be sent
    async fn send_payload(&self, payload: &[u8]) -> bool {
        if !self.is_connected() {
            self.stats.lock().dropped_while_disconnected += 1;
            return false;
        }

        for fragment in fragments(payload, self.framing.notify_size) {
            if let Err(e) = self.link.notify(fragment).await {
                self.stats.lock().notify_errors += 1;
                warn!(error = %e, code = e.error_code(), "Notify failed");
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Peer to host
    // ------------------------------------------------------------------

    async fn inbound_loop(&self) {
        loop {
            match self.link.written(self.config.write_wait).await {
                Ok(Some(data)) => self.handle_peer_message(&data).await,
                Ok(None) => sleep(self.config.idle_backoff).await,
                Err(e) if e.is_disconnect() => sleep(self.config.disconnected_backoff).await,
                Err(e) => {
                    warn!(error = %e, code = e.error_code(), "Peer read failed");
                    sleep(self.config.disconnected_backoff).await;
                }
            }
        }
    }

    /// Forward one message written by the peer
    pub async fn handle_peer_message(&self, data: &[u8]) {
        self.stats.lock().messages_from_peer += 1;
        let message = String::from_utf8_lossy(data);
        debug!(bytes = data.len(), "Peer message");

        if is_chunk(&message) {
            self.handle_chunk(&message).await;
            return;
        }

        self.write_host(terminated(&message).as_bytes()).await;
        self.observers.activity(
            Direction::BleIn,
            &preview(&message, self.config.preview_chars),
        );
    }

    async fn handle_chunk(&self, message: &str) {
        let chunk = match Chunk::parse(message) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.stats.lock().malformed_chunks += 1;
                warn!(error = %e, "Malformed chunk, forwarding raw");
                self.write_host(raw_line(message).as_bytes()).await;
                return;
            }
        };

        let now = Instant::now().into_std();
        let (expired, progress) = {
            let mut reassembler = self.reassembler.lock();
            let expired = reassembler.expire(now);
            (expired, reassembler.accept(chunk, now))
        };

        if let Some(expired) = expired {
            self.report_timeout(expired).await;
        }
        self.stats.lock().chunks_reassembled += 1;

        if let Progress::Complete(text) = progress {
            self.stats.lock().messages_reassembled += 1;
            self.write_host(terminated(&text).as_bytes()).await;
            self.observers.activity(
                Direction::BleIn,
                &preview(&text, self.config.preview_chars),
            );
        }
    }

    /// Report and discard a reassembly older than the chunk timeout
    pub async fn check_chunk_timeout(&self) {
        let now = Instant::now().into_std();
        let expired = self.reassembler.lock().expire(now);
        if let Some(expired) = expired {
            self.report_timeout(expired).await;
        }
    }

    async fn report_timeout(&self, expired: Expired) {
        self.stats.lock().chunk_timeouts += 1;
        self.write_host(chunk_timeout_line(expired.received, expired.total).as_bytes())
            .await;
    }

    async fn write_host(&self, line: &[u8]) {
        let mut host_tx = self.host_tx.lock().await;
        let result = match host_tx.write_all(line).await {
            Ok(()) => host_tx.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.stats.lock().host_write_errors += 1;
            let err = LinkError::HostWrite(e.to_string());
            warn!(error = %err, "Host write failed");
        }
    }

    // ------------------------------------------------------------------
    // Connection tracking
    // ------------------------------------------------------------------

    fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Discard partial reassembly once the peer is gone
    fn track_connection(&self) {
        let connected = self.is_connected();
        let was = self.was_connected.swap(connected, Ordering::Relaxed);
        if was && !connected {
            if let Some(dropped) = self.reassembler.lock().reset() {
                warn!(
                    received = dropped.received,
                    total = dropped.total,
                    "Peer gone, partial reassembly discarded"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockPeripheral, RecordingObserver};
    use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream};

    struct Fixture {
        mock: Arc<MockPeripheral>,
        observer: Arc<RecordingObserver>,
        state_tx: watch::Sender<ConnectionState>,
        bridge: DuplexBridge<MockPeripheral, DuplexStream>,
        host: BufReader<DuplexStream>,
    }

    fn fixture() -> Fixture {
        let mock = Arc::new(MockPeripheral::new());
        mock.set_connected(true);
        let observer = Arc::new(RecordingObserver::new());
        let hub = Arc::new(ObserverHub::new(Some(observer.clone())));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (device_out, host_in) = duplex(16 * 1024);
        let bridge = DuplexBridge::new(
            mock.clone(),
            device_out,
            state_rx,
            hub,
            FramingConfig::default(),
            BridgeConfig::default(),
        )
        .unwrap();
        Fixture {
            mock,
            observer,
            state_tx,
            bridge,
            host: BufReader::new(host_in),
        }
    }

    async fn host_line(host: &mut BufReader<DuplexStream>) -> String {
        let mut line = String::new();
        host.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn test_short_line_single_message() {
        let fx = fixture();
        fx.bridge.handle_host_line(b"hello").await;

        assert_eq!(fx.mock.notifications(), vec![b"hello\n".to_vec()]);
        assert_eq!(fx.bridge.stats().unchunked_sends, 1);
        assert_eq!(
            fx.observer.activities(),
            vec![("serial_in".to_string(), "hello".to_string())]
        );
    }

    #[tokio::test]
    async fn test_payload_limit_line_is_fragmented_not_chunked() {
        let fx = fixture();
        let line = vec![b'a'; 450];
        fx.bridge.handle_host_line(&line).await;

        let sizes: Vec<usize> = fx.mock.notifications().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![200, 200, 51]);
        assert!(!fx.mock.notified_text().starts_with("CHUNK:"));
    }

    #[tokio::test]
    async fn test_long_line_chunked() {
        let fx = fixture();
        let line = "z".repeat(1000);
        fx.bridge.handle_host_line(line.as_bytes()).await;

        let expected: String = ChunkSplitter::default().frames(&line).concat();
        assert_eq!(fx.mock.notified_text(), expected);
        assert!(fx.mock.notifications().iter().all(|n| n.len() <= 200));

        let stats = fx.bridge.stats();
        assert_eq!(stats.chunked_messages, 1);
        assert_eq!(stats.chunks_sent, 3);
        assert_eq!(fx.observer.activities()[0].1, format!("CHUNK 1/3 {}", "z".repeat(30)));
    }

    #[tokio::test]
    async fn test_dropped_while_disconnected() {
        let fx = fixture();
        fx.state_tx.send_replace(ConnectionState::Advertising);
        fx.bridge.handle_host_line(b"lost").await;

        assert!(fx.mock.notifications().is_empty());
        assert_eq!(fx.bridge.stats().dropped_while_disconnected, 1);
    }

    #[tokio::test]
    async fn test_notify_failure_counted() {
        let fx = fixture();
        fx.mock.set_fail_notify(true);
        fx.bridge.handle_host_line(b"boom").await;
        assert_eq!(fx.bridge.stats().notify_errors, 1);
        assert_eq!(fx.bridge.stats().unchunked_sends, 0);
    }

    #[tokio::test]
    async fn test_plain_peer_message() {
        let mut fx = fixture();
        fx.bridge.handle_peer_message(b"hi there").await;
        assert_eq!(host_line(&mut fx.host).await, "hi there\n");

        fx.bridge.handle_peer_message(b"already\n").await;
        assert_eq!(host_line(&mut fx.host).await, "already\n");
    }

    #[tokio::test]
    async fn test_malformed_chunk_forwarded_raw() {
        let mut fx = fixture();
        fx.bridge.handle_peer_message(b"CHUNK:x/2:data").await;
        assert_eq!(host_line(&mut fx.host).await, "RAW:CHUNK:x/2:data\n");
        assert_eq!(fx.bridge.stats().malformed_chunks, 1);
    }

    #[tokio::test]
    async fn test_out_of_order_reassembly() {
        let mut fx = fixture();
        fx.bridge.handle_peer_message(b"CHUNK:2/2:world\n").await;
        assert_eq!(fx.bridge.reassembly_progress(), Some((1, 2)));
        fx.bridge.handle_peer_message(b"CHUNK:1/2:hello ").await;

        assert_eq!(host_line(&mut fx.host).await, "hello world\n");
        assert_eq!(fx.bridge.stats().messages_reassembled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reported_before_new_chunk() {
        let mut fx = fixture();
        fx.bridge.handle_peer_message(b"CHUNK:1/3:a").await;
        tokio::time::advance(Duration::from_secs(6)).await;
        fx.bridge.handle_peer_message(b"CHUNK:1/3:b").await;

        assert_eq!(
            host_line(&mut fx.host).await,
            "ERR:CHUNK_TIMEOUT:received 1/3 chunks\n"
        );
        assert_eq!(fx.bridge.reassembly_progress(), Some((1, 3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_check_not_before_deadline() {
        let fx = fixture();
        fx.bridge.handle_peer_message(b"CHUNK:1/2:a").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        fx.bridge.check_chunk_timeout().await;
        assert_eq!(fx.bridge.stats().chunk_timeouts, 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        fx.bridge.check_chunk_timeout().await;
        assert_eq!(fx.bridge.stats().chunk_timeouts, 1);
        assert_eq!(fx.bridge.reassembly_progress(), None);
    }

    #[tokio::test]
    async fn test_disconnect_discards_partial() {
        let fx = fixture();
        fx.bridge.track_connection();
        fx.bridge.handle_peer_message(b"CHUNK:1/2:a").await;

        fx.state_tx.send_replace(ConnectionState::Disconnected);
        fx.bridge.track_connection();
        assert_eq!(fx.bridge.reassembly_progress(), None);
        assert_eq!(fx.bridge.stats().chunk_timeouts, 0);
    }
}
