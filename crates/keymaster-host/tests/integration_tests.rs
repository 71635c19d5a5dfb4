//! Integration tests for the host transport
//!
//! Each test runs a real [`HostTransport`] with its reader thread against a
//! [`MockSerial`] device, using short real timings:
//! - Request/response correlation and the settle window
//! - Recovery from a device reset in the middle of a request
//! - Stale line handling and concurrent requests

use keymaster_host::test_utils::{fast_config, wait_until, MockSerial};
use keymaster_host::{CommandClient, Correlator, HostConfigBuilder, HostError, HostTransport};
use keymaster_protocol::Response;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn ping_device() -> MockSerial {
    MockSerial::with_responder(|line| match line {
        "CMD:ping" => vec!["RSP:ping:pong".into()],
        _ => Vec::new(),
    })
}

fn setup(mock: MockSerial) -> (Arc<MockSerial>, Arc<HostTransport>, Correlator) {
    let mock = Arc::new(mock);
    let transport = Arc::new(HostTransport::new(mock.clone(), fast_config()));
    let correlator = Correlator::new(transport.clone());
    (mock, transport, correlator)
}

// ============================================================================
// Correlation
// ============================================================================

#[test]
fn test_ping_returns_single_reply_line() {
    let (_mock, _transport, correlator) = setup(ping_device());

    let lines = correlator
        .send_and_wait("CMD:ping", Some(Duration::from_secs(5)), Some(Duration::from_millis(400)))
        .unwrap();

    assert_eq!(lines, vec!["RSP:ping:pong"]);
}

#[test]
fn test_no_peer_returns_empty_after_timeout() {
    let (_mock, _transport, correlator) = setup(MockSerial::new());

    let started = Instant::now();
    let lines = correlator
        .send_and_wait("CMD:ping", Some(Duration::from_millis(300)), None)
        .unwrap();
    let elapsed = started.elapsed();

    assert!(lines.is_empty());
    assert!(elapsed >= Duration::from_millis(300), "returned early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "returned late: {:?}", elapsed);
}

#[test]
fn test_stale_lines_not_attributed_to_request() {
    let (mock, transport, correlator) = setup(ping_device());
    transport.connect(None, None).unwrap();

    mock.inject_line("ERR:CHUNK_TIMEOUT:received 1/3 chunks");
    assert!(wait_until(Duration::from_secs(2), || transport.buffered_count() == 1));

    let lines = correlator.request("CMD:ping").unwrap();
    assert_eq!(lines, vec!["RSP:ping:pong"]);
    assert_eq!(transport.buffered_count(), 0);
}

#[test]
fn test_unsolicited_lines_readable_later() {
    let (mock, transport, _correlator) = setup(MockSerial::new());
    transport.connect(None, None).unwrap();

    mock.inject_line("hello from phone");
    mock.inject_line("second");
    assert!(wait_until(Duration::from_secs(2), || transport.buffered_count() == 2));
    assert_eq!(transport.read_pending(), vec!["hello from phone", "second"]);
}

#[test]
fn test_concurrent_requests_serialized() {
    let mock = MockSerial::with_responder(|line| vec![format!("RSP:echo:{}", line)]);
    let (_mock, _transport, correlator) = setup(mock);

    let workers: Vec<_> = (0..4)
        .map(|i| {
            let correlator = correlator.clone();
            thread::spawn(move || correlator.request(&format!("req{}", i)).unwrap())
        })
        .collect();

    for (i, worker) in workers.into_iter().enumerate() {
        let lines = worker.join().unwrap();
        // Each caller sees only its own answer
        assert_eq!(lines, vec![format!("RSP:echo:req{}", i)]);
    }
}

// ============================================================================
// Recovery
// ============================================================================

#[test]
fn test_device_reset_mid_write_delivers_once() {
    let (mock, transport, correlator) = setup(ping_device());
    transport.connect(None, None).unwrap();
    assert_eq!(mock.open_count(), 1);

    mock.invalidate_handles();
    let lines = correlator.request("CMD:ping").unwrap();

    assert_eq!(lines, vec!["RSP:ping:pong"]);
    assert_eq!(mock.written_lines(), vec!["CMD:ping"]);
    assert_eq!(mock.open_count(), 2);
}

#[test]
fn test_reader_recovers_after_reset() {
    let (mock, transport, _correlator) = setup(MockSerial::new());
    transport.connect(None, None).unwrap();

    mock.invalidate_handles();
    assert!(wait_until(Duration::from_secs(2), || transport.reconnect_count() == 1));

    mock.inject_line("back online");
    assert!(wait_until(Duration::from_secs(2), || transport.buffered_count() == 1));
    assert_eq!(transport.read_pending(), vec!["back online"]);
}

#[test]
fn test_reconnect_retries_until_port_returns() {
    let (mock, transport, _correlator) = setup(MockSerial::new());
    transport.connect(None, None).unwrap();

    mock.fail_next_opens(2);
    mock.invalidate_handles();

    assert!(wait_until(Duration::from_secs(3), || transport.is_connected()
        && transport.reconnect_count() == 1));
    assert_eq!(mock.open_count(), 2);
}

// ============================================================================
// Commands
// ============================================================================

#[test]
fn test_client_round_trip() {
    let mock = MockSerial::with_responder(|line| match line {
        "CMD:status" => vec![r#"RSP:status:{"recording":false}"#.into()],
        "CMD:get_context" => vec!["RSP:get_context:{}".into()],
        _ => vec!["ERR:unknown:no such command".into()],
    });
    let (_mock, _transport, correlator) = setup(mock);
    let client = CommandClient::new(correlator);

    match client.status().unwrap() {
        Some(Response::Rsp { data, .. }) => assert_eq!(data["recording"], false),
        other => panic!("unexpected {:?}", other),
    }
    assert!(client.get_context().unwrap().is_some());
    assert!(client.send_raw("CMD:bogus", None).unwrap()[0].starts_with("ERR:"));
}

#[test]
fn test_oversized_message_rejected() {
    let mock = Arc::new(MockSerial::new());
    let config = HostConfigBuilder::new().port("mock0").build();
    let transport = HostTransport::new(mock.clone(), config);

    let result = transport.send(&"a".repeat(5000));
    assert!(matches!(result, Err(HostError::MessageTooLong { len: 5000, .. })));
    assert!(mock.written().is_empty());
}
