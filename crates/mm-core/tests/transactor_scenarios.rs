//! End-to-end transactor behaviour against scripted serial devices.

use mm_core::mock_serial::{self, ScriptedDevice};
use mm_core::retry::{retry_busy, RetryPolicy};
use mm_core::serial::SerialChannel;
use mm_core::transactor::{EchoMatch, ReplyMatch, Transactor, TransactorSettings};
use mm_core::{EchoKind, TransactError};
use std::time::Duration;
use tokio::time::Instant;

fn scripted(device: ScriptedDevice) -> (Transactor, mock_serial::ScriptHandle) {
    let (port, handle) = device.spawn();
    let channel = SerialChannel::new("COM7", Box::new(port));
    (Transactor::new(channel), handle)
}

/// Wait until a spawned exchange holds the channel.
async fn until_busy(transactor: &Transactor) {
    while !transactor.channel().is_busy() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn response_ends_at_first_terminator_and_noise_is_purged() {
    let (t, _handle) = scripted(
        ScriptedDevice::new()
            .on(b"W X\r", b":A 100\r#noise")
            .on(b"W Y\r", b":A 200\r"),
    );

    let first = t.execute("W X", ReplyMatch::cr(), Duration::from_millis(500)).await.unwrap();
    assert_eq!(first.raw(), b":A 100\r");

    let second = t.execute("W Y", ReplyMatch::cr(), Duration::from_millis(500)).await.unwrap();
    assert_eq!(second.payload(), b":A 200");
    assert!(!second.raw().windows(6).any(|w| w == b"#noise"));
}

#[tokio::test(start_paused = true)]
async fn verbatim_echo_line_is_skipped() {
    let (t, _handle) = scripted(
        ScriptedDevice::new()
            .on(b"MOVE 10\r", b":A\r")
            .echo_commands(true),
    );

    let response = t
        .execute("MOVE 10", ReplyMatch::cr(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.payload(), b":A");
    assert!(response.is_ack());
}

#[tokio::test(start_paused = true)]
async fn concurrent_execute_fails_fast_and_queued_waits() {
    let (t, handle) = scripted(
        ScriptedDevice::new()
            .on_delayed(b"SLOW\r", b":A slow\r", Duration::from_millis(100))
            .on(b"W X\r", b":A 5\r"),
    );

    let holder = t.clone();
    let in_flight = tokio::spawn(async move {
        holder
            .execute("SLOW", ReplyMatch::cr(), Duration::from_secs(1))
            .await
    });
    until_busy(&t).await;

    let busy = t.execute("W X", ReplyMatch::cr(), Duration::from_secs(1)).await;
    assert!(matches!(busy, Err(TransactError::ChannelBusy { ref channel }) if channel == "COM7"));

    let queued = t
        .execute_queued("W X", ReplyMatch::cr(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(queued.payload(), b":A 5");
    assert_eq!(in_flight.await.unwrap().unwrap().payload(), b":A slow");

    // The rejected attempt never reached the wire.
    assert_eq!(handle.received(), vec![b"SLOW\r".to_vec(), b"W X\r".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn queued_wait_counts_against_deadline() {
    let (t, _handle) = scripted(
        ScriptedDevice::new().on_delayed(b"SLOW\r", b":A\r", Duration::from_millis(300)),
    );

    let holder = t.clone();
    let _in_flight = tokio::spawn(async move {
        holder
            .execute("SLOW", ReplyMatch::cr(), Duration::from_secs(1))
            .await
    });
    until_busy(&t).await;

    let start = Instant::now();
    let result = t
        .execute_queued("W X", ReplyMatch::cr(), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(TransactError::Timeout { .. })));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(100) && elapsed <= Duration::from_millis(105));
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out_at_deadline() {
    let (port, _harness) = mock_serial::new();
    let t = Transactor::new(SerialChannel::new("COM1", Box::new(port)));

    let start = Instant::now();
    let result = t
        .execute("PING", ReplyMatch::cr(), Duration::from_millis(100))
        .await;
    let elapsed = start.elapsed();

    match result {
        Err(TransactError::Timeout { timeout, received }) => {
            assert_eq!(timeout, Duration::from_millis(100));
            assert_eq!(received, 0);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed <= Duration::from_millis(105));
}

#[tokio::test(start_paused = true)]
async fn blocked_write_times_out_and_releases_the_channel() {
    // The peer never reads, so the two-byte pipe fills mid-command.
    let (device, _peer) = tokio::io::duplex(2);
    let settings = TransactorSettings::default().with_default_timeout(Duration::from_millis(50));
    let t = Transactor::with_settings(SerialChannel::new("COM9", Box::new(device)), settings);

    let start = Instant::now();
    let result = t
        .execute("PING", ReplyMatch::cr(), Duration::from_millis(100))
        .await;
    let elapsed = start.elapsed();
    match result {
        Err(TransactError::Timeout { timeout, received }) => {
            assert_eq!(timeout, Duration::from_millis(100));
            assert_eq!(received, 0);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(100) && elapsed <= Duration::from_millis(105));
    assert!(!t.channel().is_busy());

    let start = Instant::now();
    assert!(matches!(t.send("f").await, Err(TransactError::Timeout { .. })));
    assert!(start.elapsed() <= Duration::from_millis(55));

    assert!(matches!(
        t.write_queued("f", Duration::from_millis(30)).await,
        Err(TransactError::Timeout { .. })
    ));
    assert!(t.channel().try_acquire().is_ok());
}

#[tokio::test(start_paused = true)]
async fn late_reply_does_not_extend_the_deadline() {
    let (t, _handle) = scripted(
        ScriptedDevice::new().on_delayed(b"PING\r", b":A\r", Duration::from_millis(200)),
    );

    let start = Instant::now();
    let result = t
        .execute("PING", ReplyMatch::cr(), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(TransactError::Timeout { .. })));
    assert!(start.elapsed() < Duration::from_millis(150));
}

#[tokio::test(start_paused = true)]
async fn alternate_echo_is_accepted_and_reported() {
    let (t, _handle) = scripted(ScriptedDevice::new().on([170u8], [172u8]));

    let response = t
        .execute(
            [170u8],
            EchoMatch::bytes([170u8])
                .with_alternate([b'\r'])
                .with_alternate([172u8]),
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    assert_eq!(response.echo(), Some(EchoKind::Alternate(1)));
    assert!(response.matched_alternate());
    assert_eq!(response.raw(), &[172u8]);
}

#[tokio::test(start_paused = true)]
async fn mismatched_echo_fails_without_waiting_for_deadline() {
    let (t, _handle) = scripted(ScriptedDevice::new().on([0xEEu8], [0x55u8]));

    let start = Instant::now();
    let result = t
        .execute([0xEEu8], EchoMatch::bytes([0xEEu8]), Duration::from_secs(1))
        .await;

    match result {
        Err(TransactError::Protocol { expected, received }) => {
            assert_eq!(expected, "\"\\xee\"");
            assert_eq!(received, "U");
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn prefix_echo_with_terminated_payload() {
    let (t, _handle) = scripted(ScriptedDevice::new().on([253u8], b"\xfd10-3 v2\r"));

    let response = t
        .execute(
            [253u8],
            EchoMatch::prefix([253u8], "\r"),
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    assert_eq!(response.echo(), Some(EchoKind::Expected));
    assert_eq!(response.after_echo(), b"10-3 v2");
}

#[tokio::test(start_paused = true)]
async fn deferred_completion_via_read_reply() {
    let (port, mut harness) = mock_serial::new();
    let t = Transactor::new(SerialChannel::new("COM4", Box::new(port)));

    let wheel = t.clone();
    let task = tokio::spawn(async move {
        let echo = wheel
            .execute([0x13u8], EchoMatch::bytes([0x13u8]), Duration::from_millis(500))
            .await?;
        let done = wheel.read_reply(ReplyMatch::cr(), Duration::from_millis(500)).await?;
        Ok::<_, TransactError>((echo, done))
    });

    harness.expect_and_respond(&[0x13], &[0x13]).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    harness.send_response(b"\r").unwrap();

    let (echo, done) = task.await.unwrap().unwrap();
    assert_eq!(echo.echo(), Some(EchoKind::Expected));
    assert_eq!(done.raw(), b"\r");
}

#[tokio::test(start_paused = true)]
async fn unplugged_device_reports_channel_closed() {
    let (port, mut harness) = mock_serial::new();
    let t = Transactor::new(SerialChannel::new("COM2", Box::new(port)));
    harness.disconnect();

    let result = t.execute("V", ReplyMatch::cr(), Duration::from_millis(500)).await;
    assert!(matches!(result, Err(TransactError::ChannelClosed)));
}

#[tokio::test(start_paused = true)]
async fn retry_busy_waits_out_an_exchange() {
    let (t, _handle) = scripted(
        ScriptedDevice::new()
            .on_delayed(b"SLOW\r", b":A\r", Duration::from_millis(150))
            .on(b"W Z\r", b":A 42\r"),
    );

    let holder = t.clone();
    let _in_flight = tokio::spawn(async move {
        holder
            .execute("SLOW", ReplyMatch::cr(), Duration::from_secs(1))
            .await
    });
    until_busy(&t).await;

    let response = retry_busy(&RetryPolicy::default(), || {
        t.execute("W Z", ReplyMatch::cr(), Duration::from_millis(200))
    })
    .await
    .unwrap();
    assert_eq!(response.parse_after(":A").unwrap().to_i64().unwrap(), 42);
}

#[tokio::test(start_paused = true)]
async fn send_queued_waits_for_in_flight_exchange() {
    let (t, handle) = scripted(
        ScriptedDevice::new()
            .on_delayed(b"SLOW\r", b":A\r", Duration::from_millis(80))
            .on(b"f\r", b""),
    );

    let holder = t.clone();
    let in_flight = tokio::spawn(async move {
        holder
            .execute("SLOW", ReplyMatch::cr(), Duration::from_secs(1))
            .await
    });
    until_busy(&t).await;

    assert!(matches!(t.send("f").await, Err(TransactError::ChannelBusy { .. })));
    t.send_queued("f", Duration::from_millis(500)).await.unwrap();
    assert!(in_flight.await.unwrap().is_ok());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(handle.received(), vec![b"SLOW\r".to_vec(), b"f\r".to_vec()]);
}
