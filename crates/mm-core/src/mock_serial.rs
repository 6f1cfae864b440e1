//! Mock serial port for exercising transactors and drivers without hardware.
//!
//! Two ways to drive the mock:
//!
//! - [`MockDeviceHarness`]: the test scripts each step by hand
//!   (`expect_write`, then `send_response`).
//! - [`ScriptedDevice`]: a spawned responder that answers every recognized
//!   command with a canned reply, optionally after a delay. Suited to
//!   concurrency and timing tests where the test body is busy elsewhere.
//!
//! # Architecture
//!
//! A pair of unbounded channels simulates the wire:
//! - `MockSerialPort` (given to the code under test): implements AsyncRead/AsyncWrite
//! - `MockDeviceHarness` (kept in test): plays the device
//!
//! Dropping or disconnecting the harness side makes the port read EOF, which
//! the channel layer reports as `ChannelClosed`.
//!
//! # Example
//!
//! ```rust,ignore
//! use mm_core::mock_serial;
//! use mm_core::serial::SerialChannel;
//! use mm_core::transactor::{ReplyMatch, Transactor};
//!
//! let (port, mut harness) = mock_serial::new();
//! let transactor = Transactor::new(SerialChannel::new("mock", Box::new(port)));
//!
//! let app = tokio::spawn(async move {
//!     transactor.execute("W X", ReplyMatch::crlf(), Duration::from_secs(1)).await
//! });
//!
//! harness.expect_and_respond(b"W X\r", b":A 1200\r\n").await;
//! assert_eq!(app.await??.payload(), b":A 1200");
//! ```

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// The client-facing side of the mock serial port.
#[derive(Debug)]
pub struct MockSerialPort {
    /// Channel to send written data to the harness
    writes_tx: UnboundedSender<Vec<u8>>,
    /// Channel to receive data from the harness to be read
    reads_rx: UnboundedReceiver<Vec<u8>>,
    /// Data received from the harness but not yet read by the client
    read_buffer: VecDeque<u8>,
}

/// The test-facing side for controlling the mock serial port.
#[derive(Debug)]
pub struct MockDeviceHarness {
    /// Channel to receive data written by the client
    writes_rx: UnboundedReceiver<Vec<u8>>,
    /// Channel to send data to the client; `None` once disconnected
    reads_tx: Option<UnboundedSender<Vec<u8>>>,
    /// Data received from the client but not yet asserted by the test
    write_buffer: Vec<u8>,
}

/// Creates a new connected pair of `MockSerialPort` and `MockDeviceHarness`.
pub fn new() -> (MockSerialPort, MockDeviceHarness) {
    let (client_to_harness_tx, client_to_harness_rx) = mpsc::unbounded_channel();
    let (harness_to_client_tx, harness_to_client_rx) = mpsc::unbounded_channel();

    let port = MockSerialPort {
        writes_tx: client_to_harness_tx,
        reads_rx: harness_to_client_rx,
        read_buffer: VecDeque::new(),
    };

    let harness = MockDeviceHarness {
        writes_rx: client_to_harness_rx,
        reads_tx: Some(harness_to_client_tx),
        write_buffer: Vec::new(),
    };

    (port, harness)
}

// =============================================================================
// MockSerialPort Implementations
// =============================================================================

impl MockSerialPort {
    fn drain_into(&mut self, buf: &mut ReadBuf<'_>) {
        let to_read = std::cmp::min(buf.remaining(), self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..to_read).collect();
        buf.put_slice(&chunk);
    }
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            self.drain_into(buf);
            return Poll::Ready(Ok(()));
        }

        match self.reads_rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.read_buffer.extend(chunk);
                self.drain_into(buf);
                Poll::Ready(Ok(()))
            }
            // Harness gone: end-of-file
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(_) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// =============================================================================
// MockDeviceHarness Implementations
// =============================================================================

impl MockDeviceHarness {
    /// Sends bytes to the client as if the device transmitted them.
    ///
    /// # Errors
    /// Returns error if the client port has been dropped or the harness was
    /// disconnected.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .as_ref()
            .ok_or("harness disconnected")?
            .send(data.to_vec())
            .map_err(|_| "Failed to send response: client port disconnected")
    }

    /// Simulate the device being unplugged: the client reads EOF from now on.
    pub fn disconnect(&mut self) {
        self.reads_tx = None;
    }

    /// Waits for the client to write specific data and asserts its correctness.
    ///
    /// Incoming writes are buffered until the expected length is reached;
    /// excess bytes stay buffered for the next expectation.
    ///
    /// # Panics
    /// Panics if the expected data is not received within 2 seconds or if
    /// the received data does not match the expected data.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        use tokio::time::timeout;

        let timeout_duration = Duration::from_secs(2);

        while self.write_buffer.len() < expected.len() {
            match timeout(timeout_duration, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("Client-side port closed while expecting a write."),
                Err(_) => {
                    panic!(
                        "Timeout waiting for write. Expected `{:?}` ({} bytes), but only received `{:?}` ({} bytes).",
                        String::from_utf8_lossy(expected),
                        expected.len(),
                        String::from_utf8_lossy(&self.write_buffer),
                        self.write_buffer.len()
                    );
                }
            }
        }

        let actual = &self.write_buffer[..expected.len()];
        assert_eq!(
            actual,
            expected,
            "Mismatch in expected write. Expected `{:?}`, got `{:?}`.",
            String::from_utf8_lossy(expected),
            String::from_utf8_lossy(actual)
        );

        self.write_buffer.drain(..expected.len());
    }

    /// Expects a write and sends a response in one operation.
    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{}", e);
        }
    }

    /// Drains any pending writes without asserting their content.
    pub async fn drain_writes(&mut self) {
        use tokio::time::timeout;
        let short_timeout = Duration::from_millis(50);

        while let Ok(Some(chunk)) = timeout(short_timeout, self.writes_rx.recv()).await {
            self.write_buffer.extend_from_slice(&chunk);
        }
        self.write_buffer.clear();
    }
}

// =============================================================================
// ScriptedDevice
// =============================================================================

#[derive(Debug, Clone)]
struct Rule {
    command: Vec<u8>,
    reply: Vec<u8>,
    delay: Duration,
}

/// A fake device that answers commands from a script.
///
/// Each received byte sequence is matched against the rules' command bytes
/// (including any transmit terminator). Matching commands are answered with
/// the rule's reply after its delay; bytes that cannot start any rule are
/// dropped, as a real controller ignores line noise.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDevice {
    rules: Vec<Rule>,
    echo: bool,
}

/// Handle to a running [`ScriptedDevice`].
#[derive(Debug)]
pub struct ScriptHandle {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl ScriptedDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `reply` immediately.
    pub fn on(self, command: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> Self {
        self.on_delayed(command, reply, Duration::ZERO)
    }

    /// Answer `command` with `reply` after `delay`.
    pub fn on_delayed(
        mut self,
        command: impl AsRef<[u8]>,
        reply: impl AsRef<[u8]>,
        delay: Duration,
    ) -> Self {
        self.rules.push(Rule {
            command: command.as_ref().to_vec(),
            reply: reply.as_ref().to_vec(),
            delay,
        });
        self
    }

    /// Echo each recognized command verbatim before replying.
    pub fn echo_commands(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Start the responder and return the port to hand to the code under test.
    pub fn spawn(self) -> (MockSerialPort, ScriptHandle) {
        let (port, harness) = new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        let task = tokio::spawn(self.run(harness, log));
        (port, ScriptHandle { received, task })
    }

    async fn run(self, mut harness: MockDeviceHarness, log: Arc<Mutex<Vec<Vec<u8>>>>) {
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = harness.writes_rx.recv().await {
            buffer.extend_from_slice(&chunk);

            loop {
                if let Some(rule) = self.rules.iter().find(|r| buffer.starts_with(&r.command)) {
                    buffer.drain(..rule.command.len());
                    log.lock().push(rule.command.clone());

                    if self.echo {
                        let _ = harness.send_response(&rule.command);
                    }
                    if !rule.delay.is_zero() {
                        tokio::time::sleep(rule.delay).await;
                    }
                    if !rule.reply.is_empty() {
                        let _ = harness.send_response(&rule.reply);
                    }
                    continue;
                }

                let could_match = self
                    .rules
                    .iter()
                    .any(|r| r.command.starts_with(&buffer));
                if buffer.is_empty() || could_match {
                    break;
                }
                buffer.remove(0);
            }
        }
    }
}

impl ScriptHandle {
    /// Commands recognized so far, in arrival order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    /// Stop the responder. The client reads EOF afterwards.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ScriptHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
