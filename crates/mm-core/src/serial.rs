//! Half-duplex serial channel.
//!
//! A [`SerialChannel`] owns one byte stream (a real COM port, a USB-CDC device,
//! a `tokio::io::DuplexStream` or a [`crate::mock_serial::MockSerialPort`]) and
//! the bytes already received from it but not yet consumed. Both sit behind a
//! single async mutex: holding the guard is what "having a transaction in
//! flight" means.
//!
//! # Feature Flag
//!
//! Opening real hardware requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! mm-core = { path = "../mm-core", features = ["serial"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use mm_core::serial::{Deadline, SerialChannel};
//! use std::time::Duration;
//!
//! let channel = SerialChannel::open("/dev/ttyUSB0", 9600, "MS2000").await?;
//! let mut port = channel.lock().await;
//! port.purge();
//! port.write(b"W X Y\r").await?;
//! let line = port.read_until(b"\r\n", &Deadline::after(Duration::from_secs(1))).await?;
//! ```

use crate::error::TransactError;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Bytes requested from the port per read call.
const READ_CHUNK: usize = 256;

/// Upper bound on chunks discarded by a single purge, so a device that never
/// stops talking cannot pin the caller.
const PURGE_MAX_CHUNKS: usize = 64;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can back a
/// channel:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
/// - [`crate::mock_serial::MockSerialPort`] (scripted testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Exclusive access to a channel's port, held for the duration of one exchange.
pub type ChannelGuard<'a> = MutexGuard<'a, ChannelState>;

// =============================================================================
// Deadline
// =============================================================================

/// Absolute point in time by which an exchange must complete.
///
/// Keeps the original budget so timeout errors report what the caller asked
/// for rather than what was left.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub(crate) fn timeout_error(&self, received: usize) -> TransactError {
        TransactError::Timeout {
            timeout: self.budget,
            received,
        }
    }
}

// =============================================================================
// Channel State
// =============================================================================

/// The port plus its receive buffer.
///
/// Reads accumulate into `pending`; consumers split complete replies off the
/// front and leave any trailing bytes for the next read or purge.
pub struct ChannelState {
    io: DynSerial,
    pending: BytesMut,
}

impl ChannelState {
    fn new(io: DynSerial) -> Self {
        Self {
            io,
            pending: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Remove and return the first `n` pending bytes.
    pub fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.pending.len());
        self.pending.split_to(n).freeze()
    }

    /// Write all bytes and flush.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TransactError> {
        self.io.write_all(bytes).await?;
        self.io.flush().await?;
        Ok(())
    }

    /// Discard stale input: everything pending plus whatever the port can
    /// deliver without waiting. Returns the number of bytes discarded.
    pub fn purge(&mut self) -> usize {
        let mut discarded = self.pending.len();
        self.pending.clear();

        let mut buf = [0u8; READ_CHUNK];
        for _ in 0..PURGE_MAX_CHUNKS {
            match self.io.read(&mut buf).now_or_never() {
                Some(Ok(n)) if n > 0 => discarded += n,
                // Nothing ready, EOF or an error: the next read reports it.
                _ => break,
            }
        }
        discarded
    }

    /// Read one chunk from the port into the pending buffer.
    pub async fn fill(&mut self, deadline: &Deadline) -> Result<usize, TransactError> {
        let mut buf = [0u8; READ_CHUNK];
        match tokio::time::timeout_at(deadline.instant(), self.io.read(&mut buf)).await {
            Err(_) => Err(deadline.timeout_error(self.pending.len())),
            Ok(Ok(0)) => Err(TransactError::ChannelClosed),
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(TransactError::Io(e)),
        }
    }

    /// Read through the first occurrence of `terminator`.
    ///
    /// The returned bytes include the terminator. Bytes after it stay pending.
    pub async fn read_until(
        &mut self,
        terminator: &[u8],
        deadline: &Deadline,
    ) -> Result<Bytes, TransactError> {
        if terminator.is_empty() {
            return Err(TransactError::InvalidRequest("empty terminator".into()));
        }

        let mut scanned = 0;
        loop {
            if let Some(pos) = find(&self.pending, terminator, scanned) {
                return Ok(self.take(pos + terminator.len()));
            }
            // A terminator may straddle the next chunk boundary.
            scanned = self.pending.len().saturating_sub(terminator.len() - 1);
            self.fill(deadline).await?;
        }
    }
}

impl fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelState")
            .field("pending", &printable(&self.pending))
            .finish_non_exhaustive()
    }
}

/// Position of `needle` in `haystack`, searching from `from`.
fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Render bytes for logs and error messages, escaping non-printable ones.
pub fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}

// =============================================================================
// Serial Channel
// =============================================================================

/// Named, cloneable handle to one half-duplex serial channel.
///
/// Clones share the same port; the mutex inside serializes exchanges.
#[derive(Clone)]
pub struct SerialChannel {
    name: Arc<str>,
    state: Arc<Mutex<ChannelState>>,
}

impl SerialChannel {
    /// Wrap an already-open port.
    pub fn new(name: impl Into<String>, io: DynSerial) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name),
            state: Arc::new(Mutex::new(ChannelState::new(io))),
        }
    }

    /// Open a real serial port (8N1, no flow control).
    #[cfg(feature = "serial")]
    pub async fn open(port_path: &str, baud_rate: u32, device_name: &str) -> anyhow::Result<Self> {
        let port = open_serial_async(port_path, baud_rate, device_name).await?;
        Ok(Self::new(port_path, Box::new(port)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the channel without waiting.
    pub fn try_acquire(&self) -> Result<ChannelGuard<'_>, TransactError> {
        self.state
            .try_lock()
            .map_err(|_| TransactError::ChannelBusy {
                channel: self.name.to_string(),
            })
    }

    /// Acquire the channel, waiting for any exchange in flight.
    pub async fn lock(&self) -> ChannelGuard<'_> {
        self.state.lock().await
    }

    /// Whether an exchange currently holds the channel.
    pub fn is_busy(&self) -> bool {
        self.state.try_lock().is_err()
    }
}

impl fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialChannel")
            .field("name", &self.name)
            .field("busy", &self.is_busy())
            .finish()
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}
