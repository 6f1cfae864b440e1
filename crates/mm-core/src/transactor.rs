//! Serial command/response transactor.
//!
//! One [`Transactor::execute`] call is one exchange: acquire the channel,
//! purge stale input, write the command, then wait for the reply the caller
//! describes with a [`ReplyMatch`]. The whole exchange is bounded by the
//! caller's timeout, measured from the start of the call.
//!
//! # Reply shapes
//!
//! | Device behaviour | `ReplyMatch` |
//! |---|---|
//! | ASCII line ending in CR / CRLF, possibly preceded by a command echo | [`ReplyMatch::cr`], [`ReplyMatch::crlf`], [`ReplyMatch::terminator`] |
//! | Single-byte (or short) echo, no terminator | [`EchoMatch::bytes`] |
//! | Line that must begin with a known prefix (`":A X="`) | [`EchoMatch::prefix`] |
//!
//! Devices that echo an altered form of some commands are handled with
//! [`EchoMatch::with_alternate`]; the matched candidate is reported by
//! [`Response::echo`].
//!
//! # Concurrency
//!
//! At most one exchange holds a channel at a time. [`Transactor::execute`]
//! fails fast with `ChannelBusy` when the channel is held;
//! [`Transactor::execute_queued`] waits for it within the same deadline.
//!
//! # Example
//!
//! ```rust,ignore
//! use mm_core::transactor::{EchoMatch, ReplyMatch, Transactor};
//!
//! let reply = transactor
//!     .execute("JS X?", EchoMatch::prefix(":A X=", "\r"), Duration::from_millis(500))
//!     .await?;
//! let fast = reply.parse_after("X=")?.to_f64()?;
//! ```

use crate::error::TransactError;
use crate::response::{EchoKind, Response, ResponseStatus};
use crate::serial::{printable, ChannelGuard, ChannelState, Deadline, SerialChannel};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, trace};

// =============================================================================
// Command
// =============================================================================

/// Bytes to send to a device.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    bytes: Vec<u8>,
    /// Append the transactor's transmit terminator on the wire.
    terminated: bool,
}

impl Command {
    /// ASCII command; the transmit terminator is appended when sent.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            bytes: text.into().into_bytes(),
            terminated: true,
        }
    }

    /// Binary command, sent verbatim.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            terminated: false,
        }
    }

    /// Append a suffix (axis letter, value).
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.bytes.extend_from_slice(value.to_string().as_bytes());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_text(&self) -> bool {
        self.terminated
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&printable(&self.bytes))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({:?})", printable(&self.bytes))
    }
}

impl From<&str> for Command {
    fn from(text: &str) -> Self {
        Command::text(text)
    }
}

impl From<String> for Command {
    fn from(text: String) -> Self {
        Command::text(text)
    }
}

impl From<&[u8]> for Command {
    fn from(bytes: &[u8]) -> Self {
        Command::raw(bytes)
    }
}

impl From<Vec<u8>> for Command {
    fn from(bytes: Vec<u8>) -> Self {
        Command::raw(bytes)
    }
}

impl<const N: usize> From<[u8; N]> for Command {
    fn from(bytes: [u8; N]) -> Self {
        Command::raw(bytes.to_vec())
    }
}

// =============================================================================
// Reply Matching
// =============================================================================

/// What marks the end of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMatch {
    /// Read through the first occurrence of this byte sequence.
    Terminator(Vec<u8>),
    /// Match an echo, optionally followed by a terminated payload.
    Echo(EchoMatch),
}

impl ReplyMatch {
    pub fn terminator(terminator: impl Into<Vec<u8>>) -> Self {
        ReplyMatch::Terminator(terminator.into())
    }

    pub fn cr() -> Self {
        ReplyMatch::Terminator(b"\r".to_vec())
    }

    pub fn crlf() -> Self {
        ReplyMatch::Terminator(b"\r\n".to_vec())
    }

    fn validate(&self) -> Result<(), TransactError> {
        match self {
            ReplyMatch::Terminator(t) if t.is_empty() => {
                Err(TransactError::InvalidRequest("empty terminator".into()))
            }
            ReplyMatch::Echo(echo) => echo.validate(),
            ReplyMatch::Terminator(_) => Ok(()),
        }
    }
}

impl From<EchoMatch> for ReplyMatch {
    fn from(echo: EchoMatch) -> Self {
        ReplyMatch::Echo(echo)
    }
}

/// Accepted echo patterns.
///
/// Without a terminator the reply is complete as soon as the received bytes
/// start with a candidate. With a terminator the whole line is read first and
/// must start with a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoMatch {
    pub expected: Vec<u8>,
    pub alternates: Vec<Vec<u8>>,
    pub terminator: Option<Vec<u8>>,
}

impl EchoMatch {
    /// Unterminated echo, e.g. a single command byte.
    pub fn bytes(expected: impl Into<Vec<u8>>) -> Self {
        Self {
            expected: expected.into(),
            alternates: Vec::new(),
            terminator: None,
        }
    }

    /// Terminated line that must start with `expected`.
    pub fn prefix(expected: impl Into<Vec<u8>>, terminator: impl Into<Vec<u8>>) -> Self {
        Self {
            expected: expected.into(),
            alternates: Vec::new(),
            terminator: Some(terminator.into()),
        }
    }

    /// Also accept `alternate` as a valid echo.
    pub fn with_alternate(mut self, alternate: impl Into<Vec<u8>>) -> Self {
        self.alternates.push(alternate.into());
        self
    }

    fn candidates(&self) -> impl Iterator<Item = (EchoKind, &[u8])> {
        std::iter::once((EchoKind::Expected, self.expected.as_slice())).chain(
            self.alternates
                .iter()
                .enumerate()
                .map(|(i, alt)| (EchoKind::Alternate(i), alt.as_slice())),
        )
    }

    /// First candidate that `received` starts with.
    fn matched(&self, received: &[u8]) -> Option<(EchoKind, usize)> {
        self.candidates()
            .find(|(_, candidate)| received.starts_with(candidate))
            .map(|(kind, candidate)| (kind, candidate.len()))
    }

    /// Whether more bytes could still complete some candidate.
    fn could_match(&self, received: &[u8]) -> bool {
        self.candidates()
            .any(|(_, candidate)| candidate.starts_with(received))
    }

    fn describe(&self) -> String {
        let mut out = format!("\"{}\"", printable(&self.expected));
        for alt in &self.alternates {
            out.push_str(&format!(" or \"{}\"", printable(alt)));
        }
        out
    }

    fn validate(&self) -> Result<(), TransactError> {
        if self.candidates().any(|(_, c)| c.is_empty()) {
            return Err(TransactError::InvalidRequest("empty echo pattern".into()));
        }
        if matches!(&self.terminator, Some(t) if t.is_empty()) {
            return Err(TransactError::InvalidRequest("empty terminator".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Per-channel transactor behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactorSettings {
    /// Appended to text commands on the wire.
    pub tx_terminator: Vec<u8>,
    /// Skip a reply line equal to the command, and strip a leading command
    /// echo from the payload.
    pub strip_echo: bool,
    /// Timeout used by drivers when the caller does not supply one.
    pub default_timeout: Duration,
}

impl Default for TransactorSettings {
    fn default() -> Self {
        Self {
            tx_terminator: b"\r".to_vec(),
            strip_echo: true,
            default_timeout: Duration::from_secs(1),
        }
    }
}

impl TransactorSettings {
    pub fn with_tx_terminator(mut self, terminator: impl Into<Vec<u8>>) -> Self {
        self.tx_terminator = terminator.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_strip_echo(mut self, strip: bool) -> Self {
        self.strip_echo = strip;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Acquire {
    FailFast,
    Queued,
}

// =============================================================================
// Transactor
// =============================================================================

/// Request/reply exchanges over one [`SerialChannel`].
///
/// Cheap to clone; clones share the channel and therefore its mutual
/// exclusion.
#[derive(Debug, Clone)]
pub struct Transactor {
    channel: SerialChannel,
    settings: TransactorSettings,
}

impl Transactor {
    pub fn new(channel: SerialChannel) -> Self {
        Self::with_settings(channel, TransactorSettings::default())
    }

    pub fn with_settings(channel: SerialChannel, settings: TransactorSettings) -> Self {
        Self { channel, settings }
    }

    pub fn channel(&self) -> &SerialChannel {
        &self.channel
    }

    pub fn settings(&self) -> &TransactorSettings {
        &self.settings
    }

    pub fn default_timeout(&self) -> Duration {
        self.settings.default_timeout
    }

    /// Perform one exchange, failing with `ChannelBusy` if another exchange
    /// holds the channel.
    pub async fn execute(
        &self,
        command: impl Into<Command>,
        expected: impl Into<ReplyMatch>,
        timeout: Duration,
    ) -> Result<Response, TransactError> {
        self.exchange(command.into(), expected.into(), timeout, Acquire::FailFast)
            .await
    }

    /// Like [`execute`](Self::execute) but waits for the channel. Time spent
    /// waiting counts against `timeout`.
    pub async fn execute_queued(
        &self,
        command: impl Into<Command>,
        expected: impl Into<ReplyMatch>,
        timeout: Duration,
    ) -> Result<Response, TransactError> {
        self.exchange(command.into(), expected.into(), timeout, Acquire::Queued)
            .await
    }

    /// Write a command that produces no reply.
    #[instrument(level = "debug", skip(self, command), fields(channel = %self.channel.name()), err)]
    pub async fn send(&self, command: impl Into<Command>) -> Result<(), TransactError> {
        let command = command.into();
        if command.is_empty() {
            return Err(TransactError::InvalidRequest("empty command".into()));
        }

        let deadline = Deadline::after(self.default_timeout());
        let mut port = self.channel.try_acquire()?;
        purge(&mut port);
        self.write_by(&mut port, &command, &deadline).await?;
        trace!(command = %command, "command sent");
        Ok(())
    }

    /// Like [`send`](Self::send) but waits up to `timeout` for the channel.
    ///
    /// For devices whose channel is mostly held by a monitor reading
    /// unsolicited lines.
    #[instrument(level = "debug", skip(self, command), fields(channel = %self.channel.name()), err)]
    pub async fn send_queued(
        &self,
        command: impl Into<Command>,
        timeout: Duration,
    ) -> Result<(), TransactError> {
        let command = command.into();
        if command.is_empty() {
            return Err(TransactError::InvalidRequest("empty command".into()));
        }
        validate_timeout(timeout)?;

        let deadline = Deadline::after(timeout);
        let mut port = self.acquire(Acquire::Queued, &deadline).await?;
        purge(&mut port);
        self.write_by(&mut port, &command, &deadline).await?;
        trace!(command = %command, "command sent");
        Ok(())
    }

    /// Like [`send_queued`](Self::send_queued) but leaves pending input alone.
    ///
    /// For devices that stream unsolicited lines: bytes already received
    /// belong to the stream reader and must survive a host write.
    #[instrument(level = "debug", skip(self, command), fields(channel = %self.channel.name()), err)]
    pub async fn write_queued(
        &self,
        command: impl Into<Command>,
        timeout: Duration,
    ) -> Result<(), TransactError> {
        let command = command.into();
        if command.is_empty() {
            return Err(TransactError::InvalidRequest("empty command".into()));
        }
        validate_timeout(timeout)?;

        let deadline = Deadline::after(timeout);
        let mut port = self.acquire(Acquire::Queued, &deadline).await?;
        self.write_by(&mut port, &command, &deadline).await?;
        trace!(command = %command, "command written");
        Ok(())
    }

    /// Wait for a reply without writing anything first.
    ///
    /// Used for deferred replies (a move-complete marker) and for devices that
    /// stream unsolicited lines. Pending bytes are not purged.
    #[instrument(level = "debug", skip(self, expected), fields(channel = %self.channel.name()), err)]
    pub async fn read_reply(
        &self,
        expected: impl Into<ReplyMatch>,
        timeout: Duration,
    ) -> Result<Response, TransactError> {
        let expected = expected.into();
        validate_timeout(timeout)?;
        expected.validate()?;

        let deadline = Deadline::after(timeout);
        let mut port = self.acquire(Acquire::Queued, &deadline).await?;
        let response = self.await_reply(&mut port, None, &expected, &deadline).await?;
        trace!(reply = %printable(response.raw()), "reply received");
        Ok(response)
    }

    #[instrument(
        level = "debug",
        skip(self, command, expected),
        fields(channel = %self.channel.name(), command = %command),
        err
    )]
    async fn exchange(
        &self,
        command: Command,
        expected: ReplyMatch,
        timeout: Duration,
        acquire: Acquire,
    ) -> Result<Response, TransactError> {
        if command.is_empty() {
            return Err(TransactError::InvalidRequest("empty command".into()));
        }
        validate_timeout(timeout)?;
        expected.validate()?;

        let deadline = Deadline::after(timeout);
        let mut port = self.acquire(acquire, &deadline).await?;

        purge(&mut port);
        self.write_by(&mut port, &command, &deadline).await?;

        let response = self
            .await_reply(&mut port, Some(&command), &expected, &deadline)
            .await?;
        debug!(reply = %printable(response.raw()), "transaction complete");
        Ok(response)
    }

    async fn acquire(
        &self,
        mode: Acquire,
        deadline: &Deadline,
    ) -> Result<ChannelGuard<'_>, TransactError> {
        match mode {
            Acquire::FailFast => self.channel.try_acquire(),
            Acquire::Queued => tokio::time::timeout_at(deadline.instant(), self.channel.lock())
                .await
                .map_err(|_| deadline.timeout_error(0)),
        }
    }

    /// Command bytes as they go on the wire, in one buffer so the write is
    /// a single call.
    fn frame(&self, command: &Command) -> Vec<u8> {
        let mut frame = command.as_bytes().to_vec();
        if command.is_text() {
            frame.extend_from_slice(&self.settings.tx_terminator);
        }
        frame
    }

    /// Write a framed command; a write that cannot complete by the deadline
    /// (flow control, a stalled adapter) times out like a silent reply.
    async fn write_by(
        &self,
        port: &mut ChannelState,
        command: &Command,
        deadline: &Deadline,
    ) -> Result<(), TransactError> {
        tokio::time::timeout_at(deadline.instant(), port.write(&self.frame(command)))
            .await
            .map_err(|_| deadline.timeout_error(0))?
    }

    async fn await_reply(
        &self,
        port: &mut ChannelState,
        command: Option<&Command>,
        expected: &ReplyMatch,
        deadline: &Deadline,
    ) -> Result<Response, TransactError> {
        match expected {
            ReplyMatch::Terminator(terminator) => {
                let (raw, payload) = self.read_line(port, command, terminator, deadline).await?;
                Ok(Response::new(raw, payload))
            }
            ReplyMatch::Echo(echo) => match &echo.terminator {
                None => match_echo(port, echo, deadline).await,
                Some(terminator) => {
                    let (raw, payload) =
                        self.read_line(port, command, terminator, deadline).await?;
                    verify_prefix(echo, raw, payload)
                }
            },
        }
    }

    /// Read one reply line, skipping and stripping a verbatim command echo.
    async fn read_line(
        &self,
        port: &mut ChannelState,
        command: Option<&Command>,
        terminator: &[u8],
        deadline: &Deadline,
    ) -> Result<(Bytes, Bytes), TransactError> {
        let echo = command
            .filter(|c| self.settings.strip_echo && c.is_text())
            .map(Command::as_bytes);

        loop {
            let raw = port.read_until(terminator, deadline).await?;
            let body = raw.slice(..raw.len() - terminator.len());
            let mut payload = trim_line_start(body);

            if let Some(echo) = echo {
                if payload[..] == *echo {
                    trace!("skipping echoed command line");
                    continue;
                }
                if payload.starts_with(echo) {
                    payload = trim_line_start(payload.slice(echo.len()..));
                }
            }
            return Ok((raw, payload));
        }
    }
}

fn validate_timeout(timeout: Duration) -> Result<(), TransactError> {
    if timeout.is_zero() {
        return Err(TransactError::InvalidRequest("timeout must be positive".into()));
    }
    Ok(())
}

fn purge(port: &mut ChannelState) {
    let discarded = port.purge();
    if discarded > 0 {
        debug!(discarded, "purged stale bytes before command");
    }
}

/// Drop line-break bytes left over from a previous line.
fn trim_line_start(mut line: Bytes) -> Bytes {
    let skip = line
        .iter()
        .take_while(|b| **b == b'\r' || **b == b'\n')
        .count();
    if skip > 0 {
        line = line.slice(skip..);
    }
    line
}

async fn match_echo(
    port: &mut ChannelState,
    echo: &EchoMatch,
    deadline: &Deadline,
) -> Result<Response, TransactError> {
    loop {
        let received = port.pending();
        if let Some((kind, len)) = echo.matched(received) {
            let raw = port.take(len);
            if let EchoKind::Alternate(i) = kind {
                debug!(alternate = i, echo = %printable(&raw), "accepted alternate echo");
            }
            return Ok(Response::with_echo(raw.clone(), raw, kind, len));
        }
        if !echo.could_match(received) {
            return Err(TransactError::Protocol {
                expected: echo.describe(),
                received: printable(received),
            });
        }
        port.fill(deadline).await?;
    }
}

fn verify_prefix(echo: &EchoMatch, raw: Bytes, payload: Bytes) -> Result<Response, TransactError> {
    if let Some((kind, len)) = echo.matched(&payload) {
        return Ok(Response::with_echo(raw, payload, kind, len));
    }
    match ResponseStatus::of(&payload) {
        ResponseStatus::Nak(code) => Err(TransactError::Rejected {
            code,
            reply: printable(&payload),
        }),
        _ => Err(TransactError::Protocol {
            expected: echo.describe(),
            received: printable(&payload),
        }),
    }
}
