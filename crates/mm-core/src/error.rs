//! Error types for the serial core and its drivers.
//!
//! Errors are layered the same way the code is:
//!
//! - **`ParseError`**: a payload could not be extracted from an otherwise
//!   well-formed reply.
//! - **`TransactError`**: one request/reply exchange failed. Always returned to
//!   the immediate caller; the transactor never retries on its own.
//! - **`PollError`**: one acquisition cycle failed. Transient failures stay
//!   inside the poller, fatal ones are surfaced to the sink once.
//! - **`PollerError`**: a start request was refused by the poller state machine.
//! - **`DriverError`**: a device-level failure tagged with the driver type.
//! - **`MmError`**: the application-level umbrella used by the registry and CLI.
//!
//! `#[from]` conversions let `?` lift lower layers into higher ones.

use crate::poller::PollState;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Parse Errors
// =============================================================================

/// A reply payload could not be interpreted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The separator token does not occur in the reply.
    #[error("token '{token}' not found in reply '{text}'")]
    TokenNotFound { token: String, text: String },

    /// The token was found but nothing follows it.
    #[error("nothing follows token '{token}'")]
    Empty { token: String },

    /// A fixed offset points past the end of the reply.
    #[error("offset {offset} is past the end of a {len}-character reply")]
    OffsetOutOfRange { offset: usize, len: usize },

    /// A numeric value was required but the text is not a number.
    #[error("'{text}' is not a number")]
    NotNumeric { text: String },
}

// =============================================================================
// Transaction Errors
// =============================================================================

/// Failure of a single command/response exchange.
///
/// A failed exchange means the device state is unknown to the caller, so
/// callers must not apply cached or mirrored updates until a transaction
/// succeeds.
#[derive(Error, Debug)]
pub enum TransactError {
    /// Another transaction holds the channel.
    ///
    /// **Recovery**: always safe to retry once the in-flight exchange completes
    /// (see [`crate::retry::retry_busy`]).
    #[error("channel '{channel}' is busy with another transaction")]
    ChannelBusy { channel: String },

    /// No terminator or echo arrived before the deadline.
    #[error("no reply within {timeout:?} ({received} bytes received)")]
    Timeout { timeout: Duration, received: usize },

    /// The bytes received match none of the accepted echo patterns.
    ///
    /// Usually a baud/wiring mismatch or a firmware variant that the caller
    /// does not know about yet.
    #[error("unexpected reply: expected {expected}, received {received}")]
    Protocol { expected: String, received: String },

    /// The device answered with an explicit negative acknowledgement (`:N`).
    #[error("device rejected command (code {code:?}): {reply}")]
    Rejected { code: Option<i32>, reply: String },

    /// The reply arrived but its payload could not be parsed.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The underlying port reported an I/O error.
    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The port reached end-of-file; the device is gone.
    #[error("serial channel closed")]
    ChannelClosed,

    /// The request itself was malformed (empty command, zero timeout).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransactError {
    /// Whether the failure is expected to resolve by itself on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransactError::ChannelBusy { .. }
                | TransactError::Timeout { .. }
                | TransactError::Protocol { .. }
                | TransactError::Rejected { .. }
                | TransactError::Parse(_)
        )
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, TransactError::ChannelBusy { .. })
    }
}

// =============================================================================
// Poll Errors
// =============================================================================

/// Failure of one acquisition cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// Self-resolving failure (device not ready). Retried after a backoff.
    #[error("transient poll failure: {0}")]
    Transient(String),

    /// The channel or device itself failed. Ends the session.
    #[error("fatal poll failure: {0}")]
    Fatal(String),
}

impl PollError {
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        PollError::Transient(reason.to_string())
    }

    pub fn fatal(reason: impl std::fmt::Display) -> Self {
        PollError::Fatal(reason.to_string())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, PollError::Fatal(_))
    }
}

impl From<TransactError> for PollError {
    fn from(err: TransactError) -> Self {
        if err.is_transient() {
            PollError::Transient(err.to_string())
        } else {
            PollError::Fatal(err.to_string())
        }
    }
}

/// A poller control request was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerError {
    #[error("poller is already active (state: {0})")]
    AlreadyRunning(PollState),
}

// =============================================================================
// Driver Errors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Configuration,
    Communication,
    Hardware,
    Timeout,
    Permission,
    InvalidParameter,
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::Permission => "permission",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

#[derive(Error, Debug, Clone)]
#[error("Driver '{driver_type}' {kind} error: {message}")]
pub struct DriverError {
    pub driver_type: String,
    pub kind: DriverErrorKind,
    pub message: String,
}

impl DriverError {
    pub fn new(
        driver_type: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver_type: driver_type.into(),
            kind,
            message: message.into(),
        }
    }

    /// Unknown option name or out-of-range value.
    pub fn invalid_parameter(driver_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(driver_type, DriverErrorKind::InvalidParameter, message)
    }

    /// Classify a failed transaction for a driver.
    pub fn from_transact(driver_type: impl Into<String>, err: &TransactError) -> Self {
        let kind = match err {
            TransactError::Timeout { .. } => DriverErrorKind::Timeout,
            TransactError::Rejected { .. } => DriverErrorKind::Hardware,
            TransactError::InvalidRequest(_) => DriverErrorKind::InvalidParameter,
            TransactError::ChannelBusy { .. }
            | TransactError::Protocol { .. }
            | TransactError::Parse(_)
            | TransactError::Io(_)
            | TransactError::ChannelClosed => DriverErrorKind::Communication,
        };
        Self::new(driver_type, kind, err.to_string())
    }
}

// =============================================================================
// Application Errors
// =============================================================================

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MmError>;

/// Application-level error used by the registry, logging setup and CLI.
#[derive(Error, Debug)]
pub enum MmError {
    /// Loading or validating the configuration file failed.
    #[error(transparent)]
    ConfigLoad(#[from] crate::config::ConfigLoadError),

    /// A configuration value is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transact(#[from] TransactError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Poller(#[from] PollerError),

    /// No factory is registered for the requested driver type.
    #[error("unknown driver type '{0}'")]
    UnknownDriver(String),

    /// No device with this name has been instantiated.
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    /// Failure reported by a driver factory or device.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
