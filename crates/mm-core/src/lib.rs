//! `mm-core`
//!
//! Shared building blocks for serial microscope device adapters.
//!
//! Vendor dialects differ, but nearly every adapter does the same two things:
//!
//! - **Transact**: send a command over a half-duplex serial channel, wait for a
//!   terminator or an echo, parse the reply ([`transactor`]).
//! - **Poll**: keep acquiring samples and hand them to a consumer until stopped
//!   or a target count is reached ([`poller`]).
//!
//! Everything else here supports those two: the channel itself ([`serial`]),
//! reply parsing ([`response`], [`parse`]), the host-facing device surface
//! ([`device`], [`registry`]), and the ambient stack ([`error`], [`config`],
//! [`logging`], [`retry`]). [`mock_serial`] provides scripted devices for tests.
//!
//! ## Example
//!
//! ```rust,ignore
//! use mm_core::serial::SerialChannel;
//! use mm_core::transactor::{ReplyMatch, Transactor};
//! use std::time::Duration;
//!
//! let channel = SerialChannel::open("/dev/ttyUSB0", 9600, "MS2000").await?;
//! let stage = Transactor::new(channel);
//! let reply = stage.execute("W X Y", ReplyMatch::cr(), Duration::from_millis(500)).await?;
//! let xy = reply.fields_after(":A")?;
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod mock_serial;
pub mod parse;
pub mod poller;
pub mod registry;
pub mod response;
pub mod retry;
pub mod serial;
pub mod transactor;

// Re-export commonly used types
pub use error::{
    AppResult, DriverError, DriverErrorKind, MmError, ParseError, PollError, PollerError,
    TransactError,
};
pub use poller::{PollEvent, PollSource, PollState, Poller, PollerSettings, Sample, SampleCount};
pub use response::{EchoKind, Response, ResponseStatus};
pub use serial::SerialChannel;
pub use transactor::{Command, EchoMatch, ReplyMatch, Transactor, TransactorSettings};
