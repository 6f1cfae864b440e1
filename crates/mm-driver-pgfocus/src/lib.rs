//! pgFocus focus-lock driver.
//!
//! The board streams status lines continuously; a background monitor parses
//! them into [`FocusState`] and republishes each `STATS:` line as a
//! [`Reading`](mm_core::device::Reading).

pub mod focus;
pub mod message;
pub mod state;

pub use focus::{FocusRequest, PgFocus, PgFocusConfig, PgFocusFactory};
pub use message::{FocusMessage, Stats};
pub use state::{FocusMode, FocusState, OffsetWindow};

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<PgFocusFactory>());
}
