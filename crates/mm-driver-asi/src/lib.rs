//! ASI stage driver.
//!
//! Supports MS2000 and Tiger controllers over RS-232: XY and Z positioning,
//! status and halt, and joystick speed/mirror settings.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mm_driver_asi::AsiStageFactory;
//!
//! registry.register_factory(Box::new(AsiStageFactory));
//! ```

pub mod stage;

pub use stage::{AsiStage, AsiStageConfig, AsiStageFactory, AxisSet, Joystick, JoystickPolarity};

/// Force the linker to include this crate.
///
/// Call this function from main() so the factory is not stripped from the
/// final binary.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<AsiStageFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
