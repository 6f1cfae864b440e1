//! Simulated hardware for `mm-core`.
//!
//! [`MockCamera`] produces test-pattern frames through the poller with no
//! serial port behind it. It is the reference consumer of the acquisition
//! surface and can inject not-ready, failure and disconnect conditions.

pub mod camera;
pub mod pattern;
pub mod rng;

pub use camera::{ErrorScenario, Frame, MockCamera, MockCameraConfig, MockCameraFactory};
pub use rng::MockRng;

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<MockCameraFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
