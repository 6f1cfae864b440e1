//! Sutter Lambda filter wheel and shutter driver.
//!
//! One device per controller: wheels A/B (and C on a 10-3), shutters A/B and
//! the wheel speed are exposed as options on the same device.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mm_driver_sutter::SutterLambdaFactory;
//!
//! registry.register_factory(Box::new(SutterLambdaFactory));
//! ```

pub mod lambda;

pub use lambda::{
    ControllerType, Shutter, SutterLambda, SutterLambdaConfig, SutterLambdaFactory, Wheel,
};

/// Force the linker to include this crate.
#[inline(never)]
pub fn link() {
    std::hint::black_box(std::any::TypeId::of::<SutterLambdaFactory>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_does_not_panic() {
        link();
    }
}
