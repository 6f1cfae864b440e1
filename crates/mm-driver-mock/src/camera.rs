//! Simulated camera driven by the poller.
//!
//! [`MockFrameSource`] sleeps the exposure and renders a test pattern per
//! cycle. Failures are injected with [`ErrorScenario`] so acquisition error
//! paths can be exercised without hardware.

use crate::pattern::generate_pattern;
use crate::rng::MockRng;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use mm_core::device::{
    Acquisition, Capability, Device, DeviceComponents, DeviceContext, DriverFactory, OptionKind,
    OptionSpec, OptionValue, Reading,
};
use mm_core::error::{DriverError, DriverErrorKind, PollError};
use mm_core::poller::{PollEvent, PollSource, Poller, PollerSettings, SampleCount, SampleSink};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

const DRIVER: &str = "mock_camera";

const MAX_DIMENSION: u32 = 4096;
const EVENT_CAPACITY: usize = 64;

// =============================================================================
// MockCameraFactory - DriverFactory implementation
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MockCameraConfig {
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_exposure_ms")]
    pub exposure_ms: f64,
    /// Every n-th attempt reports "not ready".
    pub not_ready_every: Option<u64>,
    /// The camera fails for good after this many frames.
    pub fail_after: Option<u64>,
    /// Seed for the frame noise; random when absent.
    pub seed: Option<u64>,
}

fn default_dimension() -> u32 {
    64
}

fn default_exposure_ms() -> f64 {
    10.0
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            width: default_dimension(),
            height: default_dimension(),
            exposure_ms: default_exposure_ms(),
            not_ready_every: None,
            fail_after: None,
            seed: None,
        }
    }
}

impl MockCameraConfig {
    fn check(&self) -> std::result::Result<(), DriverError> {
        let bad = |message: &str| {
            Err(DriverError::new(
                DRIVER,
                DriverErrorKind::Configuration,
                message,
            ))
        };
        if !(1..=MAX_DIMENSION).contains(&self.width) || !(1..=MAX_DIMENSION).contains(&self.height)
        {
            return bad("frame dimensions must be 1-4096 pixels");
        }
        if self.exposure_ms.is_nan() || self.exposure_ms <= 0.0 {
            return bad("exposure_ms must be positive");
        }
        if self.not_ready_every == Some(0) {
            return bad("not_ready_every must be at least 1");
        }
        Ok(())
    }

    fn scenarios(&self) -> Vec<ErrorScenario> {
        let mut scenarios = Vec::new();
        if let Some(n) = self.not_ready_every {
            scenarios.push(ErrorScenario::NotReadyEvery(n));
        }
        if let Some(n) = self.fail_after {
            scenarios.push(ErrorScenario::FailAfter(n));
        }
        scenarios
    }
}

pub struct MockCameraFactory;

static MOCK_CAMERA_CAPABILITIES: &[Capability] = &[Capability::Camera, Capability::Acquisition];

impl DriverFactory for MockCameraFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn name(&self) -> &'static str {
        "Mock Camera"
    }

    fn capabilities(&self) -> &'static [Capability] {
        MOCK_CAMERA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MockCameraConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(
        &self,
        ctx: DeviceContext,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: MockCameraConfig = config.try_into()?;
            cfg.check()?;
            let camera = MockCamera::with_settings(ctx.name, &cfg, ctx.poller);
            Ok(DeviceComponents::new(Arc::new(camera)))
        })
    }
}

// =============================================================================
// Frames & error injection
// =============================================================================

/// One simulated image: row-major little-endian `u16` pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_number: u64,
    pub width: u32,
    pub height: u32,
    pub exposure_ms: f64,
    pub data: Bytes,
}

impl Frame {
    fn from_pixels(frame_number: u64, width: u32, height: u32, exposure_ms: f64, pixels: &[u16]) -> Self {
        let data: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        Self {
            frame_number,
            width,
            height,
            exposure_ms,
            data: Bytes::from(data),
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = 2 * (y as usize * self.width as usize + x as usize);
        let bytes = self.data.get(i..i + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn pixels(&self) -> impl Iterator<Item = u16> + '_ {
        self.data
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn mean(&self) -> f64 {
        let n = (self.width as u64 * self.height as u64).max(1);
        self.pixels().map(u64::from).sum::<u64>() as f64 / n as f64
    }

    /// Summary published on the acquisition channel.
    pub fn reading(&self) -> Reading {
        Reading::new()
            .with("Frame", self.frame_number as i64)
            .with("Width", self.width as i64)
            .with("Height", self.height as i64)
            .with("Mean", self.mean())
            .with("Max", self.pixels().max().unwrap_or(0) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScenario {
    /// Every n-th attempt is a transient "not ready".
    NotReadyEvery(u64),
    /// Fatal once n frames have been produced.
    FailAfter(u64),
    /// Fatal on the next attempt.
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
struct CameraSettings {
    width: u32,
    height: u32,
    exposure_ms: f64,
}

/// Produces one frame per cycle.
pub struct MockFrameSource {
    settings: Arc<Mutex<CameraSettings>>,
    scenarios: Arc<Mutex<Vec<ErrorScenario>>>,
    rng: MockRng,
    attempts: u64,
    frames: u64,
}

impl MockFrameSource {
    fn injected_failure(&self) -> Option<PollError> {
        self.scenarios.lock().iter().find_map(|scenario| match *scenario {
            ErrorScenario::NotReadyEvery(n) if n > 0 && self.attempts % n == 0 => {
                Some(PollError::transient("frame not ready"))
            }
            ErrorScenario::FailAfter(n) if self.frames >= n => Some(PollError::fatal(format!(
                "camera failed after {} frames",
                n
            ))),
            ErrorScenario::Disconnect => Some(PollError::fatal("camera disconnected")),
            _ => None,
        })
    }
}

#[async_trait]
impl PollSource for MockFrameSource {
    type Sample = Frame;

    async fn poll_once(&mut self) -> Result<Frame, PollError> {
        self.attempts += 1;
        if let Some(err) = self.injected_failure() {
            return Err(err);
        }

        let settings = *self.settings.lock();
        tokio::time::sleep(Duration::from_secs_f64(settings.exposure_ms / 1000.0)).await;

        let pixels = generate_pattern(settings.width, settings.height, self.frames, &self.rng);
        let frame = Frame::from_pixels(
            self.frames,
            settings.width,
            settings.height,
            settings.exposure_ms,
            &pixels,
        );
        self.frames += 1;
        Ok(frame)
    }
}

/// Fans frames out to frame subscribers and reading subscribers.
struct FrameSink {
    frames: broadcast::Sender<PollEvent<Frame>>,
    readings: broadcast::Sender<PollEvent<Reading>>,
    delivered: Arc<AtomicU64>,
}

#[async_trait]
impl SampleSink<Frame> for FrameSink {
    async fn deliver(&self, event: PollEvent<Frame>) {
        if let PollEvent::Sample(_) = &event {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
        let _ = self.readings.send(event.clone().map(|frame| frame.reading()));
        let _ = self.frames.send(event);
    }
}

// =============================================================================
// MockCamera
// =============================================================================

pub struct MockCamera {
    name: String,
    settings: Arc<Mutex<CameraSettings>>,
    scenarios: Arc<Mutex<Vec<ErrorScenario>>>,
    poller: Poller<MockFrameSource>,
    frames: broadcast::Sender<PollEvent<Frame>>,
    readings: broadcast::Sender<PollEvent<Reading>>,
    delivered: Arc<AtomicU64>,
}

impl MockCamera {
    pub fn new(name: impl Into<String>, cfg: &MockCameraConfig) -> Self {
        Self::with_settings(name, cfg, PollerSettings::default())
    }

    pub fn with_settings(
        name: impl Into<String>,
        cfg: &MockCameraConfig,
        poller_settings: PollerSettings,
    ) -> Self {
        let name = name.into();
        let settings = Arc::new(Mutex::new(CameraSettings {
            width: cfg.width,
            height: cfg.height,
            exposure_ms: cfg.exposure_ms,
        }));
        let scenarios = Arc::new(Mutex::new(cfg.scenarios()));
        let (frames, _) = broadcast::channel(EVENT_CAPACITY);
        let (readings, _) = broadcast::channel(EVENT_CAPACITY);
        let delivered = Arc::new(AtomicU64::new(0));

        let source = MockFrameSource {
            settings: settings.clone(),
            scenarios: scenarios.clone(),
            rng: MockRng::new(cfg.seed),
            attempts: 0,
            frames: 0,
        };
        let sink = FrameSink {
            frames: frames.clone(),
            readings: readings.clone(),
            delivered: delivered.clone(),
        };
        let poller = Poller::named(format!("{name}-frames"), source, sink, poller_settings);

        Self {
            name,
            settings,
            scenarios,
            poller,
            frames,
            readings,
            delivered,
        }
    }

    /// Add a failure scenario; it applies from the next cycle on.
    pub fn inject(&self, scenario: ErrorScenario) {
        debug!(device = %self.name, ?scenario, "error scenario injected");
        self.scenarios.lock().push(scenario);
    }

    pub fn clear_scenarios(&self) {
        self.scenarios.lock().clear();
    }

    pub fn subscribe_frames(&self) -> broadcast::Receiver<PollEvent<Frame>> {
        self.frames.subscribe()
    }

    /// Acquire a single frame outside any running session.
    pub async fn snap(&self) -> Result<Frame> {
        let sample = self.poller.poll_once().await.map_err(|e| {
            DriverError::new(DRIVER, DriverErrorKind::Hardware, e.to_string())
        })?;
        Ok(sample.value)
    }

    pub fn frames_delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    fn refuse_while_running(&self, option: &str) -> Result<()> {
        if self.poller.is_running() {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::Permission,
                format!("'{}' cannot change during acquisition", option),
            )
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl Device for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn options(&self) -> Vec<OptionSpec> {
        let max = MAX_DIMENSION as f64;
        vec![
            OptionSpec::new("Width", OptionKind::Int).limits(1.0, max),
            OptionSpec::new("Height", OptionKind::Int).limits(1.0, max),
            OptionSpec::new("Exposure", OptionKind::Float).limits(0.01, 10_000.0),
            OptionSpec::new("FramesDelivered", OptionKind::Int).read_only(),
        ]
    }

    async fn open(&self) -> Result<()> {
        let settings = *self.settings.lock();
        info!(
            device = %self.name,
            width = settings.width,
            height = settings.height,
            "mock camera ready"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.poller.stop();
        self.poller.wait_idle().await;
        Ok(())
    }

    async fn get_option(&self, name: &str) -> Result<OptionValue> {
        let specs = self.options();
        let spec = OptionSpec::lookup(&specs, name, DRIVER)?;
        let settings = *self.settings.lock();
        Ok(match spec.name {
            "Width" => OptionValue::Int(settings.width as i64),
            "Height" => OptionValue::Int(settings.height as i64),
            "Exposure" => OptionValue::Float(settings.exposure_ms),
            _ => OptionValue::Int(self.frames_delivered() as i64),
        })
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        let specs = self.options();
        let value = OptionSpec::lookup(&specs, name, DRIVER)?.check(value, DRIVER)?;

        match name {
            "Width" | "Height" => {
                self.refuse_while_running(name)?;
                let pixels = value.as_i64().unwrap_or_default() as u32;
                let mut settings = self.settings.lock();
                if name == "Width" {
                    settings.width = pixels;
                } else {
                    settings.height = pixels;
                }
            }
            _ => self.settings.lock().exposure_ms = value.as_f64().unwrap_or_default(),
        }
        Ok(())
    }

    async fn busy(&self) -> Result<bool> {
        Ok(self.poller.is_running())
    }

    fn acquisition(&self) -> Option<&dyn Acquisition> {
        Some(self)
    }
}

#[async_trait]
impl Acquisition for MockCamera {
    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn start(&self, count: SampleCount, interval: Duration) -> Result<()> {
        self.poller.start(count, interval)?;
        Ok(())
    }

    fn stop(&self) {
        self.poller.stop();
    }

    fn is_running(&self) -> bool {
        self.poller.is_running()
    }

    async fn wait_idle(&self) {
        self.poller.wait_idle().await;
    }

    fn subscribe(&self) -> broadcast::Receiver<PollEvent<Reading>> {
        self.readings.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg: MockCameraConfig = toml::from_str("").unwrap();
        assert_eq!((cfg.width, cfg.height), (64, 64));
        assert_eq!(cfg.exposure_ms, 10.0);
        assert!(cfg.scenarios().is_empty());
    }

    #[test]
    fn test_factory_validation() {
        let factory = MockCameraFactory;
        let ok: toml::Value = toml::from_str("width = 32\nnot_ready_every = 3").unwrap();
        assert!(factory.validate(&ok).is_ok());

        let wide: toml::Value = toml::from_str("width = 5000").unwrap();
        assert!(factory.validate(&wide).is_err());

        let every_zero: toml::Value = toml::from_str("not_ready_every = 0").unwrap();
        assert!(factory.validate(&every_zero).is_err());
    }

    #[test]
    fn test_frame_pixel_access() {
        let frame = Frame::from_pixels(0, 2, 2, 1.0, &[1, 2, 3, 500]);
        assert_eq!(frame.pixel(1, 1), Some(500));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.mean(), 126.5);
        assert_eq!(frame.reading().get("Max"), Some(&OptionValue::Int(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_every_skips_attempts() {
        let cfg = MockCameraConfig {
            width: 4,
            height: 4,
            not_ready_every: Some(2),
            seed: Some(1),
            ..Default::default()
        };
        let camera = MockCamera::new("cam", &cfg);

        assert!(camera.snap().await.is_ok());
        assert!(camera.snap().await.is_err());
        assert_eq!(camera.snap().await.unwrap().frame_number, 1);
    }
}
