//! pgFocus focus-lock driver.
//!
//! The board streams CR-terminated lines on its own (see [`crate::message`]);
//! host commands are written without waiting for a reply. A monitor
//! [`Poller`] owns reading: it holds the channel while it waits for a line,
//! so host writes go through `write_queued` and are slotted in between reads
//! without disturbing lines the monitor has yet to consume.
//! The monitor read timeout is kept below the host write timeout so a queued
//! write always gets its turn.

use crate::message::FocusMessage;
use crate::state::{FocusMode, FocusState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use mm_core::device::{
    Acquisition, Capability, Device, DeviceComponents, DeviceContext, DriverFactory, OptionKind,
    OptionSpec, OptionValue, Reading,
};
use mm_core::error::{DriverError, DriverErrorKind, PollError, TransactError};
use mm_core::poller::{
    PollEvent, PollSource, PollState, Poller, PollerSettings, Sample, SampleCount, SampleSink,
};
use mm_core::serial::SerialChannel;
use mm_core::transactor::{ReplyMatch, Transactor};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

const DRIVER: &str = "pgfocus";

const READING_CAPACITY: usize = 256;

// =============================================================================
// Configuration & Factory
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PgFocusConfig {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Host write timeout, including time queued behind the monitor.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Monitor read timeout, and the pause before re-requesting stats.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Offsets kept for the standard deviation.
    #[serde(default = "default_offset_window")]
    pub offset_window: usize,
}

fn default_baud() -> u32 {
    57600
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_monitor_interval_ms() -> u64 {
    500
}

fn default_offset_window() -> usize {
    10
}

impl PgFocusConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            timeout_ms: default_timeout_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            offset_window: default_offset_window(),
        }
    }

    fn check(&self) -> std::result::Result<(), DriverError> {
        let bad = |message: String| {
            Err(DriverError::new(
                DRIVER,
                DriverErrorKind::Configuration,
                message,
            ))
        };
        if self.monitor_interval_ms == 0 {
            return bad("monitor_interval_ms must be positive".into());
        }
        if self.timeout_ms <= self.monitor_interval_ms {
            return bad(format!(
                "timeout_ms ({}) must exceed monitor_interval_ms ({})",
                self.timeout_ms, self.monitor_interval_ms
            ));
        }
        if self.offset_window < 2 {
            return bad("offset_window must hold at least 2 offsets".into());
        }
        Ok(())
    }
}

pub struct PgFocusFactory;

static PGFOCUS_CAPABILITIES: &[Capability] = &[Capability::AutoFocus, Capability::Acquisition];

impl DriverFactory for PgFocusFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn name(&self) -> &'static str {
        "pgFocus Focus Lock"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PGFOCUS_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: PgFocusConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(
        &self,
        ctx: DeviceContext,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: PgFocusConfig = config.try_into().context("Invalid pgFocus config")?;
            cfg.check()?;

            let channel = SerialChannel::open(&cfg.port, cfg.baud, "pgFocus").await?;
            let transactor = Transactor::with_settings(channel, ctx.transactor.clone());
            let settings = PollerSettings {
                backoff: Duration::from_millis(cfg.monitor_interval_ms),
                ..ctx.poller
            };

            Ok(DeviceComponents::new(Arc::new(PgFocus::with_poller_settings(
                ctx.name, transactor, &cfg, settings,
            ))))
        })
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Reads one streamed line per cycle.
///
/// After a cycle that saw nothing the next one first asks for stats with `v`.
pub struct LineSource {
    transactor: Transactor,
    read_timeout: Duration,
    stalled: bool,
}

#[async_trait]
impl PollSource for LineSource {
    type Sample = FocusMessage;

    async fn poll_once(&mut self) -> Result<FocusMessage, PollError> {
        if self.stalled {
            self.transactor.write_queued("v", self.read_timeout).await?;
            self.stalled = false;
        }
        let line = match self
            .transactor
            .read_reply(ReplyMatch::cr(), self.read_timeout)
            .await
        {
            Ok(line) => line,
            Err(err @ TransactError::Timeout { .. }) => {
                self.stalled = true;
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        FocusMessage::parse(&line.text()).map_err(PollError::transient)
    }
}

/// Applies monitor messages to the shared state and republishes stats.
struct FocusSink {
    device: String,
    state: Arc<Mutex<FocusState>>,
    readings: broadcast::Sender<PollEvent<Reading>>,
}

#[async_trait]
impl SampleSink<FocusMessage> for FocusSink {
    async fn deliver(&self, event: PollEvent<FocusMessage>) {
        match event {
            PollEvent::Sample(sample) => {
                match &sample.value {
                    FocusMessage::Version(version) => {
                        info!(device = %self.device, version = %version, "pgFocus firmware");
                    }
                    FocusMessage::Error(text) => {
                        warn!(device = %self.device, error = %text, "pgFocus reported an error");
                    }
                    FocusMessage::Unrecognized(line) => {
                        debug!(device = %self.device, line = %line, "unrecognized pgFocus line");
                    }
                    _ => {}
                }
                let reading = self.state.lock().apply(&sample.value);
                if let Some(reading) = reading {
                    let _ = self.readings.send(PollEvent::Sample(Sample {
                        seq: sample.seq,
                        acquired_at: sample.acquired_at,
                        value: reading,
                    }));
                }
            }
            PollEvent::Failed(err) => {
                warn!(device = %self.device, error = %err, "pgFocus monitor stopped");
                let _ = self.readings.send(PollEvent::Failed(err));
            }
        }
    }
}

// =============================================================================
// PgFocus
// =============================================================================

/// What the host asks the focus lock to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusRequest {
    Lock,
    Unlock,
    Calibrate,
    LightProfile,
}

impl FocusRequest {
    pub fn label(&self) -> &'static str {
        match self {
            FocusRequest::Lock => "Lock",
            FocusRequest::Unlock => "Unlock",
            FocusRequest::Calibrate => "Calibrate",
            FocusRequest::LightProfile => "Light Profile",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        [
            FocusRequest::Lock,
            FocusRequest::Unlock,
            FocusRequest::Calibrate,
            FocusRequest::LightProfile,
        ]
        .into_iter()
        .find(|r| r.label() == label)
    }
}

pub struct PgFocus {
    name: String,
    transactor: Transactor,
    timeout: Duration,
    state: Arc<Mutex<FocusState>>,
    monitor: Poller<LineSource>,
    readings: broadcast::Sender<PollEvent<Reading>>,
}

impl PgFocus {
    pub fn new(name: impl Into<String>, transactor: Transactor, cfg: &PgFocusConfig) -> Self {
        let settings = PollerSettings {
            backoff: Duration::from_millis(cfg.monitor_interval_ms),
            ..PollerSettings::default()
        };
        Self::with_poller_settings(name, transactor, cfg, settings)
    }

    fn with_poller_settings(
        name: impl Into<String>,
        transactor: Transactor,
        cfg: &PgFocusConfig,
        settings: PollerSettings,
    ) -> Self {
        let name = name.into();
        let state = Arc::new(Mutex::new(FocusState::new(cfg.offset_window)));
        let (readings, _) = broadcast::channel(READING_CAPACITY);

        let source = LineSource {
            transactor: transactor.clone(),
            read_timeout: Duration::from_millis(cfg.monitor_interval_ms),
            stalled: false,
        };
        let sink = FocusSink {
            device: name.clone(),
            state: state.clone(),
            readings: readings.clone(),
        };
        let monitor = Poller::named(format!("{name}-monitor"), source, sink, settings);

        Self {
            name,
            transactor,
            timeout: Duration::from_millis(cfg.timeout_ms),
            state,
            monitor,
            readings,
        }
    }

    pub fn mode(&self) -> FocusMode {
        self.state.lock().mode
    }

    /// Snapshot of everything read from the board so far.
    pub fn snapshot(&self) -> FocusState {
        self.state.lock().clone()
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn set_focus(&self, request: FocusRequest) -> Result<()> {
        match request {
            FocusRequest::Lock => self.send("f").await?,
            FocusRequest::Unlock => self.send("s").await?,
            FocusRequest::Calibrate => {
                self.send("s").await?;
                self.send("c").await?;
            }
            FocusRequest::LightProfile => {
                self.send("s").await?;
                self.send("l").await?;
            }
        }

        let mut state = self.state.lock();
        state.continuous = request == FocusRequest::Lock;
        state.mode = match request {
            FocusRequest::Lock => FocusMode::Locked,
            FocusRequest::Unlock => FocusMode::Unlocked,
            FocusRequest::Calibrate => {
                state.calibration.clear();
                FocusMode::Calibrating
            }
            FocusRequest::LightProfile => FocusMode::LightProfile,
        };
        debug!(mode = %state.mode, "focus mode requested");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn set_auto_exposure(&self, enabled: bool) -> Result<()> {
        self.send(if enabled { "E" } else { "e" }).await?;
        self.state.lock().auto_exposure = enabled;
        Ok(())
    }

    /// Ask the board to report its calibration and exposure settings.
    ///
    /// The answers arrive through the monitor.
    pub async fn refresh(&self) -> Result<()> {
        for query in ["slope", "intercept", "gain", "exposure"] {
            self.send(query).await?;
        }
        Ok(())
    }

    async fn send(&self, command: &str) -> Result<()> {
        self.transactor
            .write_queued(command, self.timeout)
            .await
            .map_err(|e| DriverError::from_transact(DRIVER, &e).into())
    }
}

#[async_trait]
impl Device for PgFocus {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn options(&self) -> Vec<OptionSpec> {
        let read_only = |name: &'static str, kind: OptionKind| OptionSpec::new(name, kind).read_only();
        vec![
            OptionSpec::new("Focus", OptionKind::Text).allowed([
                FocusRequest::Lock.label(),
                FocusRequest::Unlock.label(),
                FocusRequest::Calibrate.label(),
                FocusRequest::LightProfile.label(),
            ]),
            OptionSpec::new("AutoExposure", OptionKind::Bool),
            read_only("Offset", OptionKind::Float),
            read_only("StdDev", OptionKind::Float),
            read_only("Slope", OptionKind::Float),
            read_only("Intercept", OptionKind::Float),
            read_only("Gain", OptionKind::Float),
            read_only("Residuals", OptionKind::Float),
            read_only("MicronsPerVolt", OptionKind::Float),
            read_only("Exposure", OptionKind::Int),
            read_only("Version", OptionKind::Text),
            read_only("Mode", OptionKind::Text),
            read_only("LastError", OptionKind::Text),
        ]
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn open(&self) -> Result<()> {
        // Written before the monitor takes the channel.
        for command in ["s", "v", "version"] {
            self.send(command)
                .await
                .with_context(|| format!("pgFocus did not accept '{}'", command))?;
        }
        self.monitor
            .start(SampleCount::Unbounded, Duration::ZERO)
            .context("pgFocus monitor already running")?;
        info!(device = %self.name, "pgFocus monitor started");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.monitor.stop();
        self.monitor.wait_idle().await;
        debug!(device = %self.name, "pgFocus monitor stopped");
        Ok(())
    }

    async fn get_option(&self, name: &str) -> Result<OptionValue> {
        let specs = self.options();
        let spec = OptionSpec::lookup(&specs, name, DRIVER)?;
        let state = self.state.lock();
        let number = |v: Option<f64>| OptionValue::Float(v.unwrap_or_default());
        let text = |v: &Option<String>| OptionValue::Text(v.clone().unwrap_or_default());

        Ok(match spec.name {
            "Focus" => OptionValue::from(match state.mode {
                FocusMode::Locked => FocusRequest::Lock.label(),
                FocusMode::Unlocked => FocusRequest::Unlock.label(),
                FocusMode::Calibrating => FocusRequest::Calibrate.label(),
                FocusMode::LightProfile => FocusRequest::LightProfile.label(),
            }),
            "AutoExposure" => OptionValue::Bool(state.auto_exposure),
            "Offset" => number(state.stats.as_ref().map(|s| s.offset)),
            "StdDev" => number(state.std_dev()),
            "Slope" => number(state.slope),
            "Intercept" => number(state.intercept),
            "Gain" => number(state.gain),
            "Residuals" => number(state.residuals),
            "MicronsPerVolt" => number(state.microns_per_volt),
            "Exposure" => OptionValue::Int(state.stats.as_ref().map_or(0, |s| s.exposure)),
            "Version" => text(&state.version),
            "Mode" => OptionValue::from(state.mode.label()),
            _ => text(&state.last_error),
        })
    }

    async fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        let specs = self.options();
        let value = OptionSpec::lookup(&specs, name, DRIVER)?.check(value, DRIVER)?;

        match name {
            "Focus" => {
                let request = value
                    .as_str()
                    .and_then(FocusRequest::from_label)
                    .ok_or_else(|| DriverError::invalid_parameter(DRIVER, "unknown focus request"))?;
                self.set_focus(request).await
            }
            _ => self.set_auto_exposure(value.as_bool().unwrap_or_default()).await,
        }
    }

    async fn busy(&self) -> Result<bool> {
        Ok(self.mode() == FocusMode::Calibrating)
    }

    fn acquisition(&self) -> Option<&dyn Acquisition> {
        Some(self)
    }
}

/// The monitor session doubles as the acquisition: restarting it with a
/// count delivers that many monitor lines, stats lines among them.
#[async_trait]
impl Acquisition for PgFocus {
    async fn start(&self, count: SampleCount, interval: Duration) -> Result<()> {
        if self.monitor.state() != PollState::Idle {
            self.monitor.stop();
            self.monitor.wait_idle().await;
        }
        self.monitor.start(count, interval)?;
        Ok(())
    }

    fn stop(&self) {
        self.monitor.stop();
    }

    fn is_running(&self) -> bool {
        self.monitor.is_running()
    }

    async fn wait_idle(&self) {
        self.monitor.wait_idle().await;
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
        let cfg: PgFocusConfig = toml::from_str(r#"port = "/dev/ttyACM0""#).unwrap();
        assert_eq!(cfg.baud, 57600);
        assert_eq!(cfg.timeout_ms, 1000);
        assert_eq!(cfg.monitor_interval_ms, 500);
        assert_eq!(cfg.offset_window, 10);
    }

    #[test]
    fn test_monitor_must_yield_to_host_writes() {
        let factory = PgFocusFactory;
        let slow: toml::Value = toml::from_str(
            "port = \"/dev/ttyACM0\"\ntimeout_ms = 500\nmonitor_interval_ms = 500",
        )
        .unwrap();
        assert!(factory.validate(&slow).is_err());

        let ok: toml::Value = toml::from_str(r#"port = "/dev/ttyACM0""#).unwrap();
        assert!(factory.validate(&ok).is_ok());
    }

    #[test]
    fn test_focus_request_labels() {
        assert_eq!(FocusRequest::from_label("Lock"), Some(FocusRequest::Lock));
        assert_eq!(
            FocusRequest::from_label("Light Profile"),
            Some(FocusRequest::LightProfile)
        );
        assert_eq!(FocusRequest::from_label("lock"), None);
    }

    #[test]
    fn test_factory_capabilities() {
        let factory = PgFocusFactory;
        assert_eq!(factory.driver_type(), "pgfocus");
        assert!(factory.capabilities().contains(&Capability::Acquisition));
    }
}
