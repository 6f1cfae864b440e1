//! ASI MS2000 / Tiger stage driver.
//!
//! Reference: ASI MS-2000 and TG-1000 Programming Manuals
//!
//! Protocol Overview:
//! - Format: ASCII command/response over RS-232
//! - Baud: 9600, 8N1, no flow control
//! - Commands end in CR; replies are `:A ...` (accepted) or `:N-<code>`
//! - Positions are in controller units (tenths of a micron by default)
//!
//! | Command        | Reply          | Meaning                         |
//! |----------------|----------------|---------------------------------|
//! | `M X=10 Y=-2`  | `:A`           | absolute move                   |
//! | `W X Y`        | `:A 10 -2`     | where                           |
//! | `/`            | `B` / `N`      | busy / not busy                 |
//! | `\`            | `:A`           | halt                            |
//! | `JS X? Y?`     | `:A X=50 Y=5`  | joystick fast / slow speed      |
//!
//! The controller mirrors the joystick by negating both speeds. This driver
//! keeps speeds as magnitudes and carries the mirror flag separately; the sign
//! only exists on the wire.
//!
//! # Usage
//!
//! ```rust,ignore
//! use mm_driver_asi::AsiStageFactory;
//!
//! registry.register_factory(Box::new(AsiStageFactory));
//!
//! // microscope.toml
//! // [[devices]]
//! // name = "XYStage"
//! // driver = "asi_stage"
//! // params = { port = "/dev/ttyUSB0", axes = "xy" }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use mm_core::device::{
    Capability, Device, DeviceComponents, DeviceContext, DriverFactory, OptionKind, OptionSpec,
    OptionValue,
};
use mm_core::error::{DriverError, DriverErrorKind, TransactError};
use mm_core::retry::{retry_busy, RetryPolicy};
use mm_core::serial::SerialChannel;
use mm_core::transactor::{Command, EchoMatch, ReplyMatch, Transactor};
use mm_core::Response;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

const DRIVER: &str = "asi_stage";

const YES: &str = "Yes";
const NO: &str = "No";

// =============================================================================
// AsiStageFactory - DriverFactory implementation
// =============================================================================

/// Which axes one driver instance controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisSet {
    Xy,
    Z,
}

impl AxisSet {
    pub fn letters(&self) -> &'static [char] {
        match self {
            AxisSet::Xy => &['X', 'Y'],
            AxisSet::Z => &['Z'],
        }
    }
}

/// Configuration for the ASI stage driver
#[derive(Debug, Clone, Deserialize)]
pub struct AsiStageConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0")
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_axes")]
    pub axes: AxisSet,
    /// Microns per controller unit.
    #[serde(default = "default_step_size")]
    pub step_size_um: f64,
    /// Overrides `[transactor] timeout_ms` for this stage.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Tiger card address, prefixed to card-level (`JS`) commands.
    #[serde(default)]
    pub card_address: Option<String>,
}

fn default_baud() -> u32 {
    9600
}

fn default_axes() -> AxisSet {
    AxisSet::Xy
}

fn default_step_size() -> f64 {
    0.1
}

impl AsiStageConfig {
    /// Config for a stage on `port` with every other field at its default.
    pub fn new(port: impl Into<String>, axes: AxisSet) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            axes,
            step_size_um: default_step_size(),
            timeout_ms: None,
            card_address: None,
        }
    }

    fn check(&self) -> std::result::Result<(), DriverError> {
        if !(self.step_size_um.is_finite() && self.step_size_um > 0.0) {
            return Err(config_error(format!(
                "step_size_um must be positive, got {}",
                self.step_size_um
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(config_error("timeout_ms must be positive"));
        }
        if let Some(address) = &self.card_address {
            if address.is_empty() || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(config_error(format!(
                    "card_address must be alphanumeric, got '{}'",
                    address
                )));
            }
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> DriverError {
    DriverError::new(DRIVER, DriverErrorKind::Configuration, message)
}

/// Factory for creating ASI stage driver instances.
pub struct AsiStageFactory;

static ASI_CAPABILITIES: &[Capability] = &[Capability::Stage];

impl DriverFactory for AsiStageFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn name(&self) -> &'static str {
        "ASI MS2000/Tiger Stage"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ASI_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: AsiStageConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(
        &self,
        ctx: DeviceContext,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AsiStageConfig = config.try_into().context("Invalid ASI stage config")?;
            cfg.check()?;

            let channel = SerialChannel::open(&cfg.port, cfg.baud, "ASI stage").await?;
            let transactor = Transactor::with_settings(channel, ctx.transactor.clone());
            let stage = AsiStage::new(ctx.name, transactor, &cfg);

            Ok(DeviceComponents::new(Arc::new(stage)))
        })
    }
}

// =============================================================================
// Joystick
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoystickPolarity {
    Normal,
    Mirrored,
}

impl JoystickPolarity {
    /// Polarity encoded by the signs of the two speeds on the wire.
    ///
    /// A zero speed carries no sign. Non-zero speeds with opposite signs are
    /// an inconsistent controller state and are reported, not guessed.
    pub fn from_wire(fast: f64, slow: f64) -> std::result::Result<Self, DriverError> {
        let negative = [fast, slow].iter().filter(|v| **v < 0.0).count();
        let positive = [fast, slow].iter().filter(|v| **v > 0.0).count();
        match (negative, positive) {
            (0, _) => Ok(JoystickPolarity::Normal),
            (_, 0) => Ok(JoystickPolarity::Mirrored),
            _ => Err(DriverError::new(
                DRIVER,
                DriverErrorKind::Hardware,
                format!(
                    "inconsistent joystick polarity: fast speed {} but slow speed {}",
                    fast, slow
                ),
            )),
        }
    }

    fn sign(self) -> &'static str {
        match self {
            JoystickPolarity::Normal => "",
            JoystickPolarity::Mirrored => "-",
        }
    }

    fn label(self) -> &'static str {
        match self {
            JoystickPolarity::Normal => NO,
            JoystickPolarity::Mirrored => YES,
        }
    }
}

/// Joystick speeds as non-negative magnitudes plus the mirror flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Joystick {
    pub fast: f64,
    pub slow: f64,
    pub polarity: JoystickPolarity,
}

impl Joystick {
    fn command(&self, card_prefix: &str) -> String {
        let sign = self.polarity.sign();
        format!(
            "{}JS X={}{} Y={}{}",
            card_prefix, sign, self.fast, sign, self.slow
        )
    }
}

impl fmt::Display for Joystick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fast={} slow={} mirrored={}",
            self.fast,
            self.slow,
            self.polarity.label()
        )
    }
}

// =============================================================================
// AsiStage
// =============================================================================

/// Driver for ASI MS2000 and Tiger stages.
///
/// One instance drives either the XY pair or a single Z axis.
pub struct AsiStage {
    name: String,
    transactor: Transactor,
    axes: AxisSet,
    step_size_um: f64,
    timeout: Duration,
    card_prefix: String,
    retry: RetryPolicy,
    /// Last acknowledged position per axis, in microns.
    positions: Mutex<Vec<f64>>,
}

impl AsiStage {
    /// Wrap an open transactor. Used by the factory and by tests.
    pub fn new(name: impl Into<String>, transactor: Transactor, cfg: &AsiStageConfig) -> Self {
        let timeout = cfg
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| transactor.default_timeout());
        Self {
            name: name.into(),
            transactor,
            axes: cfg.axes,
            step_size_um: cfg.step_size_um,
            timeout,
            card_prefix: cfg.card_address.clone().unwrap_or_default(),
            retry: RetryPolicy::default(),
            positions: Mutex::new(vec![0.0; cfg.axes.letters().len()]),
        }
    }

    pub fn axes(&self) -> AxisSet {
        self.axes
    }

    /// Position as of the last acknowledged move or position query.
    pub fn cached_position(&self) -> Vec<f64> {
        self.positions.lock().clone()
    }

    /// Absolute move of every axis, in microns.
    #[instrument(skip(self), fields(stage = %self.name), err)]
    pub async fn move_to(&self, target_um: &[f64]) -> Result<()> {
        let letters = self.axes.letters();
        if target_um.len() != letters.len() {
            return Err(DriverError::invalid_parameter(
                DRIVER,
                format!(
                    "expected {} coordinates, got {}",
                    letters.len(),
                    target_um.len()
                ),
            )
            .into());
        }
        let moves: Vec<(usize, f64)> = target_um.iter().copied().enumerate().collect();
        self.move_axes(&moves).await
    }

    /// Current position in microns, read from the controller.
    #[instrument(skip(self), fields(stage = %self.name), err)]
    pub async fn position(&self) -> Result<Vec<f64>> {
        let letters = self.axes.letters();
        let mut command = Command::text("W");
        for letter in letters {
            command = command.arg(format!(" {}", letter));
        }

        let reply = self.query(command).await?;
        let fields = reply.fields_after(":A").map_err(fail)?;
        if fields.len() < letters.len() {
            return Err(fail(TransactError::Protocol {
                expected: format!("{} positions", letters.len()),
                received: reply.text().into_owned(),
            }));
        }

        let mut position = Vec::with_capacity(letters.len());
        for field in &fields[..letters.len()] {
            position.push(field.to_f64().map_err(fail)? * self.step_size_um);
        }
        *self.positions.lock() = position.clone();
        Ok(position)
    }

    /// Whether any motor is moving.
    #[instrument(skip(self), fields(stage = %self.name), err)]
    pub async fn is_busy(&self) -> Result<bool> {
        let reply = self.exchange("/").await?;
        match reply.payload().first() {
            Some(b'B') => Ok(true),
            Some(b'N') => Ok(false),
            _ => Err(fail(TransactError::Protocol {
                expected: "\"B\" or \"N\"".into(),
                received: reply.text().into_owned(),
            })),
        }
    }

    /// Stop all motion.
    #[instrument(skip(self), fields(stage = %self.name), err)]
    pub async fn halt(&self) -> Result<()> {
        self.query("\\").await?;
        Ok(())
    }

    #[instrument(skip(self), fields(stage = %self.name), err)]
    pub async fn joystick(&self) -> Result<Joystick> {
        self.require_joystick()?;
        let command = format!("{}JS X? Y?", self.card_prefix);
        let reply = retry_busy(&self.retry, || {
            self.transactor.execute(
                command.as_str(),
                EchoMatch::prefix(":A", "\r"),
                self.timeout,
            )
        })
        .await
        .map_err(fail)?;

        let fast = reply.parse_after("X=").and_then(|v| v.to_f64()).map_err(fail)?;
        let slow = reply.parse_after("Y=").and_then(|v| v.to_f64()).map_err(fail)?;
        let polarity = JoystickPolarity::from_wire(fast, slow)?;

        Ok(Joystick {
            fast: fast.abs(),
            slow: slow.abs(),
            polarity,
        })
    }

    #[instrument(skip(self, joystick), fields(stage = %self.name, joystick = %joystick), err)]
    pub async fn set_joystick(&self, joystick: Joystick) -> Result<()> {
        self.require_joystick()?;
        for speed in [joystick.fast, joystick.slow] {
            if !(speed.is_finite() && speed >= 0.0) {
                return Err(DriverError::invalid_parameter(
                    DRIVER,
                    format!("joystick speed must be a non-negative magnitude, got {}", speed),
                )
                .into());
            }
        }
        self.query(joystick.command(&self.card_prefix)).await?;
        Ok(())
    }

    async fn move_axes(&self, moves: &[(usize, f64)]) -> Result<()> {
        let letters = self.axes.letters();
        let mut command = Command::text("M");
        let mut targets = Vec::with_capacity(moves.len());
        for &(axis, um) in moves {
            if !um.is_finite() {
                return Err(
                    DriverError::invalid_parameter(DRIVER, format!("invalid target {}", um)).into(),
                );
            }
            let steps = (um / self.step_size_um).round() as i64;
            command = command.arg(format!(" {}={}", letters[axis], steps));
            targets.push((axis, steps as f64 * self.step_size_um));
        }

        self.query(command).await?;

        let mut positions = self.positions.lock();
        for (axis, um) in targets {
            positions[axis] = um;
        }
        debug!(position = ?*positions, "move acknowledged");
        Ok(())
    }

    fn require_joystick(&self) -> Result<()> {
        if self.axes != AxisSet::Xy {
            return Err(DriverError::invalid_parameter(
                DRIVER,
                "joystick settings belong to the XY stage",
            )
            .into());
        }
        Ok(())
    }

    fn axis_index(&self, option: &str) -> Option<usize> {
        let letter = option.strip_prefix("Position")?.chars().next()?;
        self.axes.letters().iter().position(|l| *l == letter)
    }

    /// Exchange one CR-terminated line, retrying while the channel is busy.
    async fn exchange(&self, command: impl Into<Command>) -> Result<Response> {
        let command = command.into();
        retry_busy(&self.retry, || {
            self.transactor
                .execute(command.clone(), ReplyMatch::cr(), self.timeout)
        })
        .await
        .map_err(fail)
    }

    /// Exchange that must be acknowledged with `:A`.
    async fn query(&self, command: impl Into<Command>) -> Result<Response> {
        self.exchange(command).await?.into_ack().map_err(fail)
    }
}

fn fail(err: impl Into<TransactError>) -> anyhow::Error {
    DriverError::from_transact(DRIVER, &err.into()).into()
}

#[async_trait]
impl Device for AsiStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn options(&self) -> Vec<OptionSpec> {
        let mut specs: Vec<OptionSpec> = self
            .axes
            .letters()
            .iter()
            .map(|letter| match letter {
                'X' => OptionSpec::new("PositionX", OptionKind::Float),
                'Y' => OptionSpec::new("PositionY", OptionKind::Float),
                _ => OptionSpec::new("PositionZ", OptionKind::Float),
            })
            .collect();
        specs.push(OptionSpec::new("StepSizeUm", OptionKind::Float).read_only());
        if self.axes == AxisSet::Xy {
            specs.push(OptionSpec::new("JoystickFastSpeed", OptionKind::Float).limits(0.0, 100.0));
            specs.push(OptionSpec::new("JoystickSlowSpeed", OptionKind::Float).limits(0.0, 100.0));
            specs.push(OptionSpec::new("JoystickMirror", OptionKind::Text).allowed([NO, YES]));
        }
        specs
    }

    #[instrument(skip(self), fields(stage = %self.name), err)]
    async fn open(&self) -> Result<()> {
        let busy = self
            .is_busy()
            .await
            .context("ASI stage did not answer the status query")?;
        let position = self.position().await?;
        info!(stage = %self.name, busy, ?position, "ASI stage ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!(stage = %self.name, "ASI stage released");
        Ok(())
    }

    async fn get_option(&self, name: &str) -> Result<OptionValue> {
        let specs = self.options();
        let spec = OptionSpec::lookup(&specs, name, DRIVER)?;
        if let Some(axis) = self.axis_index(spec.name) {
            return Ok(OptionValue::Float(self.position().await?[axis]));
        }
        match spec.name {
            "StepSizeUm" => Ok(OptionValue::Float(self.step_size_um)),
            "JoystickFastSpeed" => Ok(OptionValue::Float(self.joystick().await?.fast)),
            "JoystickSlowSpeed" => Ok(OptionValue::Float(self.joystick().await?.slow)),
            "JoystickMirror" => Ok(self.joystick().await?.polarity.label().into()),
            other => Err(DriverError::invalid_parameter(DRIVER, format!("unknown option '{}'", other)).into()),
        }
    }

    async fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        let specs = self.options();
        let spec = OptionSpec::lookup(&specs, name, DRIVER)?;
        let value = spec.check(value, DRIVER)?;

        if let Some(axis) = self.axis_index(spec.name) {
            let um = value.as_f64().unwrap_or_default();
            return self.move_axes(&[(axis, um)]).await;
        }

        let mut joystick = self.joystick().await?;
        match spec.name {
            "JoystickFastSpeed" => joystick.fast = value.as_f64().unwrap_or_default(),
            "JoystickSlowSpeed" => joystick.slow = value.as_f64().unwrap_or_default(),
            "JoystickMirror" => {
                joystick.polarity = if value.as_str() == Some(YES) {
                    JoystickPolarity::Mirrored
                } else {
                    JoystickPolarity::Normal
                }
            }
            other => {
                return Err(DriverError::invalid_parameter(
                    DRIVER,
                    format!("option '{}' cannot be written", other),
                )
                .into())
            }
        }
        self.set_joystick(joystick).await
    }

    async fn busy(&self) -> Result<bool> {
        self.is_busy().await
    }
}
