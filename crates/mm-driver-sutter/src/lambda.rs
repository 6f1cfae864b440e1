//! Sutter Lambda 10-2 / 10-3 / SmartShutter controller driver.
//!
//! Reference: Lambda 10-3 Operation Manual, "Remote Operation"
//!
//! Protocol Overview:
//! - Binary single-byte commands over RS-232, 9600 8N1
//! - The controller echoes the command byte when it accepts a command and
//!   sends CR once the command has completed. A command that completes at
//!   once may answer with just the CR.
//!
//! | Command                    | Reply                 | Meaning               |
//! |----------------------------|-----------------------|-----------------------|
//! | `0xEE`                     | `0xEE`                | go on-line            |
//! | `253`                      | `253 <id> CR`         | controller id         |
//! | `204`                      | `204 <status> CR`     | status block          |
//! | `170` / `172`              | echo, then CR         | shutter A open/close  |
//! | `186` / `188`              | echo, then CR         | shutter B open/close  |
//! | `speed*16 + pos (+128 B)`  | echo, then CR         | wheel A/B move        |
//! | `252, speed*16 + pos`      | echo, then CR         | wheel C move (10-3)   |
//!
//! Some SmartShutter firmware echoes the opposite shutter code; that echo is
//! accepted when `tolerate_inverted_echo` is set.

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
use mm_core::{EchoKind, Response};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const DRIVER: &str = "sutter_lambda";

const CR: u8 = b'\r';
const GO_ONLINE: u8 = 0xEE;
const CONTROLLER_ID: u8 = 253;
const STATUS: u8 = 204;
const WHEEL_C_PREFIX: u8 = 252;

const MAX_POSITION: u8 = 9;
const MAX_SPEED: u8 = 7;

/// How long `busy()` listens for a pending completion marker.
const BUSY_PROBE: Duration = Duration::from_millis(1);

// =============================================================================
// SutterLambdaFactory - DriverFactory implementation
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SutterLambdaConfig {
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// How long a new command waits for the previous command's CR.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_tolerate")]
    pub tolerate_inverted_echo: bool,
    /// Initial wheel speed, 0 (fastest) to 7.
    #[serde(default = "default_wheel_speed")]
    pub wheel_speed: u8,
}

fn default_baud() -> u32 {
    9600
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_busy_timeout_ms() -> u64 {
    500
}

fn default_tolerate() -> bool {
    true
}

fn default_wheel_speed() -> u8 {
    3
}

impl SutterLambdaConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            timeout_ms: default_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            tolerate_inverted_echo: default_tolerate(),
            wheel_speed: default_wheel_speed(),
        }
    }

    fn check(&self) -> std::result::Result<(), DriverError> {
        if self.timeout_ms == 0 || self.busy_timeout_ms == 0 {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::Configuration,
                "timeouts must be positive",
            ));
        }
        if self.wheel_speed > MAX_SPEED {
            return Err(DriverError::new(
                DRIVER,
                DriverErrorKind::Configuration,
                format!("wheel_speed must be 0-{}, got {}", MAX_SPEED, self.wheel_speed),
            ));
        }
        Ok(())
    }
}

/// Factory for Sutter Lambda controllers.
pub struct SutterLambdaFactory;

static LAMBDA_CAPABILITIES: &[Capability] = &[Capability::StateDevice, Capability::Shutter];

impl DriverFactory for SutterLambdaFactory {
    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn name(&self) -> &'static str {
        "Sutter Lambda Controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        LAMBDA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: SutterLambdaConfig = config.clone().try_into()?;
        cfg.check()?;
        Ok(())
    }

    fn build(
        &self,
        ctx: DeviceContext,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: SutterLambdaConfig =
                config.try_into().context("Invalid Sutter Lambda config")?;
            cfg.check()?;

            let channel = SerialChannel::open(&cfg.port, cfg.baud, "Sutter Lambda").await?;
            let transactor = Transactor::with_settings(channel, ctx.transactor.clone());

            Ok(DeviceComponents::new(Arc::new(SutterLambda::new(
                ctx.name, transactor, &cfg,
            ))))
        })
    }
}

// =============================================================================
// Controller vocabulary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerType {
    Lambda10_2,
    Lambda10_3,
    SmartShutter,
}

impl ControllerType {
    /// Classify the id returned by command 253.
    pub fn from_id(id: &str) -> Self {
        if id.starts_with("SC") {
            ControllerType::SmartShutter
        } else if id.starts_with("10-3") {
            ControllerType::Lambda10_3
        } else {
            ControllerType::Lambda10_2
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ControllerType::Lambda10_2 => "10-2",
            ControllerType::Lambda10_3 => "10-3",
            ControllerType::SmartShutter => "SC",
        }
    }
}

impl fmt::Display for ControllerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wheel {
    A,
    B,
    C,
}

impl Wheel {
    fn index(self) -> usize {
        match self {
            Wheel::A => 0,
            Wheel::B => 1,
            Wheel::C => 2,
        }
    }

    /// Move byte for this wheel. Wheel C is sent after a `252` prefix.
    pub fn command_byte(self, position: u8, speed: u8) -> u8 {
        let base = speed * 16 + position;
        match self {
            Wheel::B => base + 128,
            Wheel::A | Wheel::C => base,
        }
    }

    fn from_option(name: &str) -> Option<Self> {
        match name {
            "WheelA" => Some(Wheel::A),
            "WheelB" => Some(Wheel::B),
            "WheelC" => Some(Wheel::C),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutter {
    A,
    B,
}

impl Shutter {
    pub fn code(self, open: bool) -> u8 {
        match (self, open) {
            (Shutter::A, true) => 170,
            (Shutter::A, false) => 172,
            (Shutter::B, true) => 186,
            (Shutter::B, false) => 188,
        }
    }

    fn index(self) -> usize {
        match self {
            Shutter::A => 0,
            Shutter::B => 1,
        }
    }

    fn from_option(name: &str) -> Option<Self> {
        match name {
            "ShutterA" => Some(Shutter::A),
            "ShutterB" => Some(Shutter::B),
            _ => None,
        }
    }
}

// =============================================================================
// SutterLambda
// =============================================================================

#[derive(Debug, Clone)]
struct LambdaState {
    controller: Option<ControllerType>,
    /// A command byte was echoed and its completion CR is still due.
    busy: bool,
    wheels: [u8; 3],
    speed: u8,
    shutters: [bool; 2],
}

/// One Lambda controller: up to three wheels and two shutters on one port.
///
/// Busy tracking belongs to the controller instance, so two controllers on
/// different ports never see each other's pending completions.
pub struct SutterLambda {
    name: String,
    transactor: Transactor,
    timeout: Duration,
    busy_timeout: Duration,
    tolerate_inverted_echo: bool,
    retry: RetryPolicy,
    state: Mutex<LambdaState>,
}

impl SutterLambda {
    pub fn new(name: impl Into<String>, transactor: Transactor, cfg: &SutterLambdaConfig) -> Self {
        Self {
            name: name.into(),
            transactor,
            timeout: Duration::from_millis(cfg.timeout_ms),
            busy_timeout: Duration::from_millis(cfg.busy_timeout_ms),
            tolerate_inverted_echo: cfg.tolerate_inverted_echo,
            retry: RetryPolicy::default(),
            state: Mutex::new(LambdaState {
                controller: None,
                busy: false,
                wheels: [0; 3],
                speed: cfg.wheel_speed.min(MAX_SPEED),
                shutters: [false; 2],
            }),
        }
    }

    /// Controller type as detected by [`controller_type`](Self::controller_type).
    pub fn controller(&self) -> Option<ControllerType> {
        self.state.lock().controller
    }

    /// Whether a completion CR is still outstanding.
    pub fn is_moving(&self) -> bool {
        self.state.lock().busy
    }

    pub fn wheel_position(&self, wheel: Wheel) -> u8 {
        self.state.lock().wheels[wheel.index()]
    }

    pub fn shutter_open(&self, shutter: Shutter) -> bool {
        self.state.lock().shutters[shutter.index()]
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn go_online(&self) -> Result<()> {
        self.exchange([GO_ONLINE], EchoMatch::bytes([GO_ONLINE])).await?;
        Ok(())
    }

    /// Query and remember the controller type.
    ///
    /// The 10-2 does not know command 253; silence means a 10-2.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn controller_type(&self) -> Result<ControllerType> {
        let echo = EchoMatch::prefix([CONTROLLER_ID], [CR]);
        let controller = match self.transact([CONTROLLER_ID], echo).await {
            Ok(reply) => {
                let id = String::from_utf8_lossy(reply.after_echo()).trim().to_string();
                debug!(id = %id, "controller id");
                ControllerType::from_id(&id)
            }
            Err(TransactError::Timeout { .. }) => ControllerType::Lambda10_2,
            Err(e) => return Err(fail(e)),
        };
        self.state.lock().controller = Some(controller);
        Ok(controller)
    }

    /// Raw status block (bytes after the `204` echo, CR excluded).
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn status(&self) -> Result<Vec<u8>> {
        self.settle().await;
        let reply = self
            .exchange([STATUS], EchoMatch::prefix([STATUS], [CR]))
            .await?;
        Ok(reply.after_echo().to_vec())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn set_shutter(&self, shutter: Shutter, open: bool) -> Result<()> {
        self.settle().await;

        let code = shutter.code(open);
        let mut echo = EchoMatch::bytes([code]).with_alternate([CR]);
        if self.tolerate_inverted_echo {
            echo = echo.with_alternate([shutter.code(!open)]);
        }
        let reply = self.exchange([code], echo).await?;

        let mut state = self.state.lock();
        match reply.echo() {
            Some(EchoKind::Expected) => state.busy = true,
            Some(EchoKind::Alternate(1)) => {
                debug!(?shutter, open, "accepted inverted shutter echo");
            }
            _ => {}
        }
        state.shutters[shutter.index()] = open;
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn move_wheel(&self, wheel: Wheel, position: u8) -> Result<()> {
        if position > MAX_POSITION {
            return Err(DriverError::invalid_parameter(
                DRIVER,
                format!("wheel position must be 0-{}, got {}", MAX_POSITION, position),
            )
            .into());
        }
        if wheel == Wheel::C
            && matches!(self.controller(), Some(c) if c != ControllerType::Lambda10_3)
        {
            return Err(DriverError::invalid_parameter(
                DRIVER,
                "wheel C requires a Lambda 10-3 controller",
            )
            .into());
        }

        self.settle().await;

        let speed = self.state.lock().speed;
        let byte = wheel.command_byte(position, speed);
        let (command, echo) = match wheel {
            Wheel::C => (
                vec![WHEEL_C_PREFIX, byte],
                EchoMatch::bytes([WHEEL_C_PREFIX, byte])
                    .with_alternate([byte])
                    .with_alternate([CR]),
            ),
            Wheel::A | Wheel::B => (vec![byte], EchoMatch::bytes([byte]).with_alternate([CR])),
        };
        let reply = self.exchange(command, echo).await?;

        let mut state = self.state.lock();
        state.busy = reply.raw() != [CR];
        state.wheels[wheel.index()] = position;
        Ok(())
    }

    pub fn set_wheel_speed(&self, speed: u8) -> Result<()> {
        if speed > MAX_SPEED {
            return Err(DriverError::invalid_parameter(
                DRIVER,
                format!("wheel speed must be 0-{}, got {}", MAX_SPEED, speed),
            )
            .into());
        }
        self.state.lock().speed = speed;
        Ok(())
    }

    /// Wait for the CR that completes the last echoed command.
    ///
    /// The pending flag is cleared whatever the outcome: once the wait has
    /// failed the marker is considered lost and the next command's purge
    /// discards anything late.
    #[instrument(skip(self), fields(device = %self.name), err)]
    pub async fn wait_done(&self, timeout: Duration) -> Result<()> {
        if !self.is_moving() {
            return Ok(());
        }
        let result = self.transactor.read_reply(ReplyMatch::cr(), timeout).await;
        self.state.lock().busy = false;
        result.map(|_| ()).map_err(fail)
    }

    async fn settle(&self) {
        if let Err(e) = self.wait_done(self.busy_timeout).await {
            warn!(device = %self.name, error = %e, "previous command did not complete; continuing");
        }
    }

    fn apply_status(&self, controller: ControllerType, status: &[u8]) {
        let mut state = self.state.lock();
        let mut read = |index: usize, shutter: Shutter| match status.get(index) {
            Some(b) if *b == shutter.code(true) => state.shutters[shutter.index()] = true,
            Some(b) if *b == shutter.code(false) => state.shutters[shutter.index()] = false,
            _ => {}
        };
        match controller {
            ControllerType::Lambda10_3 => {
                read(4, Shutter::A);
                read(5, Shutter::B);
            }
            ControllerType::SmartShutter => read(0, Shutter::A),
            ControllerType::Lambda10_2 => {}
        }
    }

    async fn transact(
        &self,
        command: impl Into<Command>,
        echo: EchoMatch,
    ) -> std::result::Result<Response, TransactError> {
        let command = command.into();
        retry_busy(&self.retry, || {
            self.transactor
                .execute(command.clone(), echo.clone(), self.timeout)
        })
        .await
    }

    async fn exchange(&self, command: impl Into<Command>, echo: EchoMatch) -> Result<Response> {
        self.transact(command, echo).await.map_err(fail)
    }
}

fn fail(err: TransactError) -> anyhow::Error {
    DriverError::from_transact(DRIVER, &err).into()
}

#[async_trait]
impl Device for SutterLambda {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_type(&self) -> &'static str {
        DRIVER
    }

    fn options(&self) -> Vec<OptionSpec> {
        let position = || OptionKind::Int;
        let mut specs = vec![
            OptionSpec::new("WheelA", position()).limits(0.0, MAX_POSITION as f64),
            OptionSpec::new("WheelB", position()).limits(0.0, MAX_POSITION as f64),
        ];
        if !matches!(self.controller(), Some(c) if c != ControllerType::Lambda10_3) {
            specs.push(OptionSpec::new("WheelC", position()).limits(0.0, MAX_POSITION as f64));
        }
        specs.extend([
            OptionSpec::new("WheelSpeed", OptionKind::Int).limits(0.0, MAX_SPEED as f64),
            OptionSpec::new("ShutterA", OptionKind::Bool),
            OptionSpec::new("ShutterB", OptionKind::Bool),
            OptionSpec::new("ControllerType", OptionKind::Text).read_only(),
        ]);
        specs
    }

    #[instrument(skip(self), fields(device = %self.name), err)]
    async fn open(&self) -> Result<()> {
        self.go_online()
            .await
            .context("Sutter Lambda did not go on-line")?;
        let controller = self.controller_type().await?;

        if controller != ControllerType::Lambda10_2 {
            // Older firmware does not know the status command.
            match self.status().await {
                Ok(status) => self.apply_status(controller, &status),
                Err(e) => debug!(error = %e, "status query unsupported"),
            }
        }

        info!(device = %self.name, controller = %controller, "Sutter Lambda ready");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.settle().await;
        Ok(())
    }

    async fn get_option(&self, name: &str) -> Result<OptionValue> {
        let specs = self.options();
        let spec = OptionSpec::lookup(&specs, name, DRIVER)?;
        if let Some(wheel) = Wheel::from_option(spec.name) {
            return Ok(OptionValue::Int(self.wheel_position(wheel) as i64));
        }
        if let Some(shutter) = Shutter::from_option(spec.name) {
            return Ok(OptionValue::Bool(self.shutter_open(shutter)));
        }
        match spec.name {
            "WheelSpeed" => Ok(OptionValue::Int(self.state.lock().speed as i64)),
            _ => Ok(self
                .controller()
                .map_or("unknown", |c| c.label())
                .into()),
        }
    }

    async fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        let specs = self.options();
        let value = OptionSpec::lookup(&specs, name, DRIVER)?.check(value, DRIVER)?;

        if let Some(wheel) = Wheel::from_option(name) {
            let position = value.as_i64().unwrap_or_default() as u8;
            return self.move_wheel(wheel, position).await;
        }
        if let Some(shutter) = Shutter::from_option(name) {
            return self
                .set_shutter(shutter, value.as_bool().unwrap_or_default())
                .await;
        }
        self.set_wheel_speed(value.as_i64().unwrap_or_default() as u8)
    }

    async fn busy(&self) -> Result<bool> {
        if !self.is_moving() {
            return Ok(false);
        }
        match self.transactor.read_reply(ReplyMatch::cr(), BUSY_PROBE).await {
            Ok(_) => {
                self.state.lock().busy = false;
                Ok(false)
            }
            Err(TransactError::Timeout { .. }) => Ok(true),
            Err(e) => {
                self.state.lock().busy = false;
                Err(fail(e))
            }
        }
    }
}
