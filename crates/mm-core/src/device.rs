//! Host-facing device surface.
//!
//! Every driver exposes one [`Device`]: a named set of typed options plus
//! open/close and a busy query. Drivers that stream data also expose an
//! [`Acquisition`], which wraps a [`crate::poller::Poller`] behind an
//! object-safe interface.
//!
//! Drivers are registered through a [`DriverFactory`]:
//!
//! ```text
//!   AppConfig [[devices]] ──▶ DeviceRegistry ──▶ DriverFactory::build()
//!                                                   │
//!                                                   ▼
//!                                         DeviceComponents { Arc<dyn Device> }
//! ```
//!
//! # Example: Implementing a Driver Factory
//!
//! ```rust,ignore
//! use mm_core::device::{Capability, DeviceComponents, DeviceContext, DriverFactory};
//! use futures::future::BoxFuture;
//!
//! pub struct WheelFactory;
//!
//! impl DriverFactory for WheelFactory {
//!     fn driver_type(&self) -> &'static str { "wheel" }
//!     fn name(&self) -> &'static str { "Filter Wheel" }
//!     fn capabilities(&self) -> &'static [Capability] { &[Capability::StateDevice] }
//!
//!     fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
//!         let _: WheelConfig = config.clone().try_into()?;
//!         Ok(())
//!     }
//!
//!     fn build(&self, ctx: DeviceContext, config: toml::Value)
//!         -> BoxFuture<'static, anyhow::Result<DeviceComponents>>
//!     {
//!         Box::pin(async move {
//!             let cfg: WheelConfig = config.try_into()?;
//!             Ok(DeviceComponents::new(Arc::new(Wheel::connect(ctx, cfg).await?)))
//!         })
//!     }
//! }
//! ```

use crate::config::AppConfig;
use crate::error::{DriverError, DriverErrorKind};
use crate::poller::{PollEvent, PollerSettings, SampleCount};
use crate::transactor::TransactorSettings;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// =============================================================================
// Option Values
// =============================================================================

/// Value of one device option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl OptionValue {
    /// Interpret user input: `true`/`false`, then integer, then float, else text.
    pub fn parse(text: &str) -> OptionValue {
        let text = text.trim();
        match text {
            "true" => return OptionValue::Bool(true),
            "false" => return OptionValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = text.parse::<i64>() {
            OptionValue::Int(i)
        } else if let Ok(f) = text.parse::<f64>() {
            OptionValue::Float(f)
        } else {
            OptionValue::Text(text.to_string())
        }
    }

    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Float(_) => OptionKind::Float,
            OptionValue::Text(_) => OptionKind::Text,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OptionValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            OptionValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OptionValue::Int(i) => Some(*i as f64),
            OptionValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OptionValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<&str> for OptionValue {
    fn from(v: &str) -> Self {
        OptionValue::Text(v.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(v: String) -> Self {
        OptionValue::Text(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Bool,
    Int,
    Float,
    Text,
}

// =============================================================================
// Option Specs
// =============================================================================

/// Declaration of one option: its type, access and allowed values.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub read_only: bool,
    /// When non-empty, the only values accepted.
    pub allowed: Vec<OptionValue>,
    /// Inclusive numeric limits.
    pub limits: Option<(f64, f64)>,
}

impl OptionSpec {
    pub fn new(name: &'static str, kind: OptionKind) -> Self {
        Self {
            name,
            kind,
            read_only: false,
            allowed: Vec::new(),
            limits: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn allowed<V: Into<OptionValue>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low, high));
        self
    }

    /// Find `name` among `specs`, or fail with `InvalidParameter`.
    pub fn lookup<'a>(
        specs: &'a [OptionSpec],
        name: &str,
        driver_type: &str,
    ) -> Result<&'a OptionSpec, DriverError> {
        specs.iter().find(|s| s.name == name).ok_or_else(|| {
            DriverError::invalid_parameter(driver_type, format!("unknown option '{}'", name))
        })
    }

    /// Validate a value for writing and coerce it to this option's kind.
    pub fn check(&self, value: OptionValue, driver_type: &str) -> Result<OptionValue, DriverError> {
        if self.read_only {
            return Err(DriverError::new(
                driver_type,
                DriverErrorKind::Permission,
                format!("option '{}' is read-only", self.name),
            ));
        }

        let value = self.coerce(value).ok_or_else(|| {
            DriverError::invalid_parameter(
                driver_type,
                format!("option '{}' expects a {:?} value", self.name, self.kind),
            )
        })?;

        if !self.allowed.is_empty() && !self.allowed.contains(&value) {
            let allowed: Vec<String> = self.allowed.iter().map(ToString::to_string).collect();
            return Err(DriverError::invalid_parameter(
                driver_type,
                format!(
                    "'{}' is not allowed for '{}' (allowed: {})",
                    value,
                    self.name,
                    allowed.join(", ")
                ),
            ));
        }

        if let (Some((low, high)), Some(v)) = (self.limits, value.as_f64()) {
            if v < low || v > high {
                return Err(DriverError::invalid_parameter(
                    driver_type,
                    format!("{} = {} outside [{}, {}]", self.name, v, low, high),
                ));
            }
        }

        Ok(value)
    }

    fn coerce(&self, value: OptionValue) -> Option<OptionValue> {
        match (self.kind, value) {
            (OptionKind::Float, OptionValue::Int(i)) => Some(OptionValue::Float(i as f64)),
            (OptionKind::Int, OptionValue::Float(f)) if f.fract() == 0.0 => {
                Some(OptionValue::Int(f as i64))
            }
            (OptionKind::Text, OptionValue::Bool(b)) => Some(OptionValue::Text(b.to_string())),
            (OptionKind::Text, OptionValue::Int(i)) => Some(OptionValue::Text(i.to_string())),
            (OptionKind::Bool, OptionValue::Text(t)) => match t.to_lowercase().as_str() {
                "true" | "on" | "yes" | "1" => Some(OptionValue::Bool(true)),
                "false" | "off" | "no" | "0" => Some(OptionValue::Bool(false)),
                _ => None,
            },
            (OptionKind::Bool, OptionValue::Int(i)) if i == 0 || i == 1 => {
                Some(OptionValue::Bool(i == 1))
            }
            (kind, value) if value.kind() == kind => Some(value),
            _ => None,
        }
    }
}

// =============================================================================
// Readings
// =============================================================================

/// Named values produced by one acquisition cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reading {
    pub fields: Vec<(String, OptionValue)>,
}

impl Reading {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

// =============================================================================
// Capability Traits
// =============================================================================

/// A device as seen by the host.
///
/// Errors are `anyhow` errors wrapping a [`DriverError`] where the failure
/// has a kind (`InvalidParameter`, `Permission`, `Hardware`, ...).
#[async_trait]
pub trait Device: Send + Sync {
    /// Instance name from the configuration.
    fn name(&self) -> &str;

    fn driver_type(&self) -> &'static str;

    fn options(&self) -> Vec<OptionSpec>;

    /// Establish communication and initialize the hardware.
    async fn open(&self) -> Result<()>;

    /// Stop background work and release the hardware.
    async fn close(&self) -> Result<()>;

    async fn get_option(&self, name: &str) -> Result<OptionValue>;

    /// Validated against [`OptionSpec`] before any bytes are sent.
    async fn set_option(&self, name: &str, value: OptionValue) -> Result<()>;

    async fn busy(&self) -> Result<bool>;

    fn acquisition(&self) -> Option<&dyn Acquisition> {
        None
    }
}

/// Continuous acquisition for devices that stream readings.
#[async_trait]
pub trait Acquisition: Send + Sync {
    async fn start(&self, count: SampleCount, interval: Duration) -> Result<()>;

    fn stop(&self);

    fn is_running(&self) -> bool;

    async fn wait_idle(&self);

    fn subscribe(&self) -> broadcast::Receiver<PollEvent<Reading>>;
}

// =============================================================================
// Capability Enum
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// XY or Z positioning
    Stage,
    Shutter,
    /// Discrete positions (filter wheels, turrets)
    StateDevice,
    AutoFocus,
    Camera,
    /// Exposes [`Acquisition`]
    Acquisition,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stage => "Stage",
            Self::Shutter => "Shutter",
            Self::StateDevice => "State Device",
            Self::AutoFocus => "Auto Focus",
            Self::Camera => "Camera",
            Self::Acquisition => "Acquisition",
        }
    }
}

// =============================================================================
// Factories
// =============================================================================

/// Settings a factory receives alongside its own parameters.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub name: String,
    pub transactor: TransactorSettings,
    pub poller: PollerSettings,
    pub poll_interval: Duration,
}

impl DeviceContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transactor: TransactorSettings::default(),
            poller: PollerSettings::default(),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &AppConfig) -> Self {
        Self {
            name: name.into(),
            transactor: config.transactor.settings(),
            poller: config.poller.settings(),
            poll_interval: config.poller.interval(),
        }
    }
}

/// What a factory hands back.
#[derive(Clone)]
pub struct DeviceComponents {
    pub device: Arc<dyn Device>,
}

impl DeviceComponents {
    pub fn new(device: Arc<dyn Device>) -> Self {
        Self { device }
    }
}

impl fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("name", &self.device.name())
            .field("driver_type", &self.device.driver_type())
            .finish()
    }
}

/// Builds devices of one driver type from TOML parameters.
pub trait DriverFactory: Send + Sync {
    /// Matches `driver` in `[[devices]]` entries.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability];

    /// Check parameters without touching hardware.
    fn validate(&self, config: &toml::Value) -> Result<()>;

    /// Construct the device. The registry opens it afterwards.
    fn build(
        &self,
        ctx: DeviceContext,
        config: toml::Value,
    ) -> BoxFuture<'static, Result<DeviceComponents>>;
}
