//! Application configuration.
//!
//! Layers, later ones winning:
//!
//! 1. built-in defaults
//! 2. the TOML file given on the command line
//! 3. `MM_*` environment variables, with `__` separating nested keys
//!    (`MM_TRANSACTOR__TIMEOUT_MS=250`)
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "compact"
//!
//! [transactor]
//! timeout_ms = 500
//! tx_terminator = "\r"
//!
//! [poller]
//! interval_ms = 200
//! max_consecutive_transient = 20
//!
//! [[devices]]
//! name = "XYStage"
//! driver = "asi_stage"
//! params = { port = "/dev/ttyUSB0", axes = "xy" }
//! ```

use crate::logging::OutputFormat;
use crate::poller::PollerSettings;
use crate::transactor::TransactorSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Error types for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    /// Invalid TOML or a value of the wrong type
    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Config validation failed: {0}")]
    Validation(String),
}

impl From<figment::Error> for ConfigLoadError {
    fn from(err: figment::Error) -> Self {
        ConfigLoadError::Parse(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub transactor: TransactorConfig,
    pub poller: PollerConfig,
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: OutputFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

/// Defaults applied to every channel unless a driver overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactorConfig {
    pub timeout_ms: u64,
    /// Appended to text commands. Accepts literal `\r` / `\n` escapes so the
    /// value can come from an environment variable.
    pub tx_terminator: String,
    pub strip_echo: bool,
}

impl Default for TransactorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1000,
            tx_terminator: "\r".to_string(),
            strip_echo: true,
        }
    }
}

impl TransactorConfig {
    pub fn settings(&self) -> TransactorSettings {
        TransactorSettings {
            tx_terminator: decode_escapes(&self.tx_terminator),
            strip_echo: self.strip_echo,
            default_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    pub backoff_ms: u64,
    pub max_consecutive_transient: Option<u32>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            backoff_ms: 50,
            max_consecutive_transient: None,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn settings(&self) -> PollerSettings {
        PollerSettings {
            backoff: Duration::from_millis(self.backoff_ms),
            max_consecutive_transient: self.max_consecutive_transient,
        }
    }
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    /// Factory `driver_type`
    pub driver: String,
    /// Passed verbatim to the factory.
    #[serde(default)]
    pub params: toml::Table,
}

impl AppConfig {
    /// Defaults, then `path`, then the environment.
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("MM_").split("__"))
    }

    /// Load and validate.
    ///
    /// A path that does not exist is an error; `None` uses defaults and the
    /// environment only.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigLoadError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigLoadError::NotFound(path.display().to_string()));
            }
            debug!("Loading config from: {}", path.display());
        }

        let config = Self::from_figment(Self::figment(path))?;
        info!(
            devices = config.devices.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigLoadError> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a TOML document, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigLoadError> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(AppConfig::default()))
                .merge(Toml::string(content)),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let mut problems = Vec::new();

        if self.transactor.timeout_ms == 0 {
            problems.push("transactor.timeout_ms must be positive".to_string());
        }
        if decode_escapes(&self.transactor.tx_terminator).is_empty() {
            problems.push("transactor.tx_terminator must not be empty".to_string());
        }
        if self.poller.max_consecutive_transient == Some(0) {
            problems.push("poller.max_consecutive_transient must be positive".to_string());
        }

        let mut seen = HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            if device.name.trim().is_empty() {
                problems.push(format!("devices[{}] has an empty name", i));
            } else if !seen.insert(device.name.as_str()) {
                problems.push(format!("duplicate device name '{}'", device.name));
            }
            if device.driver.trim().is_empty() {
                problems.push(format!("devices[{}] has an empty driver", i));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigLoadError::Validation(problems.join("; ")))
        }
    }

    pub fn device(&self, name: &str) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.name == name)
    }
}

/// Expand `\r`, `\n`, `\t` and `\\` written as two characters.
pub fn decode_escapes(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('\\') => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
            None => out.push(b'\\'),
        }
    }
    out
}
