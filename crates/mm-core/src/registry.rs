//! Device registry.
//!
//! Holds the registered [`DriverFactory`]s and the devices instantiated from
//! them. Devices are keyed by their configured name; lookups hand out
//! `Arc<dyn Device>` clones so callers never hold the registry lock across an
//! await.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use mm_core::config::AppConfig;
//! use mm_core::registry::DeviceRegistry;
//!
//! let registry = DeviceRegistry::new();
//! registry.register_factory(Box::new(AsiStageFactory));
//! registry.register_factory(Box::new(SutterLambdaFactory));
//!
//! let config = AppConfig::load(Some(Path::new("microscope.toml")))?;
//! registry.build_all(&config).await?;
//!
//! let stage = registry.get("XYStage")?;
//! stage.set_option("PositionX", 1500.0.into()).await?;
//!
//! registry.close_all().await;
//! ```

use crate::config::AppConfig;
use crate::device::{Capability, Device, DeviceContext, DriverFactory};
use crate::error::{AppResult, MmError};
use anyhow::Context;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Summary of one registered factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryInfo {
    pub driver_type: &'static str,
    pub name: &'static str,
    pub capabilities: &'static [Capability],
}

/// Summary of one instantiated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub driver_type: String,
    pub capabilities: Vec<Capability>,
}

struct Entry {
    device: Arc<dyn Device>,
    capabilities: Vec<Capability>,
}

#[derive(Default)]
pub struct DeviceRegistry {
    factories: RwLock<HashMap<&'static str, Arc<dyn DriverFactory>>>,
    devices: RwLock<HashMap<String, Entry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a later registration for the same driver type
    /// replaces the earlier one.
    pub fn register_factory(&self, factory: Box<dyn DriverFactory>) {
        let driver_type = factory.driver_type();
        if self
            .factories
            .write()
            .insert(driver_type, Arc::from(factory))
            .is_some()
        {
            warn!(driver_type, "driver factory replaced");
        }
    }

    pub fn factories(&self) -> Vec<FactoryInfo> {
        let mut list: Vec<FactoryInfo> = self
            .factories
            .read()
            .values()
            .map(|f| FactoryInfo {
                driver_type: f.driver_type(),
                name: f.name(),
                capabilities: f.capabilities(),
            })
            .collect();
        list.sort_by_key(|f| f.driver_type);
        list
    }

    /// Validate parameters, build the device and open it.
    ///
    /// The device is only registered once `open` succeeds.
    #[instrument(skip(self, ctx, params), fields(device = %ctx.name), err)]
    pub async fn instantiate(
        &self,
        ctx: DeviceContext,
        driver: &str,
        params: toml::Value,
    ) -> AppResult<Arc<dyn Device>> {
        let name = ctx.name.clone();
        if self.devices.read().contains_key(&name) {
            return Err(MmError::Configuration(format!(
                "device '{}' already exists",
                name
            )));
        }

        let factory = self
            .factories
            .read()
            .get(driver)
            .cloned()
            .ok_or_else(|| MmError::UnknownDriver(driver.to_string()))?;

        factory
            .validate(&params)
            .with_context(|| format!("invalid parameters for device '{}'", name))?;

        let components = factory
            .build(ctx, params)
            .await
            .with_context(|| format!("failed to build device '{}'", name))?;
        let device = components.device;

        device
            .open()
            .await
            .with_context(|| format!("failed to open device '{}'", name))?;

        self.devices.write().insert(
            name.clone(),
            Entry {
                device: device.clone(),
                capabilities: factory.capabilities().to_vec(),
            },
        );
        info!(device = %name, driver, "device ready");
        Ok(device)
    }

    /// Instantiate every `[[devices]]` entry, stopping at the first failure.
    ///
    /// Devices opened before the failure stay registered so the caller's
    /// `close_all` releases them.
    pub async fn build_all(&self, config: &AppConfig) -> AppResult<()> {
        for entry in &config.devices {
            let ctx = DeviceContext::from_config(entry.name.clone(), config);
            self.instantiate(ctx, &entry.driver, toml::Value::Table(entry.params.clone()))
                .await?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        self.devices
            .read()
            .get(name)
            .map(|e| e.device.clone())
            .ok_or_else(|| MmError::UnknownDevice(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        let mut list: Vec<DeviceInfo> = self
            .devices
            .read()
            .iter()
            .map(|(name, e)| DeviceInfo {
                name: name.clone(),
                driver_type: e.device.driver_type().to_string(),
                capabilities: e.capabilities.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Close and drop every device. Failures are logged, not returned, so
    /// every device gets its chance to release hardware.
    pub async fn close_all(&self) {
        let devices: Vec<(String, Entry)> = self.devices.write().drain().collect();
        for (name, entry) in devices {
            if let Some(acq) = entry.device.acquisition() {
                acq.stop();
            }
            match entry.device.close().await {
                Ok(()) => info!(device = %name, "device closed"),
                Err(e) => warn!(device = %name, error = %e, "failed to close device"),
            }
        }
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("factories", &self.factories.read().keys().collect::<Vec<_>>())
            .field("devices", &self.devices.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceComponents, OptionKind, OptionSpec, OptionValue};
    use crate::error::{DriverError, DriverErrorKind};
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Lamp {
        name: String,
        on: AtomicBool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Device for Lamp {
        fn name(&self) -> &str {
            &self.name
        }

        fn driver_type(&self) -> &'static str {
            "lamp"
        }

        fn options(&self) -> Vec<OptionSpec> {
            vec![OptionSpec::new("On", OptionKind::Bool)]
        }

        async fn open(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&self) -> anyhow::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn get_option(&self, name: &str) -> anyhow::Result<OptionValue> {
            OptionSpec::lookup(&self.options(), name, "lamp")?;
            Ok(OptionValue::Bool(self.on.load(Ordering::SeqCst)))
        }

        async fn set_option(&self, name: &str, value: OptionValue) -> anyhow::Result<()> {
            let specs = self.options();
            let value = OptionSpec::lookup(&specs, name, "lamp")?.check(value, "lamp")?;
            self.on.store(value.as_bool().unwrap_or(false), Ordering::SeqCst);
            Ok(())
        }

        async fn busy(&self) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    struct LampFactory {
        closed: Arc<AtomicBool>,
    }

    impl DriverFactory for LampFactory {
        fn driver_type(&self) -> &'static str {
            "lamp"
        }

        fn name(&self) -> &'static str {
            "Test Lamp"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Shutter]
        }

        fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
            if config.get("broken").is_some() {
                anyhow::bail!("broken lamp");
            }
            Ok(())
        }

        fn build(
            &self,
            ctx: DeviceContext,
            _config: toml::Value,
        ) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
            let closed = self.closed.clone();
            Box::pin(async move {
                Ok(DeviceComponents::new(Arc::new(Lamp {
                    name: ctx.name,
                    on: AtomicBool::new(false),
                    closed,
                })))
            })
        }
    }

    fn registry() -> (DeviceRegistry, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        let registry = DeviceRegistry::new();
        registry.register_factory(Box::new(LampFactory {
            closed: closed.clone(),
        }));
        (registry, closed)
    }

    #[tokio::test]
    async fn test_build_all_and_lookup() {
        let (registry, closed) = registry();
        let config = AppConfig::from_toml_str(
            r#"
            [[devices]]
            name = "Lamp1"
            driver = "lamp"
            "#,
        )
        .unwrap();

        registry.build_all(&config).await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].capabilities, vec![Capability::Shutter]);

        let lamp = registry.get("Lamp1").unwrap();
        lamp.set_option("On", OptionValue::Bool(true)).await.unwrap();
        assert_eq!(lamp.get_option("On").await.unwrap(), OptionValue::Bool(true));

        registry.close_all().await;
        assert!(registry.is_empty());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_driver_and_device() {
        let (registry, _) = registry();
        let err = registry
            .instantiate(DeviceContext::new("X"), "laser", toml::Value::Table(Default::default()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MmError::UnknownDriver(ref d) if d == "laser"));
        assert!(matches!(registry.get("X"), Err(MmError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_validation_failure_does_not_register() {
        let (registry, _) = registry();
        let mut params = toml::Table::new();
        params.insert("broken".into(), toml::Value::Boolean(true));

        let result = registry
            .instantiate(DeviceContext::new("L"), "lamp", toml::Value::Table(params))
            .await;
        assert!(result.is_err());
        assert!(!registry.contains("L"));
    }

    #[tokio::test]
    async fn test_unknown_option_is_invalid_parameter() {
        let (registry, _) = registry();
        let lamp = registry
            .instantiate(DeviceContext::new("L"), "lamp", toml::Value::Table(Default::default()))
            .await
            .unwrap();

        let err = lamp.get_option("Brightness").await.unwrap_err();
        let driver_err = err.downcast_ref::<DriverError>().unwrap();
        assert_eq!(driver_err.kind, DriverErrorKind::InvalidParameter);
    }
}
