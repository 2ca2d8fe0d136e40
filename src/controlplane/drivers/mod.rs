//! Storage Driver Registry
//!
//! Maps the `storageDriverName` of a backend config to a constructor. Real
//! drivers live outside this crate and register themselves here; the
//! in-process `fake` driver is always available.

pub mod fake;

pub use fake::{FakeArray, FakeArrays, FakeDriver, FakeDriverConfig, FakePoolConfig};

use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const DRIVER_NAME_KEY: &str = "storageDriverName";
pub const BACKEND_NAME_KEY: &str = "backendName";

pub type DriverConstructor =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn StorageDriver>> + Send + Sync>;

/// Factory for creating storage drivers from backend configs
#[derive(Clone, Default)]
pub struct BackendFactory {
    constructors: BTreeMap<String, DriverConstructor>,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the fake driver bound to a set of simulated arrays
    pub fn with_fake(arrays: FakeArrays) -> Self {
        let mut factory = Self::new();
        factory.register(
            fake::DRIVER_NAME,
            Arc::new(move |config: &serde_json::Value| {
                let driver: Arc<dyn StorageDriver> = Arc::new(FakeDriver::from_config(config, &arrays)?);
                Ok(driver)
            }),
        );
        factory
    }

    pub fn register(&mut self, name: &str, constructor: DriverConstructor) {
        self.constructors.insert(name.to_lowercase(), constructor);
    }

    pub fn driver_names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// Create a driver by the name in the config
    pub fn create(&self, config: &serde_json::Value) -> Result<Arc<dyn StorageDriver>> {
        let name = driver_name(config)?;
        let constructor = self.constructors.get(&name.to_lowercase()).ok_or_else(|| {
            Error::Configuration(format!("unknown storage driver {}", name))
        })?;
        constructor(config)
    }
}

impl std::fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendFactory")
            .field("drivers", &self.driver_names())
            .finish()
    }
}

/// Driver name from a backend config
pub fn driver_name(config: &serde_json::Value) -> Result<String> {
    config
        .get(DRIVER_NAME_KEY)
        .and_then(|v| v.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::Configuration(format!("backend config is missing {}", DRIVER_NAME_KEY)))
}

/// Backend name from a backend config, if set
pub fn backend_name(config: &serde_json::Value) -> Option<String> {
    config
        .get(BACKEND_NAME_KEY)
        .and_then(|v| v.as_str())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_driver() {
        let factory = BackendFactory::with_fake(FakeArrays::default());
        let err = factory.create(&json!({"storageDriverName": "ontap-nas"})).unwrap_err();
        assert_matches::assert_matches!(err, Error::Configuration(_));
        assert!(factory.create(&json!({"backendName": "x"})).is_err());
    }

    #[test]
    fn test_create_fake() {
        let factory = BackendFactory::with_fake(FakeArrays::default());
        let driver = factory
            .create(&json!({"storageDriverName": "fake", "backendName": "fast-a", "protocol": "file"}))
            .unwrap();
        assert_eq!(driver.name(), "fake");
        assert_eq!(driver.backend_name(), "fast-a");
    }
}
