//! Storage Class Model
//!
//! A storage class is a named selector over pools. Its configuration is
//! persisted; its pool membership is recomputed whenever the set of
//! backends changes.

use super::attributes::{parse_requests, Request};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Pool lists map a backend name pattern to pool name patterns
pub type PoolList = BTreeMap<String, Vec<String>>;

/// Persisted configuration of a storage class
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassConfig {
    #[serde(default)]
    pub version: String,
    pub name: String,
    /// Raw attribute requests, e.g. `IOPS: "2000"`
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Strict allow-list; when present, attribute matches outside it are dropped
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pools: PoolList,
    /// Always included when present on a registered backend
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_pools: PoolList,
}

impl StorageClassConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: "1".to_string(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_pools(mut self, backend: &str, pools: &[&str]) -> Self {
        self.pools
            .insert(backend.to_string(), pools.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn with_additional_pools(mut self, backend: &str, pools: &[&str]) -> Self {
        self.additional_pools
            .insert(backend.to_string(), pools.iter().map(|p| p.to_string()).collect());
        self
    }
}

/// Identifies a pool across backends
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolId {
    pub backend_uuid: String,
    pub pool: String,
}

impl PoolId {
    pub fn new(backend_uuid: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            backend_uuid: backend_uuid.into(),
            pool: pool.into(),
        }
    }
}

/// A storage class as held in the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct StorageClass {
    pub config: StorageClassConfig,
    pub requests: BTreeMap<String, Request>,
    pub pools: BTreeSet<PoolId>,
}

impl StorageClass {
    /// Parse and validate a configuration. Pool membership starts empty.
    pub fn new(config: StorageClassConfig) -> Result<Self> {
        if config.name.trim().is_empty() {
            return Err(Error::InvalidArgument("storage class name must not be empty".into()));
        }
        for list in [&config.pools, &config.additional_pools] {
            for (backend, pools) in list {
                validate_pattern(backend)?;
                for pool in pools {
                    validate_pattern(pool)?;
                }
            }
        }
        let requests = parse_requests(&config.attributes)?;
        Ok(Self {
            config,
            requests,
            pools: BTreeSet::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn has_pool(&self, backend_uuid: &str, pool: &str) -> bool {
        self.pools.contains(&PoolId::new(backend_uuid, pool))
    }
}

fn validate_pattern(pattern: &str) -> Result<()> {
    glob::Pattern::new(pattern)
        .map(|_| ())
        .map_err(|e| Error::InvalidArgument(format!("invalid pool pattern {}: {}", pattern, e)))
}

/// API view of a storage class: pool membership keyed by backend name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageClassExternal {
    pub config: StorageClassConfig,
    pub storage: BTreeMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attributes::{IOPS, SNAPSHOTS};

    #[test]
    fn test_new_parses_requests() {
        let config = StorageClassConfig::new("fast")
            .with_attribute(IOPS, "2000")
            .with_attribute(SNAPSHOTS, "true");
        let class = StorageClass::new(config).unwrap();
        assert_eq!(class.requests.len(), 2);
        assert!(class.pools.is_empty());
    }

    #[test]
    fn test_rejects_bad_patterns_and_attributes() {
        let config = StorageClassConfig::new("bad").with_pools("fast-[", &["*"]);
        assert!(StorageClass::new(config).is_err());

        let config = StorageClassConfig::new("bad").with_attribute(IOPS, "lots");
        assert!(StorageClass::new(config).is_err());

        assert!(StorageClass::new(StorageClassConfig::new("  ")).is_err());
    }
}
