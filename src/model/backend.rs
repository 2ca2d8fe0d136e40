//! Backend and Pool Model
//!
//! A backend is a configured external storage system reached through a
//! driver instance. The in-memory [`Backend`] holds the driver; the store
//! only ever sees [`BackendPersistent`] and the API only [`BackendExternal`].

use super::attributes::Offer;
use super::redact_config;
use super::volume::Protocol;
use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Backend State
// =============================================================================

/// Lifecycle state of a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    Online,
    Offline,
    Deleting,
    Failed,
    #[default]
    Unknown,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendState::Online => write!(f, "online"),
            BackendState::Offline => write!(f, "offline"),
            BackendState::Deleting => write!(f, "deleting"),
            BackendState::Failed => write!(f, "failed"),
            BackendState::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for BackendState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "online" => Ok(BackendState::Online),
            "offline" => Ok(BackendState::Offline),
            "deleting" => Ok(BackendState::Deleting),
            "failed" => Ok(BackendState::Failed),
            "unknown" => Ok(BackendState::Unknown),
            other => Err(Error::InvalidArgument(format!("unknown backend state {}", other))),
        }
    }
}

// =============================================================================
// Pool
// =============================================================================

/// A provisioning target within a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pool {
    pub name: String,
    /// Filled in by the orchestrator when the driver reports its pools
    #[serde(default)]
    pub backend_uuid: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Offer>,
    /// Per-pool defaults such as space reserve or export policy
    #[serde(default)]
    pub internal_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub supported_topologies: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub storage_classes: BTreeSet<String>,
}

impl Pool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, offer: Offer) -> Self {
        self.attributes.insert(name.to_string(), offer);
        self
    }

    pub fn with_internal_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.internal_attributes.insert(name.to_string(), value.into());
        self
    }
}

// =============================================================================
// Backend
// =============================================================================

/// A backend as held in the catalog
#[derive(Clone)]
pub struct Backend {
    pub name: String,
    pub uuid: String,
    pub driver_name: String,
    /// Absent when the driver failed to initialize
    pub driver: Option<Arc<dyn StorageDriver>>,
    pub state: BackendState,
    pub online: bool,
    /// Created directly through the API rather than from a platform config object
    pub user_managed: bool,
    pub config_ref: Option<String>,
    /// Driver configuration blob, may contain secrets
    pub config: serde_json::Value,
    pub pools: BTreeMap<String, Pool>,
    pub volumes: BTreeSet<String>,
}

impl Backend {
    pub fn driver(&self) -> Result<Arc<dyn StorageDriver>> {
        self.driver.clone().ok_or_else(|| {
            Error::FailedPrecondition(format!(
                "backend {} has no initialized driver (state {})",
                self.name, self.state
            ))
        })
    }

    pub fn is_online(&self) -> bool {
        self.state == BackendState::Online
    }

    pub fn has_volumes(&self) -> bool {
        !self.volumes.is_empty()
    }

    pub fn protocol(&self) -> Protocol {
        self.driver
            .as_ref()
            .map(|driver| driver.protocol())
            .unwrap_or_default()
    }

    pub fn storage_prefix(&self) -> Option<String> {
        self.driver.as_ref().and_then(|driver| driver.storage_prefix())
    }

    /// Form written to the store
    pub fn construct_persistent(&self) -> BackendPersistent {
        BackendPersistent {
            version: "1".to_string(),
            name: self.name.clone(),
            backend_uuid: self.uuid.clone(),
            storage_driver_name: self.driver_name.clone(),
            config: self.config.clone(),
            state: self.state,
            online: self.online,
            user_managed: self.user_managed,
            config_ref: self.config_ref.clone(),
        }
    }

    /// Form returned by the API, secrets redacted
    pub fn construct_external(&self) -> BackendExternal {
        let storage = self
            .pools
            .values()
            .map(|pool| {
                (
                    pool.name.clone(),
                    PoolExternal {
                        attributes: pool.attributes.clone(),
                        storage_classes: pool.storage_classes.iter().cloned().collect(),
                    },
                )
            })
            .collect();

        BackendExternal {
            name: self.name.clone(),
            backend_uuid: self.uuid.clone(),
            storage_driver_name: self.driver_name.clone(),
            protocol: self.protocol(),
            config: redact_config(&self.config),
            state: self.state,
            online: self.online,
            user_managed: self.user_managed,
            config_ref: self.config_ref.clone(),
            storage,
            volumes: self.volumes.iter().cloned().collect(),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .field("driver_name", &self.driver_name)
            .field("state", &self.state)
            .field("online", &self.online)
            .field("config", &super::REDACTED)
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .field("volumes", &self.volumes.len())
            .finish()
    }
}

/// Store form of a backend
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendPersistent {
    #[serde(default)]
    pub version: String,
    pub name: String,
    pub backend_uuid: String,
    pub storage_driver_name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub state: BackendState,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub user_managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<String>,
}

impl std::fmt::Debug for BackendPersistent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPersistent")
            .field("name", &self.name)
            .field("backend_uuid", &self.backend_uuid)
            .field("storage_driver_name", &self.storage_driver_name)
            .field("config", &super::REDACTED)
            .field("state", &self.state)
            .finish()
    }
}

/// API view of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolExternal {
    pub attributes: BTreeMap<String, Offer>,
    pub storage_classes: Vec<String>,
}

/// API view of a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendExternal {
    pub name: String,
    pub backend_uuid: String,
    pub storage_driver_name: String,
    pub protocol: Protocol,
    pub config: serde_json::Value,
    pub state: BackendState,
    pub online: bool,
    pub user_managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_ref: Option<String>,
    pub storage: BTreeMap<String, PoolExternal>,
    pub volumes: Vec<String>,
}
