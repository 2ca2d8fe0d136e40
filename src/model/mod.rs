//! Orchestrator Entity Model
//!
//! Plain data types for backends, pools, volumes, snapshots, nodes,
//! publications, transactions and storage classes, plus the redaction
//! rules applied to every external representation.

pub mod attributes;
pub mod backend;
pub mod node;
pub mod snapshot;
pub mod storage_class;
pub mod transaction;
pub mod volume;

pub use attributes::{Offer, Request};
pub use backend::{Backend, BackendExternal, BackendPersistent, BackendState, Pool};
pub use node::{Node, VolumePublication, VolumePublishInfo};
pub use snapshot::{Snapshot, SnapshotConfig, SnapshotState};
pub use storage_class::{PoolId, StorageClass, StorageClassConfig, StorageClassExternal};
pub use transaction::{VolumeCreatingInfo, VolumeOperation, VolumeTransaction};
pub use volume::{
    AccessMode, BackendVolume, Protocol, Volume, VolumeAccessInfo, VolumeConfig, VolumeExternal,
    VolumeMode, VolumeState,
};

use serde::{Deserialize, Serialize};

/// Replacement for every secret in an external representation
pub const REDACTED: &str = "<REDACTED>";

/// Config keys whose values never leave the process unredacted
const SECRET_KEYS: &[&str] = &[
    "password",
    "chapinitiatorsecret",
    "chaptargetinitiatorsecret",
    "chapusername",
    "chaptargetusername",
    "clientprivatekey",
    "credentials",
];

/// Copy a backend config with secret values replaced
pub fn redact_config(config: &serde_json::Value) -> serde_json::Value {
    match config {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let redacted = if SECRET_KEYS.contains(&key.to_lowercase().as_str()) {
                    serde_json::Value::String(REDACTED.to_string())
                } else {
                    redact_config(value)
                };
                (key.clone(), redacted)
            })
            .collect::<serde_json::Map<_, _>>()
            .into(),
        serde_json::Value::Array(items) => items.iter().map(redact_config).collect(),
        other => other.clone(),
    }
}

pub const STORE_VERSION: &str = "orchestrator-store-v1";
pub const API_VERSION: &str = "1";

/// Persistent state version record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentStateVersion {
    pub store_version: String,
    pub api_version: String,
    #[serde(default)]
    pub publications_synced: bool,
    /// Bumped on every change to this record after creation
    #[serde(default)]
    pub revision: u64,
}

impl Default for PersistentStateVersion {
    fn default() -> Self {
        Self {
            store_version: STORE_VERSION.to_string(),
            api_version: API_VERSION.to_string(),
            publications_synced: false,
            revision: 0,
        }
    }
}
