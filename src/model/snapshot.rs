//! Snapshot Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build the composite `volume/snapshot` identifier
pub fn make_snapshot_id(volume_name: &str, snapshot_name: &str) -> String {
    format!("{}/{}", volume_name, snapshot_name)
}

/// Split a composite snapshot identifier
pub fn parse_snapshot_id(id: &str) -> Option<(&str, &str)> {
    match id.split_once('/') {
        Some((volume, snapshot)) if !volume.is_empty() && !snapshot.is_empty() => {
            Some((volume, snapshot))
        }
        _ => None,
    }
}

/// Lifecycle state of a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotState {
    #[default]
    Online,
    Creating,
    MissingBackend,
    MissingVolume,
}

impl SnapshotState {
    pub fn is_missing(&self) -> bool {
        matches!(self, SnapshotState::MissingBackend | SnapshotState::MissingVolume)
    }
}

impl std::fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotState::Online => write!(f, "online"),
            SnapshotState::Creating => write!(f, "creating"),
            SnapshotState::MissingBackend => write!(f, "missing-backend"),
            SnapshotState::MissingVolume => write!(f, "missing-volume"),
        }
    }
}

/// Requested configuration of a snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotConfig {
    #[serde(default)]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub internal_name: String,
    pub volume_name: String,
    #[serde(default)]
    pub volume_internal_name: String,
    /// Copied from the source volume when the snapshot is taken
    #[serde(default)]
    pub luks_passphrase_names: Vec<String>,
}

impl SnapshotConfig {
    pub fn new(volume_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            version: "1".to_string(),
            name: name.into(),
            volume_name: volume_name.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> String {
        make_snapshot_id(&self.volume_name, &self.name)
    }
}

/// A snapshot as held in the catalog and written to the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub config: SnapshotConfig,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub state: SnapshotState,
}

impl Snapshot {
    pub fn new(config: SnapshotConfig, created: DateTime<Utc>, size_bytes: u64) -> Self {
        Self {
            config,
            created,
            size_bytes,
            state: SnapshotState::Online,
        }
    }

    pub fn id(&self) -> String {
        self.config.id()
    }
}
