//! Volume Transactions
//!
//! A transaction is written before any driver call that mutates a volume or
//! snapshot and deleted once the entity itself is persisted. A transaction
//! that survives a restart tells bootstrap which compensation to run.

use super::snapshot::SnapshotConfig;
use super::volume::VolumeConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The mutation a transaction guards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeOperation {
    AddVolume,
    DeleteVolume,
    ResizeVolume,
    AddSnapshot,
    DeleteSnapshot,
    ImportVolume,
    UpgradeVolume,
    VolumeCreating,
}

impl VolumeOperation {
    pub fn is_snapshot_operation(&self) -> bool {
        matches!(self, VolumeOperation::AddSnapshot | VolumeOperation::DeleteSnapshot)
    }
}

impl std::fmt::Display for VolumeOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VolumeOperation::AddVolume => "addVolume",
            VolumeOperation::DeleteVolume => "deleteVolume",
            VolumeOperation::ResizeVolume => "resizeVolume",
            VolumeOperation::AddSnapshot => "addSnapshot",
            VolumeOperation::DeleteSnapshot => "deleteSnapshot",
            VolumeOperation::ImportVolume => "importVolume",
            VolumeOperation::UpgradeVolume => "upgradeVolume",
            VolumeOperation::VolumeCreating => "volumeCreating",
        };
        write!(f, "{}", name)
    }
}

/// Where a slow create is still running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCreatingInfo {
    pub backend_uuid: String,
    pub pool: String,
    pub started_at: DateTime<Utc>,
}

/// Persistent record of an in-flight mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeTransaction {
    pub op: VolumeOperation,
    pub config: VolumeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_config: Option<SnapshotConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creating: Option<VolumeCreatingInfo>,
    pub created_at: DateTime<Utc>,
}

impl VolumeTransaction {
    pub fn new(op: VolumeOperation, config: VolumeConfig) -> Self {
        Self {
            op,
            config,
            snapshot_config: None,
            creating: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_snapshot(op: VolumeOperation, config: VolumeConfig, snapshot: SnapshotConfig) -> Self {
        Self {
            snapshot_config: Some(snapshot),
            ..Self::new(op, config)
        }
    }

    /// Key of the entity this transaction guards: the snapshot ID for
    /// snapshot operations, the volume name otherwise
    pub fn name(&self) -> String {
        match (&self.op, &self.snapshot_config) {
            (op, Some(snapshot)) if op.is_snapshot_operation() => snapshot.id(),
            _ => self.config.name.clone(),
        }
    }
}
