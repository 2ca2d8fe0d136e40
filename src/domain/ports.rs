//! Domain Ports - Core trait definitions for the orchestrator
//!
//! These traits define the boundaries between the orchestrator engine and
//! the external systems it coordinates: storage drivers on one side and the
//! durable key-value store on the other.

use crate::error::{Error, Result};
use crate::model::{
    attributes::Request, node::Node, snapshot::Snapshot, volume::IscsiChapInfo,
    BackendPersistent, BackendVolume, PersistentStateVersion, Pool, Protocol, SnapshotConfig,
    StorageClassConfig, Volume, VolumeConfig, VolumePublication, VolumePublishInfo,
    VolumeTransaction,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

// =============================================================================
// Backend Update Classification
// =============================================================================

/// Bitmap describing what changed between two configs of the same backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateType(u32);

impl UpdateType {
    pub const NONE: UpdateType = UpdateType(0);
    pub const VOLUME_ACCESS_INFO_CHANGE: UpdateType = UpdateType(1);
    pub const INVALID_VOLUME_ACCESS_INFO_CHANGE: UpdateType = UpdateType(1 << 1);
    pub const USERNAME_CHANGE: UpdateType = UpdateType(1 << 2);
    pub const PASSWORD_CHANGE: UpdateType = UpdateType(1 << 3);
    pub const PREFIX_CHANGE: UpdateType = UpdateType(1 << 4);
    pub const CREDENTIALS_CHANGE: UpdateType = UpdateType(1 << 5);
    pub const INVALID_UPDATE: UpdateType = UpdateType(1 << 6);

    pub fn contains(&self, other: UpdateType) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Changes the orchestrator refuses to apply to a live backend
    pub fn is_rejected(&self) -> bool {
        self.contains(Self::INVALID_UPDATE)
            || self.contains(Self::PREFIX_CHANGE)
            || self.contains(Self::INVALID_VOLUME_ACCESS_INFO_CHANGE)
    }
}

impl std::ops::BitOr for UpdateType {
    type Output = UpdateType;

    fn bitor(self, rhs: UpdateType) -> UpdateType {
        UpdateType(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for UpdateType {
    fn bitor_assign(&mut self, rhs: UpdateType) {
        self.0 |= rhs.0;
    }
}

// =============================================================================
// Storage Driver Port
// =============================================================================

/// Port to one configured external storage system.
///
/// Drivers are shared across concurrent requests and must be safe for
/// concurrent use. Destroying a missing volume and deleting a missing
/// snapshot must succeed so compensation can be replayed.
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Driver type name, e.g. `fake`
    fn name(&self) -> &str;

    /// Configured backend name
    fn backend_name(&self) -> String;

    /// Prefix applied to internal names on the backend
    fn storage_prefix(&self) -> Option<String>;

    fn protocol(&self) -> Protocol;

    /// Name the backend will use for a new volume
    fn internal_volume_name(&self, config: &VolumeConfig) -> String {
        format!("{}{}", self.storage_prefix().unwrap_or_default(), config.name)
    }

    /// Classify the difference between this driver's config and a previous one
    fn update_type(&self, previous_config: &serde_json::Value) -> UpdateType;

    /// Validate credentials and connect
    async fn initialize(&self, backend_uuid: &str) -> Result<()>;

    async fn terminate(&self);

    /// Report the pools this backend offers
    async fn storage_backend_specs(&self) -> Result<Vec<Pool>>;

    async fn create(
        &self,
        config: &mut VolumeConfig,
        pool: &Pool,
        requests: &BTreeMap<String, Request>,
    ) -> Result<()>;

    async fn create_clone(
        &self,
        source: &VolumeConfig,
        clone: &mut VolumeConfig,
        pool: Option<&Pool>,
    ) -> Result<()>;

    /// Take over an existing backend volume, filling size and access info
    async fn import(&self, config: &mut VolumeConfig, original_name: &str) -> Result<()>;

    async fn rename(&self, name: &str, new_name: &str) -> Result<()>;

    async fn destroy(&self, config: &VolumeConfig) -> Result<()>;

    async fn resize(&self, config: &mut VolumeConfig, size_bytes: u64) -> Result<()>;

    async fn can_snapshot(&self, snapshot: &SnapshotConfig, volume: &VolumeConfig) -> Result<()>;

    async fn create_snapshot(
        &self,
        snapshot: &SnapshotConfig,
        volume: &VolumeConfig,
    ) -> Result<Snapshot>;

    async fn delete_snapshot(&self, snapshot: &SnapshotConfig, volume: &VolumeConfig) -> Result<()>;

    async fn restore_snapshot(&self, snapshot: &SnapshotConfig, volume: &VolumeConfig)
        -> Result<()>;

    async fn get_snapshot(
        &self,
        snapshot: &SnapshotConfig,
        volume: &VolumeConfig,
    ) -> Result<Option<Snapshot>>;

    async fn get_snapshots(&self, volume: &VolumeConfig) -> Result<Vec<Snapshot>>;

    /// Detach a clone from its parent snapshot
    async fn split_clone(&self, clone: &VolumeConfig) -> Result<()>;

    /// Grant host access, filling `info.access_info`
    async fn publish_volume(&self, config: &VolumeConfig, info: &mut VolumePublishInfo)
        -> Result<()>;

    async fn unpublish_volume(&self, config: &VolumeConfig, info: &VolumePublishInfo)
        -> Result<()>;

    /// Switch a volume to per-node access control
    async fn enable_publish_enforcement(&self, volume: &mut Volume) -> Result<()>;

    async fn reconcile_node_access(&self, nodes: &[Node], backend_uuid: &str) -> Result<()>;

    async fn chap_info(&self, volume: &VolumeConfig, node: &str) -> Result<IscsiChapInfo>;

    async fn get_volume_external(&self, name: &str) -> Result<BackendVolume>;

    async fn get_volume_external_wrappers(&self) -> Result<Vec<BackendVolume>>;
}

impl std::fmt::Debug for dyn StorageDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDriver")
            .field("name", &self.name())
            .field("backend", &self.backend_name())
            .field("config", &crate::model::REDACTED)
            .finish()
    }
}

// =============================================================================
// Store Port
// =============================================================================

/// Kinds of record kept in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    Version,
    Backend,
    Volume,
    Snapshot,
    StorageClass,
    Node,
    VolumePublication,
    VolumeTransaction,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Version => "version",
            RecordKind::Backend => "backend",
            RecordKind::Volume => "volume",
            RecordKind::Snapshot => "snapshot",
            RecordKind::StorageClass => "storageclass",
            RecordKind::Node => "node",
            RecordKind::VolumePublication => "publication",
            RecordKind::VolumeTransaction => "transaction",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const VERSION_KEY: &str = "version";

/// Port to the durable key-value store.
///
/// Implementations provide the record primitives; the typed per-entity
/// operations are built on top of them. Missing records must surface as
/// errors for which [`Error::is_not_found`] holds, duplicate creates as
/// [`Error::is_already_exists`].
#[async_trait]
pub trait StoreClient: Send + Sync {
    async fn create_record(&self, kind: RecordKind, key: &str, value: serde_json::Value)
        -> Result<()>;

    async fn read_record(&self, kind: RecordKind, key: &str) -> Result<serde_json::Value>;

    async fn update_record(&self, kind: RecordKind, key: &str, value: serde_json::Value)
        -> Result<()>;

    async fn delete_record(&self, kind: RecordKind, key: &str) -> Result<()>;

    async fn list_records(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>>;

    async fn delete_records(&self, kind: RecordKind) -> Result<()>;

    /// Human-readable store type for logs
    fn store_type(&self) -> &str;

    // -------------------------------------------------------------------------
    // Version
    // -------------------------------------------------------------------------

    async fn get_version(&self) -> Result<PersistentStateVersion> {
        decode(self.read_record(RecordKind::Version, VERSION_KEY).await?)
    }

    async fn set_version(&self, version: &PersistentStateVersion) -> Result<()> {
        let value = serde_json::to_value(version)?;
        match self.update_record(RecordKind::Version, VERSION_KEY, value.clone()).await {
            Err(e) if e.is_not_found() => {
                self.create_record(RecordKind::Version, VERSION_KEY, value).await
            }
            other => other,
        }
    }

    // -------------------------------------------------------------------------
    // Backends (keyed by name)
    // -------------------------------------------------------------------------

    async fn add_backend(&self, backend: &BackendPersistent) -> Result<()> {
        put(self, RecordKind::Backend, &backend.name, backend, false).await
    }

    async fn get_backend(&self, name: &str) -> Result<BackendPersistent> {
        decode(self.read_record(RecordKind::Backend, name).await?)
    }

    async fn update_backend(&self, backend: &BackendPersistent) -> Result<()> {
        put(self, RecordKind::Backend, &backend.name, backend, true).await
    }

    async fn delete_backend(&self, backend: &BackendPersistent) -> Result<()> {
        self.delete_record(RecordKind::Backend, &backend.name).await
    }

    async fn get_backends(&self) -> Result<Vec<BackendPersistent>> {
        list(self, RecordKind::Backend).await
    }

    async fn delete_backends(&self) -> Result<()> {
        self.delete_records(RecordKind::Backend).await
    }

    /// Rewrite the volumes of a backend, then swap its record.
    ///
    /// Volume write failures are fatal unless the volume is orphaned; the
    /// backend record is left as it was in that case.
    async fn replace_backend_and_update_volumes(
        &self,
        old: &BackendPersistent,
        new: &BackendPersistent,
        volumes: &[Volume],
    ) -> Result<()> {
        for volume in volumes {
            if let Err(e) = self.update_volume(volume).await {
                if volume.orphaned {
                    warn!(volume = %volume.name(), error = %e, "Failed to update orphaned volume during backend update");
                } else {
                    return Err(e);
                }
            }
        }
        if old.name == new.name {
            self.update_backend(new).await
        } else {
            self.add_backend(new).await?;
            ignore_not_found(self.delete_backend(old).await)
        }
    }

    // -------------------------------------------------------------------------
    // Volumes and subordinate volumes (keyed by name)
    // -------------------------------------------------------------------------

    async fn add_volume(&self, volume: &Volume) -> Result<()> {
        put(self, RecordKind::Volume, volume.name(), volume, false).await
    }

    async fn get_volume(&self, name: &str) -> Result<Volume> {
        decode(self.read_record(RecordKind::Volume, name).await?)
    }

    async fn update_volume(&self, volume: &Volume) -> Result<()> {
        put(self, RecordKind::Volume, volume.name(), volume, true).await
    }

    async fn delete_volume(&self, volume: &Volume) -> Result<()> {
        self.delete_record(RecordKind::Volume, volume.name()).await
    }

    async fn delete_volume_ignore_not_found(&self, name: &str) -> Result<()> {
        ignore_not_found(self.delete_record(RecordKind::Volume, name).await)
    }

    async fn get_volumes(&self) -> Result<Vec<Volume>> {
        list(self, RecordKind::Volume).await
    }

    async fn delete_volumes(&self) -> Result<()> {
        self.delete_records(RecordKind::Volume).await
    }

    // -------------------------------------------------------------------------
    // Snapshots (keyed by volume/snapshot)
    // -------------------------------------------------------------------------

    async fn add_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        put(self, RecordKind::Snapshot, &snapshot.id(), snapshot, false).await
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot> {
        decode(self.read_record(RecordKind::Snapshot, id).await?)
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        put(self, RecordKind::Snapshot, &snapshot.id(), snapshot, true).await
    }

    async fn delete_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.delete_record(RecordKind::Snapshot, &snapshot.id()).await
    }

    async fn delete_snapshot_ignore_not_found(&self, id: &str) -> Result<()> {
        ignore_not_found(self.delete_record(RecordKind::Snapshot, id).await)
    }

    async fn get_snapshots(&self) -> Result<Vec<Snapshot>> {
        list(self, RecordKind::Snapshot).await
    }

    async fn delete_snapshots(&self) -> Result<()> {
        self.delete_records(RecordKind::Snapshot).await
    }

    // -------------------------------------------------------------------------
    // Storage classes (keyed by name)
    // -------------------------------------------------------------------------

    async fn add_storage_class(&self, class: &StorageClassConfig) -> Result<()> {
        put(self, RecordKind::StorageClass, &class.name, class, false).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClassConfig> {
        decode(self.read_record(RecordKind::StorageClass, name).await?)
    }

    async fn update_storage_class(&self, class: &StorageClassConfig) -> Result<()> {
        put(self, RecordKind::StorageClass, &class.name, class, true).await
    }

    async fn delete_storage_class(&self, name: &str) -> Result<()> {
        self.delete_record(RecordKind::StorageClass, name).await
    }

    async fn get_storage_classes(&self) -> Result<Vec<StorageClassConfig>> {
        list(self, RecordKind::StorageClass).await
    }

    async fn delete_storage_classes(&self) -> Result<()> {
        self.delete_records(RecordKind::StorageClass).await
    }

    // -------------------------------------------------------------------------
    // Nodes (keyed by name)
    // -------------------------------------------------------------------------

    async fn add_or_update_node(&self, node: &Node) -> Result<()> {
        match put(self, RecordKind::Node, &node.name, node, true).await {
            Err(e) if e.is_not_found() => put(self, RecordKind::Node, &node.name, node, false).await,
            other => other,
        }
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        decode(self.read_record(RecordKind::Node, name).await?)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.delete_record(RecordKind::Node, name).await
    }

    async fn get_nodes(&self) -> Result<Vec<Node>> {
        list(self, RecordKind::Node).await
    }

    async fn delete_nodes(&self) -> Result<()> {
        self.delete_records(RecordKind::Node).await
    }

    // -------------------------------------------------------------------------
    // Volume publications (keyed by volume/node)
    // -------------------------------------------------------------------------

    async fn add_volume_publication(&self, publication: &VolumePublication) -> Result<()> {
        put(self, RecordKind::VolumePublication, &publication.name, publication, false).await
    }

    async fn get_volume_publication(&self, name: &str) -> Result<VolumePublication> {
        decode(self.read_record(RecordKind::VolumePublication, name).await?)
    }

    async fn update_volume_publication(&self, publication: &VolumePublication) -> Result<()> {
        put(self, RecordKind::VolumePublication, &publication.name, publication, true).await
    }

    async fn delete_volume_publication(&self, publication: &VolumePublication) -> Result<()> {
        self.delete_record(RecordKind::VolumePublication, &publication.name).await
    }

    async fn get_volume_publications(&self) -> Result<Vec<VolumePublication>> {
        list(self, RecordKind::VolumePublication).await
    }

    async fn delete_volume_publications(&self) -> Result<()> {
        self.delete_records(RecordKind::VolumePublication).await
    }

    // -------------------------------------------------------------------------
    // Volume transactions (keyed by the guarded entity name)
    // -------------------------------------------------------------------------

    async fn add_volume_transaction(&self, txn: &VolumeTransaction) -> Result<()> {
        put(self, RecordKind::VolumeTransaction, &txn.name(), txn, false).await
    }

    async fn update_volume_transaction(&self, txn: &VolumeTransaction) -> Result<()> {
        put(self, RecordKind::VolumeTransaction, &txn.name(), txn, true).await
    }

    async fn delete_volume_transaction(&self, txn: &VolumeTransaction) -> Result<()> {
        ignore_not_found(self.delete_record(RecordKind::VolumeTransaction, &txn.name()).await)
    }

    async fn get_volume_transactions(&self) -> Result<Vec<VolumeTransaction>> {
        list(self, RecordKind::VolumeTransaction).await
    }

    async fn delete_volume_transactions(&self) -> Result<()> {
        self.delete_records(RecordKind::VolumeTransaction).await
    }

    /// The transaction already recorded for the same entity, if any
    async fn get_existing_volume_transaction(
        &self,
        txn: &VolumeTransaction,
    ) -> Result<Option<VolumeTransaction>> {
        match self.read_record(RecordKind::VolumeTransaction, &txn.name()).await {
            Ok(value) => decode(value).map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn put<S, T>(store: &S, kind: RecordKind, key: &str, value: &T, update: bool) -> Result<()>
where
    S: StoreClient + ?Sized,
    T: Serialize + Sync,
{
    let value = serde_json::to_value(value)?;
    if update {
        store.update_record(kind, key, value).await
    } else {
        store.create_record(kind, key, value).await
    }
}

async fn list<S, T>(store: &S, kind: RecordKind) -> Result<Vec<T>>
where
    S: StoreClient + ?Sized,
    T: DeserializeOwned,
{
    store
        .list_records(kind)
        .await?
        .into_iter()
        .map(decode)
        .collect()
}

fn decode<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(Error::from)
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageDriverRef = Arc<dyn StorageDriver>;
pub type StoreClientRef = Arc<dyn StoreClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_type_flags() {
        let mut update = UpdateType::NONE;
        assert!(update.is_empty());
        update |= UpdateType::PASSWORD_CHANGE;
        assert!(update.contains(UpdateType::PASSWORD_CHANGE));
        assert!(!update.is_rejected());
        update |= UpdateType::PREFIX_CHANGE;
        assert!(update.is_rejected());
    }

    #[test]
    fn test_record_kind_names() {
        assert_eq!(RecordKind::VolumePublication.to_string(), "publication");
        assert_eq!(RecordKind::StorageClass.as_str(), "storageclass");
    }
}
