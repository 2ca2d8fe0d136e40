//! Fake Storage Driver
//!
//! An in-process driver over a simulated array. Arrays outlive driver
//! instances, so a backend re-created after a restart sees the volumes its
//! predecessor left behind. Arrays also count calls and accept injected
//! failures, panics and delays.

use crate::domain::ports::{StorageDriver, UpdateType};
use crate::error::{Error, Result};
use crate::model::{
    attributes::{Offer, Request, BACKEND_TYPE},
    node::Node,
    snapshot::make_snapshot_id,
    volume::{IscsiChapInfo, NfsAccessInfo},
    BackendVolume, Pool, Protocol, Snapshot, SnapshotConfig, Volume, VolumeAccessInfo,
    VolumeConfig, VolumePublishInfo, REDACTED,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const DRIVER_NAME: &str = "fake";

const NFS_SERVER_IP: &str = "192.0.2.10";
const ISCSI_PORTAL: &str = "192.0.2.20:3260";

// =============================================================================
// Configuration
// =============================================================================

fn default_pool_size() -> u64 {
    100 * (1 << 30)
}

/// One simulated pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FakePoolConfig {
    #[serde(default)]
    pub attributes: BTreeMap<String, Offer>,
    #[serde(default)]
    pub internal_attributes: BTreeMap<String, String>,
    #[serde(default = "default_pool_size")]
    pub size_bytes: u64,
    #[serde(default)]
    pub supported_topologies: Vec<BTreeMap<String, String>>,
}

impl Default for FakePoolConfig {
    fn default() -> Self {
        Self {
            attributes: BTreeMap::new(),
            internal_attributes: BTreeMap::new(),
            size_bytes: default_pool_size(),
            supported_topologies: Vec::new(),
        }
    }
}

/// Backend config understood by the fake driver
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FakeDriverConfig {
    #[serde(default)]
    pub version: u32,
    pub storage_driver_name: String,
    #[serde(default)]
    pub backend_name: String,
    /// Simulated array to talk to, defaults to the backend name
    #[serde(default)]
    pub instance_name: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_prefix: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub pools: BTreeMap<String, FakePoolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_snapshots_per_volume: Option<usize>,
}

impl std::fmt::Debug for FakeDriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDriverConfig")
            .field("backend_name", &self.backend_name)
            .field("instance_name", &self.instance_name)
            .field("protocol", &self.protocol)
            .field("username", &REDACTED)
            .field("password", &REDACTED)
            .field("pools", &self.pools.keys().collect::<Vec<_>>())
            .finish()
    }
}

// =============================================================================
// Simulated Array
// =============================================================================

/// A volume on a simulated array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeVolume {
    pub name: String,
    pub pool: String,
    pub size_bytes: u64,
    pub protocol: Protocol,
    /// `(parent volume, snapshot)` until the clone is split
    pub clone_of: Option<(String, String)>,
    pub hosts: BTreeSet<String>,
    pub enforced: bool,
}

#[derive(Debug, Clone)]
struct FakeSnapshot {
    size_bytes: u64,
    created: DateTime<Utc>,
}

#[derive(Default)]
struct ArrayState {
    volumes: BTreeMap<String, FakeVolume>,
    snapshots: BTreeMap<(String, String), FakeSnapshot>,
    calls: BTreeMap<String, usize>,
    failures: BTreeMap<String, String>,
    panics: BTreeSet<String>,
    delays: BTreeMap<String, Duration>,
    /// Calls a new create reports as still in progress
    create_rounds: u32,
    pending_creates: BTreeMap<String, u32>,
    reconciled_nodes: Vec<String>,
}

/// Simulated external array shared by every driver pointed at it
pub struct FakeArray {
    name: String,
    state: Mutex<ArrayState>,
}

impl FakeArray {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ArrayState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Make every call of `operation` fail until cleared
    pub fn fail(&self, operation: &str, reason: &str) {
        self.state
            .lock()
            .failures
            .insert(operation.to_string(), reason.to_string());
    }

    pub fn panic_on(&self, operation: &str) {
        self.state.lock().panics.insert(operation.to_string());
    }

    pub fn delay(&self, operation: &str, delay: Duration) {
        self.state.lock().delays.insert(operation.to_string(), delay);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.panics.clear();
        state.delays.clear();
    }

    pub fn set_create_rounds(&self, rounds: u32) {
        self.state.lock().create_rounds = rounds;
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().volumes.contains_key(name)
    }

    pub fn volume(&self, name: &str) -> Option<FakeVolume> {
        self.state.lock().volumes.get(name).cloned()
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.state.lock().volumes.keys().cloned().collect()
    }

    pub fn has_snapshot(&self, volume: &str, snapshot: &str) -> bool {
        self.state
            .lock()
            .snapshots
            .contains_key(&(volume.to_string(), snapshot.to_string()))
    }

    pub fn reconciled_nodes(&self) -> Vec<String> {
        self.state.lock().reconciled_nodes.clone()
    }

    /// Place a volume on the array outside the orchestrator, e.g. for imports
    pub fn insert_volume(&self, name: &str, pool: &str, size_bytes: u64, protocol: Protocol) {
        self.state.lock().volumes.insert(
            name.to_string(),
            FakeVolume {
                name: name.to_string(),
                pool: pool.to_string(),
                size_bytes,
                protocol,
                clone_of: None,
                hosts: BTreeSet::new(),
                enforced: false,
            },
        );
    }

    /// Record a call and apply any injected fault
    async fn enter(&self, operation: &str) -> Result<()> {
        let (delay, panics, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(operation.to_string()).or_default() += 1;
            (
                state.delays.get(operation).copied(),
                state.panics.contains(operation),
                state.failures.get(operation).cloned(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if panics {
            panic!("fake array {} panicked during {}", self.name, operation);
        }
        match failure {
            Some(reason) => Err(Error::backend_failed(&self.name, operation, reason)),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for FakeArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeArray")
            .field("name", &self.name)
            .field("volumes", &self.state.lock().volumes.len())
            .finish()
    }
}

/// Registry of simulated arrays by instance name
#[derive(Clone, Default)]
pub struct FakeArrays {
    arrays: Arc<Mutex<BTreeMap<String, Arc<FakeArray>>>>,
}

impl FakeArrays {
    pub fn new() -> Self {
        Self::default()
    }

    /// The array with this name, created on first use
    pub fn array(&self, name: &str) -> Arc<FakeArray> {
        self.arrays
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeArray::new(name)))
            .clone()
    }
}

// =============================================================================
// Fake Driver
// =============================================================================

pub struct FakeDriver {
    config: FakeDriverConfig,
    array: Arc<FakeArray>,
    backend_uuid: Mutex<String>,
}

impl FakeDriver {
    pub fn from_config(config: &serde_json::Value, arrays: &FakeArrays) -> Result<Self> {
        let mut config: FakeDriverConfig = serde_json::from_value(config.clone())
            .map_err(|e| Error::Configuration(format!("invalid fake driver config: {}", e)))?;
        if config.instance_name.is_empty() {
            config.instance_name = config.backend_name.clone();
        }
        if config.instance_name.is_empty() {
            return Err(Error::Configuration(
                "fake driver config needs an instanceName or backendName".into(),
            ));
        }
        let array = arrays.array(&config.instance_name);
        Ok(Self {
            config,
            array,
            backend_uuid: Mutex::new(String::new()),
        })
    }

    pub fn array(&self) -> &Arc<FakeArray> {
        &self.array
    }

    fn pool_used(state: &ArrayState, pool: &str) -> u64 {
        state
            .volumes
            .values()
            .filter(|v| v.pool == pool)
            .map(|v| v.size_bytes)
            .sum()
    }

    fn check_capacity(&self, state: &ArrayState, pool: &str, extra_bytes: u64) -> Result<()> {
        let pool_config = self.config.pools.get(pool).ok_or_else(|| {
            Error::backend_failed(&self.config.backend_name, "create", format!("pool {} does not exist", pool))
        })?;
        let used = Self::pool_used(state, pool);
        if used.saturating_add(extra_bytes) > pool_config.size_bytes {
            return Err(Error::backend_failed(
                &self.config.backend_name,
                "create",
                format!(
                    "insufficient free space in pool {}: requested {} bytes, {} bytes free",
                    pool,
                    extra_bytes,
                    pool_config.size_bytes.saturating_sub(used)
                ),
            ));
        }
        Ok(())
    }

    fn effective_protocol(&self, config: &VolumeConfig) -> Protocol {
        match config.protocol {
            Protocol::Any => self.config.protocol,
            protocol => protocol,
        }
    }

    fn access_info(&self, volume: &FakeVolume, lun: i32, enforcement: bool) -> VolumeAccessInfo {
        let mut info = VolumeAccessInfo {
            publish_enforcement: enforcement,
            ..Default::default()
        };
        match volume.protocol {
            Protocol::Block => {
                info.iscsi.iscsi_target_portal = ISCSI_PORTAL.to_string();
                info.iscsi.iscsi_portals = vec![ISCSI_PORTAL.to_string()];
                info.iscsi.iscsi_target_iqn = format!("iqn.2026-01.io.fake:{}", self.array.name());
                info.iscsi.iscsi_lun_number = lun;
                info.iscsi.iscsi_igroup = format!("{}-igroup", self.config.backend_name);
                info.iscsi.iscsi_lun_serial = format!("fake-{}", volume.name);
                if !self.config.username.is_empty() {
                    info.iscsi.chap = self.chap();
                }
            }
            _ => {
                info.nfs = NfsAccessInfo {
                    nfs_server_ip: NFS_SERVER_IP.to_string(),
                    nfs_path: format!("/{}", volume.name),
                    mount_options: String::new(),
                };
            }
        }
        info
    }

    fn chap(&self) -> IscsiChapInfo {
        IscsiChapInfo {
            use_chap: true,
            iscsi_username: self.config.username.clone(),
            iscsi_initiator_secret: self.config.password.clone(),
            iscsi_target_username: format!("{}-target", self.config.username),
            iscsi_target_secret: format!("{}-target", self.config.password),
        }
    }

    fn missing_volume(name: &str) -> Error {
        Error::not_found("backend volume", name)
    }
}

impl std::fmt::Debug for FakeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeDriver")
            .field("config", &self.config)
            .field("array", &self.array.name())
            .finish()
    }
}

#[async_trait]
impl StorageDriver for FakeDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn backend_name(&self) -> String {
        self.config.backend_name.clone()
    }

    fn storage_prefix(&self) -> Option<String> {
        self.config.storage_prefix.clone()
    }

    fn protocol(&self) -> Protocol {
        self.config.protocol
    }

    fn update_type(&self, previous_config: &serde_json::Value) -> UpdateType {
        let previous: FakeDriverConfig = match serde_json::from_value(previous_config.clone()) {
            Ok(previous) => previous,
            Err(_) => return UpdateType::INVALID_UPDATE,
        };

        let mut update = UpdateType::NONE;
        if previous.username != self.config.username {
            update |= UpdateType::USERNAME_CHANGE;
        }
        if previous.password != self.config.password {
            update |= UpdateType::PASSWORD_CHANGE;
        }
        if previous.storage_prefix != self.config.storage_prefix {
            update |= UpdateType::PREFIX_CHANGE;
        }
        if previous.protocol != self.config.protocol {
            update |= UpdateType::INVALID_VOLUME_ACCESS_INFO_CHANGE;
        }
        let previous_instance = if previous.instance_name.is_empty() {
            previous.backend_name
        } else {
            previous.instance_name
        };
        if previous_instance != self.config.instance_name {
            update |= UpdateType::INVALID_UPDATE;
        }
        update
    }

    async fn initialize(&self, backend_uuid: &str) -> Result<()> {
        self.array.enter("initialize").await?;
        *self.backend_uuid.lock() = backend_uuid.to_string();
        info!(backend = %self.config.backend_name, array = %self.array.name(), "Fake driver initialized");
        Ok(())
    }

    async fn terminate(&self) {
        let _ = self.array.enter("terminate").await;
    }

    async fn storage_backend_specs(&self) -> Result<Vec<Pool>> {
        self.array.enter("storage_backend_specs").await?;
        let backend_uuid = self.backend_uuid.lock().clone();
        Ok(self
            .config
            .pools
            .iter()
            .map(|(name, pool)| {
                let mut attributes = pool.attributes.clone();
                attributes
                    .entry(BACKEND_TYPE.to_string())
                    .or_insert_with(|| Offer::string([DRIVER_NAME]));
                Pool {
                    name: name.clone(),
                    backend_uuid: backend_uuid.clone(),
                    attributes,
                    internal_attributes: pool.internal_attributes.clone(),
                    supported_topologies: pool.supported_topologies.clone(),
                    storage_classes: BTreeSet::new(),
                }
            })
            .collect())
    }

    async fn create(
        &self,
        config: &mut VolumeConfig,
        pool: &Pool,
        _requests: &BTreeMap<String, Request>,
    ) -> Result<()> {
        self.array.enter("create").await?;
        let name = config.internal_name.clone();
        let mut state = self.array.state.lock();

        if let Some(rounds) = state.pending_creates.get_mut(&name) {
            if *rounds > 1 {
                *rounds -= 1;
                return Err(Error::VolumeCreating { name: config.name.clone() });
            }
            state.pending_creates.remove(&name);
        } else if state.volumes.contains_key(&name) {
            return Err(Error::backend_failed(
                &self.config.backend_name,
                "create",
                format!("volume {} already exists", name),
            ));
        } else {
            self.check_capacity(&state, &pool.name, config.size_bytes)?;
            if state.create_rounds > 0 {
                let rounds = state.create_rounds;
                state.pending_creates.insert(name, rounds);
                return Err(Error::VolumeCreating { name: config.name.clone() });
            }
        }

        let protocol = self.effective_protocol(config);
        state.volumes.insert(
            name.clone(),
            FakeVolume {
                name: name.clone(),
                pool: pool.name.clone(),
                size_bytes: config.size_bytes,
                protocol,
                clone_of: None,
                hosts: BTreeSet::new(),
                enforced: false,
            },
        );
        config.protocol = protocol;
        debug!(volume = %name, pool = %pool.name, "Fake volume created");
        Ok(())
    }

    async fn create_clone(
        &self,
        source: &VolumeConfig,
        clone: &mut VolumeConfig,
        pool: Option<&Pool>,
    ) -> Result<()> {
        self.array.enter("create_clone").await?;
        let mut state = self.array.state.lock();

        let parent = state
            .volumes
            .get(&source.internal_name)
            .cloned()
            .ok_or_else(|| Self::missing_volume(&source.internal_name))?;
        if state.volumes.contains_key(&clone.internal_name) {
            return Err(Error::backend_failed(
                &self.config.backend_name,
                "create_clone",
                format!("volume {} already exists", clone.internal_name),
            ));
        }

        let clone_of = match &clone.clone_source_snapshot {
            Some(snapshot) => {
                let key = (parent.name.clone(), snapshot.clone());
                if !state.snapshots.contains_key(&key) {
                    return Err(Error::not_found("backend snapshot", make_snapshot_id(&parent.name, snapshot)));
                }
                Some(key)
            }
            None => None,
        };

        let pool_name = pool.map(|p| p.name.clone()).unwrap_or_else(|| parent.pool.clone());
        if clone.size_bytes < parent.size_bytes {
            clone.size_bytes = parent.size_bytes;
        }
        self.check_capacity(&state, &pool_name, clone.size_bytes)?;

        clone.protocol = parent.protocol;
        state.volumes.insert(
            clone.internal_name.clone(),
            FakeVolume {
                name: clone.internal_name.clone(),
                pool: pool_name,
                size_bytes: clone.size_bytes,
                protocol: parent.protocol,
                clone_of,
                hosts: BTreeSet::new(),
                enforced: false,
            },
        );
        Ok(())
    }

    async fn import(&self, config: &mut VolumeConfig, original_name: &str) -> Result<()> {
        self.array.enter("import").await?;
        let state = self.array.state.lock();
        let volume = state
            .volumes
            .get(original_name)
            .ok_or_else(|| Self::missing_volume(original_name))?;
        config.size_bytes = volume.size_bytes;
        config.protocol = volume.protocol;
        Ok(())
    }

    async fn rename(&self, name: &str, new_name: &str) -> Result<()> {
        self.array.enter("rename").await?;
        let mut state = self.array.state.lock();
        if state.volumes.contains_key(new_name) {
            return Err(Error::already_exists("backend volume", new_name));
        }
        let mut volume = state
            .volumes
            .remove(name)
            .ok_or_else(|| Self::missing_volume(name))?;
        volume.name = new_name.to_string();
        state.volumes.insert(new_name.to_string(), volume);
        Ok(())
    }

    async fn destroy(&self, config: &VolumeConfig) -> Result<()> {
        self.array.enter("destroy").await?;
        let mut state = self.array.state.lock();
        let name = &config.internal_name;
        state.pending_creates.remove(name);
        if state.volumes.remove(name).is_some() {
            state.snapshots.retain(|(volume, _), _| volume != name);
            debug!(volume = %name, "Fake volume destroyed");
        }
        Ok(())
    }

    async fn resize(&self, config: &mut VolumeConfig, size_bytes: u64) -> Result<()> {
        self.array.enter("resize").await?;
        let mut state = self.array.state.lock();
        let volume = state
            .volumes
            .get(&config.internal_name)
            .cloned()
            .ok_or_else(|| Self::missing_volume(&config.internal_name))?;
        if size_bytes < volume.size_bytes {
            return Err(Error::UnsupportedCapacityRange(format!(
                "cannot shrink {} from {} to {} bytes",
                volume.name, volume.size_bytes, size_bytes
            )));
        }
        self.check_capacity(&state, &volume.pool, size_bytes - volume.size_bytes)?;
        if let Some(volume) = state.volumes.get_mut(&config.internal_name) {
            volume.size_bytes = size_bytes;
        }
        config.size_bytes = size_bytes;
        Ok(())
    }

    async fn can_snapshot(&self, _snapshot: &SnapshotConfig, volume: &VolumeConfig) -> Result<()> {
        self.array.enter("can_snapshot").await?;
        if self.has_volume_named(&volume.internal_name) {
            Ok(())
        } else {
            Err(Self::missing_volume(&volume.internal_name))
        }
    }

    async fn create_snapshot(&self, snapshot: &SnapshotConfig, volume: &VolumeConfig) -> Result<Snapshot> {
        self.array.enter("create_snapshot").await?;
        let mut state = self.array.state.lock();
        let parent = state
            .volumes
            .get(&volume.internal_name)
            .cloned()
            .ok_or_else(|| Self::missing_volume(&volume.internal_name))?;

        if let Some(max) = self.config.max_snapshots_per_volume {
            let count = state.snapshots.keys().filter(|(v, _)| *v == parent.name).count();
            if count >= max {
                return Err(Error::MaxLimitReached(format!(
                    "volume {} already has {} snapshots",
                    parent.name, count
                )));
            }
        }

        let created = Utc::now();
        state.snapshots.insert(
            (parent.name.clone(), snapshot.internal_name.clone()),
            FakeSnapshot {
                size_bytes: parent.size_bytes,
                created,
            },
        );
        Ok(Snapshot::new(snapshot.clone(), created, parent.size_bytes))
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotConfig, volume: &VolumeConfig) -> Result<()> {
        self.array.enter("delete_snapshot").await?;
        let mut state = self.array.state.lock();
        let key = (volume.internal_name.clone(), snapshot.internal_name.clone());

        if let Some(clone) = state.volumes.values().find(|v| v.clone_of.as_ref() == Some(&key)) {
            return Err(Error::SnapshotBusy {
                snapshot: snapshot.id(),
                reason: format!("clone {} still depends on it", clone.name),
            });
        }
        state.snapshots.remove(&key);
        Ok(())
    }

    async fn restore_snapshot(&self, snapshot: &SnapshotConfig, volume: &VolumeConfig) -> Result<()> {
        self.array.enter("restore_snapshot").await?;
        let mut state = self.array.state.lock();
        let key = (volume.internal_name.clone(), snapshot.internal_name.clone());
        let size = state
            .snapshots
            .get(&key)
            .map(|s| s.size_bytes)
            .ok_or_else(|| Error::not_found("backend snapshot", snapshot.id()))?;
        let target = state
            .volumes
            .get_mut(&volume.internal_name)
            .ok_or_else(|| Self::missing_volume(&volume.internal_name))?;
        target.size_bytes = size;
        Ok(())
    }

    async fn get_snapshot(&self, snapshot: &SnapshotConfig, volume: &VolumeConfig) -> Result<Option<Snapshot>> {
        self.array.enter("get_snapshot").await?;
        let state = self.array.state.lock();
        let key = (volume.internal_name.clone(), snapshot.internal_name.clone());
        Ok(state
            .snapshots
            .get(&key)
            .map(|s| Snapshot::new(snapshot.clone(), s.created, s.size_bytes)))
    }

    async fn get_snapshots(&self, volume: &VolumeConfig) -> Result<Vec<Snapshot>> {
        self.array.enter("get_snapshots").await?;
        let state = self.array.state.lock();
        Ok(state
            .snapshots
            .iter()
            .filter(|((v, _), _)| *v == volume.internal_name)
            .map(|((_, name), s)| {
                let mut config = SnapshotConfig::new(&volume.name, name);
                config.internal_name = name.clone();
                config.volume_internal_name = volume.internal_name.clone();
                Snapshot::new(config, s.created, s.size_bytes)
            })
            .collect())
    }

    async fn split_clone(&self, clone: &VolumeConfig) -> Result<()> {
        self.array.enter("split_clone").await?;
        let mut state = self.array.state.lock();
        let volume = state
            .volumes
            .get_mut(&clone.internal_name)
            .ok_or_else(|| Self::missing_volume(&clone.internal_name))?;
        volume.clone_of = None;
        info!(volume = %clone.internal_name, "Fake clone split from parent snapshot");
        Ok(())
    }

    async fn publish_volume(&self, config: &VolumeConfig, info: &mut VolumePublishInfo) -> Result<()> {
        self.array.enter("publish_volume").await?;
        let mut state = self.array.state.lock();
        let lun = state
            .volumes
            .keys()
            .position(|name| *name == config.internal_name)
            .unwrap_or(0) as i32;
        let volume = state
            .volumes
            .get_mut(&config.internal_name)
            .ok_or_else(|| Self::missing_volume(&config.internal_name))?;
        volume.hosts.insert(info.host_name.clone());
        let volume = volume.clone();
        info.access_info = self.access_info(&volume, lun, config.access_info.publish_enforcement);
        Ok(())
    }

    async fn unpublish_volume(&self, config: &VolumeConfig, info: &VolumePublishInfo) -> Result<()> {
        self.array.enter("unpublish_volume").await?;
        let mut state = self.array.state.lock();
        if let Some(volume) = state.volumes.get_mut(&config.internal_name) {
            // Sibling subordinates on the same host keep the export rule
            if info.last_publication {
                volume.hosts.remove(&info.host_name);
            }
        }
        Ok(())
    }

    async fn enable_publish_enforcement(&self, volume: &mut Volume) -> Result<()> {
        self.array.enter("enable_publish_enforcement").await?;
        let mut state = self.array.state.lock();
        let backend_volume = state
            .volumes
            .get_mut(&volume.config.internal_name)
            .ok_or_else(|| Self::missing_volume(&volume.config.internal_name))?;
        backend_volume.enforced = true;
        volume.config.access_info.publish_enforcement = true;
        Ok(())
    }

    async fn reconcile_node_access(&self, nodes: &[Node], _backend_uuid: &str) -> Result<()> {
        self.array.enter("reconcile_node_access").await?;
        self.array.state.lock().reconciled_nodes = nodes.iter().map(|n| n.name.clone()).collect();
        Ok(())
    }

    async fn chap_info(&self, volume: &VolumeConfig, _node: &str) -> Result<IscsiChapInfo> {
        self.array.enter("chap_info").await?;
        if self.effective_protocol(volume) != Protocol::Block {
            return Err(Error::FailedPrecondition(format!(
                "volume {} is not an iSCSI volume",
                volume.name
            )));
        }
        Ok(self.chap())
    }

    async fn get_volume_external(&self, name: &str) -> Result<BackendVolume> {
        self.array.enter("get_volume_external").await?;
        let state = self.array.state.lock();
        state
            .volumes
            .get(name)
            .map(to_backend_volume)
            .ok_or_else(|| Self::missing_volume(name))
    }

    async fn get_volume_external_wrappers(&self) -> Result<Vec<BackendVolume>> {
        self.array.enter("get_volume_external_wrappers").await?;
        Ok(self.array.state.lock().volumes.values().map(to_backend_volume).collect())
    }
}

impl FakeDriver {
    fn has_volume_named(&self, name: &str) -> bool {
        self.array.has_volume(name)
    }
}

fn to_backend_volume(volume: &FakeVolume) -> BackendVolume {
    BackendVolume {
        internal_name: volume.name.clone(),
        size_bytes: volume.size_bytes,
        pool: volume.pool.clone(),
        protocol: volume.protocol,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attributes::IOPS;
    use serde_json::json;

    fn driver(arrays: &FakeArrays) -> FakeDriver {
        let config = json!({
            "storageDriverName": "fake",
            "backendName": "fast-a",
            "protocol": "file",
            "username": "admin",
            "password": "secret",
            "pools": {
                "FastSmall": {
                    "attributes": {"IOPS": {"type": "int", "min": 1000, "max": 10000}},
                    "sizeBytes": 2147483648u64
                }
            },
            "maxSnapshotsPerVolume": 1
        });
        FakeDriver::from_config(&config, arrays).unwrap()
    }

    fn volume_config(name: &str, size: u64) -> VolumeConfig {
        let mut config = VolumeConfig::new(name, size, "fast");
        config.internal_name = name.to_string();
        config
    }

    #[tokio::test]
    async fn test_pools_and_capacity() {
        let arrays = FakeArrays::new();
        let driver = driver(&arrays);
        driver.initialize("uuid-1").await.unwrap();
        let pools = driver.storage_backend_specs().await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].backend_uuid, "uuid-1");
        assert!(pools[0].attributes.contains_key(IOPS));
        assert!(pools[0].attributes.contains_key(BACKEND_TYPE));

        let mut small = volume_config("small", 1 << 30);
        driver.create(&mut small, &pools[0], &BTreeMap::new()).await.unwrap();
        assert_eq!(small.protocol, Protocol::File);

        let mut large = volume_config("large", 100 << 30);
        let err = driver.create(&mut large, &pools[0], &BTreeMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("insufficient free space"));
    }

    #[tokio::test]
    async fn test_busy_snapshot_until_split() {
        let arrays = FakeArrays::new();
        let driver = driver(&arrays);
        driver.initialize("uuid-1").await.unwrap();
        let pool = driver.storage_backend_specs().await.unwrap().remove(0);

        let mut parent = volume_config("parent", 1 << 20);
        driver.create(&mut parent, &pool, &BTreeMap::new()).await.unwrap();
        let mut snap = SnapshotConfig::new("parent", "snap");
        snap.internal_name = "snap".into();
        driver.create_snapshot(&snap, &parent).await.unwrap();

        let second = SnapshotConfig::new("parent", "snap-2");
        assert!(driver.create_snapshot(&second, &parent).await.unwrap_err().is_max_limit_reached());

        let mut clone = volume_config("clone", 0);
        clone.clone_source_volume = Some("parent".into());
        clone.clone_source_snapshot = Some("snap".into());
        driver.create_clone(&parent, &mut clone, None).await.unwrap();
        assert_eq!(clone.size_bytes, 1 << 20);

        assert!(driver.delete_snapshot(&snap, &parent).await.unwrap_err().is_snapshot_busy());
        driver.split_clone(&clone).await.unwrap();
        driver.delete_snapshot(&snap, &parent).await.unwrap();
        assert!(!arrays.array("fast-a").has_snapshot("parent", "snap"));
    }

    #[tokio::test]
    async fn test_create_rounds_then_success() {
        let arrays = FakeArrays::new();
        let driver = driver(&arrays);
        let pool = driver.storage_backend_specs().await.unwrap().remove(0);
        arrays.array("fast-a").set_create_rounds(2);

        let mut config = volume_config("slow", 1 << 20);
        for _ in 0..2 {
            let err = driver.create(&mut config, &pool, &BTreeMap::new()).await.unwrap_err();
            assert!(err.is_volume_creating());
        }
        driver.create(&mut config, &pool, &BTreeMap::new()).await.unwrap();
        assert!(arrays.array("fast-a").has_volume("slow"));
    }

    #[tokio::test]
    async fn test_injected_failure_and_destroy_idempotent() {
        let arrays = FakeArrays::new();
        let driver = driver(&arrays);
        let array = arrays.array("fast-a");
        array.fail("destroy", "array offline");
        let config = volume_config("ghost", 1);
        assert!(driver.destroy(&config).await.is_err());
        array.clear_faults();
        driver.destroy(&config).await.unwrap();
        assert_eq!(array.call_count("destroy"), 2);
    }

    #[test]
    fn test_update_type() {
        let arrays = FakeArrays::new();
        let driver = driver(&arrays);
        let previous = json!({
            "storageDriverName": "fake",
            "backendName": "fast-a",
            "protocol": "file",
            "username": "admin",
            "password": "old"
        });
        let update = driver.update_type(&previous);
        assert!(update.contains(UpdateType::PASSWORD_CHANGE));
        assert!(!update.is_rejected());

        let moved = json!({"storageDriverName": "fake", "backendName": "other", "protocol": "file", "username": "admin", "password": "secret"});
        assert!(driver.update_type(&moved).is_rejected());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let arrays = FakeArrays::new();
        let rendered = format!("{:?}", driver(&arrays));
        assert!(!rendered.contains("secret"));
    }
}
