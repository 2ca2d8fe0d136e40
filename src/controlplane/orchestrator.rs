//! Main Orchestrator - The "Brain"
//!
//! Owns the catalog, the store client and the driver factory. The mutating
//! verbs live in [`super::ops`], crash recovery in [`super::bootstrap`] and
//! [`super::transaction`]; this file holds the shared state, the readiness
//! preamble and the read-only views.

use super::catalog::Catalog;
use super::config::{FrontendContext, OrchestratorConfig};
use super::drivers::BackendFactory;
use crate::domain::ports::StoreClient;
use crate::error::{Error, Result};
use crate::model::{
    snapshot::Snapshot, BackendExternal, Node, StorageClass, StorageClassExternal, VolumeExternal,
    VolumePublication,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

// =============================================================================
// Status
// =============================================================================

/// Summary served by the health endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_error: Option<String>,
    pub frontend: FrontendContext,
    pub store_type: String,
    pub backends: usize,
    pub volumes: usize,
    pub subordinate_volumes: usize,
    pub snapshots: usize,
    pub nodes: usize,
    pub storage_classes: usize,
    pub publications: usize,
    pub publications_synced: bool,
}

// =============================================================================
// Publication Sync
// =============================================================================

/// Tracks the one-time switch to per-node publish enforcement
#[derive(Debug, Default)]
pub(crate) struct PublicationSync {
    pub synced: bool,
    pub first_successful_publish: Option<Instant>,
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn StoreClient>,
    pub(crate) factory: BackendFactory,
    pub(crate) catalog: Mutex<Catalog>,
    pub(crate) ready: AtomicBool,
    pub(crate) bootstrap_error: Mutex<Option<String>>,
    pub(crate) publication_sync: Mutex<PublicationSync>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) monitor: Mutex<Option<JoinHandle<()>>>,
    /// Clone splits started by busy snapshot deletes
    pub(crate) background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn StoreClient>,
        factory: BackendFactory,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            factory,
            catalog: Mutex::new(Catalog::new()),
            ready: AtomicBool::new(false),
            bootstrap_error: Mutex::new(None),
            publication_sync: Mutex::new(PublicationSync::default()),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn frontend(&self) -> FrontendContext {
        self.config.frontend
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.bootstrap_error.lock().is_none()
    }

    pub fn bootstrap_error(&self) -> Option<String> {
        self.bootstrap_error.lock().clone()
    }

    /// Operator hook: release the latch after fixing what bootstrap tripped on
    pub fn clear_bootstrap_error(&self) {
        if let Some(previous) = self.bootstrap_error.lock().take() {
            info!(error = %previous, "Bootstrap error cleared");
        }
    }

    pub(crate) fn latch_bootstrap_error(&self, error: &Error) {
        let mut latch = self.bootstrap_error.lock();
        if latch.is_none() {
            *latch = Some(error.to_string());
        }
    }

    /// Preamble shared by every API call
    pub(crate) fn check_ready(&self) -> Result<()> {
        if let Some(reason) = self.bootstrap_error.lock().clone() {
            return Err(Error::NotReady {
                reason: format!("bootstrap failed: {}", reason),
            });
        }
        if !self.ready.load(Ordering::SeqCst) {
            return Err(Error::NotReady {
                reason: "bootstrap has not completed".into(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_size_limit(&self, volume: &str, size_bytes: u64) -> Result<()> {
        match self.config.max_volume_size_bytes {
            Some(max) if size_bytes > max => Err(Error::UnsupportedCapacityRange(format!(
                "requested size {} bytes for volume {} exceeds the limit of {} bytes",
                size_bytes, volume, max
            ))),
            _ => Ok(()),
        }
    }

    /// Read access to the catalog for views and tests
    pub fn with_catalog<R>(&self, f: impl FnOnce(&Catalog) -> R) -> R {
        f(&self.catalog.lock())
    }

    pub fn status(&self) -> OrchestratorStatus {
        let catalog = self.catalog.lock();
        OrchestratorStatus {
            ready: self.is_ready(),
            bootstrap_error: self.bootstrap_error(),
            frontend: self.config.frontend,
            store_type: self.store.store_type().to_string(),
            backends: catalog.backends.len(),
            volumes: catalog.volumes.len(),
            subordinate_volumes: catalog.subordinate_volumes.len(),
            snapshots: catalog.snapshots.len(),
            nodes: catalog.nodes.len(),
            storage_classes: catalog.storage_classes.len(),
            publications: catalog.all_publications().len(),
            publications_synced: self.publication_sync.lock().synced,
        }
    }

    /// Wait for clone splits started by snapshot deletes
    pub async fn drain_background_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task did not complete");
            }
        }
    }

    pub(crate) fn track_background(&self, task: JoinHandle<()>) {
        let mut tasks = self.background.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    /// Stop the transaction monitor and terminate every driver
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.shutdown.cancel();
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        self.drain_background_tasks().await;

        let drivers: Vec<_> = self
            .catalog
            .lock()
            .backends
            .values()
            .filter_map(|b| b.driver.clone())
            .collect();
        for driver in drivers {
            driver.terminate().await;
        }
        self.ready.store(false, Ordering::SeqCst);
    }

    // -------------------------------------------------------------------------
    // Views
    // -------------------------------------------------------------------------

    pub fn list_backends(&self) -> Result<Vec<BackendExternal>> {
        self.check_ready()?;
        Ok(self
            .catalog
            .lock()
            .backends
            .values()
            .map(|b| b.construct_external())
            .collect())
    }

    pub fn get_backend(&self, name: &str) -> Result<BackendExternal> {
        self.check_ready()?;
        let catalog = self.catalog.lock();
        Ok(catalog.require_backend_by_name(name)?.construct_external())
    }

    pub fn get_backend_by_uuid(&self, uuid: &str) -> Result<BackendExternal> {
        self.check_ready()?;
        let catalog = self.catalog.lock();
        catalog
            .backends
            .get(uuid)
            .map(|b| b.construct_external())
            .ok_or_else(|| Error::not_found("backend", uuid))
    }

    /// Volumes and subordinate volumes
    pub fn list_volumes(&self) -> Result<Vec<VolumeExternal>> {
        self.check_ready()?;
        let catalog = self.catalog.lock();
        Ok(catalog
            .volumes
            .values()
            .chain(catalog.subordinate_volumes.values())
            .map(|v| v.construct_external())
            .collect())
    }

    pub fn get_volume(&self, name: &str) -> Result<VolumeExternal> {
        self.check_ready()?;
        self.catalog
            .lock()
            .volume_or_subordinate(name)
            .map(|v| v.construct_external())
            .ok_or_else(|| Error::not_found("volume", name))
    }

    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        self.check_ready()?;
        Ok(self.catalog.lock().snapshots.values().cloned().collect())
    }

    pub fn list_snapshots_for_volume(&self, volume: &str) -> Result<Vec<Snapshot>> {
        self.check_ready()?;
        let catalog = self.catalog.lock();
        if !catalog.volume_name_in_use(volume) {
            return Err(Error::not_found("volume", volume));
        }
        Ok(catalog.snapshots_for_volume(volume).into_iter().cloned().collect())
    }

    pub fn get_snapshot(&self, volume: &str, snapshot: &str) -> Result<Snapshot> {
        self.check_ready()?;
        self.catalog
            .lock()
            .snapshot(volume, snapshot)
            .cloned()
            .ok_or_else(|| Error::not_found("snapshot", crate::model::snapshot::make_snapshot_id(volume, snapshot)))
    }

    pub fn list_storage_classes(&self) -> Result<Vec<StorageClassExternal>> {
        self.check_ready()?;
        let catalog = self.catalog.lock();
        Ok(catalog
            .storage_classes
            .values()
            .map(|class| storage_class_external(&catalog, class))
            .collect())
    }

    pub fn get_storage_class(&self, name: &str) -> Result<StorageClassExternal> {
        self.check_ready()?;
        let catalog = self.catalog.lock();
        catalog
            .storage_classes
            .get(name)
            .map(|class| storage_class_external(&catalog, class))
            .ok_or_else(|| Error::not_found("storage class", name))
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        self.check_ready()?;
        Ok(self.catalog.lock().nodes.values().cloned().collect())
    }

    pub fn get_node(&self, name: &str) -> Result<Node> {
        self.check_ready()?;
        self.catalog
            .lock()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("node", name))
    }

    pub fn list_volume_publications(&self) -> Result<Vec<VolumePublication>> {
        self.check_ready()?;
        Ok(self.catalog.lock().all_publications())
    }

    pub fn list_volume_publications_for_volume(&self, volume: &str) -> Result<Vec<VolumePublication>> {
        self.check_ready()?;
        Ok(self.catalog.lock().publications_for_volume(volume))
    }

    pub fn list_volume_publications_for_node(&self, node: &str) -> Result<Vec<VolumePublication>> {
        self.check_ready()?;
        Ok(self.catalog.lock().publications_for_node(node))
    }

    pub fn get_volume_publication(&self, volume: &str, node: &str) -> Result<VolumePublication> {
        self.check_ready()?;
        self.catalog
            .lock()
            .publication(volume, node)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(
                    "volume publication",
                    crate::model::node::make_publication_name(volume, node),
                )
            })
    }
}

/// Pool membership of a class, keyed by backend name
fn storage_class_external(catalog: &Catalog, class: &StorageClass) -> StorageClassExternal {
    let mut storage: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for id in &class.pools {
        if let Some(backend) = catalog.backends.get(&id.backend_uuid) {
            storage
                .entry(backend.name.clone())
                .or_default()
                .push(id.pool.clone());
        }
    }
    StorageClassExternal {
        config: class.config.clone(),
        storage,
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("frontend", &self.config.frontend)
            .field("store", &self.store.store_type())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_not_ready_before_bootstrap() {
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(MemoryStore::new()),
            BackendFactory::new(),
        );
        let err = orchestrator.list_volumes().unwrap_err();
        assert!(err.is_not_ready());
        assert!(!orchestrator.status().ready);
    }

    #[tokio::test]
    async fn test_latch_keeps_first_error() {
        let orchestrator = Orchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(MemoryStore::new()),
            BackendFactory::new(),
        );
        orchestrator.ready.store(true, Ordering::SeqCst);
        orchestrator.latch_bootstrap_error(&Error::Internal("first".into()));
        orchestrator.latch_bootstrap_error(&Error::Internal("second".into()));

        let err = orchestrator.list_nodes().unwrap_err();
        assert!(err.is_not_ready());
        assert!(err.to_string().contains("first"));

        orchestrator.clear_bootstrap_error();
        assert!(orchestrator.list_nodes().unwrap().is_empty());
    }
}
