//! Bootstrap
//!
//! Rebuilds the catalog from the store after a restart, then replays any
//! transaction records left behind by the previous process.

use super::catalog::Catalog;
use super::context::RequestContext;
use super::drivers;
use super::orchestrator::{Orchestrator, PublicationSync};
use super::selector;
use super::transaction::CompensationScope;
use crate::error::{Error, Result};
use crate::model::{
    Backend, BackendPersistent, BackendState, SnapshotState, StorageClass, VolumeOperation,
    VolumeState,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl Orchestrator {
    /// Load persistent state and recover from interrupted operations.
    ///
    /// A failed transaction replay does not stop bootstrap; the first such
    /// failure is latched and returned, and every API call reports it until
    /// [`Orchestrator::clear_bootstrap_error`] is called.
    pub async fn bootstrap(self: &Arc<Self>, monitor_transactions: bool) -> Result<()> {
        info!(
            store = %self.store.store_type(),
            frontend = %self.config.frontend,
            "Bootstrapping orchestrator"
        );
        self.ready.store(false, Ordering::SeqCst);
        *self.catalog.lock() = Catalog::new();
        let ctx = RequestContext::with_token(self.shutdown.child_token());

        if let Err(e) = self.load_state(&ctx).await {
            error!(error = %e, "Failed to load persistent state");
            self.latch_bootstrap_error(&e);
            return Err(e);
        }

        let replayed = self.replay_transactions(&ctx, monitor_transactions).await;
        self.remove_drained_backends(&ctx).await;

        if let Err(e) = self.catalog.lock().check_backend_links() {
            error!(error = %e, "Catalog is inconsistent after bootstrap");
            self.latch_bootstrap_error(&e);
        }

        self.ready.store(true, Ordering::SeqCst);
        if monitor_transactions {
            self.spawn_transaction_monitor();
        }

        match replayed {
            Ok(()) => {
                let status = self.status();
                info!(
                    backends = status.backends,
                    volumes = status.volumes,
                    snapshots = status.snapshots,
                    storage_classes = status.storage_classes,
                    "Orchestrator bootstrapped"
                );
                match self.bootstrap_error() {
                    Some(reason) => Err(Error::NotReady { reason }),
                    None => Ok(()),
                }
            }
            Err(e) => {
                self.latch_bootstrap_error(&e);
                Err(e)
            }
        }
    }

    async fn load_state(&self, ctx: &RequestContext) -> Result<()> {
        self.load_version().await?;
        self.load_backends(ctx).await?;
        self.load_volumes().await?;
        self.load_storage_classes().await?;
        self.load_snapshots().await?;
        self.load_nodes_and_publications().await?;
        self.reconcile_all_node_access(ctx).await;
        Ok(())
    }

    async fn load_version(&self) -> Result<()> {
        let synced = match self.store.get_version().await {
            Ok(version) => version.publications_synced,
            Err(e) if e.is_not_found() => {
                self.store.set_version(&Default::default()).await?;
                false
            }
            Err(e) => return Err(e),
        };
        *self.publication_sync.lock() = PublicationSync {
            synced,
            first_successful_publish: None,
        };
        Ok(())
    }

    async fn load_backends(&self, ctx: &RequestContext) -> Result<()> {
        for persistent in tolerate(self.store.get_backends().await)? {
            let backend = self.restore_backend(ctx, persistent).await;
            debug!(backend = %backend.name, state = %backend.state, "Loaded backend");
            self.catalog.lock().backends.insert(backend.uuid.clone(), backend);
        }
        Ok(())
    }

    /// Rebuild a backend; a driver that fails to start leaves it `failed`
    async fn restore_backend(&self, ctx: &RequestContext, persistent: BackendPersistent) -> Backend {
        let mut backend = Backend {
            name: persistent.name.clone(),
            uuid: persistent.backend_uuid.clone(),
            driver_name: persistent.storage_driver_name.clone(),
            driver: None,
            state: BackendState::Failed,
            online: false,
            user_managed: persistent.user_managed,
            config_ref: persistent.config_ref.clone(),
            config: persistent.config.clone(),
            pools: BTreeMap::new(),
            volumes: BTreeSet::new(),
        };

        match self.start_driver(ctx, &persistent.config, &persistent.backend_uuid).await {
            Ok((driver, pools)) => {
                backend.driver = Some(driver);
                backend.pools = pools;
                backend.state = match persistent.state {
                    BackendState::Deleting | BackendState::Offline => persistent.state,
                    _ => BackendState::Online,
                };
                backend.online = backend.state == BackendState::Online;
            }
            Err(e) => {
                warn!(backend = %persistent.name, error = %e, "Backend failed to initialize, marking it failed");
            }
        }
        backend
    }

    async fn load_volumes(&self) -> Result<()> {
        let (subordinates, volumes): (Vec<_>, Vec<_>) = tolerate(self.store.get_volumes().await)?
            .into_iter()
            .partition(|v| v.is_subordinate());

        let mut dangling = Vec::new();
        {
            let mut catalog = self.catalog.lock();
            for mut volume in volumes {
                match catalog.backends.get(&volume.backend_uuid) {
                    None => {
                        warn!(volume = %volume.name(), backend_uuid = %volume.backend_uuid, "Volume's backend is missing");
                        volume.state = VolumeState::MissingBackend;
                    }
                    Some(backend) => {
                        volume.orphaned = backend.driver.is_none();
                        if volume.orphaned {
                            warn!(
                                volume = %volume.name(),
                                internal_name = %volume.config.internal_name,
                                backend = %backend.name,
                                "Volume's backend failed to start, volume is orphaned"
                            );
                        }
                        if volume.state.is_missing() {
                            volume.state = VolumeState::Online;
                        }
                    }
                }
                volume.config.subordinate_volumes.clear();
                catalog.insert_volume(volume);
            }

            for subordinate in subordinates {
                let source = subordinate.config.share_source_volume.clone().unwrap_or_default();
                match catalog.volumes.get_mut(&source) {
                    Some(source) => {
                        source
                            .config
                            .subordinate_volumes
                            .insert(subordinate.name().to_string());
                    }
                    None => {
                        dangling.push(subordinate.name().to_string());
                        continue;
                    }
                }
                catalog.insert_volume(subordinate);
            }
        }

        for name in dangling {
            warn!(volume = %name, "Removing subordinate volume whose source is gone");
            self.store.delete_volume_ignore_not_found(&name).await?;
        }
        Ok(())
    }

    async fn load_storage_classes(&self) -> Result<()> {
        let configs = tolerate(self.store.get_storage_classes().await)?;
        let mut catalog = self.catalog.lock();
        for config in configs {
            let name = config.name.clone();
            match StorageClass::new(config) {
                Ok(class) => {
                    catalog.storage_classes.insert(name, class);
                }
                Err(e) => warn!(storage_class = %name, error = %e, "Skipping invalid storage class"),
            }
        }
        selector::reconcile_all(&mut catalog);
        Ok(())
    }

    async fn load_snapshots(&self) -> Result<()> {
        let snapshots = tolerate(self.store.get_snapshots().await)?;
        let mut catalog = self.catalog.lock();
        for mut snapshot in snapshots {
            let volume = catalog.volumes.get(&snapshot.config.volume_name);
            snapshot.state = match volume {
                None => SnapshotState::MissingVolume,
                Some(volume) if !catalog.backends.contains_key(&volume.backend_uuid) => {
                    SnapshotState::MissingBackend
                }
                Some(_) if snapshot.state.is_missing() => SnapshotState::Online,
                Some(_) => snapshot.state,
            };
            if snapshot.state.is_missing() {
                warn!(snapshot = %snapshot.id(), state = %snapshot.state, "Snapshot lost its parent");
            }
            catalog.snapshots.insert(snapshot.id(), snapshot);
        }
        Ok(())
    }

    async fn load_nodes_and_publications(&self) -> Result<()> {
        let nodes = tolerate(self.store.get_nodes().await)?;
        let publications = tolerate(self.store.get_volume_publications().await)?;
        let mut catalog = self.catalog.lock();
        for node in nodes {
            catalog.nodes.insert(node.name.clone(), node);
        }
        for publication in publications {
            catalog.insert_publication(publication);
        }
        Ok(())
    }

    /// Compensate every surviving transaction, keeping young creates when
    /// the monitor will look after them
    async fn replay_transactions(&self, ctx: &RequestContext, monitor_transactions: bool) -> Result<()> {
        let mut first_error = None;
        for txn in tolerate(self.store.get_volume_transactions().await)? {
            if txn.op == VolumeOperation::VolumeCreating && monitor_transactions && !self.is_expired(&txn) {
                debug!(volume = %txn.name(), "Leaving volume creation to the transaction monitor");
                continue;
            }
            match self.compensate(ctx, &txn, CompensationScope::Recovery).await {
                Ok(()) => info!(transaction = %txn.name(), op = %txn.op, "Recovered interrupted operation"),
                Err(e) => {
                    error!(transaction = %txn.name(), op = %txn.op, error = %e, "Failed to recover interrupted operation");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Register the backends and storage classes listed in the config that
    /// the store does not already know. Failures are logged per entry.
    pub async fn apply_configured_resources(&self) -> usize {
        let ctx = RequestContext::with_token(self.shutdown.child_token());
        let mut applied = 0;

        for config in &self.config.backends {
            let Some(name) = drivers::backend_name(config) else {
                warn!("Configured backend has no {}, skipping", drivers::BACKEND_NAME_KEY);
                continue;
            };
            if self.catalog.lock().backend_by_name(&name).is_some() {
                debug!(backend = %name, "Configured backend already present");
                continue;
            }
            match self.add_backend(&ctx, config.clone(), None).await {
                Ok(_) => applied += 1,
                Err(e) => warn!(backend = %name, error = %e, "Failed to add configured backend"),
            }
        }

        for class in &self.config.storage_classes {
            if self.catalog.lock().storage_classes.contains_key(&class.name) {
                debug!(storage_class = %class.name, "Configured storage class already present");
                continue;
            }
            match self.add_storage_class(class.clone()).await {
                Ok(_) => applied += 1,
                Err(e) => warn!(storage_class = %class.name, error = %e, "Failed to add configured storage class"),
            }
        }
        applied
    }

    /// Delete backends marked for deletion that no longer hold volumes
    async fn remove_drained_backends(&self, ctx: &RequestContext) {
        let drained: Vec<Backend> = {
            let catalog = self.catalog.lock();
            catalog
                .backends
                .values()
                .filter(|b| b.state == BackendState::Deleting && !catalog.backend_in_use(&b.uuid))
                .cloned()
                .collect()
        };
        for backend in drained {
            if let Err(e) = self.remove_backend(ctx, &backend).await {
                warn!(backend = %backend.name, error = %e, "Failed to remove drained backend");
            }
        }
    }
}

/// An empty store is legal
fn tolerate<T>(result: Result<Vec<T>>) -> Result<Vec<T>> {
    match result {
        Err(e) if e.is_not_found() => Ok(Vec::new()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use crate::controlplane::test_utils::{harness, harness_with, Harness};
    use crate::domain::ports::{RecordKind, StoreClient};
    use crate::model::{
        BackendState, SnapshotState, Volume, VolumeConfig, VolumeOperation, VolumeState,
        VolumeTransaction,
    };

    #[tokio::test]
    async fn test_empty_store_bootstraps() {
        let Harness { orchestrator, store, .. } = harness().await;
        assert!(orchestrator.is_ready());
        assert!(store.get_version().await.is_ok());
        assert!(orchestrator.list_backends().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_round_trip() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 30).await;

        let before = h.orchestrator.get_volume("basic").unwrap();
        let restarted = h.restart().await;
        let after = restarted.orchestrator.get_volume("basic").unwrap();
        assert_eq!(before, after);
        assert_eq!(restarted.orchestrator.get_storage_class("fast").unwrap().storage.len(), 1);
        restarted.orchestrator.with_catalog(|c| c.check_backend_links()).unwrap();
    }

    #[tokio::test]
    async fn test_crash_during_add_volume() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        let array = h.arrays.array("fast-a");

        let txn = VolumeTransaction::new(VolumeOperation::AddVolume, VolumeConfig::new("tx-only", 1 << 20, "fast"));
        h.store.add_volume_transaction(&txn).await.unwrap();

        let restarted = h.restart().await;
        assert!(array.call_count("destroy") >= 1);
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
        assert!(!h.store.contains(RecordKind::Volume, "tx-only"));
        assert!(restarted.orchestrator.get_volume("tx-only").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_failed_replay_latches_error() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("doomed", 1 << 20).await;

        let config = h.orchestrator.get_volume("doomed").unwrap().config;
        let txn = VolumeTransaction::new(VolumeOperation::DeleteVolume, config);
        h.store.add_volume_transaction(&txn).await.unwrap();
        h.arrays.array("fast-a").fail("destroy", "array offline");

        let restarted = harness_with(h.store.clone(), h.arrays.clone(), Default::default()).await;
        let err = restarted.orchestrator.bootstrap(false).await.unwrap_err();
        assert!(err.to_string().contains("array offline"));
        assert!(restarted.orchestrator.list_volumes().unwrap_err().is_not_ready());
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 1);

        h.arrays.array("fast-a").clear_faults();
        restarted.orchestrator.clear_bootstrap_error();
        assert_eq!(restarted.orchestrator.list_volumes().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_parents_are_marked() {
        let h = harness().await;
        h.store
            .add_volume(&Volume::new(VolumeConfig::new("lost", 1 << 20, "fast"), "no-such-uuid", "FastSmall"))
            .await
            .unwrap();
        let mut snapshot = crate::model::Snapshot::new(
            crate::model::SnapshotConfig::new("gone", "snap"),
            chrono::Utc::now(),
            1,
        );
        snapshot.state = SnapshotState::Online;
        h.store.add_snapshot(&snapshot).await.unwrap();
        let mut sub = VolumeConfig::new("sub", 1, "fast");
        sub.share_source_volume = Some("gone".into());
        h.store.add_volume(&Volume::new(sub, "no-such-uuid", "FastSmall")).await.unwrap();

        let restarted = h.restart().await;
        let lost = restarted.orchestrator.get_volume("lost").unwrap();
        assert_eq!(lost.state, VolumeState::MissingBackend);
        let snap = restarted.orchestrator.get_snapshot("gone", "snap").unwrap();
        assert_eq!(snap.state, SnapshotState::MissingVolume);
        assert!(!h.store.contains(RecordKind::Volume, "sub"));
    }

    #[tokio::test]
    async fn test_failed_driver_keeps_backend() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        h.arrays.array("fast-a").fail("initialize", "bad credentials");

        let restarted = h.restart().await;
        let backend = restarted.orchestrator.get_backend("fast-a").unwrap();
        assert_eq!(backend.state, BackendState::Failed);
        assert!(restarted.orchestrator.get_volume("basic").unwrap().orphaned);
        assert!(restarted.orchestrator.get_storage_class("fast").unwrap().storage.is_empty());
        assert!(h.store.contains(RecordKind::Volume, "basic"));

        // Without a driver only the record goes; the array keeps the volume
        restarted
            .orchestrator
            .delete_volume(&crate::controlplane::context::RequestContext::new(), "basic")
            .await
            .unwrap();
        assert!(!h.store.contains(RecordKind::Volume, "basic"));
        assert!(h.arrays.array("fast-a").has_volume("basic"));
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
    }

    #[tokio::test]
    async fn test_deleting_backend_without_volumes_is_removed() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        let mut persistent = h.store.get_backend("fast-a").await.unwrap();
        persistent.state = BackendState::Deleting;
        h.store.update_backend(&persistent).await.unwrap();

        let restarted = h.restart().await;
        assert!(restarted.orchestrator.get_backend("fast-a").unwrap_err().is_not_found());
        assert!(!h.store.contains(RecordKind::Backend, "fast-a"));
    }

    #[tokio::test]
    async fn test_young_volume_creating_kept_for_monitor() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        let mut txn = VolumeTransaction::new(VolumeOperation::VolumeCreating, VolumeConfig::new("slow", 1, "fast"));
        txn.creating = Some(crate::model::VolumeCreatingInfo {
            backend_uuid: h.backend_uuid("fast-a"),
            pool: "FastSmall".into(),
            started_at: chrono::Utc::now(),
        });
        h.store.add_volume_transaction(&txn).await.unwrap();

        let restarted = harness_with(h.store.clone(), h.arrays.clone(), Default::default()).await;
        restarted.orchestrator.bootstrap(true).await.unwrap();
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 1);
        restarted.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_resources_applied_once() {
        let config = crate::controlplane::OrchestratorConfig {
            publication_sync_grace_secs: 0,
            backends: vec![crate::controlplane::test_utils::fast_backend_config("fast-a")],
            storage_classes: vec![crate::model::StorageClassConfig::new("fast").with_attribute("IOPS", "2000")],
            ..Default::default()
        };
        let h = crate::controlplane::test_utils::harness_with_config(config).await;
        assert_eq!(h.orchestrator.apply_configured_resources().await, 2);
        assert_eq!(
            h.orchestrator.get_storage_class("fast").unwrap().storage["fast-a"],
            vec!["FastSmall".to_string()]
        );

        let restarted = h.restart().await;
        assert_eq!(restarted.orchestrator.apply_configured_resources().await, 0);
        assert_eq!(restarted.orchestrator.list_backends().unwrap().len(), 1);
    }
}
