//! Snapshot operations

use crate::controlplane::catalog::Claimed;
use crate::controlplane::context::RequestContext;
use crate::controlplane::orchestrator::Orchestrator;
use crate::controlplane::transaction::CompensationScope;
use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use crate::model::{
    snapshot::make_snapshot_id, Snapshot, SnapshotConfig, VolumeConfig, VolumeOperation,
    VolumeState, VolumeTransaction,
};
use std::sync::Arc;
use tracing::{info, warn};

impl Orchestrator {
    /// Snapshot a volume
    pub async fn create_snapshot(&self, ctx: &RequestContext, mut config: SnapshotConfig) -> Result<Snapshot> {
        self.check_ready()?;
        let (volume, driver) = {
            let mut catalog = self.catalog.lock();
            if catalog.subordinate_volumes.contains_key(&config.volume_name) {
                return Err(Error::InvalidArgument(format!(
                    "cannot snapshot subordinate volume {}",
                    config.volume_name
                )));
            }
            let volume = catalog.require_volume(&config.volume_name)?.clone();
            if catalog.snapshot(&config.volume_name, &config.name).is_some() {
                return Err(Error::already_exists("snapshot", config.id()));
            }
            if volume.state != VolumeState::Online {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} is {}",
                    volume.name(),
                    volume.state
                )));
            }
            let driver = catalog
                .backends
                .get(&volume.backend_uuid)
                .ok_or_else(|| Error::not_found("backend", &volume.backend_uuid))?
                .driver()?;
            catalog.claim("createSnapshot", &[], &[config.volume_name.as_str()])?;
            (volume, driver)
        };
        let _claim = Claimed::new(&self.catalog, &[volume.name()]);

        if config.internal_name.is_empty() {
            config.internal_name = config.name.clone();
        }
        config.volume_internal_name = volume.config.internal_name.clone();
        config.luks_passphrase_names = volume.config.luks_passphrase_names.clone();

        let txn = VolumeTransaction::for_snapshot(VolumeOperation::AddSnapshot, volume.config.clone(), config.clone());
        self.begin_transaction(&txn).await?;

        if let Err(e) = ctx.call("can_snapshot", driver.can_snapshot(&config, &volume.config)).await {
            if !e.skips_compensation() {
                self.abandon_transaction(&txn).await;
            }
            return Err(e);
        }

        let snapshot = match ctx
            .call("create_snapshot", driver.create_snapshot(&config, &volume.config))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_max_limit_reached() => {
                self.abandon_transaction(&txn).await;
                return Err(e);
            }
            Err(e) if e.skips_compensation() => return Err(e),
            Err(e) => {
                self.undo_add_snapshot(ctx, &txn, &volume.backend_uuid).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.add_snapshot(&snapshot).await {
            self.undo_add_snapshot(ctx, &txn, &volume.backend_uuid).await;
            return Err(e);
        }
        self.finish_transaction(&txn).await?;

        self.catalog.lock().snapshots.insert(snapshot.id(), snapshot.clone());
        info!(snapshot = %snapshot.id(), size_bytes = snapshot.size_bytes, "Created snapshot");
        Ok(snapshot)
    }

    async fn undo_add_snapshot(&self, ctx: &RequestContext, txn: &VolumeTransaction, backend_uuid: &str) {
        let attempted = [backend_uuid.to_string()];
        if let Err(e) = self.compensate(ctx, txn, CompensationScope::Inline(&attempted)).await {
            warn!(snapshot = %txn.name(), error = %e, "Failed to clean up snapshot, leaving transaction for recovery");
        }
    }

    /// Delete a snapshot.
    ///
    /// A snapshot still backing a clone is reported busy and a split of one
    /// dependent clone is started in the background; retry once it is done.
    pub async fn delete_snapshot(&self, ctx: &RequestContext, volume_name: &str, snapshot_name: &str) -> Result<()> {
        self.check_ready()?;
        let id = make_snapshot_id(volume_name, snapshot_name);
        let (snapshot, volume, driver) = {
            let mut catalog = self.catalog.lock();
            let snapshot = catalog
                .snapshot(volume_name, snapshot_name)
                .cloned()
                .ok_or_else(|| Error::not_found("snapshot", &id))?;
            let volume = catalog.volumes.get(volume_name).cloned();
            let driver = volume
                .as_ref()
                .and_then(|v| catalog.backends.get(&v.backend_uuid))
                .and_then(|b| b.driver.clone());
            catalog.claim("deleteSnapshot", &[], &[volume_name])?;
            (snapshot, volume, driver)
        };
        let claim = Claimed::new(&self.catalog, &[volume_name]);

        let (volume, driver) = match (volume, driver) {
            (Some(volume), Some(driver)) if !snapshot.state.is_missing() => (volume, driver),
            _ => {
                self.store.delete_snapshot_ignore_not_found(&id).await?;
                self.catalog.lock().snapshots.remove(&id);
                info!(snapshot = %id, state = %snapshot.state, "Removed snapshot record");
                return Ok(());
            }
        };

        let txn = VolumeTransaction::for_snapshot(
            VolumeOperation::DeleteSnapshot,
            volume.config.clone(),
            snapshot.config.clone(),
        );
        self.begin_transaction(&txn).await?;

        match ctx
            .call("delete_snapshot", driver.delete_snapshot(&snapshot.config, &volume.config))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_snapshot_busy() => {
                self.abandon_transaction(&txn).await;
                self.start_clone_split(volume_name, snapshot_name, driver);
                return Err(e);
            }
            Err(e) if e.skips_compensation() => return Err(e),
            Err(e) => {
                self.abandon_transaction(&txn).await;
                return Err(e);
            }
        }

        self.store.delete_snapshot_ignore_not_found(&id).await?;
        self.finish_transaction(&txn).await?;
        let finish_volume = {
            let mut catalog = self.catalog.lock();
            catalog.snapshots.remove(&id);
            volume.state == VolumeState::Deleting
                && !catalog.has_snapshots(volume_name)
                && catalog
                    .volumes
                    .get(volume_name)
                    .is_some_and(|v| v.config.subordinate_volumes.is_empty())
        };
        info!(snapshot = %id, "Deleted snapshot");

        drop(claim);
        if finish_volume {
            self.delete_volume(ctx, volume_name).await?;
        }
        Ok(())
    }

    /// Split one clone off a snapshot on a task bound to the orchestrator's
    /// lifetime rather than the request's
    fn start_clone_split(&self, volume_name: &str, snapshot_name: &str, driver: Arc<dyn StorageDriver>) {
        let clone: Option<VolumeConfig> = self
            .catalog
            .lock()
            .clones_of_snapshot(volume_name, snapshot_name)
            .first()
            .map(|v| v.config.clone());
        let Some(clone) = clone else {
            warn!(volume = %volume_name, snapshot = %snapshot_name, "Snapshot is busy but no dependent clone is known");
            return;
        };

        info!(clone = %clone.name, snapshot = %snapshot_name, "Starting clone split");
        let ctx = RequestContext::with_token(self.shutdown.child_token());
        self.track_background(tokio::spawn(async move {
            match ctx.call("split_clone", driver.split_clone(&clone)).await {
                Ok(()) => info!(clone = %clone.name, "Clone split finished"),
                Err(e) => warn!(clone = %clone.name, error = %e, "Clone split failed"),
            }
        }));
    }

    /// Roll a volume back to one of its snapshots
    pub async fn restore_snapshot(&self, ctx: &RequestContext, volume_name: &str, snapshot_name: &str) -> Result<()> {
        self.check_ready()?;
        let (snapshot, volume, driver) = {
            let mut catalog = self.catalog.lock();
            let volume = catalog.require_volume(volume_name)?.clone();
            let snapshot = catalog
                .snapshot(volume_name, snapshot_name)
                .cloned()
                .ok_or_else(|| Error::not_found("snapshot", make_snapshot_id(volume_name, snapshot_name)))?;
            if !catalog.publications_for_volume(volume_name).is_empty() {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} must be unpublished before restoring snapshot {}",
                    volume_name, snapshot_name
                )));
            }
            if volume.state != VolumeState::Online || snapshot.state.is_missing() {
                return Err(Error::FailedPrecondition(format!(
                    "cannot restore snapshot {} ({}) onto volume {} ({})",
                    snapshot.id(),
                    snapshot.state,
                    volume_name,
                    volume.state
                )));
            }
            let driver = catalog
                .backends
                .get(&volume.backend_uuid)
                .ok_or_else(|| Error::not_found("backend", &volume.backend_uuid))?
                .driver()?;
            catalog.claim("restoreSnapshot", &[volume_name], &[])?;
            (snapshot, volume, driver)
        };
        let _claim = Claimed::new(&self.catalog, &[volume_name]);

        ctx.call("restore_snapshot", driver.restore_snapshot(&snapshot.config, &volume.config))
            .await?;
        info!(snapshot = %snapshot.id(), "Restored volume from snapshot");
        Ok(())
    }
}
