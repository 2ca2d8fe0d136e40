//! Transaction Log
//!
//! Write-ahead records for volume and snapshot mutations, the compensation
//! applied to records left behind by a failure or crash, and the monitor
//! that abandons creates that never finished.

use super::context::RequestContext;
use super::orchestrator::Orchestrator;
use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use crate::model::{Volume, VolumeConfig, VolumeOperation, VolumeTransaction};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How much of the world a compensation may touch
#[derive(Debug, Clone, Copy)]
pub(crate) enum CompensationScope<'a> {
    /// Right after a failed request: only the backends that were tried
    Inline(&'a [String]),
    /// Replaying a record found in the store
    Recovery,
}

impl Orchestrator {
    /// Record an in-flight mutation, refusing if one exists for the same entity
    pub(crate) async fn begin_transaction(&self, txn: &VolumeTransaction) -> Result<()> {
        if let Some(existing) = self.store.get_existing_volume_transaction(txn).await? {
            return Err(Error::InProgress {
                operation: existing.op.to_string(),
                name: txn.name(),
            });
        }
        match self.store.add_volume_transaction(txn).await {
            Err(e) if e.is_already_exists() => Err(Error::InProgress {
                operation: txn.op.to_string(),
                name: txn.name(),
            }),
            other => other,
        }
    }

    pub(crate) async fn finish_transaction(&self, txn: &VolumeTransaction) -> Result<()> {
        self.store.delete_volume_transaction(txn).await
    }

    /// Drop a transaction on a failure path without masking the original error
    pub(crate) async fn abandon_transaction(&self, txn: &VolumeTransaction) {
        if let Err(e) = self.store.delete_volume_transaction(txn).await {
            warn!(transaction = %txn.name(), op = %txn.op, error = %e, "Failed to delete transaction");
        }
    }

    /// Undo or complete the mutation a transaction guards, then delete it
    pub(crate) async fn compensate(
        &self,
        ctx: &RequestContext,
        txn: &VolumeTransaction,
        scope: CompensationScope<'_>,
    ) -> Result<()> {
        debug!(transaction = %txn.name(), op = %txn.op, "Compensating transaction");
        match txn.op {
            VolumeOperation::AddVolume | VolumeOperation::VolumeCreating => {
                self.compensate_add_volume(ctx, txn, scope).await?
            }
            VolumeOperation::DeleteVolume => self.compensate_delete_volume(ctx, txn).await?,
            VolumeOperation::ResizeVolume => {
                if matches!(scope, CompensationScope::Recovery) {
                    self.compensate_resize_volume(ctx, txn).await?
                }
            }
            VolumeOperation::AddSnapshot => self.compensate_add_snapshot(ctx, txn).await?,
            VolumeOperation::DeleteSnapshot => self.compensate_delete_snapshot(ctx, txn).await?,
            VolumeOperation::ImportVolume => self.compensate_import_volume(ctx, txn).await?,
            VolumeOperation::UpgradeVolume => {}
        }
        self.finish_transaction(txn).await
    }

    async fn compensate_add_volume(
        &self,
        ctx: &RequestContext,
        txn: &VolumeTransaction,
        scope: CompensationScope<'_>,
    ) -> Result<()> {
        let targets = match (&txn.creating, scope) {
            (Some(creating), _) => self.drivers_for(Some(std::slice::from_ref(&creating.backend_uuid))),
            (None, CompensationScope::Inline(attempted)) => self.drivers_for(Some(attempted)),
            (None, CompensationScope::Recovery) => self.drivers_for(None),
        };

        for (backend, driver) in targets {
            let config = internal_config(&txn.config, driver.as_ref());
            if let Err(e) = ctx.call("destroy", driver.destroy(&config)).await {
                if e.skips_compensation() {
                    return Err(e);
                }
                warn!(volume = %config.name, backend = %backend, error = %e, "Best-effort destroy failed");
            }
        }

        self.store.delete_volume_ignore_not_found(&txn.config.name).await?;
        self.catalog.lock().remove_volume(&txn.config.name);
        Ok(())
    }

    async fn compensate_delete_volume(&self, ctx: &RequestContext, txn: &VolumeTransaction) -> Result<()> {
        let name = &txn.config.name;
        let cached = self.catalog.lock().volumes.get(name).cloned();
        let volume = match cached {
            Some(volume) => volume,
            None => match self.store.get_volume(name).await {
                Ok(volume) => volume,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            },
        };

        if !volume.config.import_not_managed {
            match self.driver_for(&volume.backend_uuid) {
                Some(driver) => match ctx.call("destroy", driver.destroy(&volume.config)).await {
                    Err(e) if !e.is_not_managed() => return Err(e),
                    _ => {}
                },
                None => warn!(
                    volume = %name,
                    internal_name = %volume.config.internal_name,
                    backend_uuid = %volume.backend_uuid,
                    "Backend has no driver, storage is left on the array"
                ),
            }
        }
        self.delete_volume_publications(name).await?;
        self.store.delete_volume_ignore_not_found(name).await?;
        self.catalog.lock().remove_volume(name);
        Ok(())
    }

    async fn compensate_resize_volume(&self, ctx: &RequestContext, txn: &VolumeTransaction) -> Result<()> {
        let name = &txn.config.name;
        let Some(mut volume) = self.catalog.lock().volumes.get(name).cloned() else {
            return Ok(());
        };
        let Some(driver) = self.driver_for(&volume.backend_uuid) else {
            warn!(volume = %name, "Cannot reissue resize, backend has no driver");
            return Ok(());
        };

        let target = txn.config.size_bytes;
        ctx.call("resize", driver.resize(&mut volume.config, target)).await?;
        volume.config.size_bytes = target;
        self.store.update_volume(&volume).await?;
        self.catalog.lock().insert_volume(volume);
        info!(volume = %name, size_bytes = target, "Reissued interrupted resize");
        Ok(())
    }

    async fn compensate_add_snapshot(&self, ctx: &RequestContext, txn: &VolumeTransaction) -> Result<()> {
        let snapshot = snapshot_config(txn)?;
        let (volume_config, owner) = self.snapshot_owner(txn);
        let targets = match owner {
            Some(uuid) => self.drivers_for(Some(std::slice::from_ref(&uuid))),
            None => self.drivers_for(None),
        };

        for (backend, driver) in targets {
            if let Err(e) = ctx
                .call("delete_snapshot", driver.delete_snapshot(&snapshot, &volume_config))
                .await
            {
                if e.skips_compensation() {
                    return Err(e);
                }
                warn!(snapshot = %snapshot.id(), backend = %backend, error = %e, "Best-effort snapshot delete failed");
            }
        }

        self.store.delete_snapshot_ignore_not_found(&snapshot.id()).await?;
        self.catalog.lock().snapshots.remove(&snapshot.id());
        Ok(())
    }

    async fn compensate_delete_snapshot(&self, ctx: &RequestContext, txn: &VolumeTransaction) -> Result<()> {
        let snapshot = snapshot_config(txn)?;
        let (volume_config, owner) = self.snapshot_owner(txn);
        if let Some(driver) = owner.as_deref().and_then(|uuid| self.driver_for(uuid)) {
            ctx.call("delete_snapshot", driver.delete_snapshot(&snapshot, &volume_config))
                .await?;
        }
        self.store.delete_snapshot_ignore_not_found(&snapshot.id()).await?;
        self.catalog.lock().snapshots.remove(&snapshot.id());
        Ok(())
    }

    async fn compensate_import_volume(&self, ctx: &RequestContext, txn: &VolumeTransaction) -> Result<()> {
        let config = &txn.config;
        if !config.import_not_managed {
            let driver = config
                .import_backend_uuid
                .as_deref()
                .and_then(|uuid| self.driver_for(uuid));
            if let (Some(driver), Some(original)) = (driver, config.import_original_name.as_deref()) {
                let renamed = internal_config(config, driver.as_ref()).internal_name;
                if renamed != original {
                    match ctx.call("rename", driver.rename(&renamed, original)).await {
                        Err(e) if !e.is_not_found() => return Err(e),
                        _ => debug!(volume = %config.name, original = %original, "Restored original backend name"),
                    }
                }
            }
        }
        self.store.delete_volume_ignore_not_found(&config.name).await?;
        self.catalog.lock().remove_volume(&config.name);
        Ok(())
    }

    /// Source volume config and owning backend for a snapshot transaction
    fn snapshot_owner(&self, txn: &VolumeTransaction) -> (VolumeConfig, Option<String>) {
        let catalog = self.catalog.lock();
        match catalog.volumes.get(&txn.config.name) {
            Some(volume) => (volume.config.clone(), Some(volume.backend_uuid.clone())),
            None => (txn.config.clone(), None),
        }
    }

    pub(crate) fn driver_for(&self, backend_uuid: &str) -> Option<Arc<dyn StorageDriver>> {
        self.catalog
            .lock()
            .backends
            .get(backend_uuid)
            .and_then(|b| b.driver.clone())
    }

    /// Drivers of the named backends, or of every backend
    fn drivers_for(&self, uuids: Option<&[String]>) -> Vec<(String, Arc<dyn StorageDriver>)> {
        let catalog = self.catalog.lock();
        catalog
            .backends
            .values()
            .filter(|b| uuids.map_or(true, |uuids| uuids.contains(&b.uuid)))
            .filter_map(|b| b.driver.clone().map(|driver| (b.name.clone(), driver)))
            .collect()
    }

    /// Whether a slow create has been running longer than allowed
    pub(crate) fn is_expired(&self, txn: &VolumeTransaction) -> bool {
        if txn.op != VolumeOperation::VolumeCreating {
            return false;
        }
        let started = txn
            .creating
            .as_ref()
            .map(|c| c.started_at)
            .unwrap_or(txn.created_at);
        let elapsed = (Utc::now() - started).to_std().unwrap_or_default();
        elapsed >= self.config.volume_creating_timeout()
    }

    /// Compensate every `VolumeCreating` record past its timeout
    pub async fn reap_expired_transactions(&self) -> Result<usize> {
        let ctx = RequestContext::with_token(self.shutdown.child_token());
        let mut reaped = 0;
        for txn in self.store.get_volume_transactions().await? {
            if !self.is_expired(&txn) {
                continue;
            }
            match self.compensate(&ctx, &txn, CompensationScope::Recovery).await {
                Ok(()) => {
                    info!(volume = %txn.name(), "Abandoned volume creation that did not complete in time");
                    reaped += 1;
                }
                Err(e) => warn!(volume = %txn.name(), error = %e, "Failed to compensate expired volume creation"),
            }
        }
        Ok(reaped)
    }

    /// Periodically reap expired creates until shutdown
    pub(crate) fn spawn_transaction_monitor(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.config.transaction_monitor_period();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = orchestrator.reap_expired_transactions().await {
                    warn!(error = %e, "Transaction monitor pass failed");
                }
            }
            debug!("Transaction monitor stopped");
        });

        if let Some(previous) = self.monitor.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Destroy a freshly created volume whose record could not be written
    pub(crate) async fn discard_created_volume(
        &self,
        ctx: &RequestContext,
        driver: &Arc<dyn StorageDriver>,
        volume: &Volume,
    ) {
        if let Err(e) = ctx.call("destroy", driver.destroy(&volume.config)).await {
            warn!(volume = %volume.name(), error = %e, "Failed to destroy volume after persist failure");
        }
    }
}

/// The config with the internal name a driver would use filled in
fn internal_config(config: &VolumeConfig, driver: &dyn StorageDriver) -> VolumeConfig {
    let mut config = config.clone();
    if config.internal_name.is_empty() {
        config.internal_name = driver.internal_volume_name(&config);
    }
    config
}

fn snapshot_config(txn: &VolumeTransaction) -> Result<crate::model::SnapshotConfig> {
    txn.snapshot_config.clone().ok_or_else(|| {
        Error::TypeAssertion(format!("{} transaction for {} has no snapshot config", txn.op, txn.name()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::test_utils::{harness, Harness};
    use crate::domain::ports::{RecordKind, StoreClient};
    use crate::model::{VolumeCreatingInfo, VolumeConfig};

    #[tokio::test]
    async fn test_second_transaction_for_same_volume_is_in_progress() {
        let Harness { orchestrator, .. } = harness().await;
        let txn = VolumeTransaction::new(VolumeOperation::ResizeVolume, VolumeConfig::new("vol-1", 1, "fast"));
        orchestrator.begin_transaction(&txn).await.unwrap();

        let again = VolumeTransaction::new(VolumeOperation::DeleteVolume, VolumeConfig::new("vol-1", 1, "fast"));
        let err = orchestrator.begin_transaction(&again).await.unwrap_err();
        assert!(err.is_in_progress());
        assert!(err.to_string().contains("resizeVolume"));

        orchestrator.finish_transaction(&txn).await.unwrap();
        orchestrator.begin_transaction(&again).await.unwrap();
    }

    #[tokio::test]
    async fn test_reap_expired_volume_creating() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        let uuid = h.backend_uuid("fast-a");
        let array = h.arrays.array("fast-a");
        array.insert_volume("slow", "FastSmall", 1 << 20, crate::model::Protocol::File);

        let mut config = VolumeConfig::new("slow", 1 << 20, "fast");
        config.internal_name = "slow".into();
        let mut txn = VolumeTransaction::new(VolumeOperation::VolumeCreating, config);
        txn.creating = Some(VolumeCreatingInfo {
            backend_uuid: uuid,
            pool: "FastSmall".into(),
            started_at: Utc::now() - chrono::Duration::hours(1),
        });
        h.store.add_volume_transaction(&txn).await.unwrap();

        let reaped = h.orchestrator.reap_expired_transactions().await.unwrap();
        assert_eq!(reaped, 1);
        assert!(!array.has_volume("slow"));
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
    }

    #[tokio::test]
    async fn test_fresh_volume_creating_is_not_reaped() {
        let h = harness().await;
        let mut txn = VolumeTransaction::new(VolumeOperation::VolumeCreating, VolumeConfig::new("slow", 1, "fast"));
        txn.creating = Some(VolumeCreatingInfo {
            backend_uuid: "uuid".into(),
            pool: "FastSmall".into(),
            started_at: Utc::now(),
        });
        h.store.add_volume_transaction(&txn).await.unwrap();
        assert_eq!(h.orchestrator.reap_expired_transactions().await.unwrap(), 0);
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 1);
    }
}
