//! Volume import
//!
//! Brings an existing backend volume under management. Managed imports are
//! renamed to the name the driver would have chosen; not-managed imports
//! keep their backend name and are never destroyed.

use crate::controlplane::catalog::Claimed;
use crate::controlplane::context::RequestContext;
use crate::controlplane::orchestrator::Orchestrator;
use crate::controlplane::transaction::CompensationScope;
use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use crate::model::{
    BackendState, Protocol, Volume, VolumeConfig, VolumeExternal, VolumeOperation, VolumeTransaction,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::{info, warn};

/// Hook run by a legacy import before the volume is recorded, typically to
/// create the platform claim bound to it
pub type ImportCallback = Box<dyn FnOnce(VolumeExternal) -> BoxFuture<'static, Result<()>> + Send>;

impl Orchestrator {
    pub async fn import_volume(&self, ctx: &RequestContext, config: VolumeConfig) -> Result<VolumeExternal> {
        self.import_volume_inner(ctx, config, None).await
    }

    /// Import, then hand the volume to `callback`; a failing callback puts
    /// the backend volume back under its original name
    pub async fn legacy_import_volume(
        &self,
        ctx: &RequestContext,
        config: VolumeConfig,
        callback: ImportCallback,
    ) -> Result<VolumeExternal> {
        self.import_volume_inner(ctx, config, Some(callback)).await
    }

    async fn import_volume_inner(
        &self,
        ctx: &RequestContext,
        config: VolumeConfig,
        callback: Option<ImportCallback>,
    ) -> Result<VolumeExternal> {
        self.check_ready()?;
        config.validate()?;
        let original = config
            .import_original_name
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("volume {} names no volume to import", config.name)))?;
        let backend_uuid = config
            .import_backend_uuid
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("volume {} names no backend to import from", config.name)))?;
        if config.is_subordinate() || config.clone_source_volume.is_some() {
            return Err(Error::InvalidArgument(format!(
                "imported volume {} cannot be a clone or a subordinate",
                config.name
            )));
        }

        let driver = {
            let mut catalog = self.catalog.lock();
            if catalog.volume_name_in_use(&config.name) {
                return Err(Error::VolumeExists { name: config.name.clone() });
            }
            let backend = catalog
                .backends
                .get(&backend_uuid)
                .ok_or_else(|| Error::not_found("backend", &backend_uuid))?;
            if let Some(managed) = catalog
                .volumes
                .values()
                .find(|v| v.backend_uuid == backend_uuid && v.config.internal_name == original)
            {
                return Err(Error::already_exists(
                    "managed volume",
                    format!("{} (backend volume {})", managed.name(), original),
                ));
            }
            if !catalog.storage_classes.contains_key(&config.storage_class) {
                return Err(Error::not_found("storage class", &config.storage_class));
            }
            let driver = backend.driver()?;
            catalog.claim("importVolume", &[config.name.as_str()], &[])?;
            if let Err(e) = catalog.start_create(&config.name, &backend_uuid) {
                catalog.release(&config.name);
                return Err(e);
            }
            driver
        };
        let name = config.name.clone();
        let _claim = Claimed::new(&self.catalog, &[name.as_str()]);

        let result = self
            .import_claimed(ctx, config, &original, &backend_uuid, driver, callback)
            .await;
        self.end_create(ctx, &name).await;
        result
    }

    async fn import_claimed(
        &self,
        ctx: &RequestContext,
        mut config: VolumeConfig,
        original: &str,
        backend_uuid: &str,
        driver: Arc<dyn StorageDriver>,
        callback: Option<ImportCallback>,
    ) -> Result<VolumeExternal> {

        let external = ctx
            .call("get_volume_external", driver.get_volume_external(original))
            .await?;
        let in_class = self.with_catalog(|catalog| {
            catalog
                .storage_classes
                .get(&config.storage_class)
                .is_some_and(|class| class.has_pool(backend_uuid, &external.pool))
        });
        if !in_class {
            return Err(Error::InvalidArgument(format!(
                "pool {} of backend volume {} is not in storage class {}",
                external.pool, original, config.storage_class
            )));
        }

        config.internal_name = if config.import_not_managed {
            original.to_string()
        } else {
            driver.internal_volume_name(&config)
        };
        let txn = VolumeTransaction::new(VolumeOperation::ImportVolume, config.clone());
        self.begin_transaction(&txn).await?;

        if let Err(e) = ctx.call("import", driver.import(&mut config, original)).await {
            if !e.skips_compensation() {
                self.abandon_transaction(&txn).await;
            }
            return Err(e);
        }
        if let Err(e) = self.check_size_limit(&config.name, config.size_bytes) {
            self.abandon_transaction(&txn).await;
            return Err(e);
        }
        if config.internal_name != original {
            if let Err(e) = ctx.call("rename", driver.rename(original, &config.internal_name)).await {
                if !e.skips_compensation() {
                    self.abandon_transaction(&txn).await;
                }
                return Err(e);
            }
        }

        if config.protocol == Protocol::Any {
            config.protocol = driver.protocol();
        }
        let volume = Volume::new(config, backend_uuid, &external.pool);

        if let Some(callback) = callback {
            if let Err(e) = callback(volume.construct_external()).await {
                warn!(volume = %volume.name(), error = %e, "Import callback failed, restoring backend volume");
                self.undo_import(ctx, &txn).await;
                return Err(e);
            }
        }
        let deleting = self
            .catalog
            .lock()
            .backends
            .get(backend_uuid)
            .map_or(true, |b| b.state == BackendState::Deleting);
        if deleting {
            warn!(volume = %volume.name(), "Backend was deleted during import, restoring backend volume");
            self.undo_import(ctx, &txn).await;
            return Err(Error::FailedPrecondition(format!(
                "backend {} was deleted while volume {} was being imported",
                backend_uuid,
                volume.name()
            )));
        }
        if let Err(e) = self.store.add_volume(&volume).await {
            self.undo_import(ctx, &txn).await;
            return Err(e);
        }
        self.finish_transaction(&txn).await?;

        let external = volume.construct_external();
        {
            let mut catalog = self.catalog.lock();
            catalog.creating.remove(volume.name());
            catalog.insert_volume(volume);
        }
        info!(
            volume = %external.config.name,
            original = %original,
            managed = !external.config.import_not_managed,
            "Imported volume"
        );
        Ok(external)
    }

    async fn undo_import(&self, ctx: &RequestContext, txn: &VolumeTransaction) {
        if let Err(e) = self.compensate(ctx, txn, CompensationScope::Inline(&[])).await {
            warn!(volume = %txn.config.name, error = %e, "Failed to undo import, leaving transaction for recovery");
        }
    }
}
