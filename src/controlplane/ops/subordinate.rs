//! Subordinate volumes
//!
//! A subordinate is a named share over an existing NFS volume. It allocates
//! nothing on the backend, so none of these operations write transactions.
//! They claim both the subordinate and its source, so a subordinate is never
//! linked to a source that is being deleted.

use crate::controlplane::catalog::Claimed;
use crate::controlplane::orchestrator::Orchestrator;
use crate::error::{Error, Result};
use crate::model::{
    Protocol, Volume, VolumeConfig, VolumeExternal, VolumeOperation, VolumeState, VolumeTransaction,
};
use tracing::{info, warn};

impl Orchestrator {
    /// Share an existing volume under a new name
    pub async fn add_subordinate_volume(&self, mut config: VolumeConfig) -> Result<VolumeExternal> {
        self.check_ready()?;
        config.validate()?;
        let source_name = config.share_source_volume.clone().ok_or_else(|| {
            Error::InvalidArgument(format!("volume {} names no share source", config.name))
        })?;

        if config.clone_source_volume.is_some() {
            return Err(invalid(&config.name, "cannot be a clone"));
        }
        if config.is_mirror_destination {
            return Err(invalid(&config.name, "cannot be a mirror destination"));
        }
        if config.is_import() {
            return Err(invalid(&config.name, "cannot be imported"));
        }
        if !config.subordinate_volumes.is_empty() {
            return Err(invalid(&config.name, "cannot have subordinate volumes"));
        }

        let mut source = {
            let mut catalog = self.catalog.lock();
            if catalog.volume_name_in_use(&config.name) {
                return Err(Error::VolumeExists { name: config.name.clone() });
            }
            if catalog.subordinate_volumes.contains_key(&source_name) {
                return Err(Error::InvalidArgument(format!(
                    "share source {} is itself a subordinate volume",
                    source_name
                )));
            }
            let source = catalog.require_volume(&source_name)?.clone();
            let backend_protocol = catalog
                .backends
                .get(&source.backend_uuid)
                .map(|b| b.protocol())
                .unwrap_or_default();
            if backend_protocol != Protocol::File || source.config.access_info.is_smb() {
                return Err(Error::InvalidArgument(format!(
                    "share source {} is not served over NFS",
                    source_name
                )));
            }
            if source.orphaned {
                return Err(Error::FailedPrecondition(format!("share source {} is orphaned", source_name)));
            }
            if source.state != VolumeState::Online {
                return Err(Error::FailedPrecondition(format!(
                    "share source {} is {}",
                    source_name, source.state
                )));
            }
            if source.config.import_not_managed {
                return Err(Error::FailedPrecondition(format!(
                    "share source {} is not managed",
                    source_name
                )));
            }
            catalog.claim("addSubordinateVolume", &[config.name.as_str(), source_name.as_str()], &[])?;
            source
        };
        let subordinate_name = config.name.clone();
        let _claim = Claimed::new(&self.catalog, &[subordinate_name.as_str(), source_name.as_str()]);

        // A delete of the source that crashed midway is still pending
        let pending = VolumeTransaction::new(VolumeOperation::DeleteVolume, source.config.clone());
        if let Some(existing) = self.store.get_existing_volume_transaction(&pending).await? {
            return Err(Error::InProgress {
                operation: existing.op.to_string(),
                name: source_name.clone(),
            });
        }
        if config.storage_class.is_empty() {
            config.storage_class = source.config.storage_class.clone();
        } else if config.storage_class != source.config.storage_class {
            return Err(Error::InvalidArgument(format!(
                "storage class {} of volume {} does not match share source class {}",
                config.storage_class, config.name, source.config.storage_class
            )));
        }
        if config.size_bytes == 0 {
            config.size_bytes = source.config.size_bytes;
        }
        if config.size_bytes > source.config.size_bytes {
            return Err(Error::UnsupportedCapacityRange(format!(
                "subordinate volume {} ({} bytes) is larger than its source {} ({} bytes)",
                config.name, config.size_bytes, source_name, source.config.size_bytes
            )));
        }

        config.internal_name = source.config.internal_name.clone();
        config.protocol = source.config.protocol;
        config.access_info = source.config.access_info.clone();
        config.luks_encryption = source.config.luks_encryption;
        let subordinate = Volume::new(config, &source.backend_uuid, &source.pool);

        self.store.add_volume(&subordinate).await?;
        source.config.subordinate_volumes.insert(subordinate.name().to_string());
        if let Err(e) = self.store.update_volume(&source).await {
            if let Err(cleanup) = self.store.delete_volume(&subordinate).await {
                warn!(volume = %subordinate.name(), error = %cleanup, "Failed to remove subordinate record");
            }
            return Err(e);
        }

        let external = subordinate.construct_external();
        {
            let mut catalog = self.catalog.lock();
            if let Some(current) = catalog.volumes.get_mut(&source_name) {
                current
                    .config
                    .subordinate_volumes
                    .insert(subordinate.name().to_string());
            }
            catalog.insert_volume(subordinate);
        }
        info!(volume = %external.config.name, source = %source_name, "Created subordinate volume");
        Ok(external)
    }

    /// Drop a subordinate and unlink it from its source.
    ///
    /// Returns the source name when it was waiting on this subordinate to be
    /// deleted itself.
    pub(crate) async fn delete_subordinate_volume(&self, name: &str) -> Result<Option<String>> {
        let (source_name, source) = {
            let mut catalog = self.catalog.lock();
            let subordinate = catalog
                .subordinate_volumes
                .get(name)
                .ok_or_else(|| Error::not_found("subordinate volume", name))?;
            let source_name = subordinate.config.share_source_volume.clone().unwrap_or_default();
            let source = catalog.volumes.get(&source_name).cloned();
            catalog.claim("deleteVolume", &[name, source_name.as_str()], &[])?;
            if let Err(e) = catalog.require_unpublished(name) {
                catalog.release(name);
                catalog.release(&source_name);
                return Err(e);
            }
            (source_name, source)
        };
        let _claim = Claimed::new(&self.catalog, &[name, source_name.as_str()]);

        let mut resume = None;
        if let Some(mut source) = source {
            source.config.subordinate_volumes.remove(name);
            self.store.update_volume(&source).await?;
            if source.state == VolumeState::Deleting && source.config.subordinate_volumes.is_empty() {
                resume = Some(source_name.clone());
            }
            if let Some(current) = self.catalog.lock().volumes.get_mut(&source_name) {
                current.config.subordinate_volumes.remove(name);
            }
        }

        self.delete_volume_publications(name).await?;
        self.store.delete_volume_ignore_not_found(name).await?;
        self.catalog.lock().subordinate_volumes.remove(name);
        info!(volume = %name, "Deleted subordinate volume");
        Ok(resume)
    }

    /// Change the size a subordinate reports, within the size of its source
    pub(crate) async fn resize_subordinate_volume(&self, name: &str, size_bytes: u64) -> Result<()> {
        let mut subordinate = {
            let mut catalog = self.catalog.lock();
            let source = catalog.backing_volume(name)?;
            if size_bytes > source.config.size_bytes {
                return Err(Error::UnsupportedCapacityRange(format!(
                    "subordinate volume {} cannot exceed its source {} ({} bytes)",
                    name,
                    source.name(),
                    source.config.size_bytes
                )));
            }
            let subordinate = catalog
                .subordinate_volumes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("subordinate volume", name))?;
            catalog.claim("resizeVolume", &[name], &[])?;
            subordinate
        };
        let _claim = Claimed::new(&self.catalog, &[name]);

        subordinate.config.size_bytes = size_bytes;
        self.store.update_volume(&subordinate).await?;
        self.catalog.lock().insert_volume(subordinate);
        Ok(())
    }
}

fn invalid(name: &str, reason: &str) -> Error {
    Error::InvalidArgument(format!("subordinate volume {} {}", name, reason))
}
