//! Volume operations: create, clone, delete, resize

use crate::controlplane::catalog::Claimed;
use crate::controlplane::context::RequestContext;
use crate::controlplane::orchestrator::Orchestrator;
use crate::controlplane::selector::{self, Candidate};
use crate::controlplane::transaction::CompensationScope;
use crate::error::{Error, Result};
use crate::model::{
    attributes::Request, volume::derive_protocol, BackendState, Protocol, Volume, VolumeConfig,
    VolumeCreatingInfo, VolumeExternal, VolumeOperation, VolumeState, VolumeTransaction,
};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

impl Orchestrator {
    /// Provision a volume on the first pool of its class that accepts it.
    ///
    /// Configs naming a clone source or a share source are routed to
    /// [`Orchestrator::clone_volume`] and the subordinate path.
    pub async fn add_volume(&self, ctx: &RequestContext, config: VolumeConfig) -> Result<VolumeExternal> {
        self.check_ready()?;
        config.validate()?;
        if config.share_source_volume.is_some() {
            return self.add_subordinate_volume(config).await;
        }
        if config.clone_source_volume.is_some() {
            return self.clone_volume(ctx, config).await;
        }
        if config.is_mirror_destination && config.peer_volume_handle.is_none() {
            return Err(Error::InvalidArgument(format!(
                "mirror destination volume {} needs a peer volume handle",
                config.name
            )));
        }
        if config.size_bytes == 0 {
            return Err(Error::UnsupportedCapacityRange(format!(
                "volume {} must request a size",
                config.name
            )));
        }
        self.check_size_limit(&config.name, config.size_bytes)?;

        let protocol = derive_protocol(config.volume_mode, config.access_mode, config.protocol)?;
        let (candidates, reasons, requests) = {
            let mut catalog = self.catalog.lock();
            if catalog.volume_name_in_use(&config.name) {
                return Err(Error::VolumeExists { name: config.name.clone() });
            }
            let class = catalog
                .storage_classes
                .get(&config.storage_class)
                .ok_or_else(|| Error::not_found("storage class", &config.storage_class))?;
            let (candidates, reasons) = selector::candidate_pools(&catalog, class, protocol);
            let requests = class.requests.clone();
            catalog.claim("addVolume", &[config.name.as_str()], &[])?;
            (candidates, reasons, requests)
        };
        let _claim = Claimed::new(&self.catalog, &[config.name.as_str()]);

        let result = self
            .place_volume(ctx, &config, protocol, candidates, reasons, &requests)
            .await;
        self.end_create(ctx, &config.name).await;
        result
    }

    /// Try candidate pools in order until one creates the volume
    async fn place_volume(
        &self,
        ctx: &RequestContext,
        config: &VolumeConfig,
        protocol: Protocol,
        candidates: Vec<Candidate>,
        mut reasons: BTreeMap<String, String>,
        requests: &BTreeMap<String, Request>,
    ) -> Result<VolumeExternal> {
        let mut txn = VolumeTransaction::new(VolumeOperation::AddVolume, config.clone());
        let candidates = match self.store.get_existing_volume_transaction(&txn).await? {
            Some(existing) if existing.op == VolumeOperation::VolumeCreating => {
                if self.is_expired(&existing) {
                    info!(volume = %config.name, "Previous creation timed out, starting over");
                    self.compensate(ctx, &existing, CompensationScope::Recovery).await?;
                    self.begin_transaction(&txn).await?;
                    candidates
                } else {
                    debug!(volume = %config.name, "Resuming volume creation");
                    txn = existing;
                    self.resume_candidates(&txn, candidates)?
                }
            }
            Some(existing) => {
                return Err(Error::InProgress {
                    operation: existing.op.to_string(),
                    name: config.name.clone(),
                })
            }
            None => {
                self.begin_transaction(&txn).await?;
                candidates
            }
        };

        let mut attempted = Vec::new();
        let mut created = None;
        for candidate in candidates {
            let mut attempt = config.clone();
            attempt.protocol = protocol;
            attempt.internal_name = match &txn.creating {
                Some(_) if !txn.config.internal_name.is_empty() => txn.config.internal_name.clone(),
                _ => candidate.driver.internal_volume_name(&attempt),
            };

            let started = self
                .catalog
                .lock()
                .start_create(&config.name, &candidate.backend_uuid);
            if let Err(e) = started {
                reasons.insert(candidate.label(), e.to_string());
                continue;
            }
            let result = ctx
                .call(
                    "create",
                    candidate.driver.create(&mut attempt, &candidate.pool, requests),
                )
                .await;
            match result {
                Ok(()) => {
                    created = Some((candidate, attempt));
                    break;
                }
                Err(e) if e.is_volume_creating() => {
                    let started_at = txn
                        .creating
                        .as_ref()
                        .map(|c| c.started_at)
                        .unwrap_or_else(Utc::now);
                    txn.op = VolumeOperation::VolumeCreating;
                    txn.config = attempt;
                    txn.creating = Some(VolumeCreatingInfo {
                        backend_uuid: candidate.backend_uuid.clone(),
                        pool: candidate.pool.name.clone(),
                        started_at,
                    });
                    self.store.update_volume_transaction(&txn).await?;
                    info!(volume = %config.name, pool = %candidate.label(), "Volume is still being created");
                    return Err(e);
                }
                Err(e) if e.skips_compensation() => return Err(e),
                Err(e) => {
                    debug!(volume = %config.name, pool = %candidate.label(), error = %e, "Pool rejected volume");
                    reasons.insert(candidate.label(), e.to_string());
                    attempted.push(candidate.backend_uuid.clone());
                }
            }
        }

        let Some((candidate, mut created_config)) = created else {
            if let Err(e) = self.compensate(ctx, &txn, CompensationScope::Inline(&attempted)).await {
                warn!(volume = %config.name, error = %e, "Cleanup after failed placement did not complete");
            }
            return Err(Error::BackendIneligible {
                volume: config.name.clone(),
                reasons,
            });
        };

        if created_config.protocol == Protocol::Any {
            created_config.protocol = candidate.driver.protocol();
        }
        let volume = Volume::new(created_config, &candidate.backend_uuid, &candidate.pool.name);
        self.commit_new_volume(ctx, &txn, &candidate, volume).await
    }

    /// Restrict placement to the pool a slow create was started on
    fn resume_candidates(&self, txn: &VolumeTransaction, candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        let creating = txn.creating.as_ref().ok_or_else(|| {
            Error::TypeAssertion(format!("volume creating transaction for {} has no location", txn.name()))
        })?;
        let resumed: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.backend_uuid == creating.backend_uuid && c.pool.name == creating.pool)
            .collect();
        if resumed.is_empty() {
            return Err(Error::FailedPrecondition(format!(
                "pool {} of backend {} is no longer available to finish creating volume {}",
                creating.pool,
                creating.backend_uuid,
                txn.name()
            )));
        }
        Ok(resumed)
    }

    /// Persist a volume the backend has created, then index it.
    ///
    /// A backend marked for deletion while the create ran does not get the
    /// volume: it is destroyed again and the request fails.
    async fn commit_new_volume(
        &self,
        ctx: &RequestContext,
        txn: &VolumeTransaction,
        candidate: &Candidate,
        volume: Volume,
    ) -> Result<VolumeExternal> {
        let refused = {
            let catalog = self.catalog.lock();
            match catalog.backends.get(&candidate.backend_uuid) {
                Some(backend) if backend.state != BackendState::Deleting => None,
                _ => Some(format!(
                    "backend {} was deleted while volume {} was being created",
                    candidate.backend_name,
                    volume.name()
                )),
            }
        };
        if let Some(reason) = refused {
            warn!(volume = %volume.name(), backend = %candidate.backend_name, "Discarding volume created on a deleted backend");
            self.discard_created_volume(ctx, &candidate.driver, &volume).await;
            self.abandon_transaction(txn).await;
            return Err(Error::FailedPrecondition(reason));
        }

        if let Err(e) = self.store.add_volume(&volume).await {
            self.discard_created_volume(ctx, &candidate.driver, &volume).await;
            self.abandon_transaction(txn).await;
            return Err(e);
        }
        self.finish_transaction(txn).await?;

        let external = volume.construct_external();
        {
            let mut catalog = self.catalog.lock();
            catalog.creating.remove(volume.name());
            catalog.insert_volume(volume);
        }
        info!(
            volume = %external.config.name,
            pool = %candidate.label(),
            size_bytes = external.config.size_bytes,
            "Created volume"
        );
        Ok(external)
    }

    /// Create a volume from an existing volume or one of its snapshots
    pub async fn clone_volume(&self, ctx: &RequestContext, mut config: VolumeConfig) -> Result<VolumeExternal> {
        self.check_ready()?;
        config.validate()?;
        let source_name = config
            .clone_source_volume
            .clone()
            .ok_or_else(|| Error::InvalidArgument(format!("volume {} names no clone source", config.name)))?;
        let config_name = config.name.clone();

        let (source, candidate) = {
            let mut catalog = self.catalog.lock();
            if catalog.volume_name_in_use(&config.name) {
                return Err(Error::VolumeExists { name: config.name.clone() });
            }
            if catalog.subordinate_volumes.contains_key(&source_name) {
                return Err(Error::InvalidArgument(format!(
                    "cannot clone subordinate volume {}",
                    source_name
                )));
            }
            let source = catalog.require_volume(&source_name)?.clone();
            if source.orphaned || source.state != VolumeState::Online {
                return Err(Error::FailedPrecondition(format!(
                    "clone source volume {} is {}{}",
                    source_name,
                    source.state,
                    if source.orphaned { " and orphaned" } else { "" }
                )));
            }

            match &config.clone_source_snapshot {
                Some(snapshot) => {
                    let snapshot = catalog
                        .snapshot(&source_name, snapshot)
                        .ok_or_else(|| Error::not_found("snapshot", format!("{}/{}", source_name, snapshot)))?;
                    config.luks_passphrase_names = snapshot.config.luks_passphrase_names.clone();
                }
                None => config.luks_passphrase_names = source.config.luks_passphrase_names.clone(),
            }

            let backend = catalog
                .backends
                .get(&source.backend_uuid)
                .ok_or_else(|| Error::not_found("backend", &source.backend_uuid))?;
            let candidate = Candidate {
                backend_uuid: backend.uuid.clone(),
                backend_name: backend.name.clone(),
                driver: backend.driver()?,
                pool: backend.pools.get(&source.pool).cloned().unwrap_or_default(),
            };
            catalog.claim("cloneVolume", &[config.name.as_str()], &[source_name.as_str()])?;
            (source, candidate)
        };
        let _claim = Claimed::new(&self.catalog, &[config.name.as_str(), source_name.as_str()]);

        let result = self.clone_onto_source_backend(ctx, config, &source, candidate).await;
        self.end_create(ctx, &config_name).await;
        result
    }

    async fn clone_onto_source_backend(
        &self,
        ctx: &RequestContext,
        mut config: VolumeConfig,
        source: &Volume,
        candidate: Candidate,
    ) -> Result<VolumeExternal> {
        let source_name = source.name().to_string();

        if config.storage_class.is_empty() {
            config.storage_class = source.config.storage_class.clone();
        }
        if config.size_bytes == 0 {
            config.size_bytes = source.config.size_bytes;
        }
        if config.size_bytes < source.config.size_bytes {
            return Err(Error::UnsupportedCapacityRange(format!(
                "clone {} ({} bytes) cannot be smaller than its source {} ({} bytes)",
                config.name, config.size_bytes, source_name, source.config.size_bytes
            )));
        }
        self.check_size_limit(&config.name, config.size_bytes)?;
        config.protocol = source.config.protocol;
        config.access_info = Default::default();
        config.subordinate_volumes.clear();
        config.internal_name = candidate.driver.internal_volume_name(&config);

        let txn = VolumeTransaction::new(VolumeOperation::AddVolume, config.clone());
        self.begin_transaction(&txn).await?;
        let started = self
            .catalog
            .lock()
            .start_create(&config.name, &candidate.backend_uuid);
        if let Err(e) = started {
            self.abandon_transaction(&txn).await;
            return Err(e);
        }

        let pool = (!candidate.pool.name.is_empty()).then_some(&candidate.pool);
        let result = ctx
            .call(
                "create_clone",
                candidate.driver.create_clone(&source.config, &mut config, pool),
            )
            .await;
        if let Err(e) = result {
            if !e.skips_compensation() {
                let attempted = [candidate.backend_uuid.clone()];
                if let Err(cleanup) = self.compensate(ctx, &txn, CompensationScope::Inline(&attempted)).await {
                    warn!(volume = %config.name, error = %cleanup, "Cleanup after failed clone did not complete");
                }
            }
            return Err(e);
        }

        let volume = Volume::new(config, &candidate.backend_uuid, &source.pool);
        self.commit_new_volume(ctx, &txn, &candidate, volume).await
    }

    /// Delete a volume or subordinate volume.
    ///
    /// Volumes that still have subordinates or snapshots are only marked
    /// deleting; removing the last dependent finishes the job.
    pub async fn delete_volume(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        self.check_ready()?;
        let mut next = Some(name.to_string());
        while let Some(name) = next {
            next = self.delete_volume_once(ctx, &name).await?;
        }
        Ok(())
    }

    /// Delete one volume, returning a source volume whose deferred delete
    /// can now complete
    async fn delete_volume_once(&self, ctx: &RequestContext, name: &str) -> Result<Option<String>> {
        if self.catalog.lock().subordinate_volumes.contains_key(name) {
            return self.delete_subordinate_volume(name).await;
        }

        let (mut volume, deferred, driver) = {
            let mut catalog = self.catalog.lock();
            let volume = catalog.require_volume(name)?.clone();
            catalog.claim("deleteVolume", &[name], &[])?;
            if let Err(e) = catalog.require_unpublished(name) {
                catalog.release(name);
                return Err(e);
            }
            let deferred = !volume.config.subordinate_volumes.is_empty() || catalog.has_snapshots(name);
            let driver = catalog
                .backends
                .get(&volume.backend_uuid)
                .and_then(|b| b.driver.clone());
            (volume, deferred, driver)
        };
        let _claim = Claimed::new(&self.catalog, &[name]);

        if deferred {
            if volume.state != VolumeState::Deleting {
                volume.state = VolumeState::Deleting;
                self.store.update_volume(&volume).await?;
                if let Some(current) = self.catalog.lock().volumes.get_mut(name) {
                    current.state = VolumeState::Deleting;
                }
                info!(volume = %name, "Volume has dependents, deletion deferred");
            }
            return Ok(None);
        }

        let txn = VolumeTransaction::new(VolumeOperation::DeleteVolume, volume.config.clone());
        self.begin_transaction(&txn).await?;

        match driver {
            Some(driver) if !volume.config.import_not_managed && !volume.state.is_missing() => {
                match ctx.call("destroy", driver.destroy(&volume.config)).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_managed() => {
                        debug!(volume = %name, "Backend does not manage volume, removing record only")
                    }
                    Err(e) if e.skips_compensation() => return Err(e),
                    Err(e) => {
                        self.abandon_transaction(&txn).await;
                        return Err(e);
                    }
                }
            }
            Some(_) => debug!(volume = %name, state = %volume.state, "Skipping backend destroy"),
            None => warn!(
                volume = %name,
                internal_name = %volume.config.internal_name,
                backend_uuid = %volume.backend_uuid,
                "Backend has no driver, storage is left on the array"
            ),
        }

        self.delete_volume_publications(name).await?;
        self.store.delete_volume_ignore_not_found(name).await?;
        self.finish_transaction(&txn).await?;
        self.catalog.lock().remove_volume(name);
        info!(volume = %name, "Deleted volume");

        self.remove_backend_if_drained(ctx, &volume.backend_uuid).await;
        Ok(None)
    }

    /// Grow a volume, or adjust the size of a subordinate within its source
    pub async fn resize_volume(&self, ctx: &RequestContext, name: &str, size_bytes: u64) -> Result<()> {
        self.check_ready()?;
        self.check_size_limit(name, size_bytes)?;

        if self.catalog.lock().subordinate_volumes.contains_key(name) {
            return self.resize_subordinate_volume(name, size_bytes).await;
        }

        let (volume, driver) = {
            let mut catalog = self.catalog.lock();
            let volume = catalog.require_volume(name)?.clone();
            if volume.state != VolumeState::Online || volume.orphaned {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} is {} and cannot be resized",
                    name, volume.state
                )));
            }
            let driver = catalog
                .backends
                .get(&volume.backend_uuid)
                .ok_or_else(|| Error::not_found("backend", &volume.backend_uuid))?
                .driver()?;
            catalog.claim("resizeVolume", &[name], &[])?;
            (volume, driver)
        };
        let _claim = Claimed::new(&self.catalog, &[name]);

        if size_bytes < volume.config.size_bytes {
            return Err(Error::UnsupportedCapacityRange(format!(
                "cannot shrink volume {} from {} to {} bytes",
                name, volume.config.size_bytes, size_bytes
            )));
        }
        if size_bytes == volume.config.size_bytes {
            return Ok(());
        }

        let mut target = volume.config.clone();
        target.size_bytes = size_bytes;
        let txn = VolumeTransaction::new(VolumeOperation::ResizeVolume, target);
        self.begin_transaction(&txn).await?;

        let mut resized = volume.clone();
        if let Err(e) = ctx.call("resize", driver.resize(&mut resized.config, size_bytes)).await {
            if !e.skips_compensation() {
                self.abandon_transaction(&txn).await;
            }
            return Err(e);
        }
        resized.config.size_bytes = size_bytes;

        self.store.update_volume(&resized).await?;
        self.finish_transaction(&txn).await?;
        self.catalog.lock().insert_volume(resized);
        info!(volume = %name, size_bytes, "Resized volume");
        Ok(())
    }

    /// Record rotated LUKS passphrase names for a volume
    pub async fn update_volume_luks_passphrase_names(&self, name: &str, names: Vec<String>) -> Result<VolumeExternal> {
        self.check_ready()?;
        let mut volume = {
            let mut catalog = self.catalog.lock();
            let volume = catalog.require_volume(name)?.clone();
            if volume.state.is_missing() {
                return Err(Error::FailedPrecondition(format!("volume {} is {}", name, volume.state)));
            }
            catalog.claim("updateVolume", &[name], &[])?;
            volume
        };
        let _claim = Claimed::new(&self.catalog, &[name]);
        volume.config.luks_passphrase_names = names;
        self.store.update_volume(&volume).await?;

        let external = volume.construct_external();
        self.catalog.lock().insert_volume(volume);
        Ok(external)
    }

    /// Candidate pools for a class, for diagnostics
    pub fn storage_class_candidates(&self, class: &str, protocol: Protocol) -> Result<(Vec<String>, BTreeMap<String, String>)> {
        self.check_ready()?;
        let catalog = self.catalog.lock();
        let class = catalog
            .storage_classes
            .get(class)
            .ok_or_else(|| Error::not_found("storage class", class))?;
        let (candidates, rejected) = selector::candidate_pools(&catalog, class, protocol);
        Ok((candidates.iter().map(Candidate::label).collect(), rejected))
    }
}

#[cfg(test)]
mod tests {
    use crate::controlplane::context::RequestContext;
    use crate::controlplane::test_utils::harness;
    use crate::domain::ports::{RecordKind, StoreClient};
    use crate::model::{AccessMode, Protocol, VolumeConfig, VolumeMode, VolumeOperation, VolumeState};
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[tokio::test]
    async fn test_basic_provision() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;

        let mut config = VolumeConfig::new("basic", 1 << 30, "fast");
        config.protocol = Protocol::File;
        let volume = h.orchestrator.add_volume(&RequestContext::new(), config).await.unwrap();

        assert_eq!(volume.backend_uuid, h.backend_uuid("fast-a"));
        assert_eq!(volume.pool, "FastSmall");
        assert_eq!(volume.config.protocol, Protocol::File);
        assert!(h.store.contains(RecordKind::Volume, "basic"));
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
        assert!(h
            .orchestrator
            .get_backend("fast-a")
            .unwrap()
            .volumes
            .contains(&"basic".to_string()));
        assert!(h.arrays.array("fast-a").has_volume("basic"));
    }

    #[tokio::test]
    async fn test_capacity_denial() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;

        let err = h
            .orchestrator
            .add_volume(&RequestContext::new(), VolumeConfig::new("large", 100 << 30, "fast"))
            .await
            .unwrap_err();
        assert_matches!(err, crate::Error::BackendIneligible { ref reasons, .. } if reasons.contains_key("fast-a/FastSmall"));
        assert!(!h.store.contains(RecordKind::Volume, "large"));
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        let err = h
            .orchestrator
            .add_volume(&RequestContext::new(), VolumeConfig::new("basic", 1 << 20, "fast"))
            .await
            .unwrap_err();
        assert!(err.is_volume_exists());
    }

    #[tokio::test]
    async fn test_block_request_skips_file_backend() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        let mut config = VolumeConfig::new("raw", 1 << 20, "fast");
        config.volume_mode = VolumeMode::RawBlock;
        let err = h.orchestrator.add_volume(&RequestContext::new(), config).await.unwrap_err();
        assert!(err.is_backend_ineligible());

        let mut config = VolumeConfig::new("shared", 1 << 20, "fast");
        config.access_mode = AccessMode::ReadWriteMany;
        config.protocol = Protocol::Block;
        assert_matches!(
            h.orchestrator.add_volume(&RequestContext::new(), config).await,
            Err(crate::Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_driver_panic_leaves_transaction() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.arrays.array("fast-a").panic_on("create");

        let err = h
            .orchestrator
            .add_volume(&RequestContext::new(), VolumeConfig::new("boom", 1 << 20, "fast"))
            .await
            .unwrap_err();
        assert_matches!(err, crate::Error::DriverPanic { .. });
        assert!(h.store.contains(RecordKind::VolumeTransaction, "boom"));

        h.arrays.array("fast-a").clear_faults();
        let retry = h
            .orchestrator
            .add_volume(&RequestContext::new(), VolumeConfig::new("boom", 1 << 20, "fast"))
            .await
            .unwrap_err();
        assert!(retry.is_in_progress());
    }

    #[tokio::test]
    async fn test_cancelled_create_leaves_transaction() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.arrays.array("fast-a").delay("create", Duration::from_secs(30));

        let ctx = RequestContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = h
            .orchestrator
            .add_volume(&ctx, VolumeConfig::new("slow", 1 << 20, "fast"))
            .await
            .unwrap_err();
        assert_matches!(err, crate::Error::Cancelled { .. });
        assert!(h.store.contains(RecordKind::VolumeTransaction, "slow"));
    }

    #[tokio::test]
    async fn test_volume_creating_resumes() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.arrays.array("fast-a").set_create_rounds(2);
        let ctx = RequestContext::new();

        let err = h
            .orchestrator
            .add_volume(&ctx, VolumeConfig::new("slow", 1 << 20, "fast"))
            .await
            .unwrap_err();
        assert!(err.is_volume_creating());
        let txn = h
            .store
            .get_volume_transactions()
            .await
            .unwrap()
            .pop()
            .unwrap();
        assert_eq!(txn.op, VolumeOperation::VolumeCreating);
        assert!(txn.creating.is_some());

        h.arrays.array("fast-a").set_create_rounds(0);
        assert!(h
            .orchestrator
            .add_volume(&ctx, VolumeConfig::new("slow", 1 << 20, "fast"))
            .await
            .unwrap_err()
            .is_volume_creating());
        let volume = h
            .orchestrator
            .add_volume(&ctx, VolumeConfig::new("slow", 1 << 20, "fast"))
            .await
            .unwrap();
        assert_eq!(volume.config.name, "slow");
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
    }

    #[tokio::test]
    async fn test_store_failure_destroys_created_volume() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.store.inject_write_failure(RecordKind::Volume, "basic");

        assert!(h
            .orchestrator
            .add_volume(&RequestContext::new(), VolumeConfig::new("basic", 1 << 20, "fast"))
            .await
            .is_err());
        assert!(!h.arrays.array("fast-a").has_volume("basic"));
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
        assert!(h.orchestrator.get_volume("basic").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_clone_with_rotated_passphrase() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        let ctx = RequestContext::new();

        let mut config = VolumeConfig::new("V", 1 << 20, "fast");
        config.luks_encryption = true;
        config.luks_passphrase_names = vec!["A".into(), "B".into()];
        h.orchestrator.add_volume(&ctx, config).await.unwrap();
        h.orchestrator
            .create_snapshot(&ctx, crate::model::SnapshotConfig::new("V", "S"))
            .await
            .unwrap();
        h.orchestrator
            .update_volume_luks_passphrase_names("V", vec!["A".into()])
            .await
            .unwrap();

        let mut clone = VolumeConfig::new("C", 0, "");
        clone.clone_source_volume = Some("V".into());
        clone.clone_source_snapshot = Some("S".into());
        let clone = h.orchestrator.add_volume(&ctx, clone).await.unwrap();
        assert_eq!(clone.config.luks_passphrase_names, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(clone.config.storage_class, "fast");

        let mut current = VolumeConfig::new("C2", 0, "");
        current.clone_source_volume = Some("V".into());
        let current = h.orchestrator.add_volume(&ctx, current).await.unwrap();
        assert_eq!(current.config.luks_passphrase_names, vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_volume_round_trip() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        let volumes_before = h.store.count(RecordKind::Volume);
        h.add_volume("basic", 1 << 20).await;

        h.orchestrator.delete_volume(&RequestContext::new(), "basic").await.unwrap();
        assert_eq!(h.store.count(RecordKind::Volume), volumes_before);
        assert!(!h.arrays.array("fast-a").has_volume("basic"));
        assert!(h.orchestrator.get_backend("fast-a").unwrap().volumes.is_empty());
        assert!(h
            .orchestrator
            .delete_volume(&RequestContext::new(), "basic")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_delete_failure_keeps_volume() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        h.arrays.array("fast-a").fail("destroy", "busy");

        assert!(h.orchestrator.delete_volume(&RequestContext::new(), "basic").await.is_err());
        assert!(h.orchestrator.get_volume("basic").is_ok());
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
    }

    #[tokio::test]
    async fn test_resize() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        let ctx = RequestContext::new();

        h.orchestrator.resize_volume(&ctx, "basic", 2 << 20).await.unwrap();
        assert_eq!(h.orchestrator.get_volume("basic").unwrap().config.size_bytes, 2 << 20);
        assert_eq!(h.store.get_volume("basic").await.unwrap().config.size_bytes, 2 << 20);

        let err = h.orchestrator.resize_volume(&ctx, "basic", 1 << 20).await.unwrap_err();
        assert!(err.is_unsupported_capacity_range());
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
    }

    #[tokio::test]
    async fn test_backend_deleted_during_create() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.arrays.array("fast-a").delay("create", Duration::from_millis(200));

        let orchestrator = h.orchestrator.clone();
        let create = tokio::spawn(async move {
            orchestrator
                .add_volume(&RequestContext::new(), VolumeConfig::new("racing", 1 << 20, "fast"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The running create keeps the backend until it settles
        h.orchestrator.delete_backend(&RequestContext::new(), "fast-a").await.unwrap();
        assert_eq!(h.orchestrator.get_backend("fast-a").unwrap().state, crate::model::BackendState::Deleting);
        assert!(h.store.contains(RecordKind::Backend, "fast-a"));

        let err = create.await.unwrap().unwrap_err();
        assert!(err.is_failed_precondition());
        assert!(!h.arrays.array("fast-a").has_volume("racing"));
        assert!(!h.store.contains(RecordKind::Volume, "racing"));
        assert_eq!(h.store.count(RecordKind::VolumeTransaction), 0);
        assert!(h.orchestrator.get_backend("fast-a").unwrap_err().is_not_found());
        assert!(!h.store.contains(RecordKind::Backend, "fast-a"));
    }

    #[tokio::test]
    async fn test_concurrent_operations_on_one_volume() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        h.arrays.array("fast-a").delay("resize", Duration::from_millis(200));

        let orchestrator = h.orchestrator.clone();
        let resize = tokio::spawn(async move {
            orchestrator
                .resize_volume(&RequestContext::new(), "basic", 2 << 20)
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ctx = RequestContext::new();
        assert_matches!(
            h.orchestrator.delete_volume(&ctx, "basic").await,
            Err(crate::Error::InProgress { ref operation, .. }) if operation == "resizeVolume"
        );
        assert!(h
            .orchestrator
            .add_volume(&ctx, VolumeConfig::new("basic", 1 << 20, "fast"))
            .await
            .unwrap_err()
            .is_volume_exists());
        resize.await.unwrap().unwrap();

        h.orchestrator.delete_volume(&ctx, "basic").await.unwrap();
        assert!(!h.store.contains(RecordKind::Volume, "basic"));
    }

    #[tokio::test]
    async fn test_missing_backend_volume_is_delete_only() {
        let h = harness().await;
        h.store
            .add_volume(&crate::model::Volume::new(VolumeConfig::new("lost", 1 << 20, "fast"), "gone", "p"))
            .await
            .unwrap();
        let h = h.restart().await;
        let ctx = RequestContext::new();

        assert_eq!(h.orchestrator.get_volume("lost").unwrap().state, VolumeState::MissingBackend);
        assert!(h
            .orchestrator
            .resize_volume(&ctx, "lost", 2 << 20)
            .await
            .unwrap_err()
            .is_failed_precondition());
        h.orchestrator.delete_volume(&ctx, "lost").await.unwrap();
        assert!(!h.store.contains(RecordKind::Volume, "lost"));
    }
}
