//! Volume publication lifecycle
//!
//! Under the CSI front end every attachment is recorded as a publication and
//! the `not_safe_to_attach` flag fences a volume off a node that may still be
//! writing to it. The Docker front end publishes without records.
//!
//! Publishes and unpublishes share a claim on the volume and its backing
//! volume, so they overlap each other but never a delete or resize.

use crate::controlplane::catalog::Claimed;
use crate::controlplane::config::FrontendContext;
use crate::controlplane::context::RequestContext;
use crate::controlplane::orchestrator::Orchestrator;
use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use crate::model::{Volume, VolumePublication, VolumePublishInfo, VolumeState};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything an unpublish needs, gathered under one lock
struct UnpublishPlan {
    backing: Volume,
    driver: Option<Arc<dyn StorageDriver>>,
    publication: Option<VolumePublication>,
    info: VolumePublishInfo,
}

impl Orchestrator {
    /// Attach a volume (or subordinate) to the node named by `info.host_name`
    pub async fn publish_volume(
        &self,
        ctx: &RequestContext,
        volume_name: &str,
        mut info: VolumePublishInfo,
    ) -> Result<VolumePublishInfo> {
        self.check_ready()?;
        let csi = self.frontend() == FrontendContext::Csi;
        let node_name = info.host_name.clone();

        let (mut backing, driver, existing, nodes) = {
            let mut catalog = self.catalog.lock();
            let node = catalog
                .nodes
                .get(&node_name)
                .ok_or_else(|| Error::not_found("node", &node_name))?;
            if node.deleted {
                return Err(Error::FailedPrecondition(format!("node {} is being deleted", node_name)));
            }
            if info.host_iqn.is_none() {
                info.host_iqn = node.iqn.clone();
            }
            if info.host_ips.is_empty() {
                info.host_ips = node.ips.clone();
            }

            let backing = catalog.backing_volume(volume_name)?.clone();
            if backing.state == VolumeState::Deleting || backing.state.is_missing() {
                return Err(Error::FailedPrecondition(format!(
                    "volume {} is {} and cannot be published",
                    backing.name(),
                    backing.state
                )));
            }
            if catalog
                .subordinate_volumes
                .get(volume_name)
                .is_some_and(|s| s.state == VolumeState::Deleting)
            {
                return Err(Error::FailedPrecondition(format!("volume {} is deleting", volume_name)));
            }
            let driver = catalog
                .backends
                .get(&backing.backend_uuid)
                .ok_or_else(|| Error::not_found("backend", &backing.backend_uuid))?
                .driver()?;
            let existing = catalog.publication(volume_name, &node_name).cloned();
            let nodes = catalog.active_nodes();
            catalog.claim("publishVolume", &[], &[backing.name(), volume_name])?;
            (backing, driver, existing, nodes)
        };
        let backing_name = backing.name().to_string();
        let _claim = Claimed::new(&self.catalog, &[backing_name.as_str(), volume_name]);

        let mut created = None;
        if csi {
            match existing {
                Some(publication) if publication.not_safe_to_attach => {
                    return Err(Error::FailedPrecondition(format!(
                        "volume {} is not safe to attach to node {} until it is cleanly unpublished",
                        volume_name, node_name
                    )));
                }
                Some(_) => debug!(volume = %volume_name, node = %node_name, "Publication already recorded"),
                None => {
                    let publication =
                        VolumePublication::new(volume_name, &node_name, info.read_only, info.access_mode);
                    self.store.add_volume_publication(&publication).await?;
                    self.catalog.lock().insert_publication(publication.clone());
                    created = Some(publication);
                }
            }
        }

        if let Err(e) = self
            .publish_on_backend(ctx, csi, &mut backing, &driver, &nodes, &mut info)
            .await
        {
            if let Some(publication) = created {
                if !e.skips_compensation() {
                    self.forget_publication(&publication).await;
                }
            }
            return Err(e);
        }

        backing.config.access_info = info.access_info.clone();
        self.store.update_volume(&backing).await?;
        if let Some(current) = self.catalog.lock().volumes.get_mut(&backing_name) {
            current.config.access_info = info.access_info.clone();
        }
        self.publication_sync
            .lock()
            .first_successful_publish
            .get_or_insert_with(Instant::now);

        info!(volume = %volume_name, node = %node_name, "Published volume");
        Ok(info)
    }

    async fn publish_on_backend(
        &self,
        ctx: &RequestContext,
        csi: bool,
        backing: &mut Volume,
        driver: &Arc<dyn StorageDriver>,
        nodes: &[crate::model::Node],
        info: &mut VolumePublishInfo,
    ) -> Result<()> {
        if csi && self.publications_synced().await? && !backing.config.access_info.publish_enforcement {
            ctx.call("enable_publish_enforcement", driver.enable_publish_enforcement(backing))
                .await?;
            info!(volume = %backing.name(), "Enabled publish enforcement");
        }
        info.backend_uuid = backing.backend_uuid.clone();
        info.nodes = nodes.to_vec();
        info.access_info.publish_enforcement = backing.config.access_info.publish_enforcement;

        ctx.call(
            "reconcile_node_access",
            driver.reconcile_node_access(nodes, &backing.backend_uuid),
        )
        .await?;
        ctx.call("publish_volume", driver.publish_volume(&backing.config, info))
            .await
    }

    /// Whether per-node enforcement is on, flipping it once the grace
    /// window after the first publish has passed
    async fn publications_synced(&self) -> Result<bool> {
        let grace = self.config.publication_sync_grace();
        {
            let sync = self.publication_sync.lock();
            if sync.synced {
                return Ok(true);
            }
            let elapsed = grace.is_zero() || sync.first_successful_publish.is_some_and(|t| t.elapsed() >= grace);
            if !elapsed {
                return Ok(false);
            }
        }

        let mut version = match self.store.get_version().await {
            Ok(version) => version,
            Err(e) if e.is_not_found() => Default::default(),
            Err(e) => return Err(e),
        };
        version.publications_synced = true;
        version.revision += 1;
        self.store.set_version(&version).await?;
        self.publication_sync.lock().synced = true;
        info!("Volume publications are synced, enforcing per-node access");
        Ok(true)
    }

    async fn forget_publication(&self, publication: &VolumePublication) {
        if let Err(e) = self.store.delete_volume_publication(publication).await {
            if !e.is_not_found() {
                warn!(publication = %publication.name, error = %e, "Failed to remove publication record");
            }
        }
        self.catalog
            .lock()
            .remove_publication(&publication.volume_name, &publication.node_name);
    }

    /// Detach a volume from a node
    pub async fn unpublish_volume(&self, ctx: &RequestContext, volume_name: &str, node_name: &str) -> Result<()> {
        self.check_ready()?;
        self.unpublish_volume_inner(ctx, volume_name, node_name, false).await
    }

    async fn unpublish_volume_inner(
        &self,
        ctx: &RequestContext,
        volume_name: &str,
        node_name: &str,
        dirty: bool,
    ) -> Result<()> {
        let csi = self.frontend() == FrontendContext::Csi;
        let Some(plan) = self.plan_unpublish(volume_name, node_name, csi)? else {
            debug!(volume = %volume_name, node = %node_name, "No publication, nothing to unpublish");
            return Ok(());
        };
        let _claim = Claimed::new(&self.catalog, &[plan.backing.name(), volume_name]);

        let fenced = plan.publication.as_ref().is_some_and(|p| p.not_safe_to_attach);
        if fenced && !dirty {
            debug!(volume = %volume_name, node = %node_name, "Already unpublished by fencing");
        } else {
            match &plan.driver {
                Some(driver) => {
                    ctx.call("unpublish_volume", driver.unpublish_volume(&plan.backing.config, &plan.info))
                        .await?
                }
                None => warn!(volume = %volume_name, "Backend has no driver, skipping backend unpublish"),
            }
        }

        let Some(mut publication) = plan.publication else {
            info!(volume = %volume_name, node = %node_name, "Unpublished volume");
            return Ok(());
        };
        if dirty {
            publication.not_safe_to_attach = true;
            publication.unpublished = true;
            self.store.update_volume_publication(&publication).await?;
            self.catalog.lock().insert_publication(publication);
            info!(volume = %volume_name, node = %node_name, "Fenced volume off node");
            return Ok(());
        }

        self.delete_publication(&publication).await?;
        info!(volume = %volume_name, node = %node_name, "Unpublished volume");
        Ok(())
    }

    /// Gather an unpublish under one lock, claiming the volume if there is
    /// anything to do
    fn plan_unpublish(&self, volume_name: &str, node_name: &str, csi: bool) -> Result<Option<UnpublishPlan>> {
        let mut catalog = self.catalog.lock();
        let publication = catalog.publication(volume_name, node_name).cloned();
        if csi && publication.is_none() {
            return Ok(None);
        }
        let backing = catalog.backing_volume(volume_name)?.clone();

        // Any other member of the family still attached keeps the node's access
        let family_attached = std::iter::once(backing.name().to_string())
            .chain(backing.config.subordinate_volumes.iter().cloned())
            .filter(|name| name != volume_name)
            .any(|name| catalog.publication(&name, node_name).is_some());

        let node = catalog.nodes.get(node_name);
        let info = VolumePublishInfo {
            host_name: node_name.to_string(),
            host_iqn: node.and_then(|n| n.iqn.clone()),
            host_ips: node.map(|n| n.ips.clone()).unwrap_or_default(),
            nodes: catalog.active_nodes(),
            backend_uuid: backing.backend_uuid.clone(),
            access_info: backing.config.access_info.clone(),
            read_only: publication.as_ref().is_some_and(|p| p.read_only),
            last_publication: !csi || !family_attached,
            ..Default::default()
        };
        let driver = catalog
            .backends
            .get(&backing.backend_uuid)
            .and_then(|b| b.driver.clone());
        catalog.claim("unpublishVolume", &[], &[backing.name(), volume_name])?;

        Ok(Some(UnpublishPlan {
            backing,
            driver,
            publication,
            info,
        }))
    }

    /// Drop the leftover publications of a volume being deleted. Live ones
    /// are refused before a delete starts, so only fenced ones remain.
    pub(crate) async fn delete_volume_publications(&self, volume_name: &str) -> Result<()> {
        let publications = self.catalog.lock().publications_for_volume(volume_name);
        for publication in &publications {
            self.delete_publication(publication).await?;
        }
        if !publications.is_empty() {
            info!(volume = %volume_name, count = publications.len(), "Removed publications of deleted volume");
        }
        Ok(())
    }

    /// Remove a publication, then a deleted node it was keeping around
    async fn delete_publication(&self, publication: &VolumePublication) -> Result<()> {
        match self.store.delete_volume_publication(publication).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        let drained_node = {
            let mut catalog = self.catalog.lock();
            catalog.remove_publication(&publication.volume_name, &publication.node_name);
            catalog
                .nodes
                .get(&publication.node_name)
                .filter(|n| n.deleted)
                .is_some()
                && catalog.publications_for_node(&publication.node_name).is_empty()
        };
        if drained_node {
            self.remove_node_record(&publication.node_name).await?;
        }
        Ok(())
    }

    /// Move the fencing flag of a publication.
    ///
    /// Setting it unpublishes on the backend but keeps the record; clearing
    /// it drops the record so the volume can attach elsewhere.
    pub async fn update_volume_publication(
        &self,
        ctx: &RequestContext,
        volume_name: &str,
        node_name: &str,
        not_safe_to_attach: bool,
    ) -> Result<()> {
        self.check_ready()?;
        let publication = self
            .catalog
            .lock()
            .publication(volume_name, node_name)
            .cloned()
            .ok_or_else(|| {
                Error::not_found(
                    "volume publication",
                    crate::model::node::make_publication_name(volume_name, node_name),
                )
            })?;

        match (publication.not_safe_to_attach, not_safe_to_attach) {
            (false, false) | (true, true) => Ok(()),
            (false, true) => self.unpublish_volume_inner(ctx, volume_name, node_name, true).await,
            (true, false) => {
                self.delete_publication(&publication).await?;
                info!(volume = %volume_name, node = %node_name, "Cleared fenced publication");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::controlplane::config::FrontendContext;
    use crate::controlplane::context::RequestContext;
    use crate::controlplane::test_utils::{harness, harness_with_config, Harness};
    use crate::controlplane::OrchestratorConfig;
    use crate::domain::ports::{RecordKind, StoreClient};
    use crate::model::{VolumeConfig, VolumePublishInfo};
    use std::time::Duration;

    async fn published() -> Harness {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("V", 1 << 20).await;
        h.add_node("N").await;
        h.orchestrator
            .publish_volume(&RequestContext::new(), "V", VolumePublishInfo::for_host("N"))
            .await
            .unwrap();
        h
    }

    #[tokio::test]
    async fn test_publish_records_publication() {
        let h = published().await;
        let publication = h.orchestrator.get_volume_publication("V", "N").unwrap();
        assert!(!publication.not_safe_to_attach);
        assert!(!publication.unpublished);
        assert!(h.store.contains(RecordKind::VolumePublication, "V/N"));

        let volume = h.orchestrator.get_volume("V").unwrap();
        assert!(!volume.config.access_info.nfs.nfs_path.is_empty());
        assert_eq!(h.arrays.array("fast-a").reconciled_nodes(), vec!["N".to_string()]);
    }

    #[tokio::test]
    async fn test_publication_fencing() {
        let h = published().await;
        let ctx = RequestContext::new();

        h.orchestrator.update_volume_publication(&ctx, "V", "N", true).await.unwrap();
        assert_eq!(h.arrays.array("fast-a").call_count("unpublish_volume"), 1);
        let fenced = h.orchestrator.get_volume_publication("V", "N").unwrap();
        assert!(fenced.not_safe_to_attach);
        assert!(fenced.unpublished);
        assert!(h.store.get_volume_publication("V/N").await.unwrap().not_safe_to_attach);

        assert!(h
            .orchestrator
            .publish_volume(&ctx, "V", VolumePublishInfo::for_host("N"))
            .await
            .unwrap_err()
            .is_failed_precondition());

        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
        assert_eq!(h.arrays.array("fast-a").call_count("unpublish_volume"), 1);
        assert!(!h.store.contains(RecordKind::VolumePublication, "V/N"));

        h.orchestrator
            .publish_volume(&ctx, "V", VolumePublishInfo::for_host("N"))
            .await
            .unwrap();
        h.orchestrator.update_volume_publication(&ctx, "V", "N", true).await.unwrap();
        h.orchestrator.update_volume_publication(&ctx, "V", "N", true).await.unwrap();
        assert_eq!(h.arrays.array("fast-a").call_count("unpublish_volume"), 2);

        h.orchestrator.update_volume_publication(&ctx, "V", "N", false).await.unwrap();
        assert!(h.orchestrator.get_volume_publication("V", "N").unwrap_err().is_not_found());
        assert!(!h.store.contains(RecordKind::VolumePublication, "V/N"));
    }

    #[tokio::test]
    async fn test_unpublish_is_idempotent() {
        let h = published().await;
        let ctx = RequestContext::new();
        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
        assert_eq!(h.arrays.array("fast-a").call_count("unpublish_volume"), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_drops_new_publication() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("V", 1 << 20).await;
        h.add_node("N").await;
        h.arrays.array("fast-a").fail("publish_volume", "export busy");

        assert!(h
            .orchestrator
            .publish_volume(&RequestContext::new(), "V", VolumePublishInfo::for_host("N"))
            .await
            .is_err());
        assert!(!h.store.contains(RecordKind::VolumePublication, "V/N"));
        assert!(h.orchestrator.list_volume_publications().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enforcement_enabled_once_synced() {
        let h = published().await;
        let version = h.store.get_version().await.unwrap();
        assert!(version.publications_synced);
        assert_eq!(version.revision, 1);
        assert!(h.orchestrator.get_volume("V").unwrap().config.access_info.publish_enforcement);
        assert_eq!(h.arrays.array("fast-a").call_count("enable_publish_enforcement"), 1);

        h.add_volume("W", 1 << 20).await;
        let ctx = RequestContext::new();
        h.orchestrator
            .publish_volume(&ctx, "W", VolumePublishInfo::for_host("N"))
            .await
            .unwrap();
        h.orchestrator
            .publish_volume(&ctx, "W", VolumePublishInfo::for_host("N"))
            .await
            .unwrap();
        assert_eq!(h.arrays.array("fast-a").call_count("enable_publish_enforcement"), 2);
    }

    #[tokio::test]
    async fn test_grace_window_defers_enforcement() {
        let config = OrchestratorConfig {
            publication_sync_grace_secs: 3600,
            ..Default::default()
        };
        let h = harness_with_config(config).await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("V", 1 << 20).await;
        h.add_node("N").await;
        h.orchestrator
            .publish_volume(&RequestContext::new(), "V", VolumePublishInfo::for_host("N"))
            .await
            .unwrap();

        assert!(!h.store.get_version().await.unwrap().publications_synced);
        assert_eq!(h.arrays.array("fast-a").call_count("enable_publish_enforcement"), 0);
        assert!(!h.orchestrator.status().publications_synced);
    }

    #[tokio::test]
    async fn test_deleted_node_removed_after_last_unpublish() {
        let h = published().await;
        let ctx = RequestContext::new();
        h.orchestrator.delete_node(&ctx, "N").await.unwrap();
        assert!(h.orchestrator.get_node("N").unwrap().deleted);
        assert!(h
            .orchestrator
            .publish_volume(&ctx, "V", VolumePublishInfo::for_host("N"))
            .await
            .unwrap_err()
            .is_failed_precondition());

        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
        assert!(h.orchestrator.get_node("N").unwrap_err().is_not_found());
        assert!(!h.store.contains(RecordKind::Node, "N"));
    }

    #[tokio::test]
    async fn test_subordinate_keeps_node_access() {
        let h = published().await;
        let ctx = RequestContext::new();
        let mut share = VolumeConfig::new("S", 0, "");
        share.share_source_volume = Some("V".into());
        h.orchestrator.add_volume(&ctx, share).await.unwrap();
        h.orchestrator
            .publish_volume(&ctx, "S", VolumePublishInfo::for_host("N"))
            .await
            .unwrap();

        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
        assert!(h.arrays.array("fast-a").volume("V").unwrap().hosts.contains("N"));
        h.orchestrator.unpublish_volume(&ctx, "S", "N").await.unwrap();
        assert!(h.arrays.array("fast-a").volume("V").unwrap().hosts.is_empty());
    }

    #[tokio::test]
    async fn test_delete_refused_while_published() {
        let h = published().await;
        let ctx = RequestContext::new();
        h.orchestrator.delete_node(&ctx, "N").await.unwrap();

        assert!(h
            .orchestrator
            .delete_volume(&ctx, "V")
            .await
            .unwrap_err()
            .is_failed_precondition());
        assert!(h.arrays.array("fast-a").has_volume("V"));
        assert!(h.store.contains(RecordKind::VolumePublication, "V/N"));

        // Fenced publications no longer hold the volume
        h.orchestrator.update_volume_publication(&ctx, "V", "N", true).await.unwrap();
        h.orchestrator.delete_volume(&ctx, "V").await.unwrap();

        assert!(h.orchestrator.list_volume_publications().unwrap().is_empty());
        assert_eq!(h.store.count(RecordKind::VolumePublication), 0);
        assert!(h.orchestrator.get_node("N").unwrap_err().is_not_found());
        assert!(!h.store.contains(RecordKind::Node, "N"));
        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_waits_for_inflight_publish() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("V", 1 << 20).await;
        h.add_node("N").await;
        h.arrays.array("fast-a").delay("publish_volume", Duration::from_millis(200));

        let orchestrator = h.orchestrator.clone();
        let publish = tokio::spawn(async move {
            orchestrator
                .publish_volume(&RequestContext::new(), "V", VolumePublishInfo::for_host("N"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ctx = RequestContext::new();
        let err = h.orchestrator.delete_volume(&ctx, "V").await.unwrap_err();
        assert!(err.is_in_progress());
        publish.await.unwrap().unwrap();
        assert!(h.arrays.array("fast-a").has_volume("V"));
        assert!(h.orchestrator.get_volume_publication("V", "N").is_ok());

        h.arrays.array("fast-a").clear_faults();
        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
        h.orchestrator.delete_volume(&ctx, "V").await.unwrap();
        assert_eq!(h.store.count(RecordKind::VolumePublication), 0);
    }

    #[tokio::test]
    async fn test_publish_refused_during_delete() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("V", 1 << 20).await;
        h.add_node("N").await;
        h.arrays.array("fast-a").delay("destroy", Duration::from_millis(200));

        let orchestrator = h.orchestrator.clone();
        let delete = tokio::spawn(async move { orchestrator.delete_volume(&RequestContext::new(), "V").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = h
            .orchestrator
            .publish_volume(&RequestContext::new(), "V", VolumePublishInfo::for_host("N"))
            .await
            .unwrap_err();
        assert!(err.is_in_progress());
        delete.await.unwrap().unwrap();

        assert!(h.orchestrator.get_volume("V").unwrap_err().is_not_found());
        assert!(h.orchestrator.list_volume_publications().unwrap().is_empty());
        assert_eq!(h.store.count(RecordKind::VolumePublication), 0);
    }

    #[tokio::test]
    async fn test_docker_keeps_no_records() {
        let config = OrchestratorConfig {
            frontend: FrontendContext::Docker,
            ..Default::default()
        };
        let h = harness_with_config(config).await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("V", 1 << 20).await;
        h.add_node("N").await;
        let ctx = RequestContext::new();

        h.orchestrator
            .publish_volume(&ctx, "V", VolumePublishInfo::for_host("N"))
            .await
            .unwrap();
        assert_eq!(h.store.count(RecordKind::VolumePublication), 0);
        h.orchestrator.unpublish_volume(&ctx, "V", "N").await.unwrap();
        assert_eq!(h.arrays.array("fast-a").call_count("unpublish_volume"), 1);
    }
}
