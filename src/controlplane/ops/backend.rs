//! Backend operations

use crate::controlplane::catalog::Claimed;
use crate::controlplane::context::RequestContext;
use crate::controlplane::drivers;
use crate::controlplane::orchestrator::Orchestrator;
use crate::controlplane::selector;
use crate::domain::ports::StorageDriver;
use crate::error::{Error, Result};
use crate::model::{Backend, BackendExternal, BackendState, Pool};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl Orchestrator {
    /// Register a backend, or update it if the name is already known
    pub async fn add_backend(
        &self,
        ctx: &RequestContext,
        config: serde_json::Value,
        config_ref: Option<String>,
    ) -> Result<BackendExternal> {
        self.check_ready()?;
        let name = drivers::backend_name(&config)
            .ok_or_else(|| Error::InvalidArgument(format!("backend config needs a {}", drivers::BACKEND_NAME_KEY)))?;
        let driver_name = drivers::driver_name(&config)?;

        let exists = self.catalog.lock().backend_by_name(&name).is_some();
        if exists {
            debug!(backend = %name, "Backend exists, updating instead");
            return self.update_backend(ctx, &name, config, config_ref).await;
        }
        if let Some(config_ref) = config_ref.as_deref() {
            if let Some(other) = self.catalog.lock().backend_by_config_ref(config_ref) {
                return Err(Error::already_exists("backend for config", format!("{} ({})", config_ref, other.name)));
            }
        }

        let uuid = Uuid::new_v4().to_string();
        let (driver, pools) = self.start_driver(ctx, &config, &uuid).await?;
        let backend = Backend {
            name: name.clone(),
            uuid: uuid.clone(),
            driver_name,
            driver: Some(driver.clone()),
            state: BackendState::Online,
            online: true,
            user_managed: config_ref.is_none(),
            config_ref,
            config,
            pools,
            volumes: BTreeSet::new(),
        };

        if let Err(e) = self.store.add_backend(&backend.construct_persistent()).await {
            driver.terminate().await;
            return Err(e);
        }

        let external = {
            let mut catalog = self.catalog.lock();
            catalog.backends.insert(uuid.clone(), backend);
            selector::reconcile_all(&mut catalog);
            catalog
                .backends
                .get(&uuid)
                .map(|b| b.construct_external())
                .ok_or_else(|| Error::Internal(format!("backend {} vanished after insert", name)))?
        };
        self.reconcile_node_access(ctx, &uuid, &driver).await;

        info!(backend = %name, backend_uuid = %uuid, pools = external.storage.len(), "Added backend");
        Ok(external)
    }

    /// Replace the config of a backend, possibly renaming it.
    ///
    /// The backend's volumes are claimed for the update, so volume
    /// operations on them fail with `InProgress` until it completes.
    pub async fn update_backend(
        &self,
        ctx: &RequestContext,
        name: &str,
        config: serde_json::Value,
        config_ref: Option<String>,
    ) -> Result<BackendExternal> {
        self.check_ready()?;
        let (existing, volume_names) = {
            let mut catalog = self.catalog.lock();
            let existing = catalog.require_backend_by_name(name)?.clone();
            let volume_names: Vec<String> = catalog
                .volumes_on_backend(&existing.uuid)
                .iter()
                .map(|v| v.name().to_string())
                .collect();
            let claimed: Vec<&str> = volume_names.iter().map(String::as_str).collect();
            catalog.claim("updateBackend", &claimed, &[])?;
            (existing, volume_names)
        };
        let claimed: Vec<&str> = volume_names.iter().map(String::as_str).collect();
        let _claim = Claimed::new(&self.catalog, &claimed);

        let new_name = drivers::backend_name(&config).unwrap_or_else(|| existing.name.clone());
        if new_name != existing.name && self.catalog.lock().backend_by_name(&new_name).is_some() {
            return Err(Error::already_exists("backend", new_name));
        }
        let driver_name = drivers::driver_name(&config)?;
        if !driver_name.eq_ignore_ascii_case(&existing.driver_name) {
            return Err(Error::InvalidArgument(format!(
                "cannot change the storage driver of backend {} from {} to {}",
                existing.name, existing.driver_name, driver_name
            )));
        }

        let (driver, pools) = self.start_driver(ctx, &config, &existing.uuid).await?;
        let update = driver.update_type(&existing.config);
        let prefix_changed = existing.driver.is_some() && existing.storage_prefix() != driver.storage_prefix();
        if prefix_changed || update.is_rejected() {
            driver.terminate().await;
            return Err(Error::InvalidArgument(format!(
                "invalid update of backend {}: the storage prefix, instance or protocol cannot change",
                existing.name
            )));
        }

        let state = match existing.state {
            BackendState::Deleting | BackendState::Offline => existing.state,
            _ => BackendState::Online,
        };
        let mut updated = Backend {
            name: new_name.clone(),
            uuid: existing.uuid.clone(),
            driver_name: existing.driver_name.clone(),
            driver: Some(driver.clone()),
            state,
            online: state == BackendState::Online,
            user_managed: existing.user_managed,
            config_ref: config_ref.or_else(|| existing.config_ref.clone()),
            config,
            pools,
            volumes: existing.volumes.clone(),
        };

        let volumes: Vec<_> = {
            let catalog = self.catalog.lock();
            volume_names
                .iter()
                .filter_map(|name| catalog.volume_or_subordinate(name).cloned())
                .map(|mut v| {
                    v.orphaned = false;
                    v
                })
                .collect()
        };

        if let Err(e) = self
            .store
            .replace_backend_and_update_volumes(
                &existing.construct_persistent(),
                &updated.construct_persistent(),
                &volumes,
            )
            .await
        {
            driver.terminate().await;
            return Err(e);
        }

        // Apply onto the live entry: volumes may have been added and the
        // backend may have been marked for deletion meanwhile
        let committed = {
            let mut catalog = self.catalog.lock();
            match catalog.backends.get(&existing.uuid) {
                None => None,
                Some(current) => {
                    updated.volumes = current.volumes.clone();
                    let restate = current.state == BackendState::Deleting && updated.state != BackendState::Deleting;
                    if restate {
                        updated.state = BackendState::Deleting;
                        updated.online = false;
                    }
                    let persistent = restate.then(|| updated.construct_persistent());
                    for name in &volume_names {
                        if let Some(volume) = catalog.volumes.get_mut(name) {
                            volume.orphaned = false;
                        } else if let Some(volume) = catalog.subordinate_volumes.get_mut(name) {
                            volume.orphaned = false;
                        }
                    }
                    catalog.backends.insert(updated.uuid.clone(), updated);
                    selector::reconcile_all(&mut catalog);
                    catalog
                        .backends
                        .get(&existing.uuid)
                        .map(|b| (b.construct_external(), persistent))
                }
            }
        };
        let Some((external, restate)) = committed else {
            warn!(backend = %new_name, "Backend was deleted during its update");
            let mut record = existing.construct_persistent();
            record.name = new_name.clone();
            if let Err(e) = self.store.delete_backend(&record).await {
                if !e.is_not_found() {
                    warn!(backend = %new_name, error = %e, "Failed to remove record of deleted backend");
                }
            }
            driver.terminate().await;
            return Err(Error::not_found("backend", name));
        };
        if let Some(persistent) = restate {
            if let Err(e) = self.store.update_backend(&persistent).await {
                warn!(backend = %new_name, error = %e, "Failed to persist deleting state after update");
            }
        }

        if let Some(old) = existing.driver {
            old.terminate().await;
        }
        self.reconcile_node_access(ctx, &existing.uuid, &driver).await;

        if update.contains(crate::domain::ports::UpdateType::PASSWORD_CHANGE)
            || update.contains(crate::domain::ports::UpdateType::USERNAME_CHANGE)
        {
            info!(backend = %new_name, "Backend credentials changed");
        }
        info!(backend = %existing.name, new_name = %new_name, "Updated backend");
        Ok(external)
    }

    /// Force a backend into a state, e.g. to take it out of placement
    pub async fn update_backend_state(&self, name: &str, state: BackendState) -> Result<BackendExternal> {
        self.check_ready()?;
        let mut backend = self.catalog.lock().require_backend_by_name(name)?.clone();
        if state == BackendState::Online && backend.driver.is_none() {
            return Err(Error::FailedPrecondition(format!(
                "backend {} has no initialized driver and cannot be brought online",
                name
            )));
        }
        backend.state = state;
        backend.online = state == BackendState::Online;
        self.store.update_backend(&backend.construct_persistent()).await?;

        let mut catalog = self.catalog.lock();
        let current = catalog
            .backends
            .get_mut(&backend.uuid)
            .ok_or_else(|| Error::not_found("backend", name))?;
        current.state = state;
        current.online = backend.online;
        selector::reconcile_all(&mut catalog);
        let external = catalog
            .backends
            .get(&backend.uuid)
            .map(|b| b.construct_external())
            .ok_or_else(|| Error::not_found("backend", name))?;
        info!(backend = %name, state = %state, "Backend state changed");
        Ok(external)
    }

    /// Remove a backend, or mark it deleting while it still holds volumes.
    ///
    /// The backend leaves placement before anything is awaited, so no new
    /// create can start on it. A create already running keeps it in use.
    pub async fn delete_backend(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        self.check_ready()?;
        let (backend, previous, in_use) = {
            let mut catalog = self.catalog.lock();
            let uuid = catalog.require_backend_by_name(name)?.uuid.clone();
            let in_use = catalog.backend_in_use(&uuid);
            let backend = catalog
                .backends
                .get_mut(&uuid)
                .ok_or_else(|| Error::not_found("backend", name))?;
            let previous = (backend.state, backend.online);
            backend.state = BackendState::Deleting;
            backend.online = false;
            let backend = backend.clone();
            selector::reconcile_all(&mut catalog);
            (backend, previous, in_use)
        };

        let result = if in_use {
            self.store.update_backend(&backend.construct_persistent()).await
        } else {
            self.remove_backend(ctx, &backend).await
        };
        if let Err(e) = result {
            let mut catalog = self.catalog.lock();
            if let Some(current) = catalog.backends.get_mut(&backend.uuid) {
                (current.state, current.online) = previous;
            }
            selector::reconcile_all(&mut catalog);
            return Err(e);
        }
        if in_use {
            info!(backend = %name, "Backend marked for deletion, volumes remain");
        }
        Ok(())
    }

    /// Delete a backend that holds no volumes from the store and catalog
    pub(crate) async fn remove_backend(&self, _ctx: &RequestContext, backend: &Backend) -> Result<()> {
        match self.store.delete_backend(&backend.construct_persistent()).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }
        {
            let mut catalog = self.catalog.lock();
            catalog.backends.remove(&backend.uuid);
            selector::reconcile_all(&mut catalog);
        }
        if let Some(driver) = &backend.driver {
            driver.terminate().await;
        }
        info!(backend = %backend.name, "Deleted backend");
        Ok(())
    }

    /// Remove a deleting backend once its last volume is gone
    pub(crate) async fn remove_backend_if_drained(&self, ctx: &RequestContext, backend_uuid: &str) {
        let drained = {
            let catalog = self.catalog.lock();
            catalog
                .backends
                .get(backend_uuid)
                .filter(|b| b.state == BackendState::Deleting)
                .filter(|b| !catalog.backend_in_use(&b.uuid))
                .cloned()
        };
        if let Some(backend) = drained {
            if let Err(e) = self.remove_backend(ctx, &backend).await {
                warn!(backend = %backend.name, error = %e, "Failed to remove drained backend");
            }
        }
    }

    /// Forget a create that has finished one way or another, and finish
    /// deleting its backend if that was waiting on it
    pub(crate) async fn end_create(&self, ctx: &RequestContext, volume: &str) {
        let backend_uuid = self.catalog.lock().creating.remove(volume);
        if let Some(backend_uuid) = backend_uuid {
            self.remove_backend_if_drained(ctx, &backend_uuid).await;
        }
    }

    /// Build, initialize and query a driver for a backend config
    pub(crate) async fn start_driver(
        &self,
        ctx: &RequestContext,
        config: &serde_json::Value,
        backend_uuid: &str,
    ) -> Result<(Arc<dyn StorageDriver>, BTreeMap<String, Pool>)> {
        let driver = self.factory.create(config)?;
        ctx.call("initialize", driver.initialize(backend_uuid)).await?;

        let specs = match ctx.call("storage_backend_specs", driver.storage_backend_specs()).await {
            Ok(specs) => specs,
            Err(e) => {
                driver.terminate().await;
                return Err(e);
            }
        };
        let pools = specs
            .into_iter()
            .map(|mut pool| {
                pool.backend_uuid = backend_uuid.to_string();
                pool.storage_classes.clear();
                (pool.name.clone(), pool)
            })
            .collect();
        Ok((driver, pools))
    }

    /// Push the current node list to one backend, logging failures
    pub(crate) async fn reconcile_node_access(
        &self,
        ctx: &RequestContext,
        backend_uuid: &str,
        driver: &Arc<dyn StorageDriver>,
    ) {
        let nodes = self.catalog.lock().active_nodes();
        if let Err(e) = ctx
            .call("reconcile_node_access", driver.reconcile_node_access(&nodes, backend_uuid))
            .await
        {
            warn!(backend_uuid = %backend_uuid, error = %e, "Failed to reconcile node access");
        }
    }

    pub(crate) async fn reconcile_all_node_access(&self, ctx: &RequestContext) {
        let targets: Vec<(String, Arc<dyn StorageDriver>)> = self
            .catalog
            .lock()
            .backends
            .values()
            .filter(|b| b.is_online())
            .filter_map(|b| b.driver.clone().map(|d| (b.uuid.clone(), d)))
            .collect();
        for (uuid, driver) in targets {
            self.reconcile_node_access(ctx, &uuid, &driver).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::controlplane::context::RequestContext;
    use crate::controlplane::test_utils::{fast_backend_config, harness};
    use crate::domain::ports::{RecordKind, StoreClient};
    use crate::model::BackendState;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_add_backend_registers_pools() {
        let h = harness().await;
        let backend = h.add_fast_backend("fast-a").await;
        assert_eq!(backend.state, BackendState::Online);
        assert!(backend.storage.contains_key("FastSmall"));
        assert_eq!(backend.config["password"], crate::model::REDACTED);
        assert!(h.store.contains(RecordKind::Backend, "fast-a"));
        assert_eq!(h.store.get_backend("fast-a").await.unwrap().config["password"], "secret");
    }

    #[tokio::test]
    async fn test_add_backend_requires_known_driver() {
        let h = harness().await;
        let err = h
            .orchestrator
            .add_backend(&RequestContext::new(), json!({"storageDriverName": "ontap-nas", "backendName": "x"}), None)
            .await
            .unwrap_err();
        assert_matches!(err, crate::Error::Configuration(_));
        assert_eq!(h.store.count(RecordKind::Backend), 0);
    }

    #[tokio::test]
    async fn test_failed_initialize_is_not_persisted() {
        let h = harness().await;
        h.arrays.array("fast-a").fail("initialize", "bad credentials");
        let err = h
            .orchestrator
            .add_backend(&RequestContext::new(), fast_backend_config("fast-a"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad credentials"));
        assert_eq!(h.store.count(RecordKind::Backend), 0);
    }

    #[tokio::test]
    async fn test_rename_keeps_volumes() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        let uuid = h.backend_uuid("fast-a");

        let mut config = fast_backend_config("fast-a");
        config["backendName"] = json!("fast-renamed");
        config["instanceName"] = json!("fast-a");
        h.orchestrator
            .update_backend(&RequestContext::new(), "fast-a", config, None)
            .await
            .unwrap();

        let renamed = h.orchestrator.get_backend("fast-renamed").unwrap();
        assert_eq!(renamed.backend_uuid, uuid);
        assert_eq!(renamed.volumes, vec!["basic".to_string()]);
        assert!(!h.store.contains(RecordKind::Backend, "fast-a"));
        assert!(h.store.contains(RecordKind::Backend, "fast-renamed"));
        assert_eq!(h.orchestrator.get_storage_class("fast").unwrap().storage.len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_prefix_change() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        let mut config = fast_backend_config("fast-a");
        config["storagePrefix"] = json!("new_");
        let err = h
            .orchestrator
            .update_backend(&RequestContext::new(), "fast-a", config, None)
            .await
            .unwrap_err();
        assert_matches!(err, crate::Error::InvalidArgument(_));
    }

    #[tokio::test]
    async fn test_update_rejects_driver_change() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        let mut config = fast_backend_config("fast-a");
        config["storageDriverName"] = json!("other");
        assert!(h
            .orchestrator
            .update_backend(&RequestContext::new(), "fast-a", config, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_rename_aborts_on_volume_persist_failure() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        h.store.inject_write_failure(RecordKind::Volume, "basic");

        let mut config = fast_backend_config("fast-a");
        config["backendName"] = json!("fast-renamed");
        config["instanceName"] = json!("fast-a");
        assert!(h
            .orchestrator
            .update_backend(&RequestContext::new(), "fast-a", config, None)
            .await
            .is_err());
        assert!(h.orchestrator.get_backend("fast-a").is_ok());
        assert!(h.orchestrator.get_backend("fast-renamed").unwrap_err().is_not_found());
        assert!(h.store.contains(RecordKind::Backend, "fast-a"));
        assert!(!h.store.contains(RecordKind::Backend, "fast-renamed"));
    }

    #[tokio::test]
    async fn test_delete_backend_with_volumes_defers() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        let ctx = RequestContext::new();

        h.orchestrator.delete_backend(&ctx, "fast-a").await.unwrap();
        assert_eq!(h.orchestrator.get_backend("fast-a").unwrap().state, BackendState::Deleting);

        let err = h
            .orchestrator
            .add_volume(&ctx, crate::model::VolumeConfig::new("refused", 1 << 20, "fast"))
            .await
            .unwrap_err();
        assert!(err.is_backend_ineligible());

        h.orchestrator.delete_volume(&ctx, "basic").await.unwrap();
        assert!(h.orchestrator.get_backend("fast-a").unwrap_err().is_not_found());
        assert!(!h.store.contains(RecordKind::Backend, "fast-a"));
    }

    #[tokio::test]
    async fn test_update_refused_while_volume_is_deleted() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;
        h.arrays.array("fast-a").delay("destroy", Duration::from_millis(200));

        let orchestrator = h.orchestrator.clone();
        let delete = tokio::spawn(async move { orchestrator.delete_volume(&RequestContext::new(), "basic").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut config = fast_backend_config("fast-a");
        config["backendName"] = json!("fast-renamed");
        config["instanceName"] = json!("fast-a");
        let err = h
            .orchestrator
            .update_backend(&RequestContext::new(), "fast-a", config, None)
            .await
            .unwrap_err();
        assert!(err.is_in_progress());
        delete.await.unwrap().unwrap();

        // The deleted volume is not written back by the update
        assert!(!h.store.contains(RecordKind::Volume, "basic"));
        assert!(h.orchestrator.get_backend("fast-a").unwrap().volumes.is_empty());
        assert!(h.store.contains(RecordKind::Backend, "fast-a"));
    }

    #[tokio::test]
    async fn test_state_change_keeps_new_volumes() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.add_volume("basic", 1 << 20).await;

        let backend = h
            .orchestrator
            .update_backend_state("fast-a", BackendState::Offline)
            .await
            .unwrap();
        assert_eq!(backend.volumes, vec!["basic".to_string()]);
        assert_eq!(h.orchestrator.get_backend("fast-a").unwrap().volumes, vec!["basic".to_string()]);
    }

    #[tokio::test]
    async fn test_offline_backend_leaves_classes() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        h.orchestrator
            .update_backend_state("fast-a", BackendState::Offline)
            .await
            .unwrap();
        assert!(h.orchestrator.get_storage_class("fast").unwrap().storage.is_empty());
        h.orchestrator
            .update_backend_state("fast-a", BackendState::Online)
            .await
            .unwrap();
        assert_eq!(h.orchestrator.get_storage_class("fast").unwrap().storage.len(), 1);
    }
}
