//! Storage class selector
//!
//! Decides which pools belong to a storage class and, at provisioning time,
//! in which order to try them.

use super::catalog::Catalog;
use crate::domain::ports::StorageDriver;
use crate::model::{
    attributes::matches_all, storage_class::PoolList, Backend, Pool, PoolId, Protocol, StorageClass,
};
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Check a pool against a `backend pattern -> pool patterns` list
pub fn pool_list_contains(list: &PoolList, backend_name: &str, pool_name: &str) -> bool {
    list.iter().any(|(backend_pattern, pool_patterns)| {
        glob_matches(backend_pattern, backend_name)
            && pool_patterns
                .iter()
                .any(|pattern| glob_matches(pattern, pool_name))
    })
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(name))
        .unwrap_or(false)
}

/// Whether a pool belongs to a storage class.
///
/// Additional pools are always members. A class naming nothing but
/// additional pools matches only those. Otherwise a pool must satisfy every
/// attribute request and, when an allow-list is present, appear on it.
pub fn pool_matches(class: &StorageClass, backend: &Backend, pool: &Pool) -> bool {
    if !backend.is_online() {
        return false;
    }

    let config = &class.config;
    if pool_list_contains(&config.additional_pools, &backend.name, &pool.name) {
        return true;
    }
    if class.requests.is_empty() && config.pools.is_empty() && !config.additional_pools.is_empty() {
        return false;
    }

    let allowed = config.pools.is_empty() || pool_list_contains(&config.pools, &backend.name, &pool.name);
    allowed && matches_all(&class.requests, &pool.attributes)
}

/// Recompute the pool set of one class and the class membership of every pool
pub fn reconcile_storage_class(class: &mut StorageClass, backends: &mut BTreeMap<String, Backend>) {
    let mut members = BTreeSet::new();
    for backend in backends.values_mut() {
        let matches: Vec<String> = backend
            .pools
            .values()
            .filter(|pool| pool_matches(class, backend, pool))
            .map(|pool| pool.name.clone())
            .collect();

        for pool in backend.pools.values_mut() {
            if matches.contains(&pool.name) {
                pool.storage_classes.insert(class.name().to_string());
                members.insert(PoolId::new(backend.uuid.clone(), pool.name.clone()));
            } else {
                pool.storage_classes.remove(class.name());
            }
        }
    }
    debug!(storage_class = %class.name(), pools = members.len(), "Reconciled storage class");
    class.pools = members;
}

/// Recompute every class after a backend or class change
pub fn reconcile_all(catalog: &mut Catalog) {
    for backend in catalog.backends.values_mut() {
        for pool in backend.pools.values_mut() {
            pool.storage_classes
                .retain(|name| catalog.storage_classes.contains_key(name));
        }
    }
    for class in catalog.storage_classes.values_mut() {
        reconcile_storage_class(class, &mut catalog.backends);
    }
}

/// A pool a volume may be placed on, with the driver to use
#[derive(Clone)]
pub struct Candidate {
    pub backend_uuid: String,
    pub backend_name: String,
    pub driver: Arc<dyn StorageDriver>,
    pub pool: Pool,
}

impl Candidate {
    pub fn label(&self) -> String {
        format!("{}/{}", self.backend_name, self.pool.name)
    }
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("backend", &self.backend_name)
            .field("pool", &self.pool.name)
            .finish()
    }
}

/// Pools of a class that can take a volume of `protocol`, shuffled.
///
/// Pools rejected here are reported with a reason so a failed placement can
/// explain itself.
pub fn candidate_pools(
    catalog: &Catalog,
    class: &StorageClass,
    protocol: Protocol,
) -> (Vec<Candidate>, BTreeMap<String, String>) {
    let mut candidates = Vec::new();
    let mut rejected = BTreeMap::new();

    for id in &class.pools {
        let Some(backend) = catalog.backends.get(&id.backend_uuid) else {
            continue;
        };
        let Some(pool) = backend.pools.get(&id.pool) else {
            continue;
        };
        let label = format!("{}/{}", backend.name, pool.name);

        if !backend.is_online() {
            rejected.insert(label, format!("backend is {}", backend.state));
            continue;
        }
        if !backend.protocol().serves(protocol) {
            rejected.insert(
                label,
                format!("backend protocol {} cannot serve {}", backend.protocol(), protocol),
            );
            continue;
        }
        let Some(driver) = backend.driver.clone() else {
            rejected.insert(label, "backend has no driver".to_string());
            continue;
        };

        candidates.push(Candidate {
            backend_uuid: backend.uuid.clone(),
            backend_name: backend.name.clone(),
            driver,
            pool: pool.clone(),
        });
    }

    candidates.shuffle(&mut rand::thread_rng());
    (candidates, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::attributes::{IOPS, SNAPSHOTS};
    use crate::model::{BackendState, Offer, StorageClassConfig};
    use serde_json::json;

    fn backend(name: &str, uuid: &str, state: BackendState, pools: Vec<Pool>) -> Backend {
        Backend {
            name: name.to_string(),
            uuid: uuid.to_string(),
            driver_name: "fake".to_string(),
            driver: None,
            state,
            online: state == BackendState::Online,
            user_managed: true,
            config_ref: None,
            config: json!({}),
            pools: pools.into_iter().map(|p| (p.name.clone(), p)).collect(),
            volumes: BTreeSet::new(),
        }
    }

    fn fast_pool(name: &str) -> Pool {
        Pool::new(name)
            .with_attribute(IOPS, Offer::int(2000, 10000))
            .with_attribute(SNAPSHOTS, Offer::bool(true))
    }

    fn slow_pool(name: &str) -> Pool {
        Pool::new(name)
            .with_attribute(IOPS, Offer::int(100, 500))
            .with_attribute(SNAPSHOTS, Offer::bool(true))
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::new();
        catalog.backends.insert(
            "uuid-a".into(),
            backend("fast-a", "uuid-a", BackendState::Online, vec![fast_pool("FastSmall"), slow_pool("Slow")]),
        );
        catalog.backends.insert(
            "uuid-b".into(),
            backend("fast-b", "uuid-b", BackendState::Online, vec![fast_pool("FastLarge")]),
        );
        catalog
    }

    fn reconcile(catalog: &mut Catalog, config: StorageClassConfig) -> BTreeSet<PoolId> {
        let mut class = StorageClass::new(config).unwrap();
        reconcile_storage_class(&mut class, &mut catalog.backends);
        class.pools
    }

    #[test]
    fn test_attribute_match() {
        let mut catalog = catalog();
        let pools = reconcile(
            &mut catalog,
            StorageClassConfig::new("fast")
                .with_attribute(IOPS, "2000")
                .with_attribute(SNAPSHOTS, "true"),
        );
        assert_eq!(pools.len(), 2);
        assert!(pools.contains(&PoolId::new("uuid-a", "FastSmall")));
        assert!(pools.contains(&PoolId::new("uuid-b", "FastLarge")));
        assert!(catalog.backends["uuid-a"].pools["FastSmall"]
            .storage_classes
            .contains("fast"));
        assert!(!catalog.backends["uuid-a"].pools["Slow"].storage_classes.contains("fast"));
    }

    #[test]
    fn test_allow_list_restricts_attribute_matches() {
        let mut catalog = catalog();
        let pools = reconcile(
            &mut catalog,
            StorageClassConfig::new("fast")
                .with_attribute(IOPS, "2000")
                .with_pools("fast-b", &["*"])
                .with_pools("missing", &["*"]),
        );
        assert_eq!(pools.into_iter().collect::<Vec<_>>(), vec![PoolId::new("uuid-b", "FastLarge")]);
    }

    #[test]
    fn test_additional_pools_join_attribute_matches() {
        let mut catalog = catalog();
        let pools = reconcile(
            &mut catalog,
            StorageClassConfig::new("fast")
                .with_attribute(IOPS, "2000")
                .with_additional_pools("fast-a", &["Slow"]),
        );
        assert_eq!(pools.len(), 3);
    }

    #[test]
    fn test_only_additional_pools() {
        let mut catalog = catalog();
        let pools = reconcile(
            &mut catalog,
            StorageClassConfig::new("pinned").with_additional_pools("fast-?", &["Fast*"]),
        );
        assert_eq!(pools.len(), 2);
        assert!(!pools.contains(&PoolId::new("uuid-a", "Slow")));
    }

    #[test]
    fn test_offline_backends_do_not_participate() {
        let mut catalog = catalog();
        if let Some(b) = catalog.backends.get_mut("uuid-b") {
            b.state = BackendState::Deleting;
        }
        let pools = reconcile(&mut catalog, StorageClassConfig::new("fast").with_attribute(IOPS, "2000"));
        assert_eq!(pools.len(), 1);
    }

    #[test]
    fn test_reconcile_all_drops_deleted_classes() {
        let mut catalog = catalog();
        let mut class = StorageClass::new(StorageClassConfig::new("fast").with_attribute(IOPS, "2000")).unwrap();
        reconcile_storage_class(&mut class, &mut catalog.backends);
        assert!(catalog.backends["uuid-b"].pools["FastLarge"].storage_classes.contains("fast"));

        reconcile_all(&mut catalog);
        assert!(catalog.backends["uuid-b"].pools["FastLarge"].storage_classes.is_empty());
    }

    #[test]
    fn test_candidates_skip_backends_without_driver() {
        let mut catalog = catalog();
        let mut class = StorageClass::new(StorageClassConfig::new("fast").with_attribute(IOPS, "2000")).unwrap();
        reconcile_storage_class(&mut class, &mut catalog.backends);
        let (candidates, rejected) = candidate_pools(&catalog, &class, Protocol::File);
        assert!(candidates.is_empty());
        assert_eq!(rejected.len(), 2);
    }
}
