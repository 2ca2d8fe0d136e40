//! Shared fixtures for orchestrator tests

use super::config::OrchestratorConfig;
use super::context::RequestContext;
use super::drivers::{BackendFactory, FakeArrays};
use super::orchestrator::Orchestrator;
use crate::model::{
    BackendExternal, Node, StorageClassConfig, StorageClassExternal, VolumeConfig, VolumeExternal,
};
use crate::store::memory::MemoryStore;
use serde_json::json;
use std::sync::Arc;

pub(crate) struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub arrays: FakeArrays,
}

/// Fake backend with one file pool, `FastSmall`, of 2 GiB
pub(crate) fn fast_backend_config(name: &str) -> serde_json::Value {
    json!({
        "version": 1,
        "storageDriverName": "fake",
        "backendName": name,
        "protocol": "file",
        "username": "admin",
        "password": "secret",
        "pools": {
            "FastSmall": {
                "attributes": {
                    "IOPS": {"type": "int", "min": 1000, "max": 10000},
                    "snapshots": {"type": "bool", "value": true}
                },
                "sizeBytes": 2u64 << 30
            }
        }
    })
}

/// Bootstrapped orchestrator on an empty store, publication grace disabled
pub(crate) async fn harness() -> Harness {
    harness_with_config(OrchestratorConfig {
        publication_sync_grace_secs: 0,
        ..Default::default()
    })
    .await
}

pub(crate) async fn harness_with_config(config: OrchestratorConfig) -> Harness {
    let h = harness_with(Arc::new(MemoryStore::new()), FakeArrays::new(), config).await;
    h.orchestrator.bootstrap(false).await.unwrap();
    h
}

/// Orchestrator over existing state, not yet bootstrapped
pub(crate) async fn harness_with(store: Arc<MemoryStore>, arrays: FakeArrays, config: OrchestratorConfig) -> Harness {
    let orchestrator = Orchestrator::new(config, store.clone(), BackendFactory::with_fake(arrays.clone()));
    Harness {
        orchestrator,
        store,
        arrays,
    }
}

impl Harness {
    /// A second orchestrator over the same store and arrays, bootstrapped
    pub async fn restart(&self) -> Harness {
        let h = harness_with(self.store.clone(), self.arrays.clone(), self.orchestrator.config().clone()).await;
        h.orchestrator.bootstrap(false).await.unwrap();
        h
    }

    pub async fn add_backend(&self, config: serde_json::Value) -> BackendExternal {
        self.orchestrator
            .add_backend(&RequestContext::new(), config, None)
            .await
            .unwrap()
    }

    pub async fn add_fast_backend(&self, name: &str) -> BackendExternal {
        self.add_backend(fast_backend_config(name)).await
    }

    pub async fn add_block_backend(&self, name: &str) -> BackendExternal {
        let mut config = fast_backend_config(name);
        config["protocol"] = json!("block");
        self.add_backend(config).await
    }

    pub async fn add_backend_with_snapshot_limit(&self, name: &str, limit: usize) -> BackendExternal {
        let mut config = fast_backend_config(name);
        config["maxSnapshotsPerVolume"] = json!(limit);
        self.add_backend(config).await
    }

    /// Class `fast`: IOPS 2000 with snapshots
    pub async fn add_fast_class(&self) -> StorageClassExternal {
        self.orchestrator
            .add_storage_class(
                StorageClassConfig::new("fast")
                    .with_attribute("IOPS", "2000")
                    .with_attribute("snapshots", "true"),
            )
            .await
            .unwrap()
    }

    pub async fn add_volume(&self, name: &str, size_bytes: u64) -> VolumeExternal {
        self.orchestrator
            .add_volume(&RequestContext::new(), VolumeConfig::new(name, size_bytes, "fast"))
            .await
            .unwrap()
    }

    pub async fn add_node(&self, name: &str) -> Node {
        self.orchestrator
            .add_node(&RequestContext::new(), Node::new(name))
            .await
            .unwrap()
    }

    pub fn backend_uuid(&self, name: &str) -> String {
        self.orchestrator.get_backend(name).unwrap().backend_uuid
    }
}
