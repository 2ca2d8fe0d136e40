//! Kubernetes custom-resource store
//!
//! Every record is one namespaced `OrchestratorRecord` object. Object names
//! are derived from the record kind and a name-based UUID of the key, since
//! keys such as `volume/snapshot` are not valid object names; the original
//! key travels in the resource spec and a kind label supports listing.

use crate::domain::ports::{RecordKind, StoreClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;
use std::time::Duration;
use tracing::debug;

pub const KIND_LABEL: &str = "orchestrator.storage.io/kind";

/// One durable orchestrator record
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "orchestrator.storage.io",
    version = "v1",
    kind = "OrchestratorRecord",
    plural = "orchestratorrecords",
    shortname = "orec",
    printcolumn = r#"{"name": "Kind", "type": "string", "jsonPath": ".spec.kind"}"#,
    printcolumn = r#"{"name": "Key", "type": "string", "jsonPath": ".spec.key"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorRecordSpec {
    pub kind: String,
    pub key: String,
    /// JSON encoding of the record
    pub payload: String,
}

/// Object name for a record: `<kind>-<uuid v5 of key>`
pub fn object_name(kind: RecordKind, key: &str) -> String {
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes());
    format!("{}-{}", kind.as_str(), id.simple())
}

fn api_code(error: &kube::Error) -> Option<u16> {
    match error {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    }
}

pub struct CrdStore {
    client: Client,
    namespace: String,
}

impl CrdStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster config
    pub async fn try_default(namespace: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Client::try_default().await?, namespace))
    }

    fn records_api(&self) -> Api<OrchestratorRecord> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn kind_selector(kind: RecordKind) -> ListParams {
        ListParams::default().labels(&format!("{}={}", KIND_LABEL, kind.as_str()))
    }

    fn decode(record: &OrchestratorRecord) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&record.spec.payload)?)
    }

    fn map_error(error: kube::Error, kind: RecordKind, key: &str) -> Error {
        match api_code(&error) {
            Some(404) => Error::not_found(kind.as_str(), key),
            Some(409) => Error::already_exists(kind.as_str(), key),
            _ => Error::Kube(error),
        }
    }
}

impl std::fmt::Debug for CrdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

#[async_trait]
impl StoreClient for CrdStore {
    async fn create_record(&self, kind: RecordKind, key: &str, value: serde_json::Value) -> Result<()> {
        let mut labels = BTreeMap::new();
        labels.insert(KIND_LABEL.to_string(), kind.as_str().to_string());
        let record = OrchestratorRecord {
            metadata: ObjectMeta {
                name: Some(object_name(kind, key)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: OrchestratorRecordSpec {
                kind: kind.as_str().to_string(),
                key: key.to_string(),
                payload: serde_json::to_string(&value)?,
            },
        };

        self.records_api()
            .create(&PostParams::default(), &record)
            .await
            .map(|_| ())
            .map_err(|e| Self::map_error(e, kind, key))
    }

    async fn read_record(&self, kind: RecordKind, key: &str) -> Result<serde_json::Value> {
        let record = self
            .records_api()
            .get(&object_name(kind, key))
            .await
            .map_err(|e| Self::map_error(e, kind, key))?;
        if record.spec.key != key {
            return Err(Error::Internal(format!(
                "record name collision between {} keys {} and {}",
                kind, key, record.spec.key
            )));
        }
        Self::decode(&record)
    }

    async fn update_record(&self, kind: RecordKind, key: &str, value: serde_json::Value) -> Result<()> {
        let api = &self.records_api();
        let name = &object_name(kind, key);
        let payload = &serde_json::to_string(&value)?;
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(10)),
            ..Default::default()
        };

        // Read-modify-replace; a 409 means someone else wrote in between
        backoff::future::retry(policy, move || async move {
            let mut record = api
                .get(name)
                .await
                .map_err(|e| backoff::Error::permanent(Self::map_error(e, kind, key)))?;
            record.spec.payload = payload.clone();
            match api.replace(name, &PostParams::default(), &record).await {
                Ok(_) => Ok(()),
                Err(e) if api_code(&e) == Some(409) => {
                    debug!(kind = %kind, key = %key, "Conflict replacing record, retrying");
                    Err(backoff::Error::transient(Error::Kube(e)))
                }
                Err(e) => Err(backoff::Error::permanent(Self::map_error(e, kind, key))),
            }
        })
        .await
    }

    async fn delete_record(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.records_api()
            .delete(&object_name(kind, key), &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| Self::map_error(e, kind, key))
    }

    async fn list_records(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>> {
        let records = self.records_api().list(&Self::kind_selector(kind)).await?;
        records.items.iter().map(Self::decode).collect()
    }

    async fn delete_records(&self, kind: RecordKind) -> Result<()> {
        self.records_api()
            .delete_collection(&DeleteParams::default(), &Self::kind_selector(kind))
            .await?;
        Ok(())
    }

    fn store_type(&self) -> &str {
        "crd"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_object_names_are_stable_and_distinct() {
        let a = object_name(RecordKind::Snapshot, "vol-1/snap-1");
        let b = object_name(RecordKind::Snapshot, "vol-1/snap-2");
        assert_eq!(a, object_name(RecordKind::Snapshot, "vol-1/snap-1"));
        assert_ne!(a, b);
        assert!(a.starts_with("snapshot-"));
        assert_eq!(a.len(), "snapshot-".len() + 32);
    }

    #[test]
    fn test_same_key_different_kinds() {
        assert_ne!(
            object_name(RecordKind::Volume, "vol-1"),
            object_name(RecordKind::VolumeTransaction, "vol-1")
        );
    }

    #[test]
    fn test_crd_definition() {
        let crd = OrchestratorRecord::crd();
        assert_eq!(crd.spec.group, "orchestrator.storage.io");
        assert_eq!(crd.spec.names.kind, "OrchestratorRecord");
    }
}
