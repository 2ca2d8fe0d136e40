//! Storage class registration

use crate::controlplane::orchestrator::Orchestrator;
use crate::controlplane::selector;
use crate::error::{Error, Result};
use crate::model::{StorageClass, StorageClassConfig, StorageClassExternal};
use tracing::info;

impl Orchestrator {
    pub async fn add_storage_class(&self, config: StorageClassConfig) -> Result<StorageClassExternal> {
        self.check_ready()?;
        let class = StorageClass::new(config)?;
        if self.catalog.lock().storage_classes.contains_key(class.name()) {
            return Err(Error::already_exists("storage class", class.name()));
        }
        self.store.add_storage_class(&class.config).await?;
        self.index_storage_class(class)
    }

    /// Replace the selector of an existing class; placed volumes stay put
    pub async fn update_storage_class(&self, config: StorageClassConfig) -> Result<StorageClassExternal> {
        self.check_ready()?;
        let class = StorageClass::new(config)?;
        if !self.catalog.lock().storage_classes.contains_key(class.name()) {
            return Err(Error::not_found("storage class", class.name()));
        }
        self.store.update_storage_class(&class.config).await?;
        self.index_storage_class(class)
    }

    pub async fn delete_storage_class(&self, name: &str) -> Result<()> {
        self.check_ready()?;
        if !self.catalog.lock().storage_classes.contains_key(name) {
            return Err(Error::not_found("storage class", name));
        }
        self.store.delete_storage_class(name).await?;

        let mut catalog = self.catalog.lock();
        catalog.storage_classes.remove(name);
        selector::reconcile_all(&mut catalog);
        info!(storage_class = %name, "Deleted storage class");
        Ok(())
    }

    fn index_storage_class(&self, class: StorageClass) -> Result<StorageClassExternal> {
        let name = class.name().to_string();
        {
            let mut catalog = self.catalog.lock();
            catalog.storage_classes.insert(name.clone(), class);
            selector::reconcile_all(&mut catalog);
        }
        let external = self.get_storage_class(&name)?;
        info!(
            storage_class = %name,
            backends = external.storage.len(),
            "Reconciled storage class"
        );
        Ok(external)
    }
}

#[cfg(test)]
mod tests {
    use crate::controlplane::test_utils::harness;
    use crate::domain::ports::RecordKind;
    use crate::model::StorageClassConfig;

    #[tokio::test]
    async fn test_class_membership_follows_attributes() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;

        let fast = h.add_fast_class().await;
        assert_eq!(fast.storage.get("fast-a"), Some(&vec!["FastSmall".to_string()]));
        assert!(h.store.contains(RecordKind::StorageClass, "fast"));

        let gold = h
            .orchestrator
            .add_storage_class(StorageClassConfig::new("gold").with_attribute("IOPS", "20000"))
            .await
            .unwrap();
        assert!(gold.storage.is_empty());

        let gold = h
            .orchestrator
            .update_storage_class(StorageClassConfig::new("gold").with_additional_pools("fast-a", &["Fast*"]))
            .await
            .unwrap();
        assert_eq!(gold.storage.get("fast-a"), Some(&vec!["FastSmall".to_string()]));

        let backend = h.orchestrator.get_backend("fast-a").unwrap();
        assert_eq!(
            backend.storage["FastSmall"].storage_classes,
            vec!["fast".to_string(), "gold".to_string()]
        );

        h.orchestrator.delete_storage_class("gold").await.unwrap();
        let backend = h.orchestrator.get_backend("fast-a").unwrap();
        assert_eq!(backend.storage["FastSmall"].storage_classes, vec!["fast".to_string()]);
        assert!(!h.store.contains(RecordKind::StorageClass, "gold"));
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_classes() {
        let h = harness().await;
        h.add_fast_class().await;
        assert!(h
            .orchestrator
            .add_storage_class(StorageClassConfig::new("fast"))
            .await
            .unwrap_err()
            .is_already_exists());
        assert!(h
            .orchestrator
            .update_storage_class(StorageClassConfig::new("missing"))
            .await
            .unwrap_err()
            .is_not_found());
        assert!(h
            .orchestrator
            .delete_storage_class("missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_pool_pattern_rejected() {
        let h = harness().await;
        let err = h
            .orchestrator
            .add_storage_class(StorageClassConfig::new("bad").with_pools("fast-a", &["[unclosed"]))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::InvalidArgument(_)));
    }
}
