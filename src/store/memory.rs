//! In-memory store
//!
//! Backs standalone mode and tests. Records survive for the lifetime of the
//! value, so tests can drop an orchestrator and bootstrap a new one over the
//! same store to simulate a restart.

use crate::domain::ports::{RecordKind, StoreClient};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

type RecordKey = (RecordKind, String);

pub struct MemoryStore {
    records: RwLock<BTreeMap<RecordKey, serde_json::Value>>,
    available: AtomicBool,
    /// Writes to these keys fail with `StoreUnavailable`
    write_failures: RwLock<BTreeSet<RecordKey>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
            write_failures: RwLock::new(BTreeSet::new()),
            writes: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn inject_write_failure(&self, kind: RecordKind, key: &str) {
        self.write_failures.write().insert((kind, key.to_string()));
    }

    pub fn clear_write_failures(&self) {
        self.write_failures.write().clear();
    }

    /// Number of successful mutations since creation
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, kind: RecordKind, key: &str) -> bool {
        self.records.read().contains_key(&(kind, key.to_string()))
    }

    pub fn count(&self, kind: RecordKind) -> usize {
        self.records.read().keys().filter(|(k, _)| *k == kind).count()
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store is offline".into()))
        }
    }

    fn check_writable(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.check_available()?;
        if self.write_failures.read().contains(&(kind, key.to_string())) {
            return Err(Error::StoreUnavailable(format!("injected write failure for {} {}", kind, key)));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.read().len())
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn create_record(&self, kind: RecordKind, key: &str, value: serde_json::Value) -> Result<()> {
        self.check_writable(kind, key)?;
        let mut records = self.records.write();
        let record_key = (kind, key.to_string());
        if records.contains_key(&record_key) {
            return Err(Error::already_exists(kind.as_str(), key));
        }
        records.insert(record_key, value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_record(&self, kind: RecordKind, key: &str) -> Result<serde_json::Value> {
        self.check_available()?;
        self.records
            .read()
            .get(&(kind, key.to_string()))
            .cloned()
            .ok_or_else(|| Error::not_found(kind.as_str(), key))
    }

    async fn update_record(&self, kind: RecordKind, key: &str, value: serde_json::Value) -> Result<()> {
        self.check_writable(kind, key)?;
        let mut records = self.records.write();
        match records.get_mut(&(kind, key.to_string())) {
            Some(existing) => {
                *existing = value;
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::not_found(kind.as_str(), key)),
        }
    }

    async fn delete_record(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.check_writable(kind, key)?;
        match self.records.write().remove(&(kind, key.to_string())) {
            Some(_) => {
                self.writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::not_found(kind.as_str(), key)),
        }
    }

    async fn list_records(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>> {
        self.check_available()?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn delete_records(&self, kind: RecordKind) -> Result<()> {
        self.check_available()?;
        self.records.write().retain(|(k, _), _| *k != kind);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn store_type(&self) -> &str {
        "memory"
    }
}
