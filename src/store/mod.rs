//! Store Adapters
//!
//! Implementations of [`StoreClient`](crate::domain::ports::StoreClient):
//! - Memory: process-local, for standalone mode and tests
//! - CRD: one Kubernetes custom resource per record

pub mod crd;
pub mod memory;

pub use crd::{CrdStore, OrchestratorRecord, OrchestratorRecordSpec};
pub use memory::MemoryStore;
