//! Storage Orchestrator
//!
//! Brokers block and file volumes between a container platform and a set of
//! storage backends. Every mutation is written ahead to a transaction log in
//! a durable store, so an interrupted operation is compensated on the next
//! bootstrap instead of leaking capacity or records.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      REST API (axum)  /  CLI                          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                          Orchestrator                                 │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │  Catalog   │  │  Selector  │  │ Transaction  │  │  Bootstrap   │  │
//! │  │ (one lock) │  │ (classes)  │  │     log      │  │  & monitor   │  │
//! │  └────────────┘  └────────────┘  └──────────────┘  └──────────────┘  │
//! ├──────────────────────────────────┬───────────────────────────────────┤
//! │   StoreClient (memory | CRD)     │   StorageDriver (fake | plug-in)  │
//! └──────────────────────────────────┴───────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestrator, selector, transaction log, REST API
//! - [`model`]: backends, pools, volumes, snapshots, nodes, publications
//! - [`store`]: persistent store adapters
//! - [`domain`]: the store and driver ports
//! - [`error`]: error types and retry classification

pub mod controlplane;
pub mod domain;
pub mod error;
pub mod model;
pub mod store;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, BackendFactory, FakeArrays, FrontendContext, ImportCallback,
    Orchestrator, OrchestratorConfig, OrchestratorStatus, RequestContext, RestRouter,
};

pub use domain::ports::{StorageDriver, StoreClient};

pub use error::{Error, ErrorAction, Result};

pub use model::{
    Backend, BackendExternal, Node, Snapshot, SnapshotConfig, StorageClassConfig, Volume,
    VolumeConfig, VolumeExternal, VolumePublication, VolumePublishInfo,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
