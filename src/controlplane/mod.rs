//! Orchestrator Control Plane
//!
//! The engine that brokers volumes between callers and storage backends:
//! catalog, selector, transaction log, bootstrap, the mutating verbs and the
//! REST surface on top of them.

pub mod api;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod context;
pub mod drivers;
pub mod ops;
pub mod orchestrator;
pub mod selector;
pub mod transaction;

#[cfg(test)]
pub(crate) mod test_utils;

pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use catalog::Catalog;
pub use config::{FrontendContext, OrchestratorConfig};
pub use context::RequestContext;
pub use drivers::{BackendFactory, FakeArrays};
pub use ops::ImportCallback;
pub use orchestrator::{Orchestrator, OrchestratorStatus};
