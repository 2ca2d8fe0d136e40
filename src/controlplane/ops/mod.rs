//! Mutating verbs of the orchestrator, one file per entity kind
//!
//! Every verb runs the readiness preamble, validates against a snapshot of the
//! catalog taken under the lock, releases the lock for driver and store calls,
//! and commits back to the catalog only after the store write succeeded.

mod backend;
mod import;
mod node;
mod publication;
mod snapshot;
mod storage_class;
mod subordinate;
mod volume;

pub use import::ImportCallback;
