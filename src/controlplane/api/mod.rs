//! API Module
//!
//! REST surface over the orchestrator and the server that hosts it.

pub mod rest;
pub mod server;

pub use rest::{ApiError, ApiErrorResponse, RestRouter};
pub use server::{ApiServer, ApiServerConfig};
