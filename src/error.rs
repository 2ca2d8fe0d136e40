//! Error types for the Storage Orchestrator
//!
//! Provides structured error types for the orchestrator core, the storage
//! drivers, the persistent store and the API surface. Every error kind the
//! core surfaces has a predicate so callers never need to match on variants.

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the orchestrator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Orchestrator State Errors
    // =========================================================================
    #[error("Orchestrator is not ready: {reason}")]
    NotReady { reason: String },

    #[error("Operation {operation} is already in progress for {name}")]
    InProgress { operation: String, name: String },

    #[error("Type assertion failed: {0}")]
    TypeAssertion(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Entity Errors
    // =========================================================================
    #[error("{kind} {name} was not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("Volume {name} already exists")]
    VolumeExists { name: String },

    #[error("Volume {name} is not managed by the orchestrator")]
    NotManaged { name: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    // =========================================================================
    // Provisioning Errors
    // =========================================================================
    #[error("No backend could satisfy the request for volume {volume}: {}", format_reasons(.reasons))]
    BackendIneligible {
        volume: String,
        reasons: BTreeMap<String, String>,
    },

    #[error("Unsupported capacity range: {0}")]
    UnsupportedCapacityRange(String),

    #[error("Maximum limit reached: {0}")]
    MaxLimitReached(String),

    #[error("Volume {name} is still being created on the backend")]
    VolumeCreating { name: String },

    #[error("Snapshot {snapshot} is busy: {reason}")]
    SnapshotBusy { snapshot: String, reason: String },

    // =========================================================================
    // Driver Errors
    // =========================================================================
    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Driver panicked during {operation}: {reason}")]
    DriverPanic { operation: String, reason: String },

    #[error("Operation {operation} was cancelled")]
    Cancelled { operation: String },

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_reasons(reasons: &BTreeMap<String, String>) -> String {
    if reasons.is_empty() {
        return "no candidate pools".to_string();
    }
    reasons
        .iter()
        .map(|(pool, reason)| format!("[{}: {}]", pool, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Action a caller should take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after specific duration
    RetryAfter(Duration),
    /// Don't retry, the request must change first
    NoRetry,
}

impl Error {
    /// Shorthand for a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Shorthand for a driver failure
    pub fn backend_failed(
        backend: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::BackendOperationFailed {
            backend: backend.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Determine what a caller should do with this error
    pub fn action(&self) -> ErrorAction {
        match self {
            Error::Kube(_) | Error::StoreUnavailable(_) | Error::BackendOperationFailed { .. } => {
                ErrorAction::RetryWithBackoff
            }

            // Work is ongoing somewhere, come back later
            Error::InProgress { .. } | Error::VolumeCreating { .. } => {
                ErrorAction::RetryAfter(Duration::from_secs(10))
            }

            // Clone split was started
            Error::SnapshotBusy { .. } => ErrorAction::RetryAfter(Duration::from_secs(30)),

            Error::NotReady { .. } => ErrorAction::RetryAfter(Duration::from_secs(60)),

            Error::NotFound { .. }
            | Error::AlreadyExists { .. }
            | Error::VolumeExists { .. }
            | Error::NotManaged { .. }
            | Error::InvalidArgument(_)
            | Error::FailedPrecondition(_)
            | Error::BackendIneligible { .. }
            | Error::UnsupportedCapacityRange(_)
            | Error::MaxLimitReached(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::TypeAssertion(_) => ErrorAction::NoRetry,

            _ => ErrorAction::RetryWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube(_) | Error::StoreUnavailable(_))
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Error::NotReady { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. } | Error::VolumeExists { .. })
    }

    pub fn is_volume_exists(&self) -> bool {
        matches!(self, Error::VolumeExists { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self, Error::InProgress { .. })
    }

    pub fn is_backend_ineligible(&self) -> bool {
        matches!(self, Error::BackendIneligible { .. })
    }

    pub fn is_unsupported_capacity_range(&self) -> bool {
        matches!(self, Error::UnsupportedCapacityRange(_))
    }

    pub fn is_max_limit_reached(&self) -> bool {
        matches!(self, Error::MaxLimitReached(_))
    }

    pub fn is_not_managed(&self) -> bool {
        matches!(self, Error::NotManaged { .. })
    }

    pub fn is_type_assertion(&self) -> bool {
        matches!(self, Error::TypeAssertion(_))
    }

    pub fn is_volume_creating(&self) -> bool {
        matches!(self, Error::VolumeCreating { .. })
    }

    pub fn is_snapshot_busy(&self) -> bool {
        matches!(self, Error::SnapshotBusy { .. })
    }

    pub fn is_failed_precondition(&self) -> bool {
        matches!(self, Error::FailedPrecondition(_))
    }

    /// Panics and cancellations leave their transaction in place for the
    /// next bootstrap instead of compensating inline.
    pub fn skips_compensation(&self) -> bool {
        matches!(self, Error::DriverPanic { .. } | Error::Cancelled { .. })
    }
}

/// Result type alias for the orchestrator
pub type Result<T> = std::result::Result<T, Error>;
