//! REST API Handlers
//!
//! Thin axum layer over the orchestrator verbs. Every handler builds a fresh
//! [`RequestContext`]; errors are mapped to status codes by [`ApiError`].

use crate::controlplane::context::RequestContext;
use crate::controlplane::Orchestrator;
use crate::error::{Error, ErrorAction};
use crate::model::{
    volume::IscsiChapInfo, AccessMode, BackendExternal, BackendState, Node, Snapshot, SnapshotConfig, StorageClassConfig,
    StorageClassExternal, VolumeConfig, VolumeExternal, VolumePublication, VolumePublishInfo,
};
use axum::{
    extract::{Json, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Backend registration body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendRequest {
    /// Driver config, including `storageDriverName` and `backendName`
    pub config: serde_json::Value,
    /// Reference to the external object that owns this backend, if any
    #[serde(default)]
    pub config_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStateRequest {
    pub state: BackendState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublishRequest {
    pub read_only: bool,
    pub access_mode: AccessMode,
    pub filesystem: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationUpdateRequest {
    pub not_safe_to_attach: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassphraseNamesRequest {
    pub luks_passphrase_names: Vec<String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Orchestrator error carried out of a handler
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::NotReady { .. } | Error::StoreUnavailable(_) | Error::Kube(_) | Error::Cancelled { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyExists { .. }
            | Error::VolumeExists { .. }
            | Error::InProgress { .. }
            | Error::VolumeCreating { .. }
            | Error::SnapshotBusy { .. } => StatusCode::CONFLICT,
            Error::InvalidArgument(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::TypeAssertion(_) => StatusCode::BAD_REQUEST,
            Error::FailedPrecondition(_) | Error::NotManaged { .. } => StatusCode::PRECONDITION_FAILED,
            Error::BackendIneligible { .. }
            | Error::UnsupportedCapacityRange(_)
            | Error::MaxLimitReached(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::BackendOperationFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            Error::NotReady { .. } => "not_ready",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::VolumeExists { .. } => "volume_exists",
            Error::InProgress { .. } => "in_progress",
            Error::VolumeCreating { .. } => "volume_creating",
            Error::SnapshotBusy { .. } => "snapshot_busy",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::FailedPrecondition(_) => "failed_precondition",
            Error::NotManaged { .. } => "not_managed",
            Error::BackendIneligible { .. } => "backend_ineligible",
            Error::UnsupportedCapacityRange(_) => "unsupported_capacity_range",
            Error::MaxLimitReached(_) => "max_limit_reached",
            Error::BackendOperationFailed { .. } => "backend_failed",
            Error::Cancelled { .. } => "cancelled",
            _ => "internal_error",
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self.0.action() {
            ErrorAction::RetryAfter(d) => Some(d.as_secs().max(1)),
            ErrorAction::RetryWithBackoff => Some(5),
            ErrorAction::NoRetry => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = %status, error = %self.0, "Request failed");
        } else {
            debug!(status = %status, error = %self.0, "Request rejected");
        }

        let details = match &self.0 {
            Error::BackendIneligible { reasons, .. } => serde_json::to_value(reasons).ok(),
            _ => None,
        };
        let body = ApiErrorResponse {
            error: self.code().into(),
            message: self.0.to_string(),
            details,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<Orchestrator>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
        };

        Router::new()
            // Backends
            .route("/v1/backends", get(list_backends).post(add_backend))
            .route(
                "/v1/backends/:name",
                get(get_backend).put(update_backend).delete(delete_backend),
            )
            .route("/v1/backends/:name/state", put(update_backend_state))
            // Storage classes
            .route("/v1/storageclasses", get(list_storage_classes).post(add_storage_class))
            .route(
                "/v1/storageclasses/:name",
                get(get_storage_class)
                    .put(update_storage_class)
                    .delete(delete_storage_class),
            )
            // Volumes
            .route("/v1/volumes", get(list_volumes).post(add_volume))
            .route("/v1/volumes/import", post(import_volume))
            .route("/v1/volumes/:name", get(get_volume).delete(delete_volume))
            .route("/v1/volumes/:name/size", put(resize_volume))
            .route("/v1/volumes/:name/passphrases", put(update_passphrase_names))
            // Snapshots
            .route(
                "/v1/volumes/:name/snapshots",
                get(list_volume_snapshots).post(create_snapshot),
            )
            .route(
                "/v1/volumes/:name/snapshots/:snapshot",
                get(get_snapshot).delete(delete_snapshot),
            )
            .route("/v1/volumes/:name/snapshots/:snapshot/restore", post(restore_snapshot))
            .route("/v1/snapshots", get(list_snapshots))
            // Publications
            .route("/v1/publications", get(list_publications))
            .route(
                "/v1/volumes/:name/publications/:node",
                get(get_publication)
                    .put(publish_volume)
                    .patch(update_publication)
                    .delete(unpublish_volume),
            )
            .route("/v1/volumes/:name/chap/:node", get(get_chap))
            // Nodes
            .route("/v1/nodes", get(list_nodes).post(add_node))
            .route("/v1/nodes/:name", get(get_node).delete(delete_node))
            // Health
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

// =============================================================================
// Backend Handlers
// =============================================================================

async fn list_backends(State(state): State<AppState>) -> ApiResult<Json<Vec<BackendExternal>>> {
    Ok(Json(state.orchestrator.list_backends()?))
}

async fn add_backend(
    State(state): State<AppState>,
    Json(request): Json<BackendRequest>,
) -> ApiResult<(StatusCode, Json<BackendExternal>)> {
    let backend = state
        .orchestrator
        .add_backend(&RequestContext::new(), request.config, request.config_ref)
        .await?;
    info!(backend = %backend.name, "Backend added via API");
    Ok((StatusCode::CREATED, Json(backend)))
}

async fn get_backend(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<BackendExternal>> {
    Ok(Json(state.orchestrator.get_backend(&name)?))
}

async fn update_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<BackendRequest>,
) -> ApiResult<Json<BackendExternal>> {
    Ok(Json(
        state
            .orchestrator
            .update_backend(&RequestContext::new(), &name, request.config, request.config_ref)
            .await?,
    ))
}

async fn update_backend_state(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<BackendStateRequest>,
) -> ApiResult<Json<BackendExternal>> {
    Ok(Json(state.orchestrator.update_backend_state(&name, request.state).await?))
}

async fn delete_backend(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_backend(&RequestContext::new(), &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Storage Class Handlers
// =============================================================================

async fn list_storage_classes(State(state): State<AppState>) -> ApiResult<Json<Vec<StorageClassExternal>>> {
    Ok(Json(state.orchestrator.list_storage_classes()?))
}

async fn add_storage_class(
    State(state): State<AppState>,
    Json(config): Json<StorageClassConfig>,
) -> ApiResult<(StatusCode, Json<StorageClassExternal>)> {
    let class = state.orchestrator.add_storage_class(config).await?;
    Ok((StatusCode::CREATED, Json(class)))
}

async fn get_storage_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<StorageClassExternal>> {
    Ok(Json(state.orchestrator.get_storage_class(&name)?))
}

async fn update_storage_class(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(mut config): Json<StorageClassConfig>,
) -> ApiResult<Json<StorageClassExternal>> {
    config.name = name;
    Ok(Json(state.orchestrator.update_storage_class(config).await?))
}

async fn delete_storage_class(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_storage_class(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Volume Handlers
// =============================================================================

async fn list_volumes(State(state): State<AppState>) -> ApiResult<Json<Vec<VolumeExternal>>> {
    Ok(Json(state.orchestrator.list_volumes()?))
}

async fn add_volume(
    State(state): State<AppState>,
    Json(config): Json<VolumeConfig>,
) -> ApiResult<(StatusCode, Json<VolumeExternal>)> {
    let volume = state.orchestrator.add_volume(&RequestContext::new(), config).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn import_volume(
    State(state): State<AppState>,
    Json(config): Json<VolumeConfig>,
) -> ApiResult<(StatusCode, Json<VolumeExternal>)> {
    let volume = state.orchestrator.import_volume(&RequestContext::new(), config).await?;
    Ok((StatusCode::CREATED, Json(volume)))
}

async fn get_volume(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<VolumeExternal>> {
    Ok(Json(state.orchestrator.get_volume(&name)?))
}

async fn delete_volume(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_volume(&RequestContext::new(), &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resize_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> ApiResult<Json<VolumeExternal>> {
    state
        .orchestrator
        .resize_volume(&RequestContext::new(), &name, request.size_bytes)
        .await?;
    Ok(Json(state.orchestrator.get_volume(&name)?))
}

async fn update_passphrase_names(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<PassphraseNamesRequest>,
) -> ApiResult<Json<VolumeExternal>> {
    Ok(Json(
        state
            .orchestrator
            .update_volume_luks_passphrase_names(&name, request.luks_passphrase_names)
            .await?,
    ))
}

// =============================================================================
// Snapshot Handlers
// =============================================================================

async fn list_snapshots(State(state): State<AppState>) -> ApiResult<Json<Vec<Snapshot>>> {
    Ok(Json(state.orchestrator.list_snapshots()?))
}

async fn list_volume_snapshots(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Snapshot>>> {
    Ok(Json(state.orchestrator.list_snapshots_for_volume(&name)?))
}

async fn create_snapshot(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SnapshotRequest>,
) -> ApiResult<(StatusCode, Json<Snapshot>)> {
    let snapshot = state
        .orchestrator
        .create_snapshot(&RequestContext::new(), SnapshotConfig::new(name, request.name))
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<Json<Snapshot>> {
    Ok(Json(state.orchestrator.get_snapshot(&name, &snapshot)?))
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .delete_snapshot(&RequestContext::new(), &name, &snapshot)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restore_snapshot(
    State(state): State<AppState>,
    Path((name, snapshot)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .restore_snapshot(&RequestContext::new(), &name, &snapshot)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Publication Handlers
// =============================================================================

async fn list_publications(State(state): State<AppState>) -> ApiResult<Json<Vec<VolumePublication>>> {
    Ok(Json(state.orchestrator.list_volume_publications()?))
}

async fn get_publication(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> ApiResult<Json<VolumePublication>> {
    Ok(Json(state.orchestrator.get_volume_publication(&name, &node)?))
}

async fn publish_volume(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
    Json(request): Json<PublishRequest>,
) -> ApiResult<Json<VolumePublishInfo>> {
    let info = VolumePublishInfo {
        read_only: request.read_only,
        access_mode: request.access_mode,
        filesystem: request.filesystem,
        ..VolumePublishInfo::for_host(node)
    };
    let info = state
        .orchestrator
        .publish_volume(&RequestContext::new(), &name, info)
        .await?;
    Ok(Json(info.redacted()))
}

async fn update_publication(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
    Json(request): Json<PublicationUpdateRequest>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .update_volume_publication(&RequestContext::new(), &name, &node, request.not_safe_to_attach)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unpublish_volume(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .unpublish_volume(&RequestContext::new(), &name, &node)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_chap(
    State(state): State<AppState>,
    Path((name, node)): Path<(String, String)>,
) -> ApiResult<Json<IscsiChapInfo>> {
    Ok(Json(state.orchestrator.get_chap(&RequestContext::new(), &name, &node).await?))
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(state.orchestrator.list_nodes()?))
}

async fn add_node(State(state): State<AppState>, Json(node): Json<Node>) -> ApiResult<(StatusCode, Json<Node>)> {
    let node = state.orchestrator.add_node(&RequestContext::new(), node).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn get_node(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<Json<Node>> {
    Ok(Json(state.orchestrator.get_node(&name)?))
}

async fn delete_node(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    state.orchestrator.delete_node(&RequestContext::new(), &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Health Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 200 once bootstrap has completed without a latched error
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.orchestrator.status();
    let code = if status.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::test_utils::{fast_backend_config, harness, harness_with};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    async fn call(router: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> Response {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        router.clone().oneshot(request.body(body).unwrap()).await.unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_provision_and_publish_over_rest() {
        let h = harness().await;
        let router = RestRouter::new(h.orchestrator.clone()).build();

        let response = call(&router, "POST", "/v1/backends", Some(json!({"config": fast_backend_config("fast-a")}))).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let backend = json_body(response).await;
        assert_eq!(backend["config"]["password"], "<REDACTED>");

        let class = json!({"name": "fast", "attributes": {"IOPS": "2000"}});
        let response = call(&router, "POST", "/v1/storageclasses", Some(class)).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let volume = json!({"name": "V", "sizeBytes": 1u64 << 20, "storageClass": "fast"});
        let response = call(&router, "POST", "/v1/volumes", Some(volume)).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(json_body(response).await["config"]["name"], "V");

        let response = call(&router, "POST", "/v1/nodes", Some(json!({"name": "node-a"}))).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = call(&router, "PUT", "/v1/volumes/V/publications/node-a", Some(json!({}))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = call(&router, "GET", "/v1/publications", None).await;
        assert_eq!(json_body(response).await.as_array().unwrap().len(), 1);

        let response = call(&router, "DELETE", "/v1/volumes/V/publications/node-a", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let response = call(&router, "DELETE", "/v1/volumes/V", None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_errors_map_to_status_codes() {
        let h = harness().await;
        h.add_fast_backend("fast-a").await;
        h.add_fast_class().await;
        let router = RestRouter::new(h.orchestrator.clone()).build();

        let response = call(&router, "GET", "/v1/volumes/missing", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
        assert_eq!(json_body(response).await["error"], "not_found");

        let big = json!({"name": "big", "sizeBytes": 100u64 << 30, "storageClass": "fast"});
        let response = call(&router, "POST", "/v1/volumes", Some(big)).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["error"], "backend_ineligible");
        assert!(body["details"]["fast-a/FastSmall"].is_string());
    }

    #[tokio::test]
    async fn test_not_ready_sets_retry_after() {
        let h = harness_with(
            Arc::new(crate::store::MemoryStore::new()),
            crate::controlplane::FakeArrays::new(),
            Default::default(),
        )
        .await;
        let router = RestRouter::new(h.orchestrator.clone()).build();

        let response = call(&router, "GET", "/v1/volumes", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        let response = call(&router, "GET", "/ready", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = call(&router, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
