//! REST API Handlers
//!
//! Every CSI operation is exposed as `POST /csi.v1.<Service>/<Method>` with a
//! camelCase JSON body. Failures carry the CSI status name and map onto an
//! HTTP status.

use crate::controller::ControllerService;
use crate::domain::csi::*;
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use crate::metrics::CsiMetrics;
use crate::node::NodeService;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info_span, warn, Instrument};

// =============================================================================
// Request/Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ApiErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

fn error_response(err: &Error) -> Response {
    let status = StatusCode::from_u16(err.code().http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ApiErrorResponse::from(err))).into_response()
}

/// Per-call context recorded in the request span
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub operation: &'static str,
}

impl RequestContext {
    pub fn new(operation: &'static str) -> Self {
        Self {
            request_id: format!("{:016x}", rand::random::<u64>()),
            operation,
        }
    }
}

// =============================================================================
// REST Router
// =============================================================================

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Option<Arc<ControllerService>>,
    pub node: Option<Arc<NodeService>>,
    pub identity: IdentityService,
    pub metrics: CsiMetrics,
}

impl AppState {
    fn controller(&self) -> Result<&ControllerService> {
        self.controller.as_deref().ok_or_else(|| {
            Error::Unimplemented("controller service is not enabled on this instance".into())
        })
    }

    fn node(&self) -> Result<&NodeService> {
        self.node.as_deref().ok_or_else(|| {
            Error::Unimplemented("node service is not enabled on this instance".into())
        })
    }
}

/// REST API router builder
pub struct RestRouter {
    state: AppState,
}

impl RestRouter {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        Router::new()
            // Identity
            .route("/csi.v1.Identity/GetPluginInfo", post(get_plugin_info))
            .route(
                "/csi.v1.Identity/GetPluginCapabilities",
                post(get_plugin_capabilities),
            )
            .route("/csi.v1.Identity/Probe", post(probe))
            // Controller
            .route("/csi.v1.Controller/CreateVolume", post(create_volume))
            .route("/csi.v1.Controller/DeleteVolume", post(delete_volume))
            .route("/csi.v1.Controller/ListVolumes", post(list_volumes))
            .route("/csi.v1.Controller/CreateSnapshot", post(create_snapshot))
            .route("/csi.v1.Controller/DeleteSnapshot", post(delete_snapshot))
            .route("/csi.v1.Controller/ListSnapshots", post(list_snapshots))
            .route(
                "/csi.v1.Controller/ControllerPublishVolume",
                post(controller_publish_volume),
            )
            .route(
                "/csi.v1.Controller/ControllerUnpublishVolume",
                post(controller_unpublish_volume),
            )
            .route(
                "/csi.v1.Controller/ValidateVolumeCapabilities",
                post(validate_volume_capabilities),
            )
            .route(
                "/csi.v1.Controller/ControllerGetCapabilities",
                post(controller_get_capabilities),
            )
            .route("/csi.v1.Controller/GetCapacity", post(get_capacity))
            .route(
                "/csi.v1.Controller/ControllerExpandVolume",
                post(controller_expand_volume),
            )
            // Node
            .route("/csi.v1.Node/NodeStageVolume", post(node_stage_volume))
            .route("/csi.v1.Node/NodeUnstageVolume", post(node_unstage_volume))
            .route("/csi.v1.Node/NodePublishVolume", post(node_publish_volume))
            .route("/csi.v1.Node/NodeUnpublishVolume", post(node_unpublish_volume))
            .route("/csi.v1.Node/NodeGetInfo", post(node_get_info))
            .route("/csi.v1.Node/NodeGetCapabilities", post(node_get_capabilities))
            .route("/csi.v1.Node/NodeGetVolumeStats", post(node_get_volume_stats))
            .route("/csi.v1.Node/NodeExpandVolume", post(node_expand_volume))
            // Health
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state)
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Run one operation inside its request span and record its outcome
async fn dispatch<T, F>(state: &AppState, operation: &'static str, fut: F) -> Response
where
    T: Serialize,
    F: Future<Output = Result<T>>,
{
    let ctx = RequestContext::new(operation);
    let span = info_span!(
        "csi_request",
        operation = ctx.operation,
        request_id = %ctx.request_id
    );
    let started = Instant::now();

    let result = fut.instrument(span.clone()).await;
    state
        .metrics
        .observe(operation, result.as_ref().err().map(Error::code), started.elapsed());

    let _entered = span.enter();
    match result {
        Ok(body) => {
            debug!("{} succeeded", operation);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            warn!("{} failed: {}", operation, e);
            error_response(&e)
        }
    }
}

// =============================================================================
// Identity Handlers
// =============================================================================

async fn get_plugin_info(State(state): State<AppState>) -> Response {
    dispatch(&state, "GetPluginInfo", async {
        Ok(state.identity.get_plugin_info())
    })
    .await
}

async fn get_plugin_capabilities(State(state): State<AppState>) -> Response {
    dispatch(&state, "GetPluginCapabilities", async {
        Ok(state.identity.get_plugin_capabilities())
    })
    .await
}

async fn probe(State(state): State<AppState>) -> Response {
    dispatch(&state, "Probe", async { Ok(state.identity.probe()) }).await
}

// =============================================================================
// Controller Handlers
// =============================================================================

async fn create_volume(
    State(state): State<AppState>,
    Json(req): Json<CreateVolumeRequest>,
) -> Response {
    dispatch(&state, "CreateVolume", async {
        state.controller()?.create_volume(req).await
    })
    .await
}

async fn delete_volume(
    State(state): State<AppState>,
    Json(req): Json<DeleteVolumeRequest>,
) -> Response {
    dispatch(&state, "DeleteVolume", async {
        state.controller()?.delete_volume(req).await
    })
    .await
}

async fn list_volumes(
    State(state): State<AppState>,
    Json(req): Json<ListVolumesRequest>,
) -> Response {
    dispatch(&state, "ListVolumes", async {
        state.controller()?.list_volumes(req).await
    })
    .await
}

async fn create_snapshot(
    State(state): State<AppState>,
    Json(req): Json<CreateSnapshotRequest>,
) -> Response {
    dispatch(&state, "CreateSnapshot", async {
        state.controller()?.create_snapshot(req).await
    })
    .await
}

async fn delete_snapshot(
    State(state): State<AppState>,
    Json(req): Json<DeleteSnapshotRequest>,
) -> Response {
    dispatch(&state, "DeleteSnapshot", async {
        state.controller()?.delete_snapshot(req).await
    })
    .await
}

async fn list_snapshots(
    State(state): State<AppState>,
    Json(req): Json<ListSnapshotsRequest>,
) -> Response {
    dispatch(&state, "ListSnapshots", async {
        state.controller()?.list_snapshots(req).await
    })
    .await
}

async fn controller_publish_volume(
    State(state): State<AppState>,
    Json(req): Json<ControllerPublishVolumeRequest>,
) -> Response {
    dispatch(&state, "ControllerPublishVolume", async {
        state.controller()?.publish_volume(req).await
    })
    .await
}

async fn controller_unpublish_volume(
    State(state): State<AppState>,
    Json(req): Json<ControllerUnpublishVolumeRequest>,
) -> Response {
    dispatch(&state, "ControllerUnpublishVolume", async {
        state.controller()?.unpublish_volume(req).await
    })
    .await
}

async fn validate_volume_capabilities(
    State(state): State<AppState>,
    Json(req): Json<ValidateVolumeCapabilitiesRequest>,
) -> Response {
    dispatch(&state, "ValidateVolumeCapabilities", async {
        state.controller()?.validate_volume_capabilities(req).await
    })
    .await
}

async fn controller_get_capabilities(State(state): State<AppState>) -> Response {
    dispatch(&state, "ControllerGetCapabilities", async {
        Ok(state.controller()?.get_capabilities())
    })
    .await
}

async fn get_capacity(State(state): State<AppState>) -> Response {
    dispatch(&state, "GetCapacity", async {
        state.controller()?.get_capacity().await
    })
    .await
}

async fn controller_expand_volume(
    State(state): State<AppState>,
    Json(req): Json<ControllerExpandVolumeRequest>,
) -> Response {
    dispatch(&state, "ControllerExpandVolume", async {
        state.controller()?.expand_volume(req).await
    })
    .await
}

// =============================================================================
// Node Handlers
// =============================================================================

async fn node_stage_volume(
    State(state): State<AppState>,
    Json(req): Json<NodeStageVolumeRequest>,
) -> Response {
    dispatch(&state, "NodeStageVolume", async {
        state.node()?.stage_volume(req).await
    })
    .await
}

async fn node_unstage_volume(
    State(state): State<AppState>,
    Json(req): Json<NodeUnstageVolumeRequest>,
) -> Response {
    dispatch(&state, "NodeUnstageVolume", async {
        state.node()?.unstage_volume(req).await
    })
    .await
}

async fn node_publish_volume(
    State(state): State<AppState>,
    Json(req): Json<NodePublishVolumeRequest>,
) -> Response {
    dispatch(&state, "NodePublishVolume", async {
        state.node()?.publish_volume(req).await
    })
    .await
}

async fn node_unpublish_volume(
    State(state): State<AppState>,
    Json(req): Json<NodeUnpublishVolumeRequest>,
) -> Response {
    dispatch(&state, "NodeUnpublishVolume", async {
        state.node()?.unpublish_volume(req).await
    })
    .await
}

async fn node_get_info(State(state): State<AppState>) -> Response {
    dispatch(&state, "NodeGetInfo", async { Ok(state.node()?.get_info()) }).await
}

async fn node_get_capabilities(State(state): State<AppState>) -> Response {
    dispatch(&state, "NodeGetCapabilities", async {
        Ok(state.node()?.get_capabilities())
    })
    .await
}

async fn node_get_volume_stats(State(state): State<AppState>) -> Response {
    dispatch(&state, "NodeGetVolumeStats", async {
        state.node()?.get_volume_stats().await
    })
    .await
}

async fn node_expand_volume(
    State(state): State<AppState>,
    Json(req): Json<NodeExpandVolumeRequest>,
) -> Response {
    dispatch(&state, "NodeExpandVolume", async {
        state.node()?.expand_volume(req).await
    })
    .await
}

// =============================================================================
// Health Handlers
// =============================================================================

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
///
/// A controller is ready once the appliance answers a pool listing.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(controller) = &state.controller else {
        return (StatusCode::OK, "ready".to_string());
    };
    match controller.get_pools().await {
        Ok(_) => (StatusCode::OK, "ready".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}
