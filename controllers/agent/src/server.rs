//! HTTP transport of the IPAM RPC surface, plus the metrics endpoint.

use crate::metrics::Metrics;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ipam::api::{
    ALLOCATE_PATH, AllocateRequest, AllocateResponse, ErrorBody, GATEWAY_PATH, GatewayResponse, HEALTH_PATH,
    HealthResponse, RELEASE_PATH, ReleaseRequest, ReleaseResponse,
};
use ipam::{IpamError, IpamService, StoreError};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

/// Shared state of the RPC handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// IPAM request handlers
    pub service: Arc<IpamService>,
    /// Agent metrics
    pub metrics: Arc<Metrics>,
}

/// An [`IpamError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub IpamError);

impl From<IpamError> for ApiError {
    fn from(err: IpamError) -> Self {
        Self(err)
    }
}

/// HTTP status for an IPAM error.
pub fn status_for(err: &IpamError) -> StatusCode {
    match err {
        IpamError::PodNotFound(_) | IpamError::PoolNotFound(_) | IpamError::GatewayNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        IpamError::PodNotAlive(_) => StatusCode::PRECONDITION_FAILED,
        IpamError::PoolExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
        IpamError::AllocationConflict { .. } => StatusCode::CONFLICT,
        IpamError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        IpamError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        IpamError::InvalidAddressSpec(_) | IpamError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

/// Routes of the RPC server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(ALLOCATE_PATH, post(allocate))
        .route(RELEASE_PATH, post(release))
        .route(&format!("{}/{{node}}", GATEWAY_PATH), get(gateway))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Routes of the metrics server.
pub fn metrics_router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.service.health())
}

async fn allocate(
    State(state): State<AppState>,
    Json(request): Json<AllocateRequest>,
) -> Result<Json<AllocateResponse>, ApiError> {
    match state.service.allocate(&request).await {
        Ok(response) => {
            state.metrics.allocation("success");
            Ok(Json(response))
        }
        Err(e) => {
            warn!(
                "Allocate for {}/{} failed: {}",
                request.pod_namespace, request.pod_name, e
            );
            state.metrics.allocation(e.code().as_str());
            Err(e.into())
        }
    }
}

async fn release(
    State(state): State<AppState>,
    Json(request): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    match state.service.release(&request).await {
        Ok(response) => {
            state.metrics.release("success");
            Ok(Json(response))
        }
        Err(e) => {
            warn!(
                "Release for {}/{} failed: {}",
                request.pod_namespace, request.pod_name, e
            );
            state.metrics.release(e.code().as_str());
            Err(e.into())
        }
    }
}

async fn gateway(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> Result<Json<GatewayResponse>, ApiError> {
    Ok(Json(state.service.get_gateway(&node).await?))
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> Response {
    match metrics.render() {
        Ok(text) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
