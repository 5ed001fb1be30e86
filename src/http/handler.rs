//! Main axum router and shared HTTP plumbing for the album archiver.
//!
//! Routes:
//! - `POST   /api/albums/{slug}/archive`        - Start or join an archive build
//! - `GET    /api/albums/{slug}/download`       - Build and stream in one call
//! - `GET    /api/archives/{handle}`            - Job status
//! - `DELETE /api/archives/{handle}`            - Cancel a job
//! - `GET    /api/archives/{handle}/download`   - Stream a finished archive
//! - `GET    /healthz`                          - Health check
//! - `GET    /metrics`                          - Prometheus metrics

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tracing::{debug, error};

use super::archive;
use crate::AppState;
use crate::error::ArchiveError;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Archive lifecycle
        .route(
            "/api/albums/{slug}/archive",
            post(archive::handle_request_archive),
        )
        .route(
            "/api/albums/{slug}/download",
            get(archive::handle_sync_download),
        )
        .route(
            "/api/archives/{handle}",
            get(archive::handle_status).delete(archive::handle_cancel),
        )
        .route(
            "/api/archives/{handle}/download",
            get(archive::handle_download),
        )
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Ambient handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health_state = crate::health::HealthState {
        catalog: Arc::clone(&state.catalog),
        space: Arc::clone(&state.space),
        staging_dir: state.config.archives.staging_dir.clone(),
        min_free_bytes: state.config.archives.min_free_bytes,
    };
    crate::health::health_handler(State(health_state)).await
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the archiver.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Bodies are JSON `{"error": "..."}`.  Internal errors are logged in full
/// and reported to the caller only generically.
#[derive(Debug)]
pub enum AppError {
    Archive(ArchiveError),
    Internal(anyhow::Error),
}

impl AppError {
    fn status_and_message(self) -> (StatusCode, String) {
        let err = match self {
            AppError::Archive(ArchiveError::Internal(err)) | AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                );
            }
            AppError::Archive(err) => err,
        };
        let status = match &err {
            ArchiveError::NotFound(_) => StatusCode::NOT_FOUND,
            ArchiveError::Forbidden(_) => StatusCode::FORBIDDEN,
            ArchiveError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ArchiveError::NotReady(_) | ArchiveError::Cancelled => StatusCode::CONFLICT,
            ArchiveError::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
            ArchiveError::BuildFailed(_) | ArchiveError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        debug!(%status, error = %err, "request rejected");
        (status, err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        AppError::Archive(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
