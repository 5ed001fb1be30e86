use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::archive::disk::SpaceProbe;
use crate::catalog::Catalog;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub catalog: CheckResult,
    pub staging: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: Some(detail.into()),
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of `AppState` the health check needs.
#[derive(Clone)]
pub struct HealthState {
    pub catalog: Arc<dyn Catalog>,
    pub space: Arc<dyn SpaceProbe>,
    pub staging_dir: PathBuf,
    pub min_free_bytes: u64,
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_catalog(catalog: &dyn Catalog) -> CheckResult {
    match catalog.count().await {
        Ok(albums) => CheckResult::healthy(format!("{albums} albums")),
        Err(e) => CheckResult::unhealthy(format!("catalog unreadable: {e}")),
    }
}

async fn check_staging(state: &HealthState) -> CheckResult {
    let space = Arc::clone(&state.space);
    let path = state.staging_dir.clone();
    let floor = state.min_free_bytes;

    // statvfs may block on a wedged mount; run it on the blocking pool.
    let result = tokio::task::spawn_blocking(move || space.available_bytes(&path)).await;

    match result {
        Ok(Ok(available)) if available < floor => CheckResult::unhealthy(format!(
            "{available} bytes free, below the {floor} byte floor"
        )),
        Ok(Ok(available)) => CheckResult::healthy(format!("{available} bytes free")),
        Ok(Err(e)) => CheckResult::unhealthy(format!("free space probe failed: {e}")),
        Err(e) => CheckResult::unhealthy(format!("free space probe task failed: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if !checks.catalog.ok {
        // Nothing can be archived without the catalog.
        HealthStatus::Unhealthy
    } else if !checks.staging.ok {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (catalog, staging) = tokio::join!(
        check_catalog(state.catalog.as_ref()),
        check_staging(&state)
    );

    let checks = HealthChecks { catalog, staging };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FixedSpace, MemoryCatalog};

    fn state(catalog: Arc<MemoryCatalog>, space: Arc<FixedSpace>) -> HealthState {
        HealthState {
            catalog,
            space,
            staging_dir: PathBuf::from("/tmp"),
            min_free_bytes: 1024,
        }
    }

    async fn status_of(state: HealthState) -> StatusCode {
        health_handler(State(state)).await.into_response().status()
    }

    #[tokio::test]
    async fn healthy_when_catalog_readable_and_space_available() {
        let catalog = Arc::new(MemoryCatalog::default());
        let space = Arc::new(FixedSpace::default());
        assert_eq!(status_of(state(catalog, space)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn low_space_degrades_but_stays_up() {
        let space = Arc::new(FixedSpace::default());
        space.set(10);
        let s = state(Arc::new(MemoryCatalog::default()), space);
        let staging = check_staging(&s).await;
        assert!(!staging.ok);
        let checks = HealthChecks {
            catalog: check_catalog(s.catalog.as_ref()).await,
            staging,
        };
        assert_eq!(aggregate_status(&checks), HealthStatus::Degraded);
        assert_eq!(status_of(s).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn unreadable_catalog_is_unhealthy() {
        let catalog = Arc::new(MemoryCatalog::default());
        catalog.set_failing(true);
        let s = state(catalog, Arc::new(FixedSpace::default()));
        assert_eq!(status_of(s).await, StatusCode::SERVICE_UNAVAILABLE);
    }
}
