//! Album archive endpoints.
//!
//! The asynchronous flow is request → poll status → download.  Handles
//! returned to callers are the hex form of the archive key, so identical
//! requests from different callers share one handle.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::{info, instrument};

use super::handler::AppError;
use crate::AppState;
use crate::archive::{ArchiveKey, CancelOutcome, JobSnapshot};
use crate::catalog::Tier;
use crate::error::ArchiveError;

/// Response header carrying the number of photos left out of a synchronous
/// download.
const SKIPPED_HEADER: &str = "x-archive-skipped-items";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct ArchiveQuery {
    quality: Option<String>,
    /// Seconds to wait for the build before answering.
    wait: Option<u64>,
}

#[derive(Debug, Serialize)]
struct Links {
    status: String,
    download: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    handle: String,
    #[serde(flatten)]
    snapshot: JobSnapshot,
    links: Links,
}

impl StatusBody {
    fn new(key: ArchiveKey, snapshot: JobSnapshot) -> Self {
        let handle = key.to_hex();
        Self {
            links: Links {
                status: format!("/api/archives/{handle}"),
                download: format!("/api/archives/{handle}/download"),
            },
            handle,
            snapshot,
        }
    }
}

#[derive(Debug, Serialize)]
struct CancelBody {
    handle: String,
    result: CancelOutcome,
}

fn parse_tier(quality: Option<&str>) -> Result<Tier, ArchiveError> {
    quality
        .ok_or_else(|| {
            ArchiveError::InvalidArgument(
                "missing quality; must be one of: preview, display, original".to_string(),
            )
        })?
        .parse()
}

fn parse_handle(handle: &str) -> Result<ArchiveKey, ArchiveError> {
    handle.parse()
}

/// Keep only characters that are safe inside a quoted header parameter.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "album".to_string()
    } else {
        cleaned
    }
}

fn attachment(slug: &str, tier: Tier, size_bytes: u64, body: Body) -> Response {
    let filename = format!("{}-{tier}.zip", sanitize_filename(slug));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
            (header::CONTENT_LENGTH, size_bytes.to_string()),
        ],
        body,
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /api/albums/{slug}/archive?quality=<tier>&wait=<secs>`
///
/// Starts a build (or joins/reuses one) and answers `202` with a handle.
/// With `wait`, holds the response until the job finishes or the wait,
/// capped by configuration, runs out.
#[instrument(skip(state, query), fields(%slug))]
pub async fn handle_request_archive(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, AppError> {
    let tier = parse_tier(query.quality.as_deref())?;
    let plan = state.coordinator.resolve(&slug, tier).await?;
    let mut handle = state.coordinator.request_archive(plan);

    let snapshot = match query.wait {
        Some(secs) if secs > 0 => {
            let wait = Duration::from_secs(secs).min(state.config.archives.max_wait());
            handle.wait(wait).await
        }
        _ => handle.snapshot(),
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(StatusBody::new(handle.key(), snapshot)),
    )
        .into_response())
}

/// `GET /api/archives/{handle}`
#[instrument(skip(state))]
pub async fn handle_status(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Response, AppError> {
    let key = parse_handle(&handle)?;
    let snapshot = state
        .coordinator
        .status(&key)
        .ok_or_else(|| ArchiveError::NotFound("archive not found or expired".to_string()))?;
    Ok(Json(StatusBody::new(key, snapshot)).into_response())
}

/// `DELETE /api/archives/{handle}`
#[instrument(skip(state))]
pub async fn handle_cancel(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Response, AppError> {
    let key = parse_handle(&handle)?;
    let result = state.coordinator.cancel(&key);
    Ok(Json(CancelBody {
        handle: key.to_hex(),
        result,
    })
    .into_response())
}

/// `GET /api/archives/{handle}/download`
///
/// Streams a finished archive.  `409` while the job is still running, `404`
/// once the archive has expired or its album has changed.
#[instrument(skip(state))]
pub async fn handle_download(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Response, AppError> {
    let key = parse_handle(&handle)?;
    let served = state.coordinator.serve(&key).await?;
    let body = Body::from_stream(ReaderStream::new(served.file));
    Ok(attachment(&served.slug, served.tier, served.size_bytes, body))
}

/// `GET /api/albums/{slug}/download?quality=<tier>`
///
/// Builds the archive inside the request and streams it; nothing is cached.
#[instrument(skip(state, query), fields(%slug))]
pub async fn handle_sync_download(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<ArchiveQuery>,
) -> Result<Response, AppError> {
    let tier = parse_tier(query.quality.as_deref())?;
    let plan = state.coordinator.resolve(&slug, tier).await?;
    let archive = state.coordinator.build_now(plan).await?;

    info!(
        size_bytes = archive.size_bytes,
        skipped = archive.warnings.len(),
        "streaming synchronous archive"
    );
    let skipped = archive.warnings.len();
    let file = tokio::fs::File::from_std(archive.file);
    let mut response = attachment(
        &archive.slug,
        archive.tier,
        archive.size_bytes,
        Body::from_stream(ReaderStream::new(file)),
    );
    if skipped > 0 {
        response
            .headers_mut()
            .insert(SKIPPED_HEADER, skipped.into());
    }
    Ok(response)
}
