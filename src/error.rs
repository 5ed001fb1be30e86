//! Error taxonomy for archive requests.
//!
//! Messages carried by these variants are safe to show to callers: they name
//! slugs, tiers and item identifiers but never filesystem paths.  Underlying
//! I/O causes are logged where they occur.

use serde::Serialize;

/// Everything that can go wrong between receiving an archive request and
/// handing back a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The collection or the artifact does not exist (or has expired).
    #[error("{0}")]
    NotFound(String),
    /// Archives are disabled for the collection.
    #[error("{0}")]
    Forbidden(String),
    /// Malformed request, e.g. an unknown quality tier.
    #[error("{0}")]
    InvalidArgument(String),
    /// The job exists but has not produced an artifact yet.
    #[error("archive is not ready (state: {0})")]
    NotReady(String),
    /// The container could not be created or no item could be read.
    #[error("archive build failed: {0}")]
    BuildFailed(String),
    /// The build was cancelled before it finished.
    #[error("archive build was cancelled")]
    Cancelled,
    /// Not enough free space in the staging directory to start a build.
    #[error("insufficient free space to build archive")]
    ResourceExhausted,
    /// An unexpected internal failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Machine-readable classification of a failed job, reported in status
/// snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailed,
    ResourceExhausted,
    Internal,
}

/// Failure detail recorded on a job and shared with every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn build_failed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::BuildFailed,
            message: message.into(),
        }
    }

    pub fn resource_exhausted() -> Self {
        Self {
            kind: FailureKind::ResourceExhausted,
            message: ArchiveError::ResourceExhausted.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            message: message.into(),
        }
    }
}

impl From<JobFailure> for ArchiveError {
    fn from(failure: JobFailure) -> Self {
        match failure.kind {
            FailureKind::BuildFailed => ArchiveError::BuildFailed(failure.message),
            FailureKind::ResourceExhausted => ArchiveError::ResourceExhausted,
            FailureKind::Internal => ArchiveError::Internal(anyhow::anyhow!(failure.message)),
        }
    }
}
