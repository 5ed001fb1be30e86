//! Archive job records and the handles callers wait on.
//!
//! A job publishes its progress through a `watch` channel.  Every caller
//! joined to the job holds a receiver, so the single terminal transition is
//! observed by all of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::builder::SkippedItem;
use super::key::ArchiveKey;
use crate::catalog::Tier;
use crate::error::{ArchiveError, JobFailure};

// ---------------------------------------------------------------------------
// Request / state
// ---------------------------------------------------------------------------

/// Which album and tier an archive was requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub collection_id: String,
    pub slug: String,
    pub tier: Tier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Building,
    Ready,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Cancelled | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Building => "building",
            JobState::Ready => "ready",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        }
    }
}

/// Point-in-time view of a job, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub state: JobState,
    pub items_total: usize,
    pub items_processed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SkippedItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    fn pending(items_total: usize) -> Self {
        Self {
            state: JobState::Pending,
            items_total,
            items_processed: 0,
            size_bytes: None,
            warnings: Vec::new(),
            error: None,
            completed_at: None,
        }
    }

    /// Snapshot describing an already-built artifact.
    pub fn ready(
        items_total: usize,
        size_bytes: u64,
        warnings: Vec<SkippedItem>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state: JobState::Ready,
            items_total,
            items_processed: items_total,
            size_bytes: Some(size_bytes),
            warnings,
            error: None,
            completed_at: Some(completed_at),
        }
    }

    /// Convert a terminal snapshot into the caller-facing result.
    pub fn into_result(self) -> Result<JobSnapshot, ArchiveError> {
        match self.state {
            JobState::Ready => Ok(self),
            JobState::Cancelled => Err(ArchiveError::Cancelled),
            JobState::Failed => Err(self
                .error
                .map(ArchiveError::from)
                .unwrap_or_else(|| ArchiveError::BuildFailed("unknown failure".to_string()))),
            state => Err(ArchiveError::NotReady(state.as_str().to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One in-flight or finished build for an [`ArchiveKey`].
#[derive(Debug)]
pub struct ArchiveJob {
    pub key: ArchiveKey,
    pub request: ArchiveRequest,
    pub created_at: DateTime<Utc>,
    cancel: CancellationToken,
    /// Set once the build is past its last cancellation checkpoint.
    committed: AtomicBool,
    state: watch::Sender<JobSnapshot>,
}

impl ArchiveJob {
    pub fn new(key: ArchiveKey, request: ArchiveRequest, items_total: usize) -> Arc<Self> {
        let (state, _) = watch::channel(JobSnapshot::pending(items_total));
        Arc::new(Self {
            key,
            request,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            committed: AtomicBool::new(false),
            state,
        })
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().state.is_terminal()
    }

    pub fn handle(&self) -> ArchiveHandle {
        ArchiveHandle {
            key: self.key,
            rx: self.state.subscribe(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Signal the build to stop.  Returns `false` when there is nothing left
    /// to stop: the job is terminal or has already committed its output.
    ///
    /// Runs under the state lock, so it cannot interleave with [`commit`].
    ///
    /// [`commit`]: ArchiveJob::commit
    pub fn request_cancel(&self) -> bool {
        let mut acknowledged = false;
        self.state.send_if_modified(|s| {
            if !s.state.is_terminal() && !self.committed.load(Ordering::Acquire) {
                self.cancel.cancel();
                acknowledged = true;
            }
            false
        });
        acknowledged
    }

    /// Pass the last cancellation checkpoint.  Fails if cancellation has
    /// already been requested; afterwards cancellation is refused.
    pub(crate) fn commit(&self) -> bool {
        let mut committed = false;
        self.state.send_if_modified(|s| {
            if !s.state.is_terminal() && !self.cancel.is_cancelled() {
                self.committed.store(true, Ordering::Release);
                committed = true;
            }
            false
        });
        committed
    }

    pub(crate) fn mark_building(&self) {
        self.state.send_if_modified(|s| {
            if s.state == JobState::Pending {
                s.state = JobState::Building;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn record_progress(&self, items_processed: usize) {
        self.state.send_if_modified(|s| {
            if s.state == JobState::Building {
                s.items_processed = items_processed;
                true
            } else {
                false
            }
        });
    }

    /// Apply the terminal transition.  Only the first call has any effect;
    /// returns whether this call was it.
    fn finish(&self, apply: impl FnOnce(&mut JobSnapshot)) -> bool {
        self.state.send_if_modified(|s| {
            if s.state.is_terminal() {
                return false;
            }
            apply(s);
            s.completed_at = Some(Utc::now());
            true
        })
    }

    pub(crate) fn finish_ready(&self, size_bytes: u64, warnings: Vec<SkippedItem>) -> bool {
        self.finish(|s| {
            s.state = JobState::Ready;
            s.items_processed = s.items_total;
            s.size_bytes = Some(size_bytes);
            s.warnings = warnings;
        })
    }

    pub(crate) fn finish_cancelled(&self) -> bool {
        self.finish(|s| s.state = JobState::Cancelled)
    }

    pub(crate) fn finish_failed(&self, failure: JobFailure) -> bool {
        self.finish(|s| {
            s.state = JobState::Failed;
            s.error = Some(failure);
        })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A caller's view of a job, returned by the coordinator.
#[derive(Debug, Clone)]
pub struct ArchiveHandle {
    key: ArchiveKey,
    rx: watch::Receiver<JobSnapshot>,
}

impl ArchiveHandle {
    /// Handle that is already resolved, used when a cached artifact matches.
    pub fn resolved(key: ArchiveKey, snapshot: JobSnapshot) -> Self {
        let (_tx, rx) = watch::channel(snapshot);
        Self { key, rx }
    }

    pub fn key(&self) -> ArchiveKey {
        self.key
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.rx.borrow().clone()
    }

    /// Suspend until the job is terminal or `timeout` elapses, returning the
    /// latest snapshot either way.
    pub async fn wait(&mut self, timeout: Duration) -> JobSnapshot {
        if !self.rx.borrow().state.is_terminal() {
            let _ = tokio::time::timeout(timeout, self.rx.wait_for(|s| s.state.is_terminal())).await;
        }
        self.snapshot()
    }

    /// Suspend until the job is terminal and convert the outcome.
    pub async fn outcome(mut self) -> Result<JobSnapshot, ArchiveError> {
        let terminal = self
            .rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| s.clone());
        let snapshot = match terminal {
            Ok(snapshot) => snapshot,
            Err(_) => self.snapshot(),
        };
        snapshot.into_result()
    }
}
