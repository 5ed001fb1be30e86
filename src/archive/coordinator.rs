//! Job coordinator: turns `(album, tier)` requests into archives.
//!
//! Requests are deduplicated per [`ArchiveKey`]: the artifact registry is
//! consulted first, then the job table, and only when neither can satisfy
//! the key is a new build spawned.  The job table is a [`DashMap`], so the
//! check-and-insert for one key is serialized by that key's shard lock while
//! unrelated albums proceed independently.  A semaphore caps how many builds
//! run at once; the rest wait in line as `pending`.

use std::io::{BufWriter, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use prometheus_client::metrics::gauge::Gauge;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::builder::{
    ArchiveEntry, BuildError, BuildOutcome, BuildReport, SkippedItem, build_archive, plan_entries,
};
use super::disk::{SpaceProbe, StagingDir, remove_artifact};
use super::job::{ArchiveHandle, ArchiveJob, ArchiveRequest, JobSnapshot, JobState};
use super::key::ArchiveKey;
use super::registry::{ArtifactRecord, ArtifactRegistry};
use crate::catalog::{Catalog, Collection, Tier};
use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, JobFailure};
use crate::media::MediaStore;
use crate::metrics::{BuildLabels, BuildResult, MetricsRegistry, RequestLabels, RequestOutcome};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A validated request together with the entries and key it resolves to.
#[derive(Debug, Clone)]
pub struct ArchivePlan {
    pub request: ArchiveRequest,
    pub key: ArchiveKey,
    pub entries: Vec<ArchiveEntry>,
}

impl ArchivePlan {
    fn for_collection(collection: &Collection, tier: Tier) -> Self {
        let entries = plan_entries(collection, tier);
        let key = ArchiveKey::compute(&collection.id, collection.updated_at, tier, &entries);
        Self {
            request: ArchiveRequest {
                collection_id: collection.id.clone(),
                slug: collection.slug.clone(),
                tier,
            },
            key,
            entries,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CancelOutcome {
    Acknowledged,
    NothingToCancel,
}

/// An open artifact ready to be streamed.
#[derive(Debug)]
pub struct ServedArtifact {
    pub file: tokio::fs::File,
    pub size_bytes: u64,
    pub slug: String,
    pub tier: Tier,
}

/// An archive built for a single synchronous download.  The backing file
/// is unnamed and disappears once closed.
#[derive(Debug)]
pub struct SyncArchive {
    pub file: std::fs::File,
    pub size_bytes: u64,
    pub warnings: Vec<SkippedItem>,
    pub slug: String,
    pub tier: Tier,
}

/// How a spawned build ended, before it is published on the job.
enum BuildEnd {
    Ready(ArtifactRecord),
    Cancelled,
    Failed(JobFailure),
}

/// Keeps the active-builds gauge accurate even if the owning future is
/// dropped mid-build.
struct ActiveBuild(Gauge);

impl ActiveBuild {
    fn start(gauge: &Gauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveBuild {
    fn drop(&mut self) {
        self.0.dec();
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    pub(super) settings: ArchiveConfig,
    pub(super) catalog: Arc<dyn Catalog>,
    pub(super) media: Arc<dyn MediaStore>,
    pub(super) staging: StagingDir,
    pub(super) space: Arc<dyn SpaceProbe>,
    pub(super) jobs: DashMap<ArchiveKey, Arc<ArchiveJob>>,
    pub(super) artifacts: ArtifactRegistry,
    pub(super) metrics: MetricsRegistry,
    build_permits: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(
        settings: ArchiveConfig,
        catalog: Arc<dyn Catalog>,
        media: Arc<dyn MediaStore>,
        staging: StagingDir,
        space: Arc<dyn SpaceProbe>,
        metrics: MetricsRegistry,
    ) -> Arc<Self> {
        let artifacts = ArtifactRegistry::new(settings.artifact_ttl(), settings.download_grace());
        let build_permits = Arc::new(Semaphore::new(settings.max_concurrent_builds.max(1)));
        Arc::new(Self {
            settings,
            catalog,
            media,
            staging,
            space,
            jobs: DashMap::new(),
            artifacts,
            metrics,
            build_permits,
        })
    }

    pub fn settings(&self) -> &ArchiveConfig {
        &self.settings
    }

    pub fn artifacts(&self) -> &ArtifactRegistry {
        &self.artifacts
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    /// Look up `slug` and work out which archive would satisfy it at `tier`.
    ///
    /// Rejects unknown albums and albums with archives disabled before any
    /// work is scheduled.
    #[instrument(skip(self), fields(%slug, %tier))]
    pub async fn resolve(&self, slug: &str, tier: Tier) -> Result<ArchivePlan, ArchiveError> {
        let collection = self
            .catalog
            .find_by_slug(slug)
            .await
            .context("catalog lookup failed")?
            .ok_or_else(|| ArchiveError::NotFound(format!("album {slug:?} not found")))?;

        if !collection.allow_archives {
            return Err(ArchiveError::Forbidden(format!(
                "archives are disabled for album {slug:?}"
            )));
        }

        Ok(ArchivePlan::for_collection(&collection, tier))
    }

    /// Start or join the build for `plan`, or reuse a cached artifact.
    pub fn request_archive(self: &Arc<Self>, plan: ArchivePlan) -> ArchiveHandle {
        let now = Utc::now();
        if let Some(record) = self.artifacts.get_servable(&plan.key, now) {
            debug!(key = %plan.key, slug = %plan.request.slug, "reusing cached archive");
            self.count_request(RequestOutcome::CacheHit);
            return ArchiveHandle::resolved(plan.key, record.snapshot());
        }

        let (job, started) = match self.jobs.entry(plan.key) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                // A ready job only counts while its artifact is still
                // servable; failed or cancelled jobs are retried.
                let joinable = !existing.is_terminal()
                    || (existing.snapshot().state == JobState::Ready
                        && self.artifacts.get_servable(&plan.key, now).is_some());
                if joinable {
                    (Arc::clone(slot.get()), false)
                } else {
                    let job = self.new_job(&plan);
                    slot.insert(Arc::clone(&job));
                    (job, true)
                }
            }
            Entry::Vacant(slot) => {
                let job = self.new_job(&plan);
                slot.insert(Arc::clone(&job));
                (job, true)
            }
        };

        let handle = job.handle();
        if started {
            info!(
                key = %plan.key,
                slug = %plan.request.slug,
                tier = %plan.request.tier,
                items = plan.entries.len(),
                "archive build scheduled"
            );
            self.count_request(RequestOutcome::Started);
            tokio::spawn(Arc::clone(self).run_job(job, plan.entries));
        } else {
            debug!(key = %plan.key, "joined existing archive job");
            self.count_request(RequestOutcome::Joined);
        }
        handle
    }

    fn new_job(&self, plan: &ArchivePlan) -> Arc<ArchiveJob> {
        ArchiveJob::new(plan.key, plan.request.clone(), plan.entries.len())
    }

    fn count_request(&self, outcome: RequestOutcome) {
        self.metrics
            .metrics
            .archive_requests_total
            .get_or_create(&RequestLabels { outcome })
            .inc();
    }

    /// Current state of the job or artifact behind `key`.
    pub fn status(&self, key: &ArchiveKey) -> Option<JobSnapshot> {
        if let Some(snapshot) = self.jobs.get(key).map(|job| job.snapshot())
            && snapshot.state != JobState::Ready
        {
            return Some(snapshot);
        }
        self.artifacts
            .get_servable(key, Utc::now())
            .map(|record| record.snapshot())
    }

    /// Ask the job behind `key` to stop.  Unknown jobs, terminal jobs and
    /// jobs already moving their archive into place have nothing to cancel.
    pub fn cancel(&self, key: &ArchiveKey) -> CancelOutcome {
        let Some(job) = self.jobs.get(key).map(|job| Arc::clone(job.value())) else {
            return CancelOutcome::NothingToCancel;
        };
        if job.request_cancel() {
            info!(%key, slug = %job.request.slug, "archive cancellation requested");
            CancelOutcome::Acknowledged
        } else {
            debug!(%key, "archive job is past cancellation");
            CancelOutcome::NothingToCancel
        }
    }

    /// Open the finished archive for `key`.
    ///
    /// The album is re-read first: permission is checked again and the key
    /// recomputed, so an archive of an outdated album revision is never
    /// served.
    #[instrument(skip(self), fields(%key))]
    pub async fn serve(&self, key: &ArchiveKey) -> Result<ServedArtifact, ArchiveError> {
        let now = Utc::now();
        let Some(record) = self.artifacts.get_servable(key, now) else {
            return Err(self.not_servable(key));
        };

        let collection = self
            .catalog
            .find_by_id(&record.collection_id)
            .await
            .context("catalog lookup failed")?;
        let Some(collection) = collection else {
            info!(slug = %record.slug, "album no longer exists; marking archive stale");
            self.artifacts.mark_stale(key, now);
            return Err(ArchiveError::NotFound("album not found".to_string()));
        };
        if !collection.allow_archives {
            return Err(ArchiveError::Forbidden(format!(
                "archives are disabled for album {:?}",
                collection.slug
            )));
        }
        if ArchivePlan::for_collection(&collection, record.tier).key != *key {
            info!(slug = %collection.slug, "album changed since archive was built; marking stale");
            self.artifacts.mark_stale(key, now);
            return Err(ArchiveError::NotFound(
                "archive is out of date; request a new one".to_string(),
            ));
        }

        let Some(record) = self.artifacts.touch(key, now) else {
            return Err(self.not_servable(key));
        };

        let file = match tokio::fs::File::open(&record.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %record.path.display(), "archive file vanished; dropping record");
                self.artifacts.remove(key);
                self.refresh_artifact_gauges();
                return Err(ArchiveError::NotFound("archive not found or expired".to_string()));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to open archive {}", record.path.display()))
                    .into());
            }
        };

        self.metrics.metrics.downloads_total.inc();
        info!(slug = %collection.slug, tier = %record.tier, size_bytes = record.size_bytes, "serving archive");
        Ok(ServedArtifact {
            file,
            size_bytes: record.size_bytes,
            slug: collection.slug,
            tier: record.tier,
        })
    }

    fn not_servable(&self, key: &ArchiveKey) -> ArchiveError {
        match self.jobs.get(key).map(|job| job.snapshot().state) {
            Some(state) if !state.is_terminal() => ArchiveError::NotReady(state.as_str().to_string()),
            _ => ArchiveError::NotFound("archive not found or expired".to_string()),
        }
    }

    /// Build `plan` into an unnamed temporary file and hand it back without
    /// caching it.  Shares the build ceiling with queued jobs; dropping the
    /// returned future stops the build at the next item.
    #[instrument(skip(self, plan), fields(key = %plan.key, slug = %plan.request.slug, tier = %plan.request.tier))]
    pub async fn build_now(&self, plan: ArchivePlan) -> Result<SyncArchive, ArchiveError> {
        let _permit = Arc::clone(&self.build_permits)
            .acquire_owned()
            .await
            .context("build queue closed")?;
        self.check_free_space().await?;

        let file = self
            .staging
            .anonymous_file()
            .context("failed to create temporary archive file")?;
        let media = Arc::clone(&self.media);
        let cancel = CancellationToken::new();
        let abort_on_drop = cancel.clone().drop_guard();
        let ArchivePlan {
            request, entries, ..
        } = plan;

        let metrics = &self.metrics.metrics;
        let active = ActiveBuild::start(&metrics.active_builds);
        let started = Instant::now();
        let built = tokio::task::spawn_blocking(move || {
            build_archive(media.as_ref(), &entries, BufWriter::new(file), &cancel, |_| {})
                .and_then(|(report, writer)| {
                    let file = writer
                        .into_inner()
                        .map_err(|e| BuildError::Io(e.into_error()))?;
                    Ok((report, file))
                })
        })
        .await;
        abort_on_drop.disarm();
        drop(active);
        metrics
            .build_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        let (report, mut file) = match built.context("archive build task panicked")? {
            Ok(built) => built,
            Err(e) => {
                warn!(error = %e, "synchronous archive build failed");
                return Err(ArchiveError::BuildFailed(e.public_message()));
            }
        };
        if report.outcome == BuildOutcome::Cancelled {
            return Err(ArchiveError::Cancelled);
        }
        metrics.items_skipped_total.inc_by(report.skipped.len() as u64);

        file.seek(SeekFrom::Start(0))
            .context("failed to rewind temporary archive")?;
        metrics.sync_downloads_total.inc();
        Ok(SyncArchive {
            file,
            size_bytes: report.bytes_written,
            warnings: report.skipped,
            slug: request.slug,
            tier: request.tier,
        })
    }

    // -----------------------------------------------------------------------
    // Build path
    // -----------------------------------------------------------------------

    /// Free bytes on the staging volume.  The probe may block on a wedged
    /// mount, so it runs on the blocking pool.
    pub(super) async fn available_space(&self) -> anyhow::Result<u64> {
        let space = Arc::clone(&self.space);
        let root = self.staging.root().to_path_buf();
        tokio::task::spawn_blocking(move || space.available_bytes(&root))
            .await
            .context("free space probe task failed")?
            .context("failed to probe free space in staging dir")
    }

    async fn check_free_space(&self) -> Result<(), ArchiveError> {
        let available = self.available_space().await?;
        if available < self.settings.min_free_bytes {
            warn!(
                available,
                floor = self.settings.min_free_bytes,
                "refusing archive build: staging volume is low on space"
            );
            return Err(ArchiveError::ResourceExhausted);
        }
        Ok(())
    }

    #[instrument(skip_all, fields(key = %job.key, slug = %job.request.slug, tier = %job.request.tier))]
    async fn run_job(self: Arc<Self>, job: Arc<ArchiveJob>, entries: Vec<ArchiveEntry>) {
        let cancel = job.cancel_token().clone();
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                info!("archive cancelled while queued");
                self.publish(&job, BuildEnd::Cancelled);
                return;
            }
            permit = Arc::clone(&self.build_permits).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            error!("build queue closed");
            self.publish(&job, BuildEnd::Failed(JobFailure::internal("build queue closed")));
            return;
        };

        if let Err(e) = self.check_free_space().await {
            let failure = match e {
                ArchiveError::ResourceExhausted => JobFailure::resource_exhausted(),
                other => {
                    error!(error = %other, "free space check failed");
                    JobFailure::internal("internal error")
                }
            };
            self.publish(&job, BuildEnd::Failed(failure));
            return;
        }

        job.mark_building();
        let active = ActiveBuild::start(&self.metrics.metrics.active_builds);
        let started = Instant::now();
        let end = match self.build_cached(&job, entries).await {
            Ok(end) => end,
            Err(e) => {
                error!(error = %format!("{e:#}"), "archive build failed unexpectedly");
                BuildEnd::Failed(JobFailure::internal("internal error"))
            }
        };
        drop(active);
        self.metrics
            .metrics
            .build_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        self.publish(&job, end);
    }

    /// Run the build on the blocking pool and move the result into place.
    /// Any temporary file is gone by the time this returns without a
    /// [`BuildEnd::Ready`].
    async fn build_cached(
        &self,
        job: &Arc<ArchiveJob>,
        entries: Vec<ArchiveEntry>,
    ) -> anyhow::Result<BuildEnd> {
        let partial = self
            .staging
            .partial_file()
            .context("failed to create partial archive file")?;
        let items_total = entries.len();
        let media = Arc::clone(&self.media);
        let cancel = job.cancel_token().clone();
        let progress = Arc::clone(job);

        let built = tokio::task::spawn_blocking(move || {
            build_archive(
                media.as_ref(),
                &entries,
                BufWriter::new(partial),
                &cancel,
                |processed| progress.record_progress(processed),
            )
            .and_then(|(report, writer)| {
                let partial = writer
                    .into_inner()
                    .map_err(|e| BuildError::Io(e.into_error()))?;
                Ok((report, partial))
            })
        })
        .await
        .context("archive build task panicked")?;

        let (report, partial): (BuildReport, _) = match built {
            Ok(built) => built,
            Err(e) => {
                warn!(error = %e, "archive build failed");
                return Ok(BuildEnd::Failed(JobFailure::build_failed(e.public_message())));
            }
        };

        // Last cancellation checkpoint.
        if report.outcome == BuildOutcome::Cancelled || !job.commit() {
            drop(partial);
            info!(entries_written = report.entries_written, "archive build cancelled; partial output removed");
            return Ok(BuildEnd::Cancelled);
        }

        let created_at = Utc::now();
        let path = self.staging.artifact_path(&job.key, created_at);
        partial
            .persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to persist archive to {}", path.display()))?;

        self.metrics
            .metrics
            .items_skipped_total
            .inc_by(report.skipped.len() as u64);

        let record = ArtifactRecord {
            key: job.key,
            collection_id: job.request.collection_id.clone(),
            slug: job.request.slug.clone(),
            tier: job.request.tier,
            path,
            size_bytes: report.bytes_written,
            items_total,
            warnings: report.skipped,
            created_at,
            last_access: None,
            stale_since: None,
        };
        if let Some(replaced) = self.artifacts.insert(record.clone())
            && let Err(e) = remove_artifact(&replaced.path).await
        {
            warn!(path = %replaced.path.display(), error = %e, "failed to delete replaced archive");
        }
        self.refresh_artifact_gauges();

        // The album may have been edited while the build ran.
        if !self.is_live(&job.key, &job.request).await {
            info!("album changed during build; archive marked stale");
            self.artifacts.mark_stale(&job.key, Utc::now());
        }

        info!(
            size_bytes = record.size_bytes,
            entries_written = report.entries_written,
            skipped = record.warnings.len(),
            "archive ready"
        );
        Ok(BuildEnd::Ready(record))
    }

    fn publish(&self, job: &ArchiveJob, end: BuildEnd) {
        let result = match end {
            BuildEnd::Ready(record) => {
                job.finish_ready(record.size_bytes, record.warnings);
                BuildResult::Ready
            }
            BuildEnd::Cancelled => {
                job.finish_cancelled();
                BuildResult::Cancelled
            }
            BuildEnd::Failed(failure) => {
                job.finish_failed(failure);
                BuildResult::Failed
            }
        };
        self.metrics
            .metrics
            .builds_total
            .get_or_create(&BuildLabels { result })
            .inc();
    }

    // -----------------------------------------------------------------------
    // Freshness
    // -----------------------------------------------------------------------

    /// The key the album would produce at `tier` right now, or `None` if the
    /// album is gone.
    pub(super) async fn live_key(
        &self,
        collection_id: &str,
        tier: Tier,
    ) -> anyhow::Result<Option<ArchiveKey>> {
        let collection = self.catalog.find_by_id(collection_id).await?;
        Ok(collection.map(|c| ArchivePlan::for_collection(&c, tier).key))
    }

    async fn is_live(&self, key: &ArchiveKey, request: &ArchiveRequest) -> bool {
        match self.live_key(&request.collection_id, request.tier).await {
            Ok(live) => live == Some(*key),
            Err(e) => {
                warn!(error = %e, "catalog unavailable; assuming archive is current");
                true
            }
        }
    }

    pub(super) fn refresh_artifact_gauges(&self) {
        let metrics = &self.metrics.metrics;
        metrics.artifacts.set(self.artifacts.len() as i64);
        metrics
            .artifact_bytes
            .set(self.artifacts.total_bytes() as i64);
    }
}
