use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

use crate::archive::registry::EvictionReason;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub outcome: RequestOutcome,
}

/// How an archive request was satisfied.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum RequestOutcome {
    CacheHit,
    Joined,
    Started,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BuildLabels {
    pub result: BuildResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum BuildResult {
    Ready,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EvictionLabels {
    pub reason: EvictionReason,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Central container for every Prometheus metric exposed by the archiver.
pub struct Metrics {
    // -- requests --
    pub archive_requests_total: Family<RequestLabels, Counter>,

    // -- builds --
    pub builds_total: Family<BuildLabels, Counter>,
    pub build_duration_seconds: Histogram,
    pub items_skipped_total: Counter,
    pub active_builds: Gauge,

    // -- retention --
    pub evictions_total: Family<EvictionLabels, Counter>,
    pub jobs_reaped_total: Counter,
    pub artifacts: Gauge,
    pub artifact_bytes: Gauge,

    // -- downloads --
    pub downloads_total: Counter,
    pub sync_downloads_total: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let archive_requests_total = Family::<RequestLabels, Counter>::default();
        registry.register(
            "album_archiver_requests_total",
            "Archive requests by how they were satisfied",
            archive_requests_total.clone(),
        );

        let builds_total = Family::<BuildLabels, Counter>::default();
        registry.register(
            "album_archiver_builds_total",
            "Finished archive builds by terminal state",
            builds_total.clone(),
        );

        let build_duration_seconds = Histogram::new(exponential_buckets(0.1, 2.0, 14));
        registry.register(
            "album_archiver_build_duration_seconds",
            "Archive build latency in seconds, excluding queueing",
            build_duration_seconds.clone(),
        );

        let items_skipped_total = Counter::default();
        registry.register(
            "album_archiver_items_skipped_total",
            "Photos left out of archives because their source was unreadable",
            items_skipped_total.clone(),
        );

        let active_builds: Gauge = Gauge::default();
        registry.register(
            "album_archiver_active_builds",
            "Archive builds currently holding a build slot",
            active_builds.clone(),
        );

        let evictions_total = Family::<EvictionLabels, Counter>::default();
        registry.register(
            "album_archiver_evictions_total",
            "Artifacts removed by the retention sweeper, by reason",
            evictions_total.clone(),
        );

        let jobs_reaped_total = Counter::default();
        registry.register(
            "album_archiver_jobs_reaped_total",
            "Finished job records dropped by the retention sweeper",
            jobs_reaped_total.clone(),
        );

        let artifacts: Gauge = Gauge::default();
        registry.register(
            "album_archiver_artifacts",
            "Archives currently registered on disk",
            artifacts.clone(),
        );

        let artifact_bytes: Gauge = Gauge::default();
        registry.register(
            "album_archiver_artifact_bytes",
            "Total size of registered archives in bytes",
            artifact_bytes.clone(),
        );

        let downloads_total = Counter::default();
        registry.register(
            "album_archiver_downloads_total",
            "Cached archives streamed to callers",
            downloads_total.clone(),
        );

        let sync_downloads_total = Counter::default();
        registry.register(
            "album_archiver_sync_downloads_total",
            "Archives built and streamed in a single request",
            sync_downloads_total.clone(),
        );

        Self {
            archive_requests_total,
            builds_total,
            build_duration_seconds,
            items_skipped_total,
            active_builds,
            evictions_total,
            jobs_reaped_total,
            artifacts,
            artifact_bytes,
            downloads_total,
            sync_downloads_total,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`crate::AppState`].
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all archiver metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
