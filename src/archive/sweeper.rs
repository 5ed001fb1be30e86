//! Background retention sweeper.
//!
//! Each pass walks the artifact registry and evicts archives that are stale,
//! past retention, or missing from disk.  If the staging volume is still
//! below its free-space floor afterwards, the oldest remaining archives past
//! a minimum age are evicted until it is not.  Finally, terminal job records
//! older than the job grace window are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::coordinator::Coordinator;
use super::disk::remove_artifact;
use super::key::ArchiveKey;
use super::registry::{ArtifactRecord, EvictionReason, shift};
use crate::catalog::Tier;
use crate::metrics::EvictionLabels;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<(ArchiveKey, EvictionReason)>,
    pub jobs_reaped: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty() && self.jobs_reaped == 0
    }
}

/// Run sweeps every `sweep_interval` until `shutdown` fires.
pub async fn run_sweeper(coordinator: Arc<Coordinator>, shutdown: CancellationToken) {
    let interval = coordinator.settings().sweep_interval();
    info!(interval_secs = interval.as_secs(), "retention sweeper started");

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }

        let report = sweep(&coordinator, Utc::now()).await;
        if report.is_empty() {
            debug!("sweep found nothing to reclaim");
        } else {
            info!(
                evicted = report.evicted.len(),
                jobs_reaped = report.jobs_reaped,
                "sweep complete"
            );
        }
    }

    info!("retention sweeper stopped");
}

/// One retention pass, evaluated as of `now`.
#[instrument(skip(coordinator))]
pub async fn sweep(coordinator: &Coordinator, now: DateTime<Utc>) -> SweepReport {
    let mut report = SweepReport::default();
    let registry = &coordinator.artifacts;
    // One catalog read per album and tier per pass.
    let mut live_keys: HashMap<(String, Tier), Option<ArchiveKey>> = HashMap::new();
    let mut survivors = Vec::new();

    for record in registry.records() {
        let reason = if record.is_stale() {
            Some(EvictionReason::Stale)
        } else if now >= record.retained_until(registry.ttl(), registry.download_grace()) {
            Some(EvictionReason::Expired)
        } else if !tokio::fs::try_exists(&record.path).await.unwrap_or(true) {
            Some(EvictionReason::Missing)
        } else {
            let lookup = (record.collection_id.clone(), record.tier);
            let cached = live_keys.get(&lookup).copied();
            let live = match cached {
                Some(live) => Some(live),
                None => match coordinator.live_key(&lookup.0, lookup.1).await {
                    Ok(live) => {
                        live_keys.insert(lookup, live);
                        Some(live)
                    }
                    Err(e) => {
                        warn!(slug = %record.slug, error = %e, "catalog unavailable; skipping staleness check");
                        None
                    }
                },
            };
            match live {
                Some(live) if live != Some(record.key) => Some(EvictionReason::Stale),
                _ => None,
            }
        };

        match reason {
            Some(reason) => evict(coordinator, &record, reason, &mut report).await,
            None => survivors.push(record),
        }
    }

    reclaim_space(coordinator, survivors, now, &mut report).await;
    report.jobs_reaped = reap_jobs(coordinator, now);
    coordinator.refresh_artifact_gauges();
    report
}

/// Evict the oldest artifacts past the minimum age while free space is
/// below the floor, re-probing after every deletion.
async fn reclaim_space(
    coordinator: &Coordinator,
    mut candidates: Vec<ArtifactRecord>,
    now: DateTime<Utc>,
    report: &mut SweepReport,
) {
    let floor = coordinator.settings.min_free_bytes;
    let min_age = coordinator.settings.min_eviction_age();
    candidates.sort_by_key(|record| record.created_at);

    for record in candidates {
        match coordinator.available_space().await {
            Ok(available) if available < floor => {
                debug!(available, floor, "staging volume below free-space floor");
            }
            Ok(_) => break,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to probe free space; skipping low-disk eviction");
                break;
            }
        }
        if shift(record.created_at, min_age) > now {
            continue;
        }
        evict(coordinator, &record, EvictionReason::LowDisk, report).await;
    }
}

async fn evict(
    coordinator: &Coordinator,
    record: &ArtifactRecord,
    reason: EvictionReason,
    report: &mut SweepReport,
) {
    if !coordinator.artifacts.remove_exact(record) {
        return;
    }
    if let Err(e) = remove_artifact(&record.path).await {
        warn!(
            key = %record.key,
            path = %record.path.display(),
            error = %e,
            "failed to delete evicted archive"
        );
    }
    info!(
        key = %record.key,
        slug = %record.slug,
        tier = %record.tier,
        ?reason,
        size_bytes = record.size_bytes,
        "archive evicted"
    );
    coordinator
        .metrics
        .metrics
        .evictions_total
        .get_or_create(&EvictionLabels { reason })
        .inc();
    report.evicted.push((record.key, reason));
}

/// Drop job records that have been terminal for longer than the grace
/// window.  Ready jobs stay reachable through the artifact registry.
fn reap_jobs(coordinator: &Coordinator, now: DateTime<Utc>) -> usize {
    let grace = coordinator.settings.terminal_job_grace();
    let before = coordinator.jobs.len();
    coordinator.jobs.retain(|_, job| {
        let snapshot = job.snapshot();
        let expired = snapshot.state.is_terminal()
            && snapshot
                .completed_at
                .is_some_and(|done| shift(done, grace) <= now);
        !expired
    });
    let reaped = before.saturating_sub(coordinator.jobs.len());
    if reaped > 0 {
        coordinator
            .metrics
            .metrics
            .jobs_reaped_total
            .inc_by(reaped as u64);
    }
    reaped
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::archive::job::JobState;
    use crate::error::ArchiveError;
    use crate::testutil::{Fixture, MemoryMedia, collection_with, media_for};

    const MINUTE: Duration = Duration::from_secs(60);

    async fn build(fx: &Fixture, slug: &str, tier: Tier) -> ArchiveKey {
        let plan = fx.coordinator.resolve(slug, tier).await.unwrap();
        let key = plan.key;
        fx.coordinator.request_archive(plan).outcome().await.unwrap();
        key
    }

    #[tokio::test]
    async fn expired_archive_is_removed_from_disk() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Display))).await;
        fx.catalog.put(album);
        let key = build(&fx, "trip", Tier::Display).await;
        let path = fx.coordinator.artifacts().get(&key).unwrap().path;
        let later = shift(Utc::now(), 61 * MINUTE);

        assert!(fx.coordinator.artifacts().get_servable(&key, later).is_none());
        assert!(sweep(&fx.coordinator, Utc::now()).await.evicted.is_empty());
        assert!(path.exists());

        let report = sweep(&fx.coordinator, later).await;
        assert_eq!(report.evicted, vec![(key, EvictionReason::Expired)]);
        assert!(!path.exists());
        assert!(matches!(
            fx.coordinator.serve(&key).await,
            Err(ArchiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn edited_album_evicts_previous_archive() {
        let album = collection_with("trip", &[("p1", "a.jpg"), ("p2", "b.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Display))).await;
        fx.catalog.put(album.clone());
        let key = build(&fx, "trip", Tier::Display).await;

        let mut edited = album;
        edited.items[0].original_filename = "renamed.jpg".into();
        edited.updated_at += chrono::Duration::seconds(5);
        fx.catalog.put(edited);

        let report = sweep(&fx.coordinator, Utc::now()).await;
        assert_eq!(report.evicted, vec![(key, EvictionReason::Stale)]);
        assert_eq!(fx.staging_files(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn deleted_album_evicts_its_archives() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Preview))).await;
        fx.catalog.put(album.clone());
        let key = build(&fx, "trip", Tier::Preview).await;

        fx.catalog.remove(&album.id);
        let report = sweep(&fx.coordinator, Utc::now()).await;
        assert_eq!(report.evicted, vec![(key, EvictionReason::Stale)]);
    }

    #[tokio::test]
    async fn catalog_outage_keeps_archives() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Display))).await;
        fx.catalog.put(album);
        build(&fx, "trip", Tier::Display).await;

        fx.catalog.set_failing(true);
        assert!(sweep(&fx.coordinator, Utc::now()).await.evicted.is_empty());
        assert_eq!(fx.coordinator.artifacts().len(), 1);
    }

    #[tokio::test]
    async fn vanished_file_is_forgotten() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Display))).await;
        fx.catalog.put(album);
        let key = build(&fx, "trip", Tier::Display).await;
        std::fs::remove_file(fx.coordinator.artifacts().get(&key).unwrap().path).unwrap();

        let report = sweep(&fx.coordinator, Utc::now()).await;
        assert_eq!(report.evicted, vec![(key, EvictionReason::Missing)]);
        assert_eq!(fx.coordinator.artifacts().len(), 0);
    }

    #[tokio::test]
    async fn low_disk_evicts_oldest_past_minimum_age() {
        let first = collection_with("first", &[("a", "a.jpg")]);
        let second = collection_with("second", &[("b", "b.jpg")]);
        let mut media = media_for(&first, Tier::Display);
        media.extend(media_for(&second, Tier::Display));
        let fx = Fixture::with_settings(Arc::new(media), |s| {
            s.min_eviction_age_secs = 300;
            s.artifact_ttl_secs = 24 * 3600;
            s.download_grace_secs = 24 * 3600;
        })
        .await;
        fx.catalog.put(first);
        fx.catalog.put(second);
        let old = build(&fx, "first", Tier::Display).await;
        let young = build(&fx, "second", Tier::Display).await;

        fx.space.set(0);
        // Too young to evict yet.
        assert!(sweep(&fx.coordinator, Utc::now()).await.evicted.is_empty());

        let report = sweep(&fx.coordinator, shift(Utc::now(), 10 * MINUTE)).await;
        assert_eq!(
            report.evicted,
            vec![(old, EvictionReason::LowDisk), (young, EvictionReason::LowDisk)]
        );

        fx.space.set(u64::MAX);
        assert!(sweep(&fx.coordinator, Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn low_disk_stops_once_space_recovers() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Display))).await;
        fx.catalog.put(album);
        build(&fx, "trip", Tier::Display).await;

        fx.space.set(fx.coordinator.settings().min_free_bytes);
        assert!(sweep(&fx.coordinator, shift(Utc::now(), 30 * MINUTE)).await.evicted.is_empty());
    }

    #[tokio::test]
    async fn terminal_jobs_are_reaped_after_grace() {
        let fx = Fixture::new(Arc::new(MemoryMedia::default())).await;
        fx.catalog.put(collection_with("empty", &[("p1", "a.jpg")]));
        let plan = fx.coordinator.resolve("empty", Tier::Display).await.unwrap();
        let key = plan.key;
        assert!(fx.coordinator.request_archive(plan).outcome().await.is_err());
        assert_eq!(fx.coordinator.status(&key).unwrap().state, JobState::Failed);

        assert_eq!(sweep(&fx.coordinator, Utc::now()).await.jobs_reaped, 0);
        let report = sweep(&fx.coordinator, shift(Utc::now(), 6 * MINUTE)).await;
        assert_eq!(report.jobs_reaped, 1);
        assert!(fx.coordinator.status(&key).is_none());
    }

    #[tokio::test]
    async fn eviction_racing_a_rebuild_spares_the_new_archive() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Display))).await;
        fx.catalog.put(album);
        let key = build(&fx, "trip", Tier::Display).await;
        let old = fx.coordinator.artifacts().get(&key).unwrap();

        // Record dropped, file not yet deleted, when the rebuild lands.
        assert!(fx.coordinator.artifacts().remove_exact(&old));
        assert_eq!(build(&fx, "trip", Tier::Display).await, key);
        remove_artifact(&old.path).await.unwrap();

        assert!(fx.coordinator.serve(&key).await.is_ok());
        assert_eq!(fx.staging_files().len(), 1);
    }

    #[tokio::test]
    async fn replaced_record_is_not_evicted() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::new(Arc::new(media_for(&album, Tier::Display))).await;
        fx.catalog.put(album);
        let key = build(&fx, "trip", Tier::Display).await;
        let old = fx.coordinator.artifacts().get(&key).unwrap();
        fx.coordinator.artifacts().mark_stale(&key, Utc::now());
        build(&fx, "trip", Tier::Display).await;

        let mut report = SweepReport::default();
        evict(&fx.coordinator, &old, EvictionReason::Stale, &mut report).await;
        assert!(report.evicted.is_empty());
        assert!(fx.coordinator.artifacts().get(&key).unwrap().path.exists());
        assert!(fx.coordinator.serve(&key).await.is_ok());
    }

    #[tokio::test]
    async fn background_sweeper_runs_until_shutdown() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let fx = Fixture::with_settings(Arc::new(media_for(&album, Tier::Display)), |s| {
            s.sweep_interval_secs = 1;
        })
        .await;
        fx.catalog.put(album.clone());
        build(&fx, "trip", Tier::Display).await;
        fx.catalog.remove(&album.id);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_sweeper(Arc::clone(&fx.coordinator), shutdown.clone()));

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while fx.coordinator.artifacts().len() > 0 {
            assert!(std::time::Instant::now() < deadline, "sweeper never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fx.staging_files(), Vec::<String>::new());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
