//! In-memory registry of finished archives on disk.
//!
//! An artifact stays servable until both retention clocks have run out: the
//! TTL measured from creation and the grace window measured from the last
//! download.  A stale artifact (its album changed after it was built) is
//! never servable and is evicted by the next sweep.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prometheus_client::encoding::EncodeLabelValue;
use serde::Serialize;

use super::builder::SkippedItem;
use super::job::JobSnapshot;
use super::key::ArchiveKey;
use crate::catalog::Tier;

/// `at + by`, saturating instead of overflowing.
pub fn shift(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Why the sweeper removed an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, EncodeLabelValue)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Expired,
    Stale,
    LowDisk,
    Missing,
}

/// A finished archive and its retention bookkeeping.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub key: ArchiveKey,
    pub collection_id: String,
    pub slug: String,
    pub tier: Tier,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub items_total: usize,
    pub warnings: Vec<SkippedItem>,
    pub created_at: DateTime<Utc>,
    pub last_access: Option<DateTime<Utc>>,
    pub stale_since: Option<DateTime<Utc>>,
}

impl ArtifactRecord {
    /// Instant after which neither retention clock keeps the artifact.
    pub fn retained_until(&self, ttl: Duration, download_grace: Duration) -> DateTime<Utc> {
        let by_ttl = shift(self.created_at, ttl);
        match self.last_access {
            Some(accessed) => by_ttl.max(shift(accessed, download_grace)),
            None => by_ttl,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot::ready(
            self.items_total,
            self.size_bytes,
            self.warnings.clone(),
            self.created_at,
        )
    }
}

#[derive(Debug)]
pub struct ArtifactRegistry {
    entries: DashMap<ArchiveKey, ArtifactRecord>,
    ttl: Duration,
    download_grace: Duration,
}

impl ArtifactRegistry {
    pub fn new(ttl: Duration, download_grace: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            download_grace,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn download_grace(&self) -> Duration {
        self.download_grace
    }

    /// Register `record`, returning the record it replaced, if any.
    pub fn insert(&self, record: ArtifactRecord) -> Option<ArtifactRecord> {
        self.entries.insert(record.key, record)
    }

    fn servable(&self, record: &ArtifactRecord, now: DateTime<Utc>) -> bool {
        !record.is_stale() && now < record.retained_until(self.ttl, self.download_grace)
    }

    /// The artifact for `key`, if it may still be served at `now`.
    pub fn get_servable(&self, key: &ArchiveKey, now: DateTime<Utc>) -> Option<ArtifactRecord> {
        self.entries
            .get(key)
            .filter(|record| self.servable(record.value(), now))
            .map(|record| record.value().clone())
    }

    /// The artifact for `key` regardless of freshness.
    pub fn get(&self, key: &ArchiveKey) -> Option<ArtifactRecord> {
        self.entries.get(key).map(|record| record.value().clone())
    }

    /// Record a download at `now`, extending retention by the grace window.
    /// Returns the updated record, or `None` if it is no longer servable.
    pub fn touch(&self, key: &ArchiveKey, now: DateTime<Utc>) -> Option<ArtifactRecord> {
        let mut record = self.entries.get_mut(key)?;
        if !self.servable(record.value(), now) {
            return None;
        }
        record.last_access = Some(now);
        Some(record.value().clone())
    }

    /// Flag the artifact as built from an outdated album revision.
    pub fn mark_stale(&self, key: &ArchiveKey, now: DateTime<Utc>) -> bool {
        match self.entries.get_mut(key) {
            Some(mut record) => {
                record.stale_since.get_or_insert(now);
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: &ArchiveKey) -> Option<ArtifactRecord> {
        self.entries.remove(key).map(|(_, record)| record)
    }

    /// Remove `record` only if it is still the registered entry for its key,
    /// i.e. no rebuild has replaced it since it was read.
    pub fn remove_exact(&self, record: &ArtifactRecord) -> bool {
        self.entries
            .remove_if(&record.key, |_, current| current.created_at == record.created_at)
            .is_some()
    }

    /// Copy of every record, for sweeping without holding shard locks.
    pub fn records(&self) -> Vec<ArtifactRecord> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|entry| entry.size_bytes).sum()
    }
}
