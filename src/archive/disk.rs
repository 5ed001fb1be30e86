//! Staging directory layout and free-space probing.
//!
//! Finished archives live at `{staging}/{key}-{created}.zip`, one file per
//! build, so a rebuild never reuses the path of an archive that is being
//! evicted.  Builds write to
//! `{staging}/.partial-*` temporaries that are renamed into place only once
//! complete, so a half-written archive never sits at a servable path.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::key::ArchiveKey;

const PARTIAL_PREFIX: &str = ".partial-";
const ARTIFACT_EXTENSION: &str = "zip";

// ---------------------------------------------------------------------------
// Free space
// ---------------------------------------------------------------------------

/// Reports how many bytes are available to unprivileged writers at a path.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by `statvfs(3)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

#[cfg(unix)]
impl SpaceProbe for StatvfsProbe {
    #[allow(clippy::unnecessary_cast)]
    fn available_bytes(&self, path: &Path) -> io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
    }
}

#[cfg(not(unix))]
impl SpaceProbe for StatvfsProbe {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(u64::MAX)
    }
}

// ---------------------------------------------------------------------------
// Staging directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StagingDir {
    root: PathBuf,
}

impl StagingDir {
    /// Create the staging directory if needed and clear out anything left by
    /// a previous process.  Artifact bookkeeping is in-memory, so files from
    /// an earlier run are unreachable and only occupy disk.
    pub async fn prepare(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create staging dir: {}", root.display()))?;

        let mut removed = 0usize;
        let mut entries = tokio::fs::read_dir(&root)
            .await
            .with_context(|| format!("failed to list staging dir: {}", root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_leftover = name.starts_with(PARTIAL_PREFIX)
                || Path::new(name.as_ref()).extension().and_then(|e| e.to_str())
                    == Some(ARTIFACT_EXTENSION);
            if !is_leftover || !entry.file_type().await?.is_file() {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %name, error = %e, "failed to remove leftover staging file"),
            }
        }

        info!(path = %root.display(), removed, "staging directory ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, key: &ArchiveKey, created_at: DateTime<Utc>) -> PathBuf {
        self.root.join(format!(
            "{key}-{}.{ARTIFACT_EXTENSION}",
            created_at.timestamp_micros()
        ))
    }

    /// Named temporary file for a cached build; deleted on drop unless
    /// persisted.
    pub fn partial_file(&self) -> io::Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&self.root)
    }

    /// Unnamed temporary file for an uncached build; gone once closed.
    pub fn anonymous_file(&self) -> io::Result<File> {
        tempfile::tempfile_in(&self.root)
    }
}

/// Delete an artifact file.  Already-absent files are not an error; returns
/// whether a file was actually removed.
pub async fn remove_artifact(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "artifact removed");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
