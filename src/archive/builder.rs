//! Uncompressed ZIP writer for album archives.
//!
//! Photos are already compressed, so entries are stored as-is.  Each source
//! file is streamed through a fixed-size buffer straight into its entry;
//! nothing larger than the buffer is held in memory.

use std::collections::HashSet;
use std::io::{self, Read, Seek, Write};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::catalog::{Collection, Tier};
use crate::media::MediaStore;

const COPY_BUFFER_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Entry planning
// ---------------------------------------------------------------------------

/// One file to be placed in the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub item_id: String,
    /// Name of the entry inside the archive.
    pub name: String,
    /// Media store path of the source bytes.
    pub source: String,
}

/// Lay out the entries of `collection` at `tier`, in catalog order.
///
/// Entries are named after the photo's original filename, carrying the
/// extension of the tier's stored file.  Names that collide get a ` (n)`
/// suffix so every entry is unique.
pub fn plan_entries(collection: &Collection, tier: Tier) -> Vec<ArchiveEntry> {
    let mut used = HashSet::new();
    collection
        .items
        .iter()
        .map(|item| {
            let source = item.path(tier).to_string();
            let base = entry_name(&item.original_filename, &source, &item.id);
            ArchiveEntry {
                item_id: item.id.clone(),
                name: unique_name(base, &mut used),
                source,
            }
        })
        .collect()
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(0) | None => (name, None),
        Some(idx) => (&name[..idx], Some(&name[idx + 1..])),
    }
}

fn entry_name(original_filename: &str, source: &str, item_id: &str) -> String {
    let (stem, original_ext) = split_extension(file_name(original_filename));
    let (_, source_ext) = split_extension(file_name(source));
    let stem = if stem.is_empty() { item_id } else { stem };
    match source_ext.or(original_ext) {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}

fn unique_name(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let (stem, ext) = split_extension(&base);
    let mut n = 2;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

// ---------------------------------------------------------------------------
// Build report
// ---------------------------------------------------------------------------

/// A photo left out of the archive, with a caller-safe reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub item_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Complete,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub outcome: BuildOutcome,
    /// Size of the finished container in bytes.
    pub bytes_written: u64,
    pub entries_written: usize,
    pub skipped: Vec<SkippedItem>,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to write archive container: {0}")]
    Container(#[from] zip::result::ZipError),
    #[error("failed to write archive container: {0}")]
    Io(#[from] io::Error),
    #[error("none of the {0} photos could be read")]
    NoItems(usize),
}

impl BuildError {
    /// Description safe to hand to callers.
    pub fn public_message(&self) -> String {
        match self {
            BuildError::Container(_) | BuildError::Io(_) => {
                "archive container could not be written".to_string()
            }
            BuildError::NoItems(0) => "album has no photos".to_string(),
            BuildError::NoItems(n) => format!("none of the {n} photos could be read"),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .unix_permissions(0o644)
}

enum CopyError {
    Source(io::Error),
    Sink(io::Error),
}

fn copy_entry(source: &mut dyn Read, sink: &mut impl Write) -> Result<u64, CopyError> {
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    let mut copied = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => return Ok(copied),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Source(e)),
        };
        sink.write_all(&buf[..n]).map_err(CopyError::Sink)?;
        copied += n as u64;
    }
}

/// Write `entries` into a ZIP container on `writer`, in order.
///
/// Missing or unreadable sources are skipped and reported.  `cancel` is
/// checked before each entry; once observed, the container is finalized
/// without the remaining entries and the outcome is
/// [`BuildOutcome::Cancelled`].  `on_item` receives the running count of
/// processed entries (written or skipped).
///
/// Returns the report together with the writer so the caller can persist it.
pub fn build_archive<W: Write + Seek>(
    media: &dyn MediaStore,
    entries: &[ArchiveEntry],
    writer: W,
    cancel: &CancellationToken,
    mut on_item: impl FnMut(usize),
) -> Result<(BuildReport, W), BuildError> {
    let mut zip = ZipWriter::new(writer);
    let mut skipped = Vec::new();
    let mut written = 0usize;
    let mut outcome = BuildOutcome::Complete;

    for (idx, entry) in entries.iter().enumerate() {
        if cancel.is_cancelled() {
            debug!(processed = idx, total = entries.len(), "cancellation observed");
            outcome = BuildOutcome::Cancelled;
            break;
        }

        let source = match media.open(&entry.source) {
            Ok(Some(source)) => Some(source),
            Ok(None) => {
                warn!(item_id = %entry.item_id, source = %entry.source, "source file missing; skipping");
                skipped.push(SkippedItem {
                    item_id: entry.item_id.clone(),
                    reason: "source file missing".to_string(),
                });
                None
            }
            Err(e) => {
                warn!(item_id = %entry.item_id, source = %entry.source, error = %e, "source file unreadable; skipping");
                skipped.push(SkippedItem {
                    item_id: entry.item_id.clone(),
                    reason: format!("source file unreadable ({})", e.kind()),
                });
                None
            }
        };

        if let Some(mut source) = source {
            zip.start_file(entry.name.as_str(), entry_options())?;
            match copy_entry(&mut source, &mut zip) {
                Ok(bytes) => {
                    written += 1;
                    debug!(item_id = %entry.item_id, name = %entry.name, bytes, "entry written");
                }
                Err(CopyError::Source(e)) => {
                    warn!(item_id = %entry.item_id, source = %entry.source, error = %e, "read failed mid-entry; dropping entry");
                    zip.abort_file()?;
                    skipped.push(SkippedItem {
                        item_id: entry.item_id.clone(),
                        reason: format!("source file unreadable ({})", e.kind()),
                    });
                }
                Err(CopyError::Sink(e)) => return Err(BuildError::Io(e)),
            }
        }

        on_item(idx + 1);
    }

    if outcome == BuildOutcome::Complete && written == 0 {
        return Err(BuildError::NoItems(entries.len()));
    }

    let mut writer = zip.finish()?;
    let bytes_written = writer.stream_position()?;
    writer.flush()?;

    Ok((
        BuildReport {
            outcome,
            bytes_written,
            entries_written: written,
            skipped,
        },
        writer,
    ))
}
