//! Media store collaborator: read-only access to per-tier photo files.
//!
//! Reads are blocking; callers run them on the blocking pool alongside the
//! archive writer they feed.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tracing::warn;

/// Byte source for stored photos.
pub trait MediaStore: Send + Sync {
    /// Open the file stored at `path`.
    ///
    /// Returns `Ok(None)` when nothing is stored there; other I/O failures
    /// are returned as errors.
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>>;
}

/// [`MediaStore`] over a directory tree.
///
/// Catalog paths are site-relative (`/uploads/display/x.webp`) and are
/// resolved beneath `root`.  Paths that would escape the root are treated
/// as absent.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        (resolved != self.root).then_some(resolved)
    }
}

impl MediaStore for FsMediaStore {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        let Some(full) = self.resolve(path) else {
            warn!(%path, "rejected media path outside the store root");
            return Ok(None);
        };
        match File::open(&full) {
            Ok(file) if file.metadata()?.is_file() => Ok(Some(Box::new(file))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
