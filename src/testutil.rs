//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use crate::AppState;
use crate::archive::coordinator::Coordinator;
use crate::archive::disk::{SpaceProbe, StagingDir};
use crate::catalog::{Catalog, Collection, Item, Tier};
use crate::config::{ArchiveConfig, CatalogConfig, Config, MediaConfig, ServerConfig};
use crate::media::MediaStore;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Albums
// ---------------------------------------------------------------------------

/// An archivable album whose items are `(id, original filename)` pairs.
///
/// Stored paths follow the site's layout: `originals/{id}.{ext}`,
/// `display/{id}.webp` and `thumbnails/{id}.webp`.
pub fn collection_with(slug: &str, items: &[(&str, &str)]) -> Collection {
    Collection {
        id: format!("album-{slug}"),
        slug: slug.to_string(),
        title: format!("Album {slug}"),
        description: String::new(),
        visibility: "public".to_string(),
        allow_archives: true,
        updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        items: items
            .iter()
            .map(|(id, original)| {
                let original_path = match Path::new(original).extension() {
                    Some(ext) => format!("originals/{id}.{}", ext.to_string_lossy()),
                    None => format!("originals/{id}"),
                };
                Item {
                    id: id.to_string(),
                    original_filename: original.to_string(),
                    original_path,
                    display_path: format!("display/{id}.webp"),
                    preview_path: format!("thumbnails/{id}.webp"),
                }
            })
            .collect(),
    }
}

/// In-memory media holding a small distinct file for every item of
/// `collection` at `tier`.
pub fn media_for(collection: &Collection, tier: Tier) -> MemoryMedia {
    let mut media = MemoryMedia::default();
    for item in &collection.items {
        media.insert(item.path(tier), format!("{}@{tier}", item.id).into_bytes());
    }
    media
}

// ---------------------------------------------------------------------------
// Media stores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MemoryMedia {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryMedia {
    pub fn with(files: &[(&str, &str)]) -> Self {
        let mut media = Self::default();
        for (path, contents) in files {
            media.insert(path, contents.as_bytes().to_vec());
        }
        media
    }

    pub fn insert(&mut self, path: &str, contents: Vec<u8>) {
        self.files.insert(path.to_string(), contents);
    }

    pub fn remove(&mut self, path: &str) {
        self.files.remove(path);
    }

    pub fn extend(&mut self, other: MemoryMedia) {
        self.files.extend(other.files);
    }
}

impl MediaStore for MemoryMedia {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        Ok(self
            .files
            .get(path)
            .map(|bytes| Box::new(Cursor::new(bytes.clone())) as Box<dyn Read + Send>))
    }
}

/// Media store whose opens block once `free_opens` have gone through, until
/// [`GateMedia::release`] is called.  Counts opens per path.
pub struct GateMedia {
    inner: MemoryMedia,
    free_opens: usize,
    total: AtomicUsize,
    per_path: Mutex<HashMap<String, usize>>,
    released: Mutex<bool>,
    cv: Condvar,
}

impl GateMedia {
    pub fn new(inner: MemoryMedia, free_opens: usize) -> Self {
        Self {
            inner,
            free_opens,
            total: AtomicUsize::new(0),
            per_path: Mutex::new(HashMap::new()),
            released: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn release(&self) {
        *self.released.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn opens(&self, path: &str) -> usize {
        self.per_path.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_opens(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl MediaStore for GateMedia {
    fn open(&self, path: &str) -> io::Result<Option<Box<dyn Read + Send>>> {
        *self
            .per_path
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default() += 1;
        let seen = self.total.fetch_add(1, Ordering::SeqCst);
        if seen >= self.free_opens {
            let mut released = self.released.lock().unwrap();
            while !*released {
                released = self.cv.wait(released).unwrap();
            }
        }
        self.inner.open(path)
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCatalog {
    albums: Mutex<Vec<Collection>>,
    failing: AtomicBool,
    id_gate: tokio::sync::Mutex<()>,
    id_lookups: AtomicUsize,
}

impl MemoryCatalog {
    /// Insert `collection`, replacing any album with the same id.
    pub fn put(&self, collection: Collection) {
        let mut albums = self.albums.lock().unwrap();
        albums.retain(|album| album.id != collection.id);
        albums.push(collection);
    }

    pub fn remove(&self, id: &str) {
        self.albums.lock().unwrap().retain(|album| album.id != id);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Park every `find_by_id` call until the returned guard is dropped.
    pub async fn hold_id_lookups(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.id_gate.lock().await
    }

    /// Number of `find_by_id` calls started so far.
    pub fn id_lookups(&self) -> usize {
        self.id_lookups.load(Ordering::SeqCst)
    }

    fn find(&self, matches: impl Fn(&Collection) -> bool) -> Result<Option<Collection>> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "catalog unavailable");
        Ok(self.albums.lock().unwrap().iter().find(|c| matches(c)).cloned())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_by_slug(&self, slug: &str) -> Result<Option<Collection>> {
        self.find(|c| c.slug == slug)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Collection>> {
        self.id_lookups.fetch_add(1, Ordering::SeqCst);
        let _open = self.id_gate.lock().await;
        self.find(|c| c.id == id)
    }

    async fn count(&self) -> Result<usize> {
        anyhow::ensure!(!self.failing.load(Ordering::SeqCst), "catalog unavailable");
        Ok(self.albums.lock().unwrap().len())
    }
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

pub struct FixedSpace {
    bytes: AtomicU64,
    probed_on: Mutex<Vec<ThreadId>>,
}

impl FixedSpace {
    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    /// Threads every probe ran on, in call order.
    pub fn probed_on(&self) -> Vec<ThreadId> {
        self.probed_on.lock().unwrap().clone()
    }
}

impl Default for FixedSpace {
    fn default() -> Self {
        Self {
            bytes: AtomicU64::new(u64::MAX),
            probed_on: Mutex::new(Vec::new()),
        }
    }
}

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        self.probed_on.lock().unwrap().push(std::thread::current().id());
        Ok(self.bytes.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Wired-up service
// ---------------------------------------------------------------------------

/// A coordinator over an in-memory catalog, backed by a temporary staging
/// directory and a controllable free-space probe.
pub struct Fixture {
    pub tmp: TempDir,
    pub catalog: Arc<MemoryCatalog>,
    pub space: Arc<FixedSpace>,
    pub coordinator: Arc<Coordinator>,
    pub state: Arc<AppState>,
}

impl Fixture {
    pub async fn new(media: Arc<dyn MediaStore>) -> Self {
        Self::with_settings(media, |_| {}).await
    }

    pub async fn with_settings(
        media: Arc<dyn MediaStore>,
        configure: impl FnOnce(&mut ArchiveConfig),
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = ArchiveConfig::with_staging_dir(tmp.path().join("staging"));
        configure(&mut settings);

        let staging = StagingDir::prepare(&settings.staging_dir).await.unwrap();
        let catalog = Arc::new(MemoryCatalog::default());
        let space = Arc::new(FixedSpace::default());
        let metrics = MetricsRegistry::new();
        let coordinator = Coordinator::new(
            settings.clone(),
            catalog.clone(),
            media,
            staging,
            space.clone(),
            metrics.clone(),
        );

        let config = Config {
            server: ServerConfig::default(),
            catalog: CatalogConfig {
                path: tmp.path().join("albums.json"),
            },
            media: MediaConfig {
                root: tmp.path().join("media"),
            },
            archives: settings,
        };
        let state = Arc::new(AppState {
            config: Arc::new(config),
            coordinator: Arc::clone(&coordinator),
            catalog: catalog.clone(),
            space: space.clone(),
            metrics,
        });

        Self {
            tmp,
            catalog,
            space,
            coordinator,
            state,
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.tmp.path().join("staging")
    }

    /// Names of every file currently in the staging directory, sorted.
    pub fn staging_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(self.staging_root())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}
