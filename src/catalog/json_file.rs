//! Catalog backed by the JSON document the admin backend writes.
//!
//! The file is small and rewritten in place by the catalog owner, so it is
//! re-read on every lookup.  That makes edits visible to the next key
//! computation without any notification channel.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::{Catalog, Collection};

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    albums: Vec<Collection>,
}

/// [`Catalog`] implementation reading `{"albums": [...]}` from disk.
#[derive(Debug, Clone)]
pub struct JsonFileCatalog {
    path: PathBuf,
}

impl JsonFileCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<Collection>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("failed to read catalog: {}", self.path.display()))?;
        let doc: CatalogDocument = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse catalog: {}", self.path.display()))?;
        debug!(albums = doc.albums.len(), "catalog loaded");
        Ok(doc.albums)
    }
}

#[async_trait::async_trait]
impl Catalog for JsonFileCatalog {
    async fn find_by_slug(&self, slug: &str) -> Result<Option<Collection>> {
        Ok(self.load().await?.into_iter().find(|c| c.slug == slug))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Collection>> {
        Ok(self.load().await?.into_iter().find(|c| c.id == id))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.load().await?.len())
    }
}
