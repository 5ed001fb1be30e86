//! Album catalog collaborator.
//!
//! The catalog owns album and photo metadata.  This service only reads it:
//! lookups by slug (incoming requests) and by id (freshness checks on
//! artifacts that outlive the request that produced them).

pub mod json_file;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ArchiveError;

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Fidelity level at which a photo is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[serde(alias = "thumbnail")]
    Preview,
    Display,
    Original,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Preview, Tier::Display, Tier::Original];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Preview => "preview",
            Tier::Display => "display",
            Tier::Original => "original",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preview" | "thumbnail" => Ok(Tier::Preview),
            "display" => Ok(Tier::Display),
            "original" => Ok(Tier::Original),
            other => Err(ArchiveError::InvalidArgument(format!(
                "invalid quality {other:?}; must be one of: preview, display, original"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Collection model
// ---------------------------------------------------------------------------

/// A photo inside an album, with one stored file per tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    /// Filename the photo was uploaded with.
    #[serde(rename = "filename_original")]
    pub original_filename: String,
    #[serde(rename = "url_original")]
    pub original_path: String,
    #[serde(rename = "url_display")]
    pub display_path: String,
    #[serde(rename = "url_thumbnail")]
    pub preview_path: String,
}

impl Item {
    /// Media store path of this photo at `tier`.
    pub fn path(&self, tier: Tier) -> &str {
        match tier {
            Tier::Preview => &self.preview_path,
            Tier::Display => &self.display_path,
            Tier::Original => &self.original_path,
        }
    }
}

/// An album as recorded in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_visibility")]
    pub visibility: String,
    /// Whether visitors may download the album as an archive.
    #[serde(rename = "allow_downloads", default)]
    pub allow_archives: bool,
    /// Bumped by the catalog on every write to the album.
    pub updated_at: DateTime<Utc>,
    /// Photos in display order.
    #[serde(rename = "photos", default)]
    pub items: Vec<Item>,
}

fn default_visibility() -> String {
    "public".to_string()
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Read access to album metadata.
#[async_trait::async_trait]
pub trait Catalog: Send + Sync {
    /// Look up an album by its public slug.
    async fn find_by_slug(&self, slug: &str) -> Result<Option<Collection>>;

    /// Look up an album by its stable identifier.
    async fn find_by_id(&self, id: &str) -> Result<Option<Collection>>;

    /// Number of albums; doubles as a readability probe.
    async fn count(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parses_canonical_names() {
        for tier in Tier::ALL {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
    }

    #[test]
    fn thumbnail_is_an_alias_for_preview() {
        assert_eq!("thumbnail".parse::<Tier>().unwrap(), Tier::Preview);
        let tier: Tier = serde_json::from_str("\"thumbnail\"").unwrap();
        assert_eq!(tier, Tier::Preview);
    }

    #[test]
    fn unknown_tier_is_invalid_argument() {
        let err = "huge".parse::<Tier>().unwrap_err();
        assert!(matches!(err, ArchiveError::InvalidArgument(_)));
        assert!(err.to_string().contains("huge"));
    }

    #[test]
    fn tier_names_are_case_sensitive() {
        assert!("Display".parse::<Tier>().is_err());
    }

    #[test]
    fn item_path_selects_tier() {
        let item = Item {
            id: "p1".into(),
            original_filename: "IMG_0001.JPG".into(),
            original_path: "originals/p1.jpg".into(),
            display_path: "display/p1.webp".into(),
            preview_path: "thumbnails/p1.webp".into(),
        };
        assert_eq!(item.path(Tier::Original), "originals/p1.jpg");
        assert_eq!(item.path(Tier::Display), "display/p1.webp");
        assert_eq!(item.path(Tier::Preview), "thumbnails/p1.webp");
    }
}
