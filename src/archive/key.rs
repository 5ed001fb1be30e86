//! Content fingerprint for album archives.
//!
//! The key covers exactly what changes the bytes of an archive: the album's
//! identity and revision marker, the tier, and the ordered list of
//! `(item id, entry name)` pairs.  Titles and descriptions are not hashed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use super::builder::ArchiveEntry;
use crate::catalog::Tier;
use crate::error::ArchiveError;

const KEY_DOMAIN: &[u8] = b"album-archive/v1";

/// SHA-256 fingerprint identifying one archive's contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey([u8; 32]);

impl ArchiveKey {
    pub fn compute(
        collection_id: &str,
        last_modified: DateTime<Utc>,
        tier: Tier,
        entries: &[ArchiveEntry],
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        // Length-prefix every field so adjacent values cannot run together.
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(collection_id.as_bytes());
        field(
            last_modified
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        field(tier.as_str().as_bytes());
        field(&(entries.len() as u64).to_le_bytes());
        for entry in entries {
            field(entry.item_id.as_bytes());
            field(entry.name.as_bytes());
        }
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveKey({})", &self.to_hex()[..12])
    }
}

impl FromStr for ArchiveKey {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ArchiveError::InvalidArgument("malformed archive handle".to_string());
        let bytes = hex::decode(s).map_err(|_| malformed())?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| malformed())?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::builder::plan_entries;
    use crate::testutil::collection_with;

    fn key_of(collection: &crate::catalog::Collection, tier: Tier) -> ArchiveKey {
        ArchiveKey::compute(
            &collection.id,
            collection.updated_at,
            tier,
            &plan_entries(collection, tier),
        )
    }

    #[test]
    fn same_inputs_same_key() {
        let album = collection_with("trip", &[("p1", "a.jpg"), ("p2", "b.jpg")]);
        assert_eq!(key_of(&album, Tier::Display), key_of(&album.clone(), Tier::Display));
    }

    #[test]
    fn tier_changes_key() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        assert_ne!(key_of(&album, Tier::Display), key_of(&album, Tier::Original));
    }

    #[test]
    fn reordering_changes_key() {
        let album = collection_with("trip", &[("p1", "a.jpg"), ("p2", "b.jpg")]);
        let mut reordered = album.clone();
        reordered.items.reverse();
        assert_ne!(key_of(&album, Tier::Display), key_of(&reordered, Tier::Display));
    }

    #[test]
    fn renaming_or_removing_items_changes_key() {
        let album = collection_with("trip", &[("p1", "a.jpg"), ("p2", "b.jpg")]);

        let mut renamed = album.clone();
        renamed.items[1].original_filename = "c.jpg".into();
        assert_ne!(key_of(&album, Tier::Display), key_of(&renamed, Tier::Display));

        let mut removed = album.clone();
        removed.items.pop();
        assert_ne!(key_of(&album, Tier::Display), key_of(&removed, Tier::Display));
    }

    #[test]
    fn revision_marker_changes_key() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let mut touched = album.clone();
        touched.updated_at += chrono::Duration::seconds(1);
        assert_ne!(key_of(&album, Tier::Display), key_of(&touched, Tier::Display));
    }

    #[test]
    fn title_and_description_do_not_change_key() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let mut retitled = album.clone();
        retitled.title = "A whole new title".into();
        retitled.description = "and a description".into();
        retitled.slug = "new-slug".into();
        assert_eq!(key_of(&album, Tier::Display), key_of(&retitled, Tier::Display));
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let entry = |id: &str, name: &str| ArchiveEntry {
            item_id: id.into(),
            name: name.into(),
            source: String::new(),
        };
        let now = Utc::now();
        let a = ArchiveKey::compute("c", now, Tier::Display, &[entry("ab", "c")]);
        let b = ArchiveKey::compute("c", now, Tier::Display, &[entry("a", "bc")]);
        assert_ne!(a, b);
    }

    #[test]
    fn hex_round_trip_and_rejects_garbage() {
        let album = collection_with("trip", &[("p1", "a.jpg")]);
        let key = key_of(&album, Tier::Preview);
        let hex = key.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex.parse::<ArchiveKey>().unwrap(), key);
        assert!("zz".parse::<ArchiveKey>().is_err());
        assert!("abcd".parse::<ArchiveKey>().is_err());
    }
}
