//! On-demand album archives.
//!
//! A request names an album and a [`Tier`](crate::catalog::Tier).  The
//! [`Coordinator`] fingerprints the album's current contents into an
//! [`ArchiveKey`], reuses a cached archive for that key if one is on disk,
//! joins a build already in flight for it, or schedules a new build.  The
//! [`sweeper`] reclaims archives that have expired or no longer match their
//! album.

pub mod builder;
pub mod coordinator;
pub mod disk;
pub mod job;
pub mod key;
pub mod registry;
pub mod sweeper;

pub use coordinator::{CancelOutcome, Coordinator};
pub use job::{JobSnapshot, JobState};
pub use key::ArchiveKey;
