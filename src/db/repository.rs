//! Storage abstraction shared by the SQLite and PostgreSQL backends.
//!
//! The scan path writes through `apply_diff` and `commit_photo`, which wrap
//! the single-row primitives in one transaction each. The primitives stay
//! public for administrative tools and tests.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::{
    Event, EventCounts, FaceMatch, FaceQuery, FaceRow, NewBib, PhotoCommit, RegistryEntry,
    RepoError, UpdateItem,
};
use crate::extract::{BibRead, FaceRead};
use crate::scanner::diff::DiffPlan;

pub type RepoResult<T> = Result<T, RepoError>;

pub trait Repository {
    // === Setup ===

    /// Create tables and indexes if they do not exist
    fn initialize(&self) -> RepoResult<()>;

    /// Length every stored face embedding must have
    fn embedding_dim(&self) -> usize;

    // === Events and enrolled bibs ===

    fn add_event(&self, name: &str, enabled: bool, expiry: DateTime<Utc>) -> RepoResult<i64>;

    fn get_event(&self, event_id: i64) -> RepoResult<Option<Event>>;

    fn add_bib(&self, event_id: i64, bib: &NewBib) -> RepoResult<i64>;

    fn event_counts(&self, event_id: i64) -> RepoResult<EventCounts>;

    // === Photos ===

    /// Register `path`, or move the watermark of an existing registration.
    fn upsert_photo(&self, event_id: i64, path: &str, timestamp: DateTime<Utc>) -> RepoResult<i64>;

    /// Advance the watermark; the last write of a commit
    fn touch_photo(&self, photo_id: i64, timestamp: DateTime<Utc>) -> RepoResult<()>;

    fn photo_registry(&self, event_id: i64) -> RepoResult<HashMap<String, RegistryEntry>>;

    /// Delete a photo after its detections
    fn delete_photo(&self, photo_id: i64) -> RepoResult<()>;

    // === Detections ===

    /// Remove every detection of a photo; a no-op when there are none
    fn clear_detections(&self, photo_id: i64) -> RepoResult<()>;

    fn add_bib_detection(&self, event_id: i64, photo_id: i64, bib: &BibRead) -> RepoResult<()>;

    /// Fails with [`RepoError::DimensionMismatch`] unless the embedding has
    /// exactly [`Repository::embedding_dim`] values.
    fn add_face_detection(&self, event_id: i64, photo_id: i64, face: &FaceRead) -> RepoResult<()>;

    // === Transactional scan writes ===

    /// Apply a change plan atomically and return the photos to extract,
    /// ordered by path.
    fn apply_diff(&self, event_id: i64, plan: &DiffPlan) -> RepoResult<Vec<UpdateItem>>;

    /// Replace a photo's detections and advance its watermark atomically.
    /// On error nothing is written.
    fn commit_photo(&self, commit: &PhotoCommit) -> RepoResult<()>;

    // === Search ===

    /// Photo paths with a bib read matching `bib` exactly, or containing it
    /// when `substring` is set. Sorted and de-duplicated.
    fn search_bib_photos(
        &self,
        event_id: i64,
        bib: &str,
        substring: bool,
        min_confidence: f32,
    ) -> RepoResult<Vec<String>>;

    /// Every stored face of an event, for building an in-memory index
    fn face_rows(&self, event_id: i64) -> RepoResult<Vec<FaceRow>>;

    /// Ranked face search inside the store. `None` when the backend has no
    /// vector support and the caller must use an in-memory index.
    fn native_face_search(&self, _query: &FaceQuery<'_>) -> RepoResult<Option<Vec<FaceMatch>>> {
        Ok(None)
    }

    // === Downloads ===

    fn record_download(&self, bib_id: i64, files: usize, total_size: u64) -> RepoResult<()>;

    fn downloaded_bytes_since(&self, bib_id: i64, since: DateTime<Utc>) -> RepoResult<u64>;
}

/// Reject embeddings of the wrong length before they reach storage.
pub fn check_dimension(expected: usize, embedding: &[f32]) -> RepoResult<()> {
    if embedding.len() != expected {
        return Err(RepoError::DimensionMismatch {
            expected,
            actual: embedding.len(),
        });
    }
    Ok(())
}
