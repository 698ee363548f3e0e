mod error;
mod repository;
mod schema;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod postgres_schema;

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;

pub use error::RepoError;
pub use repository::{check_dimension, RepoResult, Repository};
pub use schema::SCHEMA;

use crate::config::{DatabaseConfig, SimilarityMetric};
#[cfg(feature = "postgres")]
use crate::config::DatabaseType;
use crate::extract::{BibRead, FaceRead};
use crate::scanner::diff::DiffPlan;

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub expiry: DateTime<Utc>,
}

/// Enrollment data for a runner.
#[derive(Debug, Clone)]
pub struct NewBib {
    pub bib_number: String,
    pub enabled: bool,
    pub expiry: DateTime<Utc>,
    pub name: Option<String>,
    /// Access code handed to the runner for downloads
    pub code: Option<String>,
}

/// A registered photo as seen by change detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryEntry {
    pub id: i64,
    pub last_updated: DateTime<Utc>,
}

/// A photo queued for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateItem {
    pub photo_id: i64,
    pub path: String,
}

/// Everything extracted from one photo, written in one transaction.
#[derive(Debug, Clone)]
pub struct PhotoCommit {
    pub event_id: i64,
    pub photo_id: i64,
    pub bibs: Vec<BibRead>,
    pub faces: Vec<FaceRead>,
    /// New watermark
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub bibs: u64,
    pub photos: u64,
    pub bib_detections: u64,
    pub faces: u64,
}

/// A stored face with the path of its photo.
#[derive(Debug, Clone)]
pub struct FaceRow {
    pub path: String,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct FaceQuery<'a> {
    pub event_id: i64,
    pub embedding: &'a [f32],
    pub metric: SimilarityMetric,
    pub min_confidence: f32,
    pub min_similarity: f32,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FaceMatch {
    pub path: String,
    pub similarity: f32,
    pub confidence: f32,
}

/// Watermarks are compared as strings in SQL, so every timestamp is written
/// in the same fixed-width UTC form.
pub fn to_db_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn from_db_timestamp(value: &str) -> Result<DateTime<Utc>, RepoError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| RepoError::Timestamp(value.to_string()))
}

/// Convert embedding to little-endian bytes for storage
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Macro to dispatch a method call to the active backend variant.
macro_rules! dispatch {
    // No arguments beyond self
    ($self:expr, $method:ident()) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method(),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method(),
        }
    };
    // With arguments
    ($self:expr, $method:ident($($arg:expr),+ $(,)?)) => {
        match &$self.inner {
            DatabaseInner::Sqlite(db) => db.$method($($arg),+),
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(db) => db.$method($($arg),+),
        }
    };
}

enum DatabaseInner {
    Sqlite(sqlite::SqliteDb),
    #[cfg(feature = "postgres")]
    Postgres(postgres::PgDb),
}

/// The configured backend.
pub struct Database {
    inner: DatabaseInner,
}

impl Database {
    /// Open a database connection based on the provided configuration.
    pub fn open(config: &DatabaseConfig, embedding_dim: usize) -> anyhow::Result<Self> {
        #[cfg(feature = "postgres")]
        {
            if config.backend == DatabaseType::Postgresql {
                let url = config.postgresql_url.as_deref()
                    .ok_or_else(|| anyhow::anyhow!("PostgreSQL URL not configured"))?;
                let pool_size = config.pool_size.unwrap_or(10);
                let pg = postgres::PgDb::open(url, pool_size, embedding_dim)?;
                return Ok(Self { inner: DatabaseInner::Postgres(pg) });
            }
        }
        #[cfg(not(feature = "postgres"))]
        {
            if config.backend != crate::config::DatabaseType::Sqlite {
                anyhow::bail!("PostgreSQL support not compiled in (enable the `postgres` feature)");
            }
        }

        let db = sqlite::SqliteDb::open(&config.sqlite_path, embedding_dim)?;
        Ok(Self { inner: DatabaseInner::Sqlite(db) })
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.inner {
            DatabaseInner::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            DatabaseInner::Postgres(_) => "postgresql",
        }
    }
}

impl From<sqlite::SqliteDb> for Database {
    fn from(db: sqlite::SqliteDb) -> Self {
        Self { inner: DatabaseInner::Sqlite(db) }
    }
}

impl Repository for Database {
    fn initialize(&self) -> RepoResult<()> {
        dispatch!(self, initialize())
    }

    fn embedding_dim(&self) -> usize {
        dispatch!(self, embedding_dim())
    }

    // ========================================================================
    // Events and bibs
    // ========================================================================

    fn add_event(&self, name: &str, enabled: bool, expiry: DateTime<Utc>) -> RepoResult<i64> {
        dispatch!(self, add_event(name, enabled, expiry))
    }

    fn get_event(&self, event_id: i64) -> RepoResult<Option<Event>> {
        dispatch!(self, get_event(event_id))
    }

    fn add_bib(&self, event_id: i64, bib: &NewBib) -> RepoResult<i64> {
        dispatch!(self, add_bib(event_id, bib))
    }

    fn event_counts(&self, event_id: i64) -> RepoResult<EventCounts> {
        dispatch!(self, event_counts(event_id))
    }

    // ========================================================================
    // Photos and detections
    // ========================================================================

    fn upsert_photo(&self, event_id: i64, path: &str, timestamp: DateTime<Utc>) -> RepoResult<i64> {
        dispatch!(self, upsert_photo(event_id, path, timestamp))
    }

    fn touch_photo(&self, photo_id: i64, timestamp: DateTime<Utc>) -> RepoResult<()> {
        dispatch!(self, touch_photo(photo_id, timestamp))
    }

    fn photo_registry(&self, event_id: i64) -> RepoResult<HashMap<String, RegistryEntry>> {
        dispatch!(self, photo_registry(event_id))
    }

    fn delete_photo(&self, photo_id: i64) -> RepoResult<()> {
        dispatch!(self, delete_photo(photo_id))
    }

    fn clear_detections(&self, photo_id: i64) -> RepoResult<()> {
        dispatch!(self, clear_detections(photo_id))
    }

    fn add_bib_detection(&self, event_id: i64, photo_id: i64, bib: &BibRead) -> RepoResult<()> {
        dispatch!(self, add_bib_detection(event_id, photo_id, bib))
    }

    fn add_face_detection(&self, event_id: i64, photo_id: i64, face: &FaceRead) -> RepoResult<()> {
        dispatch!(self, add_face_detection(event_id, photo_id, face))
    }

    fn apply_diff(&self, event_id: i64, plan: &DiffPlan) -> RepoResult<Vec<UpdateItem>> {
        dispatch!(self, apply_diff(event_id, plan))
    }

    fn commit_photo(&self, commit: &PhotoCommit) -> RepoResult<()> {
        dispatch!(self, commit_photo(commit))
    }

    // ========================================================================
    // Search and downloads
    // ========================================================================

    fn search_bib_photos(
        &self,
        event_id: i64,
        bib: &str,
        substring: bool,
        min_confidence: f32,
    ) -> RepoResult<Vec<String>> {
        dispatch!(self, search_bib_photos(event_id, bib, substring, min_confidence))
    }

    fn face_rows(&self, event_id: i64) -> RepoResult<Vec<FaceRow>> {
        dispatch!(self, face_rows(event_id))
    }

    fn native_face_search(&self, query: &FaceQuery<'_>) -> RepoResult<Option<Vec<FaceMatch>>> {
        dispatch!(self, native_face_search(query))
    }

    fn record_download(&self, bib_id: i64, files: usize, total_size: u64) -> RepoResult<()> {
        dispatch!(self, record_download(bib_id, files, total_size))
    }

    fn downloaded_bytes_since(&self, bib_id: i64, since: DateTime<Utc>) -> RepoResult<u64> {
        dispatch!(self, downloaded_bytes_since(bib_id, since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_embedding_bytes() {
        let embedding = vec![0.25f32, -1.5, 3.0];
        let bytes = embedding_to_bytes(&embedding);
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes_to_embedding(&bytes), embedding);
    }

    #[test]
    fn test_timestamps_sort_as_strings() {
        let earlier = Utc.timestamp_opt(1_700_000_000, 5).unwrap();
        let later = Utc.timestamp_opt(1_700_000_000, 500_000_000).unwrap();
        assert!(to_db_timestamp(&earlier) < to_db_timestamp(&later));
        assert_eq!(from_db_timestamp(&to_db_timestamp(&later)).unwrap(), later);
        assert!(matches!(from_db_timestamp("yesterday"), Err(RepoError::Timestamp(_))));
    }
}
