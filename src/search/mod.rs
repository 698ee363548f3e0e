//! Bib and face lookups over indexed photos.

pub mod index;

use anyhow::Context;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;

use crate::config::{Config, SimilarityMetric};
use crate::db::{FaceMatch, FaceQuery, RepoError, Repository};
use crate::extract::{self, FeatureExtractor};
use index::FlatIndex;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Query embedding has {actual} values, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Storage(#[from] RepoError),
}

/// Ranked face search results.
#[derive(Debug, Clone, Default)]
pub struct FaceMatches {
    pub matches: Vec<FaceMatch>,
    pub limit: usize,
}

impl FaceMatches {
    /// True when the result hit the limit, so more matches may exist.
    pub fn is_saturated(&self) -> bool {
        self.limit > 0 && self.matches.len() == self.limit
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.matches.iter().map(|m| m.path.as_str())
    }
}

/// Thresholds for a face query.
#[derive(Debug, Clone, Copy)]
pub struct FaceSearchParams {
    pub min_detect_confidence: f32,
    pub min_similarity: f32,
    pub limit: usize,
}

impl FaceSearchParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_detect_confidence: config.search.face_detect_confidence,
            min_similarity: config.search.face_match_confidence,
            limit: config.search.default_limit,
        }
    }
}

/// Answers queries for one or more events.
///
/// Backends without vector support are searched through a [`FlatIndex`] per
/// event, built on first use and refreshed with [`SearchService::rebuild`].
pub struct SearchService<'a, R: Repository + ?Sized> {
    repo: &'a R,
    metric: SimilarityMetric,
    indexes: HashMap<i64, FlatIndex>,
}

impl<'a, R: Repository + ?Sized> SearchService<'a, R> {
    pub fn new(repo: &'a R, metric: SimilarityMetric) -> Self {
        Self {
            repo,
            metric,
            indexes: HashMap::new(),
        }
    }

    /// Reload an event's faces from storage. Returns the number indexed.
    pub fn rebuild(&mut self, event_id: i64) -> Result<usize, SearchError> {
        let rows = self.repo.face_rows(event_id)?;
        let index = FlatIndex::build(self.metric, self.repo.embedding_dim(), rows);
        let len = index.len();
        tracing::debug!(event_id, faces = len, "Face index rebuilt");
        self.indexes.insert(event_id, index);
        Ok(len)
    }

    /// Every photo with a bib read matching `bib`. Not capped.
    pub fn search_by_bib(
        &self,
        event_id: i64,
        bib: &str,
        substring: bool,
        min_confidence: f32,
    ) -> Result<Vec<String>, SearchError> {
        let bib = bib.trim();
        if bib.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.repo.search_bib_photos(event_id, bib, substring, min_confidence)?)
    }

    pub fn search_by_face(
        &mut self,
        event_id: i64,
        query: &[f32],
        min_detect_confidence: f32,
        min_similarity: f32,
        limit: usize,
    ) -> Result<FaceMatches, SearchError> {
        let expected = self.repo.embedding_dim();
        if query.len() != expected {
            return Err(SearchError::DimensionMismatch {
                expected,
                actual: query.len(),
            });
        }
        if limit == 0 {
            return Ok(FaceMatches { matches: Vec::new(), limit });
        }

        let native = self.repo.native_face_search(&FaceQuery {
            event_id,
            embedding: query,
            metric: self.metric,
            min_confidence: min_detect_confidence,
            min_similarity,
            limit,
        })?;
        if let Some(matches) = native {
            return Ok(FaceMatches { matches, limit });
        }

        if !self.indexes.contains_key(&event_id) {
            self.rebuild(event_id)?;
        }
        let matches = self
            .indexes
            .get(&event_id)
            .map(|index| index.search(query, min_detect_confidence, min_similarity, limit))
            .unwrap_or_default();
        Ok(FaceMatches { matches, limit })
    }

    /// Union of bib and face hits, de-duplicated and sorted.
    pub fn find_photos(
        &mut self,
        event_id: i64,
        bib: Option<(&str, bool)>,
        bib_confidence: f32,
        faces: &[Vec<f32>],
        params: FaceSearchParams,
    ) -> Result<Vec<String>, SearchError> {
        let mut found = BTreeSet::new();
        if let Some((text, substring)) = bib {
            found.extend(self.search_by_bib(event_id, text, substring, bib_confidence)?);
        }
        for face in faces {
            let matches = self.search_by_face(
                event_id,
                face,
                params.min_detect_confidence,
                params.min_similarity,
                params.limit,
            )?;
            if matches.is_saturated() {
                tracing::warn!(event_id, limit = params.limit, "Face search hit its limit; results may be truncated");
            }
            found.extend(matches.matches.into_iter().map(|m| m.path));
        }
        Ok(found.into_iter().collect())
    }
}

/// Turn a query photo into an embedding: the first face at or above
/// `min_detect_confidence`, or `None` when the photo has no usable face.
pub fn face_query_from_image<E: FeatureExtractor + ?Sized>(
    extractor: &mut E,
    path: &Path,
    max_width: u32,
    min_detect_confidence: f32,
    embedding_dim: usize,
) -> anyhow::Result<Option<Vec<f32>>> {
    let image = extract::load_image(path)?;
    let image = extract::downscale(image, max_width);
    let faces = extractor
        .detect_faces(&image)
        .with_context(|| format!("Face detection failed for {}", path.display()))?;

    match faces.into_iter().find(|f| f.confidence >= min_detect_confidence) {
        Some(face) if face.embedding.len() != embedding_dim => Err(SearchError::DimensionMismatch {
            expected: embedding_dim,
            actual: face.embedding.len(),
        }
        .into()),
        Some(face) => Ok(Some(face.embedding)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::SqliteDb;
    use crate::extract::FaceRead;
    use chrono::Utc;

    fn repo() -> (SqliteDb, i64) {
        let db = SqliteDb::open_in_memory(2).unwrap();
        db.initialize().unwrap();
        let event_id = db.add_event("Trail Run", true, Utc::now()).unwrap();
        (db, event_id)
    }

    #[test]
    fn test_query_dimension_is_checked() {
        let (db, event_id) = repo();
        let mut search = SearchService::new(&db, SimilarityMetric::Cosine);
        let err = search.search_by_face(event_id, &[1.0, 0.0, 0.0], 0.0, 0.0, 10).unwrap_err();
        assert!(matches!(err, SearchError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn test_rebuild_picks_up_new_faces() {
        let (db, event_id) = repo();
        let mut search = SearchService::new(&db, SimilarityMetric::Cosine);
        assert!(search.search_by_face(event_id, &[1.0, 0.0], 0.0, 0.5, 10).unwrap().matches.is_empty());

        let photo_id = db.upsert_photo(event_id, "a.jpg", Utc::now()).unwrap();
        db.add_face_detection(event_id, photo_id, &FaceRead { embedding: vec![1.0, 0.0], confidence: 0.9 })
            .unwrap();

        // the cached index is stale until rebuilt
        assert!(search.search_by_face(event_id, &[1.0, 0.0], 0.0, 0.5, 10).unwrap().matches.is_empty());
        assert_eq!(search.rebuild(event_id).unwrap(), 1);
        let found = search.search_by_face(event_id, &[1.0, 0.0], 0.0, 0.5, 10).unwrap();
        assert_eq!(found.paths().collect::<Vec<_>>(), vec!["a.jpg"]);
    }

    #[test]
    fn test_saturation() {
        let full = FaceMatches {
            matches: vec![FaceMatch { path: "a.jpg".into(), similarity: 0.9, confidence: 0.9 }],
            limit: 1,
        };
        assert!(full.is_saturated());
        let partial = FaceMatches { limit: 2, ..full.clone() };
        assert!(!partial.is_saturated());
    }

    #[test]
    fn test_blank_bib_finds_nothing() {
        let (db, event_id) = repo();
        let search = SearchService::new(&db, SimilarityMetric::Cosine);
        assert!(search.search_by_bib(event_id, "  ", true, 0.0).unwrap().is_empty());
    }
}
