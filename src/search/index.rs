//! Flat nearest-neighbour index over an event's face embeddings.
//!
//! Rebuilt from storage before a session of queries; scoring is a parallel
//! brute-force scan, which is plenty for the few hundred thousand faces of a
//! large event.

use rayon::prelude::*;
use std::collections::HashMap;

use crate::config::SimilarityMetric;
use crate::db::{FaceMatch, FaceRow};

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// `1 - normalized distance` between two vectors already prepared for `metric`.
///
/// Cosine: the cosine of the angle (vectors are unit length). L2: `1 - d²/2`,
/// which equals the cosine for unit vectors and keeps the same scale for
/// unnormalized ones.
pub fn similarity(metric: SimilarityMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        SimilarityMetric::Cosine => dot(a, b),
        SimilarityMetric::L2 => 1.0 - squared_distance(a, b) / 2.0,
    }
}

#[derive(Debug, Clone)]
struct IndexedFace {
    path: String,
    confidence: f32,
}

#[derive(Debug, Clone)]
pub struct FlatIndex {
    metric: SimilarityMetric,
    dim: usize,
    vectors: Vec<f32>,
    faces: Vec<IndexedFace>,
}

impl FlatIndex {
    pub fn new(metric: SimilarityMetric, dim: usize) -> Self {
        Self {
            metric,
            dim,
            vectors: Vec::new(),
            faces: Vec::new(),
        }
    }

    pub fn build(metric: SimilarityMetric, dim: usize, rows: Vec<FaceRow>) -> Self {
        let mut index = Self::new(metric, dim);
        for row in rows {
            index.add(row);
        }
        index
    }

    /// Add one face. Rows of the wrong length are skipped; storage never
    /// accepts them, so one here means the store was written by other means.
    pub fn add(&mut self, row: FaceRow) -> bool {
        if row.embedding.len() != self.dim {
            tracing::warn!(
                path = %row.path,
                expected = self.dim,
                actual = row.embedding.len(),
                "Skipping stored face with wrong dimension"
            );
            return false;
        }

        let mut embedding = row.embedding;
        if self.metric == SimilarityMetric::Cosine {
            l2_normalize(&mut embedding);
        }
        self.vectors.extend_from_slice(&embedding);
        self.faces.push(IndexedFace {
            path: row.path,
            confidence: row.confidence,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    /// Best match per photo, filtered on both thresholds, ordered by
    /// similarity then path, at most `limit` entries.
    ///
    /// The caller checks `query.len() == self.dimension()`.
    pub fn search(
        &self,
        query: &[f32],
        min_confidence: f32,
        min_similarity: f32,
        limit: usize,
    ) -> Vec<FaceMatch> {
        let mut query = query.to_vec();
        if self.metric == SimilarityMetric::Cosine {
            l2_normalize(&mut query);
        }

        let hits: Vec<(usize, f32)> = self
            .vectors
            .par_chunks(self.dim.max(1))
            .enumerate()
            .filter(|(i, _)| self.faces[*i].confidence >= min_confidence)
            .map(|(i, vector)| (i, similarity(self.metric, vector, &query)))
            .filter(|(_, sim)| *sim >= min_similarity)
            .collect();

        let mut best: HashMap<&str, FaceMatch> = HashMap::new();
        for (i, sim) in hits {
            let face = &self.faces[i];
            let candidate = FaceMatch {
                path: face.path.clone(),
                similarity: sim,
                confidence: face.confidence,
            };
            best.entry(face.path.as_str())
                .and_modify(|current| {
                    if (sim, face.confidence) > (current.similarity, current.confidence) {
                        *current = candidate.clone();
                    }
                })
                .or_insert(candidate);
        }

        let mut matches: Vec<FaceMatch> = best.into_values().collect();
        matches.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.path.cmp(&b.path))
        });
        matches.truncate(limit);
        matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(path: &str, embedding: Vec<f32>, confidence: f32) -> FaceRow {
        FaceRow {
            path: path.to_string(),
            embedding,
            confidence,
        }
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_ignores_magnitude() {
        let index = FlatIndex::build(
            SimilarityMetric::Cosine,
            2,
            vec![row("near.jpg", vec![10.0, 0.1], 0.9), row("far.jpg", vec![0.0, 5.0], 0.9)],
        );
        let matches = index.search(&[1.0, 0.0], 0.0, -1.0, 10);
        assert_eq!(matches[0].path, "near.jpg");
        assert!(matches[0].similarity > 0.99);
        assert!(matches[1].similarity.abs() < 1e-6);
    }

    #[test]
    fn test_l2_similarity() {
        let index = FlatIndex::build(
            SimilarityMetric::L2,
            2,
            vec![row("same.jpg", vec![1.0, 0.0], 0.9), row("orthogonal.jpg", vec![0.0, 1.0], 0.9)],
        );
        let matches = index.search(&[1.0, 0.0], 0.0, -10.0, 10);
        assert_eq!(matches[0].path, "same.jpg");
        assert!((matches[0].similarity - 1.0).abs() < 1e-6);
        // unit vectors at 90 degrees: d² = 2
        assert!(matches[1].similarity.abs() < 1e-6);
    }

    #[test]
    fn test_thresholds_dedup_and_order() {
        let index = FlatIndex::build(
            SimilarityMetric::Cosine,
            2,
            vec![
                row("b.jpg", vec![1.0, 0.0], 0.95),
                row("a.jpg", vec![1.0, 0.0], 0.95),
                row("a.jpg", vec![0.8, 0.6], 0.99),
                row("blurry.jpg", vec![1.0, 0.0], 0.2),
                row("other.jpg", vec![0.0, 1.0], 0.95),
            ],
        );

        let matches = index.search(&[1.0, 0.0], 0.5, 0.5, 10);
        let paths: Vec<&str> = matches.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(paths, vec!["a.jpg", "b.jpg"]);
        // a.jpg keeps its best face, not its most confident one
        assert!((matches[0].similarity - 1.0).abs() < 1e-6);
        assert!((matches[0].confidence - 0.95).abs() < 1e-6);

        assert_eq!(index.search(&[1.0, 0.0], 0.5, 0.5, 1).len(), 1);
    }

    #[test]
    fn test_wrong_dimension_rows_are_skipped() {
        let mut index = FlatIndex::new(SimilarityMetric::Cosine, 3);
        assert!(!index.add(row("bad.jpg", vec![1.0, 0.0], 0.9)));
        assert!(index.add(row("good.jpg", vec![1.0, 0.0, 0.0], 0.9)));
        assert_eq!(index.len(), 1);
    }
}
