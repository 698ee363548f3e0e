mod common;

use bibfinder::config::SimilarityMetric;
use bibfinder::search::{FaceSearchParams, SearchError, SearchService};
use common::{hours_ago, FakeExtractor, Fixture};

/// Three runners: 512 with two photos, 5120 with one, and a face that shows
/// up in a photo without a readable bib.
fn indexed_event() -> Fixture {
    let fx = Fixture::new();
    fx.photo("start/001.png", 10, hours_ago(3));
    fx.photo("start/002.png", 11, hours_ago(3));
    fx.photo("finish/003.png", 12, hours_ago(3));
    fx.photo("finish/004.png", 13, hours_ago(3));

    let extractor = FakeExtractor::new()
        .bib("001.png", "512", 0.95)
        .bib("002.png", "5120", 0.9)
        .bib("003.png", "512", 0.85)
        .face(10, &[1.0, 0.0], 0.95)
        .face(11, &[0.0, 1.0], 0.95)
        .face(12, &[0.8, 0.6], 0.95)
        .face(13, &[0.96, 0.28], 0.95)
        .face(13, &[0.0, 1.0], 0.95);
    let summary = fx.scan(&extractor);
    assert!(summary.is_complete());
    fx
}

#[test]
fn test_search_by_bib_exact_and_substring() {
    let fx = indexed_event();
    let search = SearchService::new(&fx.db, SimilarityMetric::Cosine);

    let exact = search.search_by_bib(fx.event_id, "512", false, 0.8).unwrap();
    assert_eq!(exact, vec!["finish/003.png", "start/001.png"]);

    let partial = search.search_by_bib(fx.event_id, "512", true, 0.8).unwrap();
    assert_eq!(partial, vec!["finish/003.png", "start/001.png", "start/002.png"]);

    let confident = search.search_by_bib(fx.event_id, "512", false, 0.9).unwrap();
    assert_eq!(confident, vec!["start/001.png"]);

    assert!(search.search_by_bib(fx.event_id, "999", true, 0.0).unwrap().is_empty());
}

#[test]
fn test_search_by_face_ranks_by_similarity() {
    let fx = indexed_event();
    let mut search = SearchService::new(&fx.db, SimilarityMetric::Cosine);

    let found = search.search_by_face(fx.event_id, &[1.0, 0.0], 0.9, 0.75, 10).unwrap();
    let paths: Vec<&str> = found.paths().collect();
    assert_eq!(paths, vec!["start/001.png", "finish/004.png", "finish/003.png"]);
    assert!((found.matches[1].similarity - 0.96).abs() < 1e-4);
    assert!(!found.is_saturated());

    // two faces in 004; the photo is listed once
    let found = search.search_by_face(fx.event_id, &[0.0, 1.0], 0.9, 0.9, 10).unwrap();
    let paths: Vec<&str> = found.paths().collect();
    assert_eq!(paths, vec!["finish/004.png", "start/002.png"]);
}

#[test]
fn test_face_results_are_bounded() {
    let fx = indexed_event();
    let mut search = SearchService::new(&fx.db, SimilarityMetric::Cosine);

    let found = search.search_by_face(fx.event_id, &[1.0, 0.0], 0.0, 0.0, 2).unwrap();
    assert_eq!(found.matches.len(), 2);
    assert!(found.is_saturated());
    assert_eq!(found.matches[0].path, "start/001.png");

    assert!(search.search_by_face(fx.event_id, &[1.0, 0.0], 0.0, 0.0, 0).unwrap().matches.is_empty());
}

#[test]
fn test_l2_metric_orders_like_cosine_on_unit_vectors() {
    let fx = indexed_event();
    let mut search = SearchService::new(&fx.db, SimilarityMetric::L2);

    let found = search.search_by_face(fx.event_id, &[1.0, 0.0], 0.9, 0.75, 10).unwrap();
    let paths: Vec<&str> = found.paths().collect();
    assert_eq!(paths, vec!["start/001.png", "finish/004.png", "finish/003.png"]);
}

#[test]
fn test_query_of_wrong_dimension_is_rejected() {
    let fx = indexed_event();
    let mut search = SearchService::new(&fx.db, SimilarityMetric::Cosine);
    let err = search.search_by_face(fx.event_id, &[1.0], 0.0, 0.0, 10).unwrap_err();
    assert!(matches!(err, SearchError::DimensionMismatch { expected: 2, actual: 1 }));
}

#[test]
fn test_find_photos_unions_bib_and_face_hits() {
    let fx = indexed_event();
    let mut search = SearchService::new(&fx.db, SimilarityMetric::Cosine);
    let params = FaceSearchParams {
        min_detect_confidence: 0.9,
        min_similarity: 0.99,
        limit: 10,
    };

    let found = search
        .find_photos(fx.event_id, Some(("512", false)), 0.8, &[vec![0.0, 1.0]], params)
        .unwrap();
    assert_eq!(
        found,
        vec!["finish/003.png", "finish/004.png", "start/001.png", "start/002.png"]
    );

    let bib_only = search.find_photos(fx.event_id, Some(("5120", false)), 0.8, &[], params).unwrap();
    assert_eq!(bib_only, vec!["start/002.png"]);
}
