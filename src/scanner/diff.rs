//! Incremental change detection for an event's photos.
//!
//! Compares the corpus listing against the photo registry and decides which
//! photos need (re)extraction. Planning is pure; the repository applies the
//! plan in one transaction.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::db::RegistryEntry;

/// How far before its file's mtime a newly registered photo's watermark is set.
/// Guarantees the photo is stale for this run whatever the clocks say.
pub const NEW_PHOTO_WATERMARK_OFFSET_HOURS: i64 = 24;

/// A corpus path seen for the first time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPhoto {
    pub path: String,
    pub watermark: DateTime<Utc>,
}

/// A registered photo identified by id and path.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoRef {
    pub photo_id: i64,
    pub path: String,
}

/// What a scan has to change before extraction starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffPlan {
    /// Paths to register; each one is queued for extraction.
    pub register: Vec<NewPhoto>,
    /// Photos whose file is newer than the watermark: detections are cleared
    /// and the photo is queued.
    pub refresh: Vec<PhotoRef>,
    /// Registered photos missing from the corpus, deleted with their detections.
    /// Empty unless purging is enabled.
    pub purge: Vec<PhotoRef>,
    /// Registered photos missing from the corpus and left alone.
    pub orphaned: usize,
    pub unchanged: usize,
}

impl DiffPlan {
    pub fn update_count(&self) -> usize {
        self.register.len() + self.refresh.len()
    }

    pub fn is_noop(&self) -> bool {
        self.register.is_empty() && self.refresh.is_empty() && self.purge.is_empty()
    }
}

/// Decide what to do with every path in `corpus` (path -> file mtime) given
/// the persisted `registry`.
pub fn plan_updates(
    corpus: &HashMap<String, DateTime<Utc>>,
    registry: &HashMap<String, RegistryEntry>,
    purge_missing: bool,
) -> DiffPlan {
    let mut plan = DiffPlan::default();

    for (path, modified) in corpus {
        match registry.get(path) {
            None => plan.register.push(NewPhoto {
                path: path.clone(),
                watermark: *modified - Duration::hours(NEW_PHOTO_WATERMARK_OFFSET_HOURS),
            }),
            Some(entry) if entry.last_updated < *modified => plan.refresh.push(PhotoRef {
                photo_id: entry.id,
                path: path.clone(),
            }),
            Some(_) => plan.unchanged += 1,
        }
    }

    for (path, entry) in registry {
        if corpus.contains_key(path) {
            continue;
        }
        if purge_missing {
            plan.purge.push(PhotoRef {
                photo_id: entry.id,
                path: path.clone(),
            });
        } else {
            plan.orphaned += 1;
        }
    }

    plan.register.sort_by(|a, b| a.path.cmp(&b.path));
    plan.refresh.sort_by(|a, b| a.path.cmp(&b.path));
    plan.purge.sort_by(|a, b| a.path.cmp(&b.path));
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn registered(id: i64, last_updated: DateTime<Utc>) -> RegistryEntry {
        RegistryEntry { id, last_updated }
    }

    #[test]
    fn test_new_paths_get_stale_watermark() {
        let corpus = HashMap::from([("b.jpg".to_string(), at(100)), ("a.jpg".to_string(), at(50))]);
        let plan = plan_updates(&corpus, &HashMap::new(), false);

        assert_eq!(plan.register.len(), 2);
        assert_eq!(plan.register[0].path, "a.jpg");
        assert_eq!(plan.register[0].watermark, at(50) - Duration::hours(24));
        assert_eq!(plan.update_count(), 2);
    }

    #[test]
    fn test_changed_and_current_photos() {
        let corpus = HashMap::from([
            ("changed.jpg".to_string(), at(200)),
            ("current.jpg".to_string(), at(100)),
            ("same_instant.jpg".to_string(), at(100)),
        ]);
        let registry = HashMap::from([
            ("changed.jpg".to_string(), registered(1, at(150))),
            ("current.jpg".to_string(), registered(2, at(300))),
            ("same_instant.jpg".to_string(), registered(3, at(100))),
        ]);

        let plan = plan_updates(&corpus, &registry, false);
        assert!(plan.register.is_empty());
        assert_eq!(
            plan.refresh,
            vec![PhotoRef { photo_id: 1, path: "changed.jpg".to_string() }]
        );
        assert_eq!(plan.unchanged, 2);
    }

    #[test]
    fn test_missing_photos_respect_purge_flag() {
        let corpus = HashMap::new();
        let registry = HashMap::from([("gone.jpg".to_string(), registered(7, at(0)))]);

        let kept = plan_updates(&corpus, &registry, false);
        assert!(kept.purge.is_empty());
        assert_eq!(kept.orphaned, 1);
        assert!(kept.is_noop());

        let purged = plan_updates(&corpus, &registry, true);
        assert_eq!(purged.purge, vec![PhotoRef { photo_id: 7, path: "gone.jpg".to_string() }]);
        assert_eq!(purged.update_count(), 0);
    }
}
