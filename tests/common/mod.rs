#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use image::DynamicImage;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::TempDir;

use bibfinder::config::Config;
use bibfinder::db::sqlite::SqliteDb;
use bibfinder::db::Repository;
use bibfinder::extract::{BibRead, FaceRead, FeatureExtractor};
use bibfinder::scanner::{CorpusSource, LocalCorpus, ScanOrchestrator, ScanSummary};
use bibfinder::supervisor::ThreadSpawner;
use bibfinder::worker::WorkerOptions;

pub const DIM: usize = 2;

/// Extractor driven by a script. Faces are keyed by image width because
/// face detection only sees pixels; bibs are keyed by file name.
#[derive(Clone, Default)]
pub struct FakeExtractor {
    faces: HashMap<u32, Vec<FaceRead>>,
    bibs: HashMap<String, Vec<BibRead>>,
    hang_on: Option<String>,
    panic_on: Option<String>,
    pub hanging: Arc<AtomicBool>,
    pub calls: Arc<AtomicUsize>,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn face(mut self, width: u32, embedding: &[f32], confidence: f32) -> Self {
        self.faces.entry(width).or_default().push(FaceRead {
            embedding: embedding.to_vec(),
            confidence,
        });
        self
    }

    pub fn bib(mut self, name: &str, text: &str, confidence: f32) -> Self {
        self.bibs.entry(name.to_string()).or_default().push(BibRead {
            text: text.to_string(),
            confidence,
        });
        self
    }

    /// Sleep on `name` while [`FakeExtractor::hanging`] is set.
    pub fn hang_on(mut self, name: &str) -> Self {
        self.hang_on = Some(name.to_string());
        self.hanging.store(true, Ordering::SeqCst);
        self
    }

    pub fn panic_on(mut self, name: &str) -> Self {
        self.panic_on = Some(name.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeatureExtractor for FakeExtractor {
    fn detect_faces(&mut self, image: &DynamicImage) -> Result<Vec<FaceRead>> {
        Ok(self.faces.get(&image.width()).cloned().unwrap_or_default())
    }

    fn detect_bibs(&mut self, _image: &DynamicImage, source: &Path) -> Result<Vec<BibRead>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if self.hang_on.as_deref() == Some(name.as_str()) && self.hanging.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_secs(4));
        }
        if self.panic_on.as_deref() == Some(name.as_str()) {
            panic!("cannot read {}", name);
        }
        Ok(self.bibs.get(&name).cloned().unwrap_or_default())
    }
}

/// A scratch event: config, SQLite file and photo directory.
pub struct Fixture {
    pub dir: TempDir,
    pub config: Config,
    pub db: SqliteDb,
    pub event_id: i64,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.photos.root = dir.path().join("photos");
        config.database.sqlite_path = dir.path().join("index.db");
        config.faces.embedding_dim = DIM;
        config.scan.workers = 2;
        config.scan.sync_timeout_secs = 1;
        config.scan.master_wait_for_secs = 0;
        config.scan.poll_interval_ms = 20;
        config.scan.shutdown_grace_secs = 1;
        config.scan.max_worker_restarts = 4;
        config.validate().unwrap();

        let db = SqliteDb::open(&config.database.sqlite_path, DIM).unwrap();
        db.initialize().unwrap();
        let event_id = db
            .add_event("City Marathon", true, Utc::now() + Duration::days(30))
            .unwrap();
        std::fs::create_dir_all(config.photos.event_dir(event_id)).unwrap();

        Self { dir, config, db, event_id }
    }

    pub fn event_dir(&self) -> PathBuf {
        self.config.photos.event_dir(self.event_id)
    }

    /// Write a `width`x8 PNG with the given mtime.
    pub fn photo(&self, name: &str, width: u32, modified: DateTime<Utc>) -> PathBuf {
        let path = self.event_dir().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        DynamicImage::new_rgb8(width, 8).save(&path).unwrap();
        self.touch(name, modified);
        path
    }

    pub fn touch(&self, name: &str, modified: DateTime<Utc>) {
        let file = File::options().write(true).open(self.event_dir().join(name)).unwrap();
        file.set_modified(SystemTime::from(modified)).unwrap();
    }

    pub fn corpus(&self) -> LocalCorpus {
        LocalCorpus::new(self.event_dir(), &self.config.photos.image_extensions)
    }

    pub fn spawner(&self, extractor: &FakeExtractor) -> ThreadSpawner {
        let extractor = extractor.clone();
        ThreadSpawner::new(WorkerOptions::from_config(&self.config), move |_slot| {
            Ok(Box::new(extractor.clone()) as Box<dyn FeatureExtractor + Send>)
        })
    }

    pub fn scan_from(&self, corpus: &dyn CorpusSource, extractor: &FakeExtractor) -> Result<ScanSummary> {
        ScanOrchestrator::new(&self.config, &self.db).scan(self.event_id, corpus, self.spawner(extractor))
    }

    pub fn scan(&self, extractor: &FakeExtractor) -> ScanSummary {
        self.scan_from(&self.corpus(), extractor).unwrap()
    }
}

pub fn hours_ago(hours: i64) -> DateTime<Utc> {
    Utc::now() - Duration::hours(hours)
}
