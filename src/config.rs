use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub photos: PhotosConfig,

    #[serde(default)]
    pub scan: ScanConfig,

    #[serde(default)]
    pub faces: FacesConfig,

    #[serde(default)]
    pub ocr: OcrConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgresql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseType,

    #[serde(default = "default_db_path")]
    pub sqlite_path: PathBuf,

    /// e.g. "host=localhost user=postgres dbname=bibfinder"
    #[serde(default)]
    pub postgresql_url: Option<String>,

    #[serde(default)]
    pub pool_size: Option<u32>,
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bibfinder")
        .join("bibfinder.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseType::default(),
            sqlite_path: default_db_path(),
            postgresql_url: None,
            pool_size: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotosConfig {
    /// Event photos live under `<root>/<event_id>/raw`.
    #[serde(default = "default_photo_root")]
    pub root: PathBuf,

    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
}

fn default_photo_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("bibfinder/photos")
}

fn default_image_extensions() -> Vec<String> {
    vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()]
}

impl Default for PhotosConfig {
    fn default() -> Self {
        Self {
            root: default_photo_root(),
            image_extensions: default_image_extensions(),
        }
    }
}

impl PhotosConfig {
    pub fn event_dir(&self, event_id: i64) -> PathBuf {
        self.root.join(event_id.to_string()).join("raw")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// A worker silent for longer than this is killed and replaced.
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,

    /// Extra time granted to a freshly started worker (model loading).
    #[serde(default = "default_master_wait_for_secs")]
    pub master_wait_for_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    #[serde(default = "default_max_worker_restarts")]
    pub max_worker_restarts: usize,

    /// Delete photos (and their detections) whose file left the corpus.
    #[serde(default)]
    pub purge_missing: bool,

    #[serde(default = "default_max_width")]
    pub max_width: u32,
}

fn default_workers() -> usize {
    4
}

fn default_sync_timeout_secs() -> u64 {
    60
}

fn default_master_wait_for_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_max_worker_restarts() -> usize {
    16
}

fn default_max_width() -> u32 {
    2000
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            sync_timeout_secs: default_sync_timeout_secs(),
            master_wait_for_secs: default_master_wait_for_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_worker_restarts: default_max_worker_restarts(),
            purge_missing: false,
            max_width: default_max_width(),
        }
    }
}

impl ScanConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn master_wait_for(&self) -> Duration {
        Duration::from_secs(self.master_wait_for_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacesConfig {
    /// UltraFace ONNX model; downloaded into the data dir when unset.
    #[serde(default)]
    pub detection_model: Option<PathBuf>,

    /// ArcFace ONNX model; downloaded into the data dir when unset.
    #[serde(default)]
    pub embedding_model: Option<PathBuf>,

    #[serde(default = "default_detect_confidence")]
    pub detect_confidence: f32,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_detect_confidence() -> f32 {
    0.7
}

fn default_embedding_dim() -> usize {
    512
}

fn default_intra_threads() -> usize {
    1
}

impl Default for FacesConfig {
    fn default() -> Self {
        Self {
            detection_model: None,
            embedding_model: None,
            detect_confidence: default_detect_confidence(),
            embedding_dim: default_embedding_dim(),
            intra_threads: default_intra_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// External OCR program. It receives the image path as its last
    /// argument and prints one JSON object `{"text", "confidence"}` per line.
    /// Bib extraction is disabled when unset.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_ocr_min_size")]
    pub min_size: usize,

    #[serde(default = "default_ocr_max_size")]
    pub max_size: usize,

    #[serde(default = "default_ocr_confidence")]
    pub confidence: f32,
}

fn default_ocr_min_size() -> usize {
    2
}

fn default_ocr_max_size() -> usize {
    6
}

fn default_ocr_confidence() -> f32 {
    0.8
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            min_size: default_ocr_min_size(),
            max_size: default_ocr_max_size(),
            confidence: default_ocr_confidence(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    L2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub similarity_metric: SimilarityMetric,

    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    #[serde(default = "default_face_match_confidence")]
    pub face_match_confidence: f32,

    #[serde(default = "default_face_detect_confidence")]
    pub face_detect_confidence: f32,

    #[serde(default = "default_bib_confidence")]
    pub bib_confidence: f32,

    /// Query photos are downscaled to this width before face extraction.
    #[serde(default = "default_query_max_width")]
    pub query_max_width: u32,
}

fn default_search_limit() -> usize {
    100
}

fn default_face_match_confidence() -> f32 {
    0.6
}

fn default_face_detect_confidence() -> f32 {
    0.9
}

fn default_bib_confidence() -> f32 {
    0.8
}

fn default_query_max_width() -> u32 {
    800
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            similarity_metric: SimilarityMetric::default(),
            default_limit: default_search_limit(),
            face_match_confidence: default_face_match_confidence(),
            face_detect_confidence: default_face_detect_confidence(),
            bib_confidence: default_bib_confidence(),
            query_max_width: default_query_max_width(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Reject settings the scan or search core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.faces.embedding_dim == 0 {
            bail!("faces.embedding_dim must be greater than zero");
        }
        if self.scan.workers == 0 {
            bail!("scan.workers must be at least 1");
        }
        if self.scan.sync_timeout_secs == 0 {
            bail!("scan.sync_timeout_secs must be at least 1");
        }
        if self.scan.poll_interval_ms == 0 || self.scan.poll_interval_ms > 1000 {
            bail!("scan.poll_interval_ms must be between 1 and 1000");
        }
        if self.ocr.min_size > self.ocr.max_size {
            bail!("ocr.min_size must not exceed ocr.max_size");
        }
        if self.search.default_limit == 0 {
            bail!("search.default_limit must be at least 1");
        }
        if self.database.backend == DatabaseType::Postgresql
            && self.database.postgresql_url.is_none()
        {
            bail!("database.postgresql_url is required for the postgresql backend");
        }
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("BIBFINDER_CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bibfinder")
            .join("config.toml")
    }

    pub fn log_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bibfinder")
            .join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [scan]
            workers = 2
            purge_missing = true

            [search]
            similarity_metric = "l2"
            "#,
        )
        .unwrap();

        assert_eq!(config.scan.workers, 2);
        assert!(config.scan.purge_missing);
        assert_eq!(config.scan.sync_timeout_secs, 60);
        assert_eq!(config.faces.embedding_dim, 512);
        assert_eq!(config.search.similarity_metric, SimilarityMetric::L2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.faces.embedding_dim = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.scan.poll_interval_ms = 5000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.database.backend = DatabaseType::Postgresql;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_event_dir() {
        let photos = PhotosConfig {
            root: PathBuf::from("/data"),
            image_extensions: default_image_extensions(),
        };
        assert_eq!(photos.event_dir(7), PathBuf::from("/data/7/raw"));
    }
}
