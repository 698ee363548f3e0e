//! Corpus sources: where an event's photos come from.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One file in a corpus listing. `id` is stable across listings; for local
/// corpora it is the `/`-separated path relative to the corpus root.
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
}

pub trait CorpusSource {
    /// Every photo in the corpus. A listing that could not see everything
    /// must fail rather than come back short: missing entries read as
    /// deleted photos.
    fn list(&self) -> Result<Vec<CorpusEntry>>;

    /// Local file a worker should read for `id`.
    fn locate(&self, id: &str) -> PathBuf;
}

/// Photos stored under a directory tree.
#[derive(Debug, Clone)]
pub struct LocalCorpus {
    root: PathBuf,
    extensions: Vec<String>,
}

impl LocalCorpus {
    pub fn new(root: impl Into<PathBuf>, extensions: &[String]) -> Self {
        Self {
            root: root.into(),
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_image(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| self.extensions.iter().any(|e| *e == ext))
    }
}

impl CorpusSource for LocalCorpus {
    fn list(&self) -> Result<Vec<CorpusEntry>> {
        if !self.root.is_dir() {
            anyhow::bail!("Photo directory not found: {}", self.root.display());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.with_context(|| format!("Failed to list {}", self.root.display()))?;
            let path = entry.path();
            if !entry.file_type().is_file() || !self.is_image(path) {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", path.display()))?;
            let modified: DateTime<Utc> = metadata
                .modified()
                .with_context(|| format!("No modification time for {}", path.display()))?
                .into();

            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let id = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            entries.push(CorpusEntry {
                id,
                name: entry.file_name().to_string_lossy().to_string(),
                size: metadata.len(),
                modified_time: modified,
            });
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    fn locate(&self, id: &str) -> PathBuf {
        id.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }
}

/// `{id: modified_time}` view of a listing, the shape change detection uses.
pub fn modification_times(entries: &[CorpusEntry]) -> HashMap<String, DateTime<Utc>> {
    entries
        .iter()
        .map(|e| (e.id.clone(), e.modified_time))
        .collect()
}

/// Three-way difference between two listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorpusDiff {
    pub only_in_a: Vec<CorpusEntry>,
    /// Entries present in both with a different size or mtime, as seen in `b`.
    pub changed: Vec<CorpusEntry>,
    pub only_in_b: Vec<CorpusEntry>,
}

impl CorpusDiff {
    pub fn is_empty(&self) -> bool {
        self.only_in_a.is_empty() && self.changed.is_empty() && self.only_in_b.is_empty()
    }
}

/// Compare two listings keyed by entry id.
pub fn compare(a: &[CorpusEntry], b: &[CorpusEntry]) -> CorpusDiff {
    let a_by_id: HashMap<&str, &CorpusEntry> = a.iter().map(|e| (e.id.as_str(), e)).collect();
    let b_by_id: HashMap<&str, &CorpusEntry> = b.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut diff = CorpusDiff::default();
    for entry in a {
        if !b_by_id.contains_key(entry.id.as_str()) {
            diff.only_in_a.push(entry.clone());
        }
    }
    for entry in b {
        match a_by_id.get(entry.id.as_str()) {
            None => diff.only_in_b.push(entry.clone()),
            Some(old) if old.size != entry.size || old.modified_time != entry.modified_time => {
                diff.changed.push(entry.clone())
            }
            Some(_) => {}
        }
    }

    diff.only_in_a.sort_by(|x, y| x.id.cmp(&y.id));
    diff.changed.sort_by(|x, y| x.id.cmp(&y.id));
    diff.only_in_b.sort_by(|x, y| x.id.cmp(&y.id));
    diff
}
