//! Incremental scans of an event's photos.
//!
//! A scan lists the corpus, reconciles it with the photo registry, and
//! extracts every new or changed photo through the worker pool, committing
//! each result as it arrives. A scan that could start always finishes with a
//! [`ScanSummary`]; photos it could not finish are counted as incomplete and
//! picked up again by the next run.

pub mod corpus;
pub mod diff;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::mpsc;

use crate::config::Config;
use crate::db::{EventCounts, PhotoCommit, Repository, UpdateItem};
use crate::supervisor::{
    Disposition, Supervisor, SupervisorConfig, WorkItem, WorkOutcome, WorkResult, WorkerSpawner,
};

pub use corpus::{compare, CorpusDiff, CorpusEntry, CorpusSource, LocalCorpus};
pub use diff::{plan_updates, DiffPlan};

#[derive(Debug, Clone)]
pub enum ScanProgress {
    Started { total: usize },
    Photo { photo_id: i64, committed: bool },
    Completed(ScanSummary),
}

/// In-memory state of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRun {
    pub event_id: i64,
    pub update_list: Vec<UpdateItem>,
    /// File mtime of each queued photo, keyed by photo id
    pub modified: HashMap<i64, DateTime<Utc>>,
    pub processed: usize,
    pub incomplete: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub event_id: i64,
    /// Photos in the corpus listing
    pub corpus_photos: usize,
    pub new_photos: usize,
    pub changed_photos: usize,
    pub unchanged_photos: usize,
    pub purged_photos: usize,
    /// Registered photos missing from the corpus but kept
    pub orphaned_photos: usize,
    /// Photos queued for extraction
    pub updates: usize,
    pub processed: usize,
    pub incomplete: usize,
    pub workers: usize,
    pub restarts: usize,
    /// Stored totals after the run, when they could be read
    pub counts: Option<EventCounts>,
}

impl ScanSummary {
    pub fn is_complete(&self) -> bool {
        self.incomplete == 0
    }
}

pub struct ScanOrchestrator<'a, R: Repository + ?Sized> {
    config: &'a Config,
    repo: &'a R,
    progress_tx: Option<mpsc::Sender<ScanProgress>>,
}

impl<'a, R: Repository + ?Sized> ScanOrchestrator<'a, R> {
    pub fn new(config: &'a Config, repo: &'a R) -> Self {
        Self {
            config,
            repo,
            progress_tx: None,
        }
    }

    pub fn with_progress(mut self, progress_tx: mpsc::Sender<ScanProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    fn report(&self, progress: ScanProgress) {
        if let Some(ref tx) = self.progress_tx {
            let _ = tx.send(progress);
        }
    }

    /// Compute the change plan without touching storage.
    pub fn plan(&self, event_id: i64, corpus: &dyn CorpusSource) -> Result<DiffPlan> {
        let entries = corpus.list()?;
        let registry = self.repo.photo_registry(event_id)?;
        Ok(plan_updates(
            &corpus::modification_times(&entries),
            &registry,
            self.config.scan.purge_missing,
        ))
    }

    /// Run one scan of `event_id`.
    ///
    /// Fails only before extraction starts: unknown event, unreadable corpus,
    /// storage errors while applying the change plan, or no worker starting.
    pub fn scan<S: WorkerSpawner>(
        &self,
        event_id: i64,
        corpus: &dyn CorpusSource,
        spawner: S,
    ) -> Result<ScanSummary> {
        if self.repo.get_event(event_id)?.is_none() {
            bail!("Event {} not found", event_id);
        }

        let entries = corpus.list()?;
        let modified = corpus::modification_times(&entries);
        let registry = self.repo.photo_registry(event_id)?;
        let plan = plan_updates(&modified, &registry, self.config.scan.purge_missing);
        tracing::info!(
            event_id,
            corpus = entries.len(),
            new = plan.register.len(),
            changed = plan.refresh.len(),
            purged = plan.purge.len(),
            unchanged = plan.unchanged,
            "Change plan ready"
        );

        let update_list = self.repo.apply_diff(event_id, &plan)?;
        let mut run = ScanRun {
            event_id,
            modified: update_list
                .iter()
                .filter_map(|u| modified.get(&u.path).map(|m| (u.photo_id, *m)))
                .collect(),
            update_list,
            ..Default::default()
        };
        self.report(ScanProgress::Started {
            total: run.update_list.len(),
        });

        let items: Vec<WorkItem> = run
            .update_list
            .iter()
            .map(|u| WorkItem {
                id: u.photo_id,
                path: corpus.locate(&u.path),
            })
            .collect();

        let mut supervisor = Supervisor::new(SupervisorConfig::from(&self.config.scan), spawner);
        let report = supervisor.run(items, |result| {
            let photo_id = result.item_id;
            let disposition = self.commit(event_id, result, run.modified.get(&photo_id).copied());
            self.report(ScanProgress::Photo {
                photo_id,
                committed: disposition == Disposition::Committed,
            });
            disposition
        })?;
        run.processed = report.processed;
        run.incomplete = report.incomplete;

        let counts = match self.repo.event_counts(event_id) {
            Ok(counts) => Some(counts),
            Err(e) => {
                tracing::warn!(event_id, "Could not read event totals: {}", e);
                None
            }
        };

        let summary = ScanSummary {
            event_id,
            corpus_photos: entries.len(),
            new_photos: plan.register.len(),
            changed_photos: plan.refresh.len(),
            unchanged_photos: plan.unchanged,
            purged_photos: plan.purge.len(),
            orphaned_photos: plan.orphaned,
            updates: run.update_list.len(),
            processed: run.processed,
            incomplete: run.incomplete,
            workers: report.workers,
            restarts: report.restarts,
            counts,
        };
        tracing::info!(
            event_id,
            updates = summary.updates,
            processed = summary.processed,
            incomplete = summary.incomplete,
            "Scan finished"
        );
        self.report(ScanProgress::Completed(summary.clone()));
        Ok(summary)
    }

    /// Write one worker result. The watermark only moves when everything
    /// for the photo was stored, and never lands before the file's mtime so
    /// a file stamped ahead of this clock is not stale on the next run.
    fn commit(
        &self,
        event_id: i64,
        result: WorkResult,
        modified: Option<DateTime<Utc>>,
    ) -> Disposition {
        let (bibs, faces) = match result.outcome {
            WorkOutcome::Extracted { bibs, faces } => (bibs, faces),
            WorkOutcome::Failed { reason } => {
                tracing::warn!(photo_id = result.item_id, slot = result.slot, "Extraction failed: {}", reason);
                return Disposition::Incomplete;
            }
        };

        let commit = PhotoCommit {
            event_id,
            photo_id: result.item_id,
            bibs,
            faces,
            completed_at: modified.map_or_else(Utc::now, |m| Utc::now().max(m)),
        };
        match self.repo.commit_photo(&commit) {
            Ok(()) => {
                tracing::debug!(
                    photo_id = commit.photo_id,
                    bibs = commit.bibs.len(),
                    faces = commit.faces.len(),
                    "Photo committed"
                );
                Disposition::Committed
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(photo_id = commit.photo_id, "Storage unavailable, photo left for next run: {}", e);
                Disposition::Incomplete
            }
            Err(e) => {
                tracing::error!(photo_id = commit.photo_id, "Commit rejected: {}", e);
                Disposition::Incomplete
            }
        }
    }
}
