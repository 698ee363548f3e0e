//! Extraction worker loop.
//!
//! The same loop runs inside a worker process (`bibfinder worker --slot N`,
//! commands on stdin, events on stdout as JSON lines) and inside a thread
//! for in-process scans. A bad photo never ends the loop: errors and panics
//! become a failed result for that photo.

use anyhow::{Context, Result};
use std::io::{BufRead, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::config::Config;
use crate::extract::{self, BibFilter, BibRead, FaceRead, FeatureExtractor, ModelExtractor};
use crate::supervisor::{WorkItem, WorkOutcome, WorkResult, WorkerCommand, WorkerEvent};

/// Per-item settings a worker needs.
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub max_width: u32,
    pub face_confidence: f32,
    pub bib_filter: BibFilter,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_width: config.scan.max_width,
            face_confidence: config.faces.detect_confidence,
            bib_filter: BibFilter::from(&config.ocr),
        }
    }
}

fn extract_item<E: FeatureExtractor + ?Sized>(
    extractor: &mut E,
    item: &WorkItem,
    options: &WorkerOptions,
) -> Result<(Vec<BibRead>, Vec<FaceRead>)> {
    let image = extract::load_image(&item.path)?;
    let image = extract::downscale(image, options.max_width);

    let faces = extractor.detect_faces(&image).context("Face detection failed")?;
    let bibs = extractor
        .detect_bibs(&image, &item.path)
        .context("Bib recognition failed")?;

    Ok((
        options.bib_filter.apply(bibs),
        extract::filter_faces(faces, options.face_confidence),
    ))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Extract one photo. Never fails: problems are reported in the outcome.
pub fn process_item<E: FeatureExtractor + ?Sized>(
    extractor: &mut E,
    item: &WorkItem,
    options: &WorkerOptions,
) -> WorkOutcome {
    match catch_unwind(AssertUnwindSafe(|| extract_item(extractor, item, options))) {
        Ok(Ok((bibs, faces))) => {
            tracing::debug!(
                photo_id = item.id,
                bibs = bibs.len(),
                faces = faces.len(),
                "Photo extracted"
            );
            WorkOutcome::Extracted { bibs, faces }
        }
        Ok(Err(e)) => {
            tracing::warn!(photo_id = item.id, path = ?item.path, "Extraction failed: {:#}", e);
            WorkOutcome::Failed {
                reason: format!("{:#}", e),
            }
        }
        Err(payload) => {
            let reason = format!("extractor panicked: {}", panic_message(payload.as_ref()));
            tracing::error!(photo_id = item.id, path = ?item.path, "{}", reason);
            WorkOutcome::Failed { reason }
        }
    }
}

/// Serve commands until `Stop`, the end of `commands`, or `emit` reporting
/// that the supervisor is gone. Returns the number of photos handled.
pub fn run<E, I, F>(
    slot: usize,
    extractor: &mut E,
    options: &WorkerOptions,
    commands: I,
    mut emit: F,
) -> usize
where
    E: FeatureExtractor + ?Sized,
    I: IntoIterator<Item = WorkerCommand>,
    F: FnMut(WorkerEvent) -> bool,
{
    if !emit(WorkerEvent::Ready) {
        return 0;
    }

    let mut handled = 0;
    for command in commands {
        match command {
            WorkerCommand::Stop => {
                tracing::debug!(slot, handled, "Worker received stop");
                break;
            }
            WorkerCommand::Process(item) => {
                let outcome = process_item(extractor, &item, options);
                handled += 1;
                let result = WorkResult {
                    item_id: item.id,
                    slot,
                    outcome,
                };
                if !emit(WorkerEvent::Done(result)) {
                    tracing::debug!(slot, "Supervisor went away");
                    break;
                }
            }
        }
    }
    handled
}

/// Entry point of a worker process.
pub fn run_process(config: &Config, slot: usize) -> Result<()> {
    let mut extractor = ModelExtractor::from_config(config)?;
    let options = WorkerOptions::from_config(config);

    let stdin = std::io::stdin();
    let commands = stdin.lock().lines().map_while(|line| {
        let line = line.ok()?;
        match serde_json::from_str::<WorkerCommand>(&line) {
            Ok(command) => Some(command),
            Err(e) => {
                tracing::error!(slot, "Invalid command from supervisor: {}", e);
                None
            }
        }
    });

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let handled = run(slot, &mut extractor, &options, commands, |event| {
        let written = serde_json::to_writer(&mut out, &event)
            .map_err(std::io::Error::from)
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush());
        written.is_ok()
    });

    tracing::info!(slot, handled, "Worker finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    struct Scripted {
        panic_on_faces: bool,
    }

    impl FeatureExtractor for Scripted {
        fn detect_faces(&mut self, _image: &DynamicImage) -> Result<Vec<FaceRead>> {
            if self.panic_on_faces {
                panic!("model blew up");
            }
            Ok(vec![
                FaceRead { embedding: vec![1.0, 0.0], confidence: 0.99 },
                FaceRead { embedding: vec![0.0, 1.0], confidence: 0.1 },
            ])
        }

        fn detect_bibs(&mut self, _image: &DynamicImage, _source: &Path) -> Result<Vec<BibRead>> {
            Ok(vec![
                BibRead { text: "512".to_string(), confidence: 0.9 },
                BibRead { text: "START".to_string(), confidence: 0.9 },
            ])
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            max_width: 64,
            face_confidence: 0.5,
            bib_filter: BibFilter { min_size: 2, max_size: 6, min_confidence: 0.8 },
        }
    }

    fn write_photo(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        DynamicImage::new_rgb8(128, 96).save(&path).unwrap();
        path
    }

    #[test]
    fn test_results_are_filtered() {
        let dir = tempdir().unwrap();
        let item = WorkItem { id: 1, path: write_photo(dir.path(), "a.png") };

        let outcome = process_item(&mut Scripted { panic_on_faces: false }, &item, &options());
        match outcome {
            WorkOutcome::Extracted { bibs, faces } => {
                assert_eq!(bibs, vec![BibRead { text: "512".to_string(), confidence: 0.9 }]);
                assert_eq!(faces.len(), 1);
                assert_eq!(faces[0].embedding, vec![1.0, 0.0]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_bad_photos_and_panics_become_failures() {
        let dir = tempdir().unwrap();
        let missing = WorkItem { id: 1, path: dir.path().join("missing.jpg") };
        let outcome = process_item(&mut Scripted { panic_on_faces: false }, &missing, &options());
        assert!(matches!(outcome, WorkOutcome::Failed { .. }));

        let item = WorkItem { id: 2, path: write_photo(dir.path(), "b.png") };
        let outcome = process_item(&mut Scripted { panic_on_faces: true }, &item, &options());
        match outcome {
            WorkOutcome::Failed { reason } => assert!(reason.contains("model blew up")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_loop_stops_at_sentinel() {
        let dir = tempdir().unwrap();
        let a = WorkItem { id: 1, path: write_photo(dir.path(), "a.png") };
        let b = WorkItem { id: 2, path: write_photo(dir.path(), "b.png") };
        let commands = vec![
            WorkerCommand::Process(a),
            WorkerCommand::Stop,
            WorkerCommand::Process(b),
        ];

        let mut events = Vec::new();
        let handled = run(3, &mut Scripted { panic_on_faces: false }, &options(), commands, |event| {
            events.push(event);
            true
        });

        assert_eq!(handled, 1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], WorkerEvent::Ready);
        match &events[1] {
            WorkerEvent::Done(result) => {
                assert_eq!(result.item_id, 1);
                assert_eq!(result.slot, 3);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
