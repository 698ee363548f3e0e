use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use std::path::PathBuf;
use std::sync::mpsc;

use bibfinder::config::Config;
use bibfinder::db::{Database, NewBib, Repository};
use bibfinder::extract::{FeatureExtractor, ModelExtractor};
use bibfinder::logging;
use bibfinder::scanner::{self, CorpusSource, LocalCorpus, ScanOrchestrator, ScanProgress, ScanSummary};
use bibfinder::search::{self, FaceSearchParams, SearchService};
use bibfinder::supervisor::{ProcessSpawner, ThreadSpawner};
use bibfinder::worker::{self, WorkerOptions};

const DEFAULT_EXPIRY_DAYS: i64 = 30;

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Init,
    AddEvent { name: String, expiry_days: i64 },
    AddBib { event: i64, bib: String, name: Option<String>, code: Option<String>, expiry_days: i64 },
    Scan { event: i64, in_process: bool },
    Compare { event: i64, against: Option<PathBuf> },
    SearchBib { event: i64, bib: String, substring: bool },
    SearchFace { event: i64, photo: PathBuf, limit: Option<usize> },
    Find { event: i64, bib: Option<String>, substring: bool, photos: Vec<PathBuf> },
    Stats { event: i64 },
    Worker { slot: usize },
}

#[derive(Debug)]
struct CliArgs {
    config_path: Option<PathBuf>,
    command: Command,
}

/// Flags after the subcommand. Anything starting with `--` takes a value
/// unless it is a known switch.
#[derive(Debug, Default)]
struct Flags {
    values: Vec<(String, String)>,
    switches: Vec<String>,
    positionals: Vec<String>,
}

const SWITCHES: &[&str] = &["--in-process", "--substring"];

impl Flags {
    fn parse(args: &[String]) -> Result<Self, String> {
        let mut flags = Flags::default();
        let mut i = 0;
        while i < args.len() {
            let arg = &args[i];
            if SWITCHES.contains(&arg.as_str()) {
                flags.switches.push(arg.clone());
            } else if arg.starts_with("--") {
                let value = args
                    .get(i + 1)
                    .ok_or_else(|| format!("{} requires a value", arg))?;
                flags.values.push((arg.clone(), value.clone()));
                i += 1;
            } else {
                flags.positionals.push(arg.clone());
            }
            i += 1;
        }
        Ok(flags)
    }

    fn value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    fn all(&self, name: &str) -> Vec<&str> {
        self.values
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn switch(&self, name: &str) -> bool {
        self.switches.iter().any(|s| s == name)
    }

    fn number<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, String> {
        match self.value(name) {
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| format!("{} expects a number, got '{}'", name, v)),
            None => Ok(None),
        }
    }

    fn event(&self) -> Result<i64, String> {
        self.number("--event")?
            .ok_or_else(|| "--event is required".to_string())
    }

    fn positional(&self, what: &str) -> Result<String, String> {
        self.positionals
            .first()
            .cloned()
            .ok_or_else(|| format!("missing {}", what))
    }
}

fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut config_path = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return Ok(CliArgs { config_path, command: Command::Help }),
            "--version" | "-V" => return Ok(CliArgs { config_path, command: Command::Version }),
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                } else {
                    return Err("--config requires a path argument".to_string());
                }
            }
            _ => break,
        }
        i += 1;
    }

    let name = args.get(i).ok_or_else(|| "missing command".to_string())?;
    let flags = Flags::parse(&args[i + 1..])?;
    let expiry_days = flags.number("--expiry-days")?.unwrap_or(DEFAULT_EXPIRY_DAYS);

    let command = match name.as_str() {
        "init" => Command::Init,
        "add-event" => Command::AddEvent {
            name: flags.positional("event name")?,
            expiry_days,
        },
        "add-bib" => Command::AddBib {
            event: flags.event()?,
            bib: flags.positional("bib number")?,
            name: flags.value("--name").map(String::from),
            code: flags.value("--code").map(String::from),
            expiry_days,
        },
        "scan" => Command::Scan {
            event: flags.event()?,
            in_process: flags.switch("--in-process"),
        },
        "compare" => Command::Compare {
            event: flags.event()?,
            against: flags.value("--against").map(PathBuf::from),
        },
        "search-bib" => Command::SearchBib {
            event: flags.event()?,
            bib: flags.positional("bib number")?,
            substring: flags.switch("--substring"),
        },
        "search-face" => Command::SearchFace {
            event: flags.event()?,
            photo: PathBuf::from(flags.positional("query photo")?),
            limit: flags.number("--limit")?,
        },
        "find" => {
            let photos: Vec<PathBuf> = flags.all("--photo").into_iter().map(PathBuf::from).collect();
            let bib = flags.value("--bib").map(String::from);
            if bib.is_none() && photos.is_empty() {
                return Err("find needs --bib or at least one --photo".to_string());
            }
            Command::Find {
                event: flags.event()?,
                bib,
                substring: flags.switch("--substring"),
                photos,
            }
        }
        "stats" => Command::Stats { event: flags.event()? },
        "worker" => Command::Worker {
            slot: flags
                .number("--slot")?
                .ok_or_else(|| "--slot is required".to_string())?,
        },
        other => return Err(format!("Unknown command: {}", other)),
    };

    Ok(CliArgs { config_path, command })
}

fn print_help() {
    println!(
        r#"bibfinder - Find event photos by bib number and face

USAGE:
    bibfinder [OPTIONS] <COMMAND> [ARGS]

OPTIONS:
    --config, -c PATH   Path to config file
    --version, -V       Show version
    --help, -h          Show this help message

COMMANDS:
    init                                     Create database tables
    add-event NAME [--expiry-days N]         Register an event
    add-bib --event ID NUMBER [--name NAME] [--code CODE] [--expiry-days N]
                                             Enroll a runner
    scan --event ID [--in-process]           Index new and changed photos
    compare --event ID [--against DIR]       Show what the next scan would do,
                                             or diff the photos against DIR
    search-bib --event ID NUMBER [--substring]
    search-face --event ID PHOTO [--limit N]
    find --event ID [--bib NUMBER [--substring]] [--photo PATH]...
    stats --event ID                         Stored totals for an event

ENVIRONMENT:
    BIBFINDER_CONFIG    Path to config file (overrides default location)
    BIBFINDER_LOG       Log level (trace, debug, info, warn, error)

Event photos are read from <photos.root>/<event id>/raw.
Config file location: $XDG_CONFIG_HOME/bibfinder/config.toml"#
    );
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("bibfinder {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let prefix = match cli.command {
        Command::Worker { slot } => format!("worker-{}", slot),
        Command::Scan { .. } | Command::Compare { .. } => "scan".to_string(),
        Command::SearchBib { .. } | Command::SearchFace { .. } | Command::Find { .. } => {
            "search".to_string()
        }
        _ => "admin".to_string(),
    };
    if let Err(e) = logging::init(&prefix, None) {
        eprintln!("Warning: logging unavailable: {:#}", e);
    }

    let config = match cli.config_path {
        Some(ref path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Command::Worker { slot } = cli.command {
        return worker::run_process(&config, slot);
    }

    let db = Database::open(&config.database, config.faces.embedding_dim)?;
    tracing::debug!(backend = db.backend_name(), "Database opened");

    match cli.command {
        Command::Init => {
            db.initialize()?;
            println!("Initialized {} database", db.backend_name());
        }
        Command::AddEvent { name, expiry_days } => {
            db.initialize()?;
            let id = db.add_event(&name, true, Utc::now() + Duration::days(expiry_days))?;
            println!("Event {} created: {}", id, name);
        }
        Command::AddBib { event, bib, name, code, expiry_days } => {
            let id = db.add_bib(
                event,
                &NewBib {
                    bib_number: bib.clone(),
                    enabled: true,
                    expiry: Utc::now() + Duration::days(expiry_days),
                    name,
                    code,
                },
            )?;
            println!("Bib {} enrolled in event {} (id {})", bib, event, id);
        }
        Command::Scan { event, in_process } => {
            db.initialize()?;
            let summary = run_scan(&config, cli.config_path, &db, event, in_process)?;
            print_summary(&summary);
        }
        Command::Compare { event, against } => compare(&config, &db, event, against)?,
        Command::SearchBib { event, bib, substring } => {
            let search = SearchService::new(&db, config.search.similarity_metric);
            for path in search.search_by_bib(event, &bib, substring, config.search.bib_confidence)? {
                println!("{}", path);
            }
        }
        Command::SearchFace { event, photo, limit } => {
            let mut extractor = ModelExtractor::from_config(&config)?;
            let Some(query) = query_embedding(&config, &mut extractor, &photo)? else {
                println!("No face found in {}", photo.display());
                return Ok(());
            };
            let params = FaceSearchParams::from_config(&config);
            let mut search = SearchService::new(&db, config.search.similarity_metric);
            let found = search.search_by_face(
                event,
                &query,
                params.min_detect_confidence,
                params.min_similarity,
                limit.unwrap_or(params.limit),
            )?;
            for m in &found.matches {
                println!("{:.3}  {:.3}  {}", m.similarity, m.confidence, m.path);
            }
            if found.is_saturated() {
                println!("(limit of {} reached; more matches may exist)", found.limit);
            }
        }
        Command::Find { event, bib, substring, photos } => {
            let mut queries = Vec::new();
            if !photos.is_empty() {
                let mut extractor = ModelExtractor::from_config(&config)?;
                for photo in &photos {
                    match query_embedding(&config, &mut extractor, photo)? {
                        Some(query) => queries.push(query),
                        None => eprintln!("No face found in {}", photo.display()),
                    }
                }
            }
            let mut search = SearchService::new(&db, config.search.similarity_metric);
            let found = search.find_photos(
                event,
                bib.as_deref().map(|b| (b, substring)),
                config.search.bib_confidence,
                &queries,
                FaceSearchParams::from_config(&config),
            )?;
            for path in found {
                println!("{}", path);
            }
        }
        Command::Stats { event } => {
            let info = db
                .get_event(event)?
                .with_context(|| format!("Event {} not found", event))?;
            let counts = db.event_counts(event)?;
            println!("Event {}: {}", info.id, info.name);
            println!("  enabled:        {}", info.enabled);
            println!("  expires:        {}", info.expiry.format("%Y-%m-%d"));
            println!("  enrolled bibs:  {}", counts.bibs);
            println!("  photos:         {}", counts.photos);
            println!("  bib detections: {}", counts.bib_detections);
            println!("  faces:          {}", counts.faces);
        }
        Command::Help | Command::Version | Command::Worker { .. } => {}
    }

    Ok(())
}

fn query_embedding(
    config: &Config,
    extractor: &mut ModelExtractor,
    photo: &std::path::Path,
) -> Result<Option<Vec<f32>>> {
    search::face_query_from_image(
        extractor,
        photo,
        config.search.query_max_width,
        config.search.face_detect_confidence,
        config.faces.embedding_dim,
    )
}

fn run_scan(
    config: &Config,
    config_path: Option<PathBuf>,
    db: &Database,
    event: i64,
    in_process: bool,
) -> Result<ScanSummary> {
    let corpus = LocalCorpus::new(config.photos.event_dir(event), &config.photos.image_extensions);
    let (progress_tx, progress_rx) = mpsc::channel();
    let printer = std::thread::spawn(move || print_progress(progress_rx));

    let orchestrator = ScanOrchestrator::new(config, db).with_progress(progress_tx);
    let summary = if in_process {
        let worker_config = config.clone();
        let spawner = ThreadSpawner::new(WorkerOptions::from_config(config), move |_slot| {
            let extractor = ModelExtractor::from_config(&worker_config)?;
            Ok(Box::new(extractor) as Box<dyn FeatureExtractor + Send>)
        });
        orchestrator.scan(event, &corpus, spawner)
    } else {
        orchestrator.scan(event, &corpus, ProcessSpawner::current_exe(config_path)?)
    };
    drop(orchestrator);

    let _ = printer.join();
    summary
}

fn print_progress(rx: mpsc::Receiver<ScanProgress>) {
    let mut total = 0;
    let mut done = 0;
    for progress in rx {
        match progress {
            ScanProgress::Started { total: t } => {
                total = t;
                println!("Extracting {} photos", total);
            }
            ScanProgress::Photo { .. } => {
                done += 1;
                if done % 25 == 0 || done == total {
                    println!("  {}/{}", done, total);
                }
            }
            ScanProgress::Completed(_) => break,
        }
    }
}

fn print_summary(summary: &ScanSummary) {
    println!("Scan of event {} finished", summary.event_id);
    println!(
        "  corpus: {}  new: {}  changed: {}  unchanged: {}",
        summary.corpus_photos, summary.new_photos, summary.changed_photos, summary.unchanged_photos
    );
    println!(
        "  purged: {}  orphaned: {}",
        summary.purged_photos, summary.orphaned_photos
    );
    println!(
        "  processed: {}/{}  incomplete: {}  workers: {}  restarts: {}",
        summary.processed, summary.updates, summary.incomplete, summary.workers, summary.restarts
    );
    if let Some(counts) = summary.counts {
        println!(
            "  stored: {} photos, {} bib reads, {} faces",
            counts.photos, counts.bib_detections, counts.faces
        );
    }
    if !summary.is_complete() {
        println!("  {} photos will be retried on the next scan", summary.incomplete);
    }
}

fn compare(config: &Config, db: &Database, event: i64, against: Option<PathBuf>) -> Result<()> {
    let corpus = LocalCorpus::new(config.photos.event_dir(event), &config.photos.image_extensions);

    if let Some(other) = against {
        let theirs = LocalCorpus::new(other, &config.photos.image_extensions);
        let diff = scanner::compare(&corpus.list()?, &theirs.list()?);
        if diff.is_empty() {
            println!("No differences");
        }
        for entry in &diff.only_in_a {
            println!("- {}", entry.id);
        }
        for entry in &diff.changed {
            println!("~ {}", entry.id);
        }
        for entry in &diff.only_in_b {
            println!("+ {}", entry.id);
        }
        return Ok(());
    }

    if db.get_event(event)?.is_none() {
        bail!("Event {} not found", event);
    }
    let plan = ScanOrchestrator::new(config, db).plan(event, &corpus)?;
    for photo in &plan.register {
        println!("+ {}", photo.path);
    }
    for photo in &plan.refresh {
        println!("~ {}", photo.path);
    }
    for photo in &plan.purge {
        println!("- {}", photo.path);
    }
    println!(
        "{} new, {} changed, {} to purge, {} missing but kept, {} unchanged",
        plan.register.len(),
        plan.refresh.len(),
        plan.purge.len(),
        plan.orphaned,
        plan.unchanged
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_parse_scan() {
        let cli = parse_args(&args("--config /etc/bf.toml scan --event 12 --in-process")).unwrap();
        assert_eq!(cli.config_path, Some(PathBuf::from("/etc/bf.toml")));
        assert_eq!(cli.command, Command::Scan { event: 12, in_process: true });
    }

    #[test]
    fn test_parse_find_collects_photos() {
        let cli = parse_args(&args("find --event 3 --photo a.jpg --photo b.jpg --bib 51 --substring")).unwrap();
        assert_eq!(
            cli.command,
            Command::Find {
                event: 3,
                bib: Some("51".to_string()),
                substring: true,
                photos: vec![PathBuf::from("a.jpg"), PathBuf::from("b.jpg")],
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args("scan")).is_err());
        assert!(parse_args(&args("scan --event x")).is_err());
        assert!(parse_args(&args("find --event 1")).is_err());
        assert!(parse_args(&args("frobnicate")).is_err());
        assert!(parse_args(&args("--config")).is_err());
        assert_eq!(parse_args(&args("worker --slot 2")).unwrap().command, Command::Worker { slot: 2 });
    }
}
