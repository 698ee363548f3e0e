//! Logging configuration with journald support on Linux.
//!
//! Scan, search and worker processes all log through `tracing`. On Linux the
//! systemd journal is preferred; elsewhere (or when journald is unavailable)
//! logs go to a daily rolling file. Worker processes must never log to
//! stdout, which carries their protocol, so there is no stdout fallback.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Initialize the logging system.
///
/// `prefix` names the log file (`scan`, `search`, `worker-3`, ...) and the
/// journald syslog identifier.
///
/// Log level can be controlled via the `BIBFINDER_LOG` environment variable:
/// - `BIBFINDER_LOG=debug` for verbose output
/// - `BIBFINDER_LOG=info` for standard output (default)
/// - `BIBFINDER_LOG=warn` for warnings and errors only
pub fn init(prefix: &str, log_dir: Option<PathBuf>) -> Result<()> {
    let env_filter = EnvFilter::try_from_env("BIBFINDER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald_layer) = tracing_journald::layer() {
            let journald_layer =
                journald_layer.with_syslog_identifier(format!("bibfinder-{}", prefix));
            tracing_subscriber::registry()
                .with(env_filter)
                .with(journald_layer)
                .try_init()?;

            tracing::info!(prefix, "Logging initialized with journald backend");
            return Ok(());
        }
    }

    // Fallback to file-based logging
    let log_dir = log_dir.unwrap_or_else(crate::config::Config::log_dir);
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, format!("{}.log", prefix));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Only the first init wins; later calls keep the existing writer alive.
    let _ = GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .try_init()?;

    tracing::info!(prefix, "Logging initialized with file backend at {:?}", log_dir);
    Ok(())
}
