//! Tracing setup for the server binary.
//!
//! Field deployments run under systemd: structured JSON goes to a daily log
//! file and a plain compact stream goes to the journal. Local runs get
//! pretty output with span timings.

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the fallback filter directive.
pub const LOG_LEVEL_ENV: &str = "HYDROSNAP_LOG_LEVEL";

/// File name prefix of the daily log files.
const LOG_FILE_PREFIX: &str = "hydrosnap";

// Dropping a guard stops its writer thread and loses buffered lines.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber.
///
/// With `is_production`, validation and monitoring events are written as
/// JSON to a daily file under the platform log directory and echoed to
/// stdout for the journal. Otherwise everything goes to stdout in pretty
/// form.
///
/// `RUST_LOG` wins when set; [`LOG_LEVEL_ENV`] is consulted next and
/// `info` is the fallback.
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed or the production log
/// directory cannot be created.
pub fn init(is_production: bool) -> anyhow::Result<()> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let level = std::env::var(LOG_LEVEL_ENV).ok();
    let env_filter = resolve_filter(rust_log.as_deref(), level.as_deref())?;

    if is_production {
        init_production(env_filter)?;
    } else {
        init_development(env_filter);
    }

    Ok(())
}

fn resolve_filter(rust_log: Option<&str>, level: Option<&str>) -> anyhow::Result<EnvFilter> {
    match rust_log.filter(|directive| !directive.trim().is_empty()) {
        Some(directive) => Ok(EnvFilter::try_new(directive)?),
        None => filter_for_level(level.unwrap_or("info")),
    }
}

fn init_production(env_filter: EnvFilter) -> anyhow::Result<()> {
    let log_dir = log_directory();
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log directory {}: {e}", log_dir.display()))?;

    let (file_writer, file_guard) = tracing_appender::non_blocking(RollingFileAppender::new(
        Rotation::DAILY,
        &log_dir,
        LOG_FILE_PREFIX,
    ));
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // The journal stores escape codes verbatim.
    let journal_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(journal_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);

    Ok(())
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Build a filter from a level or directive list.
///
/// A bare level also pins `tower_http` request traces to `info`.
fn filter_for_level(level: &str) -> anyhow::Result<EnvFilter> {
    let directive = if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("{level},tower_http=info")
    };
    Ok(EnvFilter::try_new(directive)?)
}

/// Where production log files are written.
fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/hydrosnap")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "hydrosnap")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}
