//! Log output for the command-line client.
//!
//! Structured JSON goes to a rolling file under the log directory; stderr
//! gets a compact human-readable view. Query results own stdout.

use anyhow::{Context, Result};
use rolling_file::{RollingConditionBasic, RollingFileAppender};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE: &str = "aqueduct.log";
const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;
const KEPT_FILES: usize = 9;

/// Filter used when `RUST_LOG` is unset, by `-v` count.
fn default_directives(verbose: u8) -> &'static str {
    match verbose {
        0 => "aqueduct=info,aqueduct_rs=info",
        1 => "aqueduct=debug,aqueduct_rs=debug",
        _ => "aqueduct=trace,aqueduct_rs=trace,reqwest=debug",
    }
}

/// Install the global subscriber. Keep the guard alive until exit or
/// buffered file output is lost.
pub fn init_telemetry(log_dir: &Path, verbose: u8) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    // Rolls daily and at MAX_FILE_BYTES
    let appender = RollingFileAppender::new(
        log_dir.join(LOG_FILE),
        RollingConditionBasic::new().daily().max_size(MAX_FILE_BYTES),
        KEPT_FILES,
    )
    .context("cannot open log file")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    let file = fmt::layer()
        .json()
        .with_writer(writer)
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_thread_ids(true);
    let console = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(file)
        .with(console)
        .try_init()
        .context("logging is already initialised")?;

    Ok(guard)
}
