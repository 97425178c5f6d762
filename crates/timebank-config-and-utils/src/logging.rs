//! Logging initialization for the time bank.

use crate::{CoreResult, Paths};
use std::fs::OpenOptions;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize the logging system.
///
/// Sets up tracing with:
/// - Log level from RUST_LOG env var or the provided default
/// - Compact human-readable output on stderr
///
/// Safe to call more than once; subsequent calls are no-ops.
///
/// # Example
///
/// ```ignore
/// init_logging("info");
/// tracing::info!("Time bank started");
/// ```
pub fn init_logging(level: &str) {
    try_init(level, None);
}

/// `init_logging` plus a JSON lines layer appended to the log file under
/// the base directory (`~/.timebank/logs/timebank.jsonl`).
pub fn init_logging_with_file(level: &str, paths: &Paths) -> CoreResult<()> {
    paths.ensure_dirs()?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(paths.log_file())?;
    try_init(level, Some(file));
    Ok(())
}

fn try_init(level: &str, file: Option<std::fs::File>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let json_layer = file.map(|file| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(file))
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(json_layer)
        .try_init();
}
