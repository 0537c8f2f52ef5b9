//! Tracing setup with non-blocking writers and a hot-reloadable filter.

use std::path::Path;

use latch_config::LogLevel;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter, Registry};

/// Handle used to re-apply the level when the base config changes.
pub type LevelHandle = reload::Handle<EnvFilter, Registry>;

fn filter_for(level: LogLevel) -> EnvFilter {
    EnvFilter::try_new(level.filter_directive()).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing with non-blocking stderr plus an optional log file.
/// The returned guards must live for the rest of the program so writers
/// flush on exit.
pub fn init(
    level: LogLevel,
    log_file: Option<&Path>,
) -> anyhow::Result<(
    Vec<tracing_appender::non_blocking::WorkerGuard>,
    LevelHandle,
)> {
    let (filter_layer, handle) = reload::Layer::new(filter_for(level));

    let (nb_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(nb_stderr);

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let (nb_file, file_guard) = tracing_appender::non_blocking(file);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(nb_file);

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(stderr_layer)
            .with(file_layer)
            .init();

        Ok((vec![stderr_guard, file_guard], handle))
    } else {
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(stderr_layer)
            .init();

        Ok((vec![stderr_guard], handle))
    }
}

/// Swap the active filter for a new level. Used by the config watcher.
pub fn apply_level(handle: &LevelHandle, level: LogLevel) {
    if let Err(e) = handle.reload(filter_for(level)) {
        tracing::error!(error = %e, "failed to apply log level");
    }
}
