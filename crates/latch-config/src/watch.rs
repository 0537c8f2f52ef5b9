//! Debounced mtime polling for configuration files.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

/// Minimum spacing between observed reloads of the same file.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(200);

/// Watch `path` for modification and invoke `on_change` after each change,
/// at most once per debounce window. The file appearing or disappearing
/// counts as a change. The task exits when `cancel` fires.
pub fn watch_file<F>(path: PathBuf, cancel: CancellationToken, on_change: F)
where
    F: Fn() + Send + 'static,
{
    tokio::spawn(async move {
        let mut last_seen = mtime(&path);
        let mut interval = tokio::time::interval(DEBOUNCE_WINDOW);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let current = mtime(&path);
                    if current != last_seen {
                        last_seen = current;
                        tracing::debug!(path = %path.display(), "watched file changed");
                        on_change();
                    }
                }
            }
        }
        tracing::debug!(path = %path.display(), "file watch stopped");
    });
}

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}
