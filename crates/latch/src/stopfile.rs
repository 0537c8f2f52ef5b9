//! Stop-signal file: an unprivileged UI creates a sentinel file next to
//! the executable; the privileged daemon polls for it and shuts down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use latch_common::STOP_FILE_NAME;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub fn stop_file_path(home: &Path) -> PathBuf {
    home.join(STOP_FILE_NAME)
}

/// Remove a sentinel left over from a previous run.
pub fn clear_stale(home: &Path) {
    let path = stop_file_path(home);
    if path.exists() {
        let _ = std::fs::remove_file(&path);
        tracing::debug!(path = %path.display(), "stale stop file removed");
    }
}

/// Poll for the sentinel every 500 ms; when it appears, remove it and
/// cancel the daemon token.
pub fn spawn_watch(home: &Path, cancel: CancellationToken) {
    let path = stop_file_path(home);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if path.exists() {
                        tracing::info!(path = %path.display(), "stop file detected, shutting down");
                        let _ = std::fs::remove_file(&path);
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_home(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("latch-stop-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn sentinel_triggers_cancellation_and_is_removed() {
        let home = temp_home("trigger");
        let cancel = CancellationToken::new();
        spawn_watch(&home, cancel.clone());

        std::fs::write(stop_file_path(&home), b"").unwrap();

        tokio::time::timeout(Duration::from_secs(3), cancel.cancelled())
            .await
            .expect("stop file must cancel the daemon");
        assert!(!stop_file_path(&home).exists());
    }

    #[test]
    fn clear_stale_removes_leftovers() {
        let home = temp_home("stale");
        std::fs::write(stop_file_path(&home), b"").unwrap();
        clear_stale(&home);
        assert!(!stop_file_path(&home).exists());
    }
}
