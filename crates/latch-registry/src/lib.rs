//! The resource registry: maps a resource-id to the remote authorization
//! endpoint that gates it.
//!
//! The table is replaced wholesale on reload. Readers clone an `Arc` of the
//! current table and never hold a lock across a knock; in-flight
//! transactions keep resolving against the `Arc<Resource>` they captured.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use latch_common::Resource;

/// Capacity of the reload event channel; laggards just miss old events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to read resources {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse resources {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Emitted after every successful table swap.
#[derive(Debug, Clone)]
pub struct RegistryReloaded {
    pub resource_count: usize,
}

#[derive(Debug, Deserialize)]
struct ResourcesFile {
    #[serde(default)]
    resources: Vec<Resource>,
}

type Table = HashMap<String, Arc<Resource>>;

pub struct Registry {
    path: PathBuf,
    table: RwLock<Arc<Table>>,
    event_tx: broadcast::Sender<RegistryReloaded>,
}

impl Registry {
    /// Load the table from `path`. A missing or malformed file yields an
    /// empty registry and a warning: resources are hot-reloadable and a
    /// broken table must never take the daemon down.
    pub fn load(path: PathBuf) -> Arc<Self> {
        let registry = Arc::new(Self {
            path,
            table: RwLock::new(Arc::new(Table::new())),
            event_tx: broadcast::channel(EVENT_CHANNEL_CAPACITY).0,
        });
        if let Err(e) = registry.reload() {
            tracing::warn!(error = %e, "resource table unavailable, starting empty");
        }
        registry
    }

    /// Current endpoint for a resource-id, if any.
    pub fn lookup(&self, resource_id: &str) -> Option<Arc<Resource>> {
        let table = self.table.read().unwrap().clone();
        table.get(resource_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to reload events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryReloaded> {
        self.event_tx.subscribe()
    }

    /// Re-read the file and swap the table. On any error the current table
    /// stays untouched.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let next = parse_resources(&self.path)?;
        let count = next.len();
        *self.table.write().unwrap() = Arc::new(next);
        tracing::info!(count, path = %self.path.display(), "resource table loaded");
        let _ = self.event_tx.send(RegistryReloaded {
            resource_count: count,
        });
        Ok(())
    }

    /// Watch the backing file and reload on change, debounced to one reload
    /// per window. Reload errors are logged and the table keeps serving.
    pub fn spawn_watch(self: &Arc<Self>, cancel: CancellationToken) {
        let registry = Arc::clone(self);
        latch_config::watch_file(self.path.clone(), cancel, move || {
            if let Err(e) = registry.reload() {
                tracing::error!(error = %e, "resource reload failed, keeping current table");
            }
        });
    }
}

fn parse_resources(path: &Path) -> Result<Table, RegistryError> {
    let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ResourcesFile = toml::from_str(&raw).map_err(|source| RegistryError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut table = Table::with_capacity(file.resources.len());
    for resource in file.resources {
        let key = resource.resource_id.clone();
        if table.insert(key.clone(), Arc::new(resource)).is_some() {
            tracing::warn!(resource_id = %key, "duplicate resource-id, last row wins");
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[resources]]
        authServiceId = "ap1"
        resourceId = "demo"
        serverIp = "10.0.0.1"
        serverPort = 62206

        [[resources]]
        authServiceId = "ap1"
        resourceId = "files"
        serverHostname = "gate.example.com"
        serverIp = ""
        serverPort = 62206
    "#;

    fn write_registry(name: &str, content: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("latch-registry-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("resources.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn lookup_finds_loaded_rows() {
        let registry = Registry::load(write_registry("lookup", SAMPLE));
        assert_eq!(registry.len(), 2);

        let demo = registry.lookup("demo").unwrap();
        assert_eq!(demo.server_addr(), "10.0.0.1:62206");

        let files = registry.lookup("files").unwrap();
        assert_eq!(files.server_addr(), "gate.example.com:62206");

        assert!(registry.lookup("ghost").is_none());
    }

    #[test]
    fn malformed_reload_keeps_current_table() {
        let path = write_registry("malformed", SAMPLE);
        let registry = Registry::load(path.clone());
        assert_eq!(registry.len(), 2);

        std::fs::write(&path, "[[resources]\nbroken").unwrap();
        assert!(registry.reload().is_err());
        assert_eq!(registry.len(), 2);
        assert!(registry.lookup("demo").is_some());
    }

    #[test]
    fn reload_swaps_wholesale() {
        let path = write_registry("swap", SAMPLE);
        let registry = Registry::load(path.clone());
        let captured = registry.lookup("demo").unwrap();

        std::fs::write(
            &path,
            r#"
            [[resources]]
            authServiceId = "ap2"
            resourceId = "other"
            serverIp = "10.0.0.2"
            serverPort = 62206
            "#,
        )
        .unwrap();
        registry.reload().unwrap();

        assert!(registry.lookup("demo").is_none());
        assert!(registry.lookup("other").is_some());
        // The row captured before the reload is unchanged.
        assert_eq!(captured.server_addr(), "10.0.0.1:62206");
    }

    #[test]
    fn missing_file_starts_empty() {
        let registry = Registry::load(PathBuf::from("/nonexistent/latch/resources.toml"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn reload_notifies_subscribers() {
        let path = write_registry("events", SAMPLE);
        let registry = Registry::load(path);
        let mut events = registry.subscribe();
        registry.reload().unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.resource_count, 2);
    }
}
