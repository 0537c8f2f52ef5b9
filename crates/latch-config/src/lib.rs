//! Base configuration (`etc/config.toml`) and the debounced file watcher.
//!
//! Startup parse failures are fatal for the base config; hot-reload
//! failures keep the current state. The resources table lives in
//! `latch-registry` and only shares the watcher from here.

mod watch;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

pub use watch::{watch_file, DEBOUNCE_WINDOW};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Verbosity levels recognized in `config.toml`, numeric on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Silent,
    Error,
    Info,
    Audit,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn from_numeric(level: i64) -> Self {
        match level {
            i64::MIN..=0 => Self::Silent,
            1 => Self::Error,
            2 => Self::Info,
            3 => Self::Audit,
            4 => Self::Debug,
            _ => Self::Trace,
        }
    }

    /// EnvFilter directive for this level. Audit events are emitted under
    /// the `audit` target and share the info floor.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Silent => "off",
            Self::Error => "error",
            Self::Info => "info",
            Self::Audit => "info,audit=trace",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// The recognized option set of `etc/config.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BaseConfig {
    /// 0=silent 1=error 2=info 3=audit 4=debug 5=trace.
    #[serde(default = "default_log_level")]
    pub log_level: i64,

    /// Upstream resolver IP. Empty disables the forward path (SERVFAIL).
    #[serde(default)]
    pub upstream_dns: String,

    /// Point the host resolver at loopback on startup.
    #[serde(default)]
    pub set_system_dns: bool,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub agent: AgentSettings,

    /// Authorization server peers, matched to resources by `host:port`.
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

fn default_log_level() -> i64 {
    2
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct IdentityConfig {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub organization_id: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub check_results: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentSettings {
    /// Base64-encoded device private key, handed to the packet codec.
    #[serde(default)]
    pub private_key: String,
    #[serde(default = "default_knock_timeout_ms")]
    pub knock_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_block_cooldown_ms")]
    pub block_cooldown_ms: u64,
}

fn default_knock_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    30_000
}

fn default_block_cooldown_ms() -> u64 {
    60_000
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            knock_timeout_ms: default_knock_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            block_cooldown_ms: default_block_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    /// Public-key fingerprint of the remote server.
    pub fingerprint: String,
    /// `host:port` the peer listens on.
    pub host: String,
}

impl BaseConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_numeric(self.log_level)
    }
}

/// Directory holding `config.toml` and `resources.toml`, next to the
/// executable as the deployment layout prescribes.
pub fn etc_dir(exe_dir: &Path) -> PathBuf {
    exe_dir.join("etc")
}

pub fn base_config_path(exe_dir: &Path) -> PathBuf {
    etc_dir(exe_dir).join("config.toml")
}

pub fn resources_path(exe_dir: &Path) -> PathBuf {
    etc_dir(exe_dir).join("resources.toml")
}
