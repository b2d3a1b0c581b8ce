//! System configuration shared by the orchestrator and the runner CLI.

use crate::defaults;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Canonical configuration for sessions and runners.
///
/// Every field is optional in the TOML file; missing fields fall back to
/// [`defaults`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatehouseConfig {
    /// Runner executable. When unset, `gatehouse-runner` next to the current
    /// executable is used.
    pub runner_executable: Option<PathBuf>,
    /// Directory for per-run logs. When unset, `<home>/logs/runs` is used.
    pub run_log_dir: Option<PathBuf>,
    /// Grace period between a cooperative cancel and a forced kill.
    pub cancel_grace_ms: u64,
    /// Maximum concurrently running runners per session.
    pub max_runners_per_session: usize,
    /// Default writer queue depth for pipelines that don't set one.
    pub default_queue_depth: usize,
}

impl Default for GatehouseConfig {
    fn default() -> Self {
        Self {
            runner_executable: None,
            run_log_dir: None,
            cancel_grace_ms: defaults::DEFAULT_CANCEL_GRACE_MS,
            max_runners_per_session: defaults::DEFAULT_MAX_RUNNERS_PER_SESSION,
            default_queue_depth: defaults::DEFAULT_WRITER_QUEUE_DEPTH,
        }
    }
}

impl GatehouseConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
