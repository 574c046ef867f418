//! Engine configuration: defaults, optional JSON file, environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONVERTER_TIMEOUT_MS: u64 = 60_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database holding the catalog and every backing table.
    pub database_path: PathBuf,
    pub pool_size: usize,
    pub acquire_timeout_ms: u64,
    /// Root under which per-ingestion staging directories are created.
    pub staging_dir: PathBuf,
    pub converter: ConverterConfig,
}

/// Which component turns a row-numbered CSV into a backing table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConverterConfig {
    #[default]
    InProcess,
    /// External program; `{input}`, `{table}` and `{database}` are substituted
    /// in `args`.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_converter_timeout_ms")]
        timeout_ms: u64,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn default_converter_timeout_ms() -> u64 {
    DEFAULT_CONVERTER_TIMEOUT_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("lingua.db"),
            pool_size: 4,
            acquire_timeout_ms: 5_000,
            staging_dir: PathBuf::from("tmp-data"),
            converter: ConverterConfig::InProcess,
        }
    }
}

impl EngineConfig {
    /// Defaults with `LINGUA_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies overrides from `lookup`; unparsable numbers keep the current value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("LINGUA_DB_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(size) = lookup("LINGUA_DB_POOL").and_then(|val| val.parse().ok()) {
            self.pool_size = size;
        }
        if let Some(ms) = lookup("LINGUA_DB_ACQUIRE_TIMEOUT_MS").and_then(|val| val.parse().ok()) {
            self.acquire_timeout_ms = ms;
        }
        if let Some(dir) = lookup("LINGUA_STAGING_DIR") {
            self.staging_dir = PathBuf::from(dir);
        }
        if let Some(cmd) = lookup("LINGUA_CONVERTER_CMD") {
            let mut parts = cmd.split_whitespace().map(str::to_string);
            if let Some(program) = parts.next() {
                let timeout_ms = match &self.converter {
                    ConverterConfig::Command { timeout_ms, .. } => *timeout_ms,
                    ConverterConfig::InProcess => DEFAULT_CONVERTER_TIMEOUT_MS,
                };
                self.converter = ConverterConfig::Command {
                    program,
                    args: parts.collect(),
                    timeout_ms,
                };
            }
        }
        if let Some(ms) = lookup("LINGUA_CONVERTER_TIMEOUT_MS").and_then(|val| val.parse().ok()) {
            if let ConverterConfig::Command { timeout_ms, .. } = &mut self.converter {
                *timeout_ms = ms;
            }
        }
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
