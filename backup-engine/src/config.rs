//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file; every section falls back to defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Version of the running supervisor, stamped into new backups and
    /// compared against archives before a restore
    #[serde(default = "default_supervisor_version")]
    pub supervisor_version: String,

    /// Directory holding the shared folders (share, ssl, media, ...)
    #[serde(default = "default_folders_root")]
    pub folders_root: PathBuf,

    /// Gzip component archives unless the caller says otherwise
    #[serde(default = "default_compressed")]
    pub default_compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local backup directory
    #[serde(default = "default_backup_dir")]
    pub default_dir: PathBuf,

    /// Named external backup locations (network mounts)
    #[serde(default)]
    pub mounts: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_supervisor_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_folders_root() -> PathBuf {
    PathBuf::from("/data")
}

fn default_compressed() -> bool {
    true
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/data/backup")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supervisor_version: default_supervisor_version(),
            folders_root: default_folders_root(),
            default_compressed: default_compressed(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_dir: default_backup_dir(),
            mounts: BTreeMap::new(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
