//! Interfaces to the rest of the supervisor.
//!
//! The engine never talks to the container runtime, the core application or
//! the stores directly; it goes through these capabilities, bundled in a
//! [`Host`].

use crate::archive::manifest::RegistryCredential;
use crate::config::StorageConfig;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Work a restore step leaves running, e.g. waiting for an add-on to come up
/// or bringing the core application to the backed up version. The caller
/// awaits it when convenient.
pub type FollowUp = JoinHandle<anyhow::Result<()>>;

/// Puts the whole system into a state where nothing else starts or stops
/// workloads
pub trait SystemPauseController: Send + Sync {
    fn pause(&self);
    fn resume(&self);
}

/// An installed add-on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonInfo {
    pub slug: String,
    pub name: String,
    pub version: String,
}

#[async_trait]
pub trait AddonRuntime: Send + Sync {
    async fn installed(&self) -> anyhow::Result<Vec<AddonInfo>>;

    async fn stop(&self, slug: &str) -> anyhow::Result<()>;

    /// Write the add-on's data and metadata into `target`
    async fn export(&self, slug: &str, target: &Path) -> anyhow::Result<()>;

    /// Install or update the add-on from data previously exported to `source`
    async fn restore(&self, slug: &str, source: &Path) -> anyhow::Result<Option<FollowUp>>;

    async fn uninstall(&self, slug: &str) -> anyhow::Result<()>;
}

/// The core application (Home Assistant)
#[async_trait]
pub trait CoreApplication: Send + Sync {
    async fn version(&self) -> anyhow::Result<String>;

    /// Copy the configuration directory into `target`
    async fn export_config(&self, target: &Path, exclude_database: bool) -> anyhow::Result<()>;

    /// Replace the configuration directory with the content of `source`
    async fn import_config(&self, source: &Path) -> anyhow::Result<()>;

    /// Install `version`, up or down
    async fn update(&self, version: &str) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    async fn start(&self) -> anyhow::Result<()>;

    async fn restart(&self) -> anyhow::Result<()>;

    async fn is_running(&self) -> bool;

    /// Whether the API answers as expected
    async fn api_responds(&self) -> bool;
}

/// Container registry logins
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn registries(&self) -> anyhow::Result<BTreeMap<String, RegistryCredential>>;

    async fn save(&self, registries: BTreeMap<String, RegistryCredential>) -> anyhow::Result<()>;
}

/// Add-on repositories
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    async fn repositories(&self) -> anyhow::Result<Vec<String>>;

    async fn add(&self, url: &str) -> anyhow::Result<()>;
}

/// Maps backup location names to directories
pub trait LocationResolver: Send + Sync {
    /// Directory for `location`, `None` being the local default
    fn resolve(&self, location: Option<&str>) -> anyhow::Result<PathBuf>;

    /// Every location with its directory
    fn locations(&self) -> Vec<(Option<String>, PathBuf)>;
}

/// Locations taken from the `[storage]` configuration section
#[derive(Debug, Clone)]
pub struct ConfiguredLocations {
    default_dir: PathBuf,
    mounts: BTreeMap<String, PathBuf>,
}

impl ConfiguredLocations {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            default_dir: config.default_dir.clone(),
            mounts: config.mounts.clone(),
        }
    }
}

impl LocationResolver for ConfiguredLocations {
    fn resolve(&self, location: Option<&str>) -> anyhow::Result<PathBuf> {
        match location {
            None => Ok(self.default_dir.clone()),
            Some(name) => self
                .mounts
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("Unknown backup location {}", name)),
        }
    }

    fn locations(&self) -> Vec<(Option<String>, PathBuf)> {
        std::iter::once((None, self.default_dir.clone()))
            .chain(self.mounts.iter().map(|(name, path)| (Some(name.clone()), path.clone())))
            .collect()
    }
}

/// An external mount that lives inside a shared folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub name: String,
    pub target: PathBuf,
}

pub trait MountTable: Send + Sync {
    /// Mounts at or below `dir`
    fn mounts_under(&self, dir: &Path) -> anyhow::Result<Vec<MountPoint>>;

    fn unmount(&self, mount: &MountPoint) -> anyhow::Result<()>;

    fn mount(&self, mount: &MountPoint) -> anyhow::Result<()>;
}

/// Receives failures of whole operations and health problems
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, error: &(dyn std::error::Error + 'static));

    fn mark_unhealthy(&self, reason: &str);
}

/// Reporter that only logs
#[derive(Debug, Default, Clone)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn capture(&self, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(error = %error, "Captured error");
    }

    fn mark_unhealthy(&self, reason: &str) {
        tracing::error!(reason, "System marked unhealthy");
    }
}

/// Everything the engine needs from the surrounding system
#[derive(Clone)]
pub struct Host {
    pub system: Arc<dyn SystemPauseController>,
    pub addons: Arc<dyn AddonRuntime>,
    pub core: Arc<dyn CoreApplication>,
    pub registries: Arc<dyn RegistryStore>,
    pub repositories: Arc<dyn RepositoryStore>,
    pub locations: Arc<dyn LocationResolver>,
    pub mounts: Arc<dyn MountTable>,
    pub reporter: Arc<dyn ErrorReporter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_locations() {
        let mut config = StorageConfig::default();
        config.mounts.insert("nas".to_string(), PathBuf::from("/data/mounts/nas"));
        let locations = ConfiguredLocations::new(&config);

        assert_eq!(locations.resolve(None).unwrap(), PathBuf::from("/data/backup"));
        assert_eq!(locations.resolve(Some("nas")).unwrap(), PathBuf::from("/data/mounts/nas"));
        assert!(locations.resolve(Some("missing")).is_err());

        let all = locations.locations();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], (None, PathBuf::from("/data/backup")));
    }
}
