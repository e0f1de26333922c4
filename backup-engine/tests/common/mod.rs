//! In-memory collaborators for scenario tests.
//!
//! Add-ons and the core application keep their data in plain directories
//! under the test's temp dir, so captures and restores can be checked on
//! disk.

#![allow(dead_code)]

use async_trait::async_trait;
use backup_engine::archive::manifest::RegistryCredential;
use backup_engine::config::{EngineConfig, StorageConfig};
use backup_engine::host::{
    AddonInfo, AddonRuntime, ConfiguredLocations, CoreApplication, ErrorReporter, FollowUp, Host,
    MountPoint, MountTable, RegistryStore, RepositoryStore, SystemPauseController,
};
use backup_engine::BackupManager;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Recorder database left out by `exclude_database`
pub const DATABASE_FILES: [&str; 2] = ["home-assistant_v2.db", "home-assistant_v2.db-wal"];

pub const SUPERVISOR_VERSION: &str = "2024.6.0";

/// Ordered log of everything the collaborators were asked to do
#[derive(Default)]
pub struct Events(Mutex<Vec<String>>);

impl Events {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.0.lock().unwrap().iter().any(|e| e == event)
    }
}

pub fn copy_dir(source: &Path, target: &Path) -> std::io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let dest = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

pub struct FakeSystem {
    pub paused: AtomicBool,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(false),
            pauses: AtomicUsize::new(0),
            resumes: AtomicUsize::new(0),
        }
    }
}

impl SystemPauseController for FakeSystem {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Add-ons whose data lives in `<root>/<slug>/`
pub struct FakeAddons {
    pub root: PathBuf,
    pub installed: Mutex<BTreeMap<String, AddonInfo>>,
    pub failing_exports: Mutex<HashSet<String>>,
    pub events: Arc<Events>,
    /// Delay export so a second operation can run into the lock
    pub export_delay: Mutex<Option<std::time::Duration>>,
}

impl FakeAddons {
    pub fn new(root: PathBuf, events: Arc<Events>) -> Self {
        Self {
            root,
            installed: Mutex::new(BTreeMap::new()),
            failing_exports: Mutex::new(HashSet::new()),
            events,
            export_delay: Mutex::new(None),
        }
    }

    pub fn install(&self, slug: &str, version: &str, content: &str) {
        let dir = self.root.join(slug);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("data.txt"), content).unwrap();
        self.installed.lock().unwrap().insert(
            slug.to_string(),
            AddonInfo {
                slug: slug.to_string(),
                name: format!("Add-on {}", slug),
                version: version.to_string(),
            },
        );
    }

    pub fn fail_export(&self, slug: &str) {
        self.failing_exports.lock().unwrap().insert(slug.to_string());
    }

    /// Drop an add-on and its data without going through the runtime
    pub fn forget(&self, slug: &str) {
        self.installed.lock().unwrap().remove(slug);
        let _ = fs::remove_dir_all(self.root.join(slug));
    }

    pub fn slugs(&self) -> Vec<String> {
        self.installed.lock().unwrap().keys().cloned().collect()
    }

    pub fn data(&self, slug: &str) -> Option<String> {
        fs::read_to_string(self.root.join(slug).join("data.txt")).ok()
    }
}

#[async_trait]
impl AddonRuntime for FakeAddons {
    async fn installed(&self) -> anyhow::Result<Vec<AddonInfo>> {
        Ok(self.installed.lock().unwrap().values().cloned().collect())
    }

    async fn stop(&self, slug: &str) -> anyhow::Result<()> {
        self.events.push(format!("stop {}", slug));
        Ok(())
    }

    async fn export(&self, slug: &str, target: &Path) -> anyhow::Result<()> {
        let delay = *self.export_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_exports.lock().unwrap().contains(slug) {
            return Err(std::io::Error::other(format!("disk error reading {}", slug)).into());
        }
        let info = self
            .installed
            .lock()
            .unwrap()
            .get(slug)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} not installed", slug))?;
        copy_dir(&self.root.join(slug), &target.join("data"))?;
        fs::write(target.join("version"), &info.version)?;
        self.events.push(format!("export {}", slug));
        Ok(())
    }

    async fn restore(&self, slug: &str, source: &Path) -> anyhow::Result<Option<FollowUp>> {
        let version = fs::read_to_string(source.join("version"))?;
        let dir = self.root.join(slug);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        copy_dir(&source.join("data"), &dir)?;
        self.installed.lock().unwrap().insert(
            slug.to_string(),
            AddonInfo {
                slug: slug.to_string(),
                name: format!("Add-on {}", slug),
                version,
            },
        );
        self.events.push(format!("restore {}", slug));

        let events = Arc::clone(&self.events);
        let slug = slug.to_string();
        Ok(Some(tokio::spawn(async move {
            events.push(format!("started {}", slug));
            Ok(())
        })))
    }

    async fn uninstall(&self, slug: &str) -> anyhow::Result<()> {
        self.installed.lock().unwrap().remove(slug);
        let dir = self.root.join(slug);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        self.events.push(format!("uninstall {}", slug));
        Ok(())
    }
}

/// Core application with its configuration in `config_dir`
pub struct FakeCore {
    pub config_dir: PathBuf,
    pub version: Mutex<String>,
    pub running: AtomicBool,
    pub api_ok: AtomicBool,
    pub fail_export: AtomicBool,
    pub events: Arc<Events>,
}

impl FakeCore {
    pub fn new(config_dir: PathBuf, version: &str, events: Arc<Events>) -> Self {
        fs::create_dir_all(&config_dir).unwrap();
        Self {
            config_dir,
            version: Mutex::new(version.to_string()),
            running: AtomicBool::new(true),
            api_ok: AtomicBool::new(true),
            fail_export: AtomicBool::new(false),
            events,
        }
    }
}

#[async_trait]
impl CoreApplication for FakeCore {
    async fn version(&self) -> anyhow::Result<String> {
        Ok(self.version.lock().unwrap().clone())
    }

    async fn export_config(&self, target: &Path, _exclude_database: bool) -> anyhow::Result<()> {
        if self.fail_export.load(Ordering::SeqCst) {
            anyhow::bail!("configuration directory unreadable");
        }
        copy_dir(&self.config_dir, target)?;
        Ok(())
    }

    async fn import_config(&self, source: &Path) -> anyhow::Result<()> {
        if self.config_dir.exists() {
            fs::remove_dir_all(&self.config_dir)?;
        }
        copy_dir(source, &self.config_dir)?;
        self.events.push("import core config");
        Ok(())
    }

    async fn update(&self, version: &str) -> anyhow::Result<()> {
        *self.version.lock().unwrap() = version.to_string();
        self.events.push(format!("update core {}", version));
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::SeqCst);
        self.events.push("stop core");
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.events.push("start core");
        Ok(())
    }

    async fn restart(&self) -> anyhow::Result<()> {
        self.running.store(true, Ordering::SeqCst);
        self.api_ok.store(true, Ordering::SeqCst);
        self.events.push("restart core");
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn api_responds(&self) -> bool {
        self.api_ok.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeRegistries(pub Mutex<BTreeMap<String, RegistryCredential>>);

#[async_trait]
impl RegistryStore for FakeRegistries {
    async fn registries(&self) -> anyhow::Result<BTreeMap<String, RegistryCredential>> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn save(&self, registries: BTreeMap<String, RegistryCredential>) -> anyhow::Result<()> {
        *self.0.lock().unwrap() = registries;
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRepositories(pub Mutex<Vec<String>>);

#[async_trait]
impl RepositoryStore for FakeRepositories {
    async fn repositories(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.lock().unwrap().clone())
    }

    async fn add(&self, url: &str) -> anyhow::Result<()> {
        self.0.lock().unwrap().push(url.to_string());
        Ok(())
    }
}

/// Mount table holding a fixed set of mount points
#[derive(Default)]
pub struct FakeMounts {
    pub mounts: Mutex<Vec<MountPoint>>,
    pub events: Events,
}

impl FakeMounts {
    pub fn add(&self, name: &str, target: PathBuf) {
        self.mounts.lock().unwrap().push(MountPoint {
            name: name.to_string(),
            target,
        });
    }
}

impl MountTable for FakeMounts {
    fn mounts_under(&self, dir: &Path) -> anyhow::Result<Vec<MountPoint>> {
        Ok(self
            .mounts
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.target.starts_with(dir))
            .cloned()
            .collect())
    }

    fn unmount(&self, mount: &MountPoint) -> anyhow::Result<()> {
        self.events.push(format!("unmount {}", mount.name));
        Ok(())
    }

    fn mount(&self, mount: &MountPoint) -> anyhow::Result<()> {
        self.events.push(format!("mount {}", mount.name));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub captured: Mutex<Vec<String>>,
    pub unhealthy: Mutex<Vec<String>>,
}

impl ErrorReporter for RecordingReporter {
    fn capture(&self, error: &(dyn std::error::Error + 'static)) {
        self.captured.lock().unwrap().push(error.to_string());
    }

    fn mark_unhealthy(&self, reason: &str) {
        self.unhealthy.lock().unwrap().push(reason.to_string());
    }
}

/// A complete fake system rooted in a temp dir
pub struct TestEnv {
    pub temp: TempDir,
    pub folders_root: PathBuf,
    pub backup_dir: PathBuf,
    pub events: Arc<Events>,
    pub system: Arc<FakeSystem>,
    pub addons: Arc<FakeAddons>,
    pub core: Arc<FakeCore>,
    pub registries: Arc<FakeRegistries>,
    pub repositories: Arc<FakeRepositories>,
    pub mounts: Arc<FakeMounts>,
    pub reporter: Arc<RecordingReporter>,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let folders_root = temp.path().join("data");
        let backup_dir = folders_root.join("backup");
        for folder in ["share", "addons/local", "ssl", "media"] {
            fs::create_dir_all(folders_root.join(folder)).unwrap();
        }
        fs::create_dir_all(&backup_dir).unwrap();

        let events = Arc::new(Events::default());
        let addons = FakeAddons::new(temp.path().join("addon-data"), Arc::clone(&events));
        let core = FakeCore::new(folders_root.join("homeassistant"), "2024.6.1", Arc::clone(&events));
        fs::write(core.config_dir.join("configuration.yaml"), "homeassistant:\n").unwrap();
        for name in DATABASE_FILES {
            fs::write(core.config_dir.join(name), "recorder rows").unwrap();
        }

        Self {
            folders_root,
            backup_dir,
            events,
            system: Arc::new(FakeSystem::default()),
            addons: Arc::new(addons),
            core: Arc::new(core),
            registries: Arc::new(FakeRegistries::default()),
            repositories: Arc::new(FakeRepositories::default()),
            mounts: Arc::new(FakeMounts::default()),
            reporter: Arc::new(RecordingReporter::default()),
            temp,
        }
    }

    pub fn host(&self) -> Host {
        let storage = StorageConfig {
            default_dir: self.backup_dir.clone(),
            ..Default::default()
        };
        Host {
            system: self.system.clone(),
            addons: self.addons.clone(),
            core: self.core.clone(),
            registries: self.registries.clone(),
            repositories: self.repositories.clone(),
            locations: Arc::new(ConfiguredLocations::new(&storage)),
            mounts: self.mounts.clone(),
            reporter: self.reporter.clone(),
        }
    }

    pub fn manager(&self) -> BackupManager {
        let config = EngineConfig {
            supervisor_version: SUPERVISOR_VERSION.to_string(),
            folders_root: self.folders_root.clone(),
            default_compressed: true,
        };
        BackupManager::new(config, self.host())
    }

    pub fn folder(&self, name: &str) -> PathBuf {
        self.folders_root.join(name)
    }

    /// Everything in the backup directory, temp files included
    pub fn backup_files(&self) -> Vec<String> {
        let mut files: Vec<String> = fs::read_dir(&self.backup_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        files.sort();
        files
    }
}
