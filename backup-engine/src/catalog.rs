//! Catalog of the backups found in every storage location.

use crate::archive::Backup;
use crate::host::{ErrorReporter, LocationResolver};
use crate::utils::errors::{BackupError, Result};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// `EBADMSG`: the filesystem reports corrupted data
const EBADMSG: i32 = 74;

/// Health reason reported when backup storage returns corrupted data
pub const UNHEALTHY_BAD_MESSAGE: &str = "oserror_bad_message";

pub struct Catalog {
    locations: Arc<dyn LocationResolver>,
    reporter: Arc<dyn ErrorReporter>,
    backups: RwLock<HashMap<String, Backup>>,
}

fn list_archives(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_archive = path.extension().is_some_and(|ext| ext == "tar");
        let is_hidden = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().starts_with('.'));
        if is_archive && !is_hidden && path.is_file() {
            archives.push(path);
        }
    }
    archives.sort();
    Ok(archives)
}

impl Catalog {
    pub fn new(locations: Arc<dyn LocationResolver>, reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            locations,
            reporter,
            backups: RwLock::new(HashMap::new()),
        }
    }

    pub fn locations(&self) -> &Arc<dyn LocationResolver> {
        &self.locations
    }

    /// Rescan every location. Unreadable locations and files are logged and
    /// skipped. Returns the number of backups found.
    pub async fn reload(&self) -> Result<usize> {
        let mut found = HashMap::new();

        for (location, dir) in self.locations.locations() {
            let scan_dir = dir.clone();
            let archives = match tokio::task::spawn_blocking(move || list_archives(&scan_dir)).await? {
                Ok(archives) => archives,
                Err(e) => {
                    warn!(location = ?location, dir = %dir.display(), error = %e, "Can't read backup location");
                    continue;
                }
            };

            for path in archives {
                match Backup::load(path.clone(), location.clone()).await {
                    Ok(backup) => {
                        if let Some(previous) = found.insert(backup.slug().to_string(), backup) {
                            warn!(slug = %previous.slug(), "Backup found in more than one place, keeping the last");
                        }
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable backup"),
                }
            }
        }

        let count = found.len();
        *self.backups.write().await = found;
        info!(count, "Backup catalog reloaded");
        Ok(count)
    }

    /// All backups, newest first
    pub async fn list(&self) -> Vec<Backup> {
        let mut backups: Vec<Backup> = self.backups.read().await.values().cloned().collect();
        backups.sort_by(|a, b| {
            b.manifest()
                .date_time()
                .cmp(&a.manifest().date_time())
                .then_with(|| a.slug().cmp(b.slug()))
        });
        backups
    }

    pub async fn get(&self, slug: &str) -> Option<Backup> {
        self.backups.read().await.get(slug).cloned()
    }

    pub(crate) async fn insert(&self, backup: Backup) {
        self.backups
            .write()
            .await
            .insert(backup.slug().to_string(), backup);
    }

    /// Delete a backup file and forget it. A file that is already gone is
    /// not an error; a filesystem reporting corrupted data marks the system
    /// unhealthy.
    pub async fn remove(&self, slug: &str) -> Result<()> {
        let backup = self
            .get(slug)
            .await
            .ok_or_else(|| BackupError::NotFound(slug.to_string()))?;

        let path = backup.tarfile().to_path_buf();
        let result = tokio::task::spawn_blocking(move || std::fs::remove_file(path)).await?;
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(slug, "Backup file already gone");
            }
            Err(e) => {
                if e.raw_os_error() == Some(EBADMSG) {
                    self.reporter.mark_unhealthy(UNHEALTHY_BAD_MESSAGE);
                }
                error!(slug, error = %e, "Can't remove backup");
                return Err(e.into());
            }
        }

        self.backups.write().await.remove(slug);
        info!(slug, "Backup removed");
        Ok(())
    }

    /// Move an external backup file into the default location and add it
    pub async fn import(&self, path: &Path) -> Result<Backup> {
        let incoming = Backup::load(path.to_path_buf(), None).await?;
        if self.get(incoming.slug()).await.is_some() {
            return Err(BackupError::InvalidBackup(format!(
                "Backup {} already exists",
                incoming.slug()
            )));
        }

        let dir = self.locations.resolve(None)?;
        let target = dir.join(format!("{}.tar", incoming.slug()));
        let source = path.to_path_buf();
        let dest = target.clone();
        tokio::task::spawn_blocking(move || -> io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            if dest.exists() {
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "target file exists"));
            }
            // Copy across filesystems when a rename isn't possible
            if std::fs::rename(&source, &dest).is_err() {
                std::fs::copy(&source, &dest)?;
                std::fs::remove_file(&source)?;
            }
            Ok(())
        })
        .await??;

        let backup = Backup::load(target, None).await?;
        info!(slug = %backup.slug(), "Backup imported");
        self.insert(backup.clone()).await;
        Ok(backup)
    }
}
