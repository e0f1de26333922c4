//! Backup orchestration.
//!
//! [`BackupManager`] runs the four top-level flows. Only one backup or
//! restore runs at a time; while it runs the whole system is paused.

use crate::archive::manifest::{compare_versions, BackupType, Manifest};
use crate::archive::{ArchiveSession, Backup};
use crate::catalog::Catalog;
use crate::components::folders::{ALL_FOLDERS, FOLDER_HOMEASSISTANT};
use crate::components::Outcome;
use crate::config::EngineConfig;
use crate::host::{FollowUp, Host, SystemPauseController};
use crate::utils::errors::{BackupError, Result};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Parameters shared by full and partial backups
#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub name: String,
    pub password: Option<String>,
    /// Falls back to the configured default when unset
    pub compressed: Option<bool>,
    /// Storage location, `None` for the local default
    pub location: Option<String>,
    /// Leave the core application's database out
    pub exclude_database: bool,
}

/// Components picked for a partial backup or restore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub homeassistant: bool,
    pub addons: Vec<String>,
    pub folders: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        !self.homeassistant && self.addons.is_empty() && self.folders.is_empty()
    }

    /// The core's data folder is handled by the core configuration component
    fn normalized(mut self) -> Self {
        if let Some(pos) = self.folders.iter().position(|f| f == FOLDER_HOMEASSISTANT) {
            self.folders.remove(pos);
            self.homeassistant = true;
        }
        self
    }
}

/// What a restore actually did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub homeassistant: bool,
    pub addons: Outcome,
    pub folders: Outcome,
}

/// Held for the duration of one operation. Dropping it resumes the system,
/// then releases the lock.
struct OperationGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    system: &'a dyn SystemPauseController,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.system.resume();
        info!("System resumed");
    }
}

/// Refuse archives produced by a newer supervisor
fn check_compatible(backup: &Backup, current: &str) -> Result<()> {
    if compare_versions(backup.supervisor_version(), current) == Some(Ordering::Greater) {
        return Err(BackupError::IncompatibleVersion {
            archive: backup.supervisor_version().to_string(),
            current: current.to_string(),
        });
    }
    Ok(())
}

async fn await_follow_ups(label: &str, tasks: Vec<FollowUp>) {
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = label, error = %e, "Follow-up task failed"),
            Err(e) => warn!(task = label, error = %e, "Follow-up task aborted"),
        }
    }
}

pub struct BackupManager {
    config: EngineConfig,
    host: Host,
    catalog: Arc<Catalog>,
    lock: Mutex<()>,
}

impl BackupManager {
    pub fn new(config: EngineConfig, host: Host) -> Self {
        let catalog = Arc::new(Catalog::new(
            Arc::clone(&host.locations),
            Arc::clone(&host.reporter),
        ));
        Self {
            config,
            host,
            catalog,
            lock: Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Take the single-flight lock, then pause the system. A caller that
    /// finds the lock taken is turned away and never pauses anything.
    fn acquire(&self) -> Result<OperationGuard<'_>> {
        let lock = self.lock.try_lock().map_err(|_| BackupError::Busy)?;
        self.host.system.pause();
        info!("System paused");
        Ok(OperationGuard {
            _lock: lock,
            system: self.host.system.as_ref(),
        })
    }

    /// Turn a failed operation into what the caller sees. Rejected requests
    /// pass through; everything else is reported and becomes `JobFailed`.
    fn report(&self, operation: &str, err: BackupError) -> BackupError {
        if err.is_rejection() {
            warn!(operation, error = %err, "Request rejected");
            return err;
        }
        error!(operation, error = %err, "Operation failed");
        self.host.reporter.capture(&err);
        BackupError::JobFailed(format!("{} failed: {}", operation, err))
    }

    /// Rescan all storage locations
    pub async fn reload(&self) -> Result<usize> {
        let _lock = self.lock.try_lock().map_err(|_| BackupError::Busy)?;
        self.catalog.reload().await
    }

    /// Delete a backup
    pub async fn remove(&self, slug: &str) -> Result<()> {
        let _lock = self.lock.try_lock().map_err(|_| BackupError::Busy)?;
        self.catalog.remove(slug).await
    }

    /// Move an external backup file into the local backup directory
    pub async fn import(&self, path: &Path) -> Result<Backup> {
        let _lock = self.lock.try_lock().map_err(|_| BackupError::Busy)?;
        self.catalog.import(path).await
    }

    fn new_session(&self, kind: BackupType, options: &BackupOptions) -> Result<ArchiveSession> {
        let date = chrono::Utc::now().to_rfc3339();
        let compressed = options.compressed.unwrap_or(self.config.default_compressed);
        let manifest = Manifest::new(
            &options.name,
            &date,
            kind,
            &self.config.supervisor_version,
            compressed,
        );
        let dir = self.host.locations.resolve(options.location.as_deref())?;
        let backup = Backup::new(manifest, &dir, options.location.clone());

        info!(slug = %backup.slug(), name = %options.name, kind = %kind, "Creating backup");
        ArchiveSession::create(backup, options.password.as_deref())
    }

    async fn finish_backup(&self, result: Result<Backup>) -> Result<Backup> {
        match result {
            Ok(backup) => {
                info!(
                    slug = %backup.slug(),
                    addons = backup.addons().len(),
                    folders = backup.folders().len(),
                    "Backup completed"
                );
                self.catalog.insert(backup.clone()).await;
                Ok(backup)
            }
            Err(e) => Err(self.report("backup", e)),
        }
    }

    /// Back up the core configuration, repositories, registry credentials,
    /// every installed add-on and every shared folder.
    pub async fn backup_full(&self, options: BackupOptions) -> Result<Backup> {
        let _guard = self.acquire()?;
        let result = self.run_full_backup(&options).await;
        self.finish_backup(result).await
    }

    async fn run_full_backup(&self, options: &BackupOptions) -> Result<Backup> {
        let mut session = self.new_session(BackupType::Full, options)?;
        let host = &self.host;

        session
            .store_homeassistant(host.core.as_ref(), options.exclude_database)
            .await?;
        session.store_repositories(host.repositories.as_ref()).await?;
        session.store_registries(host.registries.as_ref()).await?;

        let addons = host.addons.installed().await?;
        session.store_addons(host.addons.as_ref(), &addons).await;

        let folders: Vec<String> = ALL_FOLDERS.iter().map(|f| f.to_string()).collect();
        session
            .store_folders(&self.config.folders_root, &host.mounts, &folders)
            .await;

        session.finalize().await
    }

    /// Back up the selected components only
    pub async fn backup_partial(&self, options: BackupOptions, selection: Selection) -> Result<Backup> {
        let selection = selection.normalized();
        if selection.is_empty() {
            return Err(BackupError::NothingSelected);
        }

        let _guard = self.acquire()?;
        let result = self.run_partial_backup(&options, &selection).await;
        self.finish_backup(result).await
    }

    async fn run_partial_backup(&self, options: &BackupOptions, selection: &Selection) -> Result<Backup> {
        let mut session = self.new_session(BackupType::Partial, options)?;
        let host = &self.host;

        if selection.homeassistant {
            session
                .store_homeassistant(host.core.as_ref(), options.exclude_database)
                .await?;
        }
        session.store_repositories(host.repositories.as_ref()).await?;
        session.store_registries(host.registries.as_ref()).await?;

        if !selection.addons.is_empty() {
            let installed = host.addons.installed().await?;
            for slug in &selection.addons {
                if !installed.iter().any(|a| &a.slug == slug) {
                    warn!(slug = %slug, "Add-on is not installed, skipping");
                }
            }
            let addons: Vec<_> = installed
                .into_iter()
                .filter(|a| selection.addons.contains(&a.slug))
                .collect();
            session.store_addons(host.addons.as_ref(), &addons).await;
        }

        if !selection.folders.is_empty() {
            session
                .store_folders(&self.config.folders_root, &host.mounts, &selection.folders)
                .await;
        }

        session.finalize().await
    }

    /// Checks shared by both restore flows, done before taking the lock
    async fn prepare_restore(&self, slug: &str, password: Option<&str>) -> Result<Backup> {
        let backup = self
            .catalog
            .get(slug)
            .await
            .ok_or_else(|| BackupError::NotFound(slug.to_string()))?;

        check_compatible(&backup, &self.config.supervisor_version)?;
        if backup.protected() && password.map_or(true, str::is_empty) {
            return Err(BackupError::WrongPassword);
        }
        Ok(backup)
    }

    /// Unpack the backup and prove the password. Nothing live is touched yet.
    async fn open_session(backup: Backup, password: Option<&str>) -> Result<ArchiveSession> {
        let protected = backup.protected();
        let mut session = ArchiveSession::open(backup).await?;
        // Components of an unprotected backup are plain streams
        if protected {
            session.set_password(password);
        } else if password.is_some_and(|p| !p.is_empty()) {
            warn!(slug = %session.backup().slug(), "Backup is not protected, ignoring password");
        }
        session.validate_password().await?;
        Ok(session)
    }

    /// Bring the whole system back to the state of a full backup
    pub async fn restore_full(&self, slug: &str, password: Option<&str>) -> Result<RestoreSummary> {
        let backup = self
            .prepare_restore(slug, password)
            .await
            .map_err(|e| self.report("restore", e))?;
        if backup.kind() != BackupType::Full {
            return Err(self.report("restore", BackupError::WrongBackupType(slug.to_string())));
        }

        let _guard = self.acquire()?;
        info!(slug, "Full restore started");
        let result = match Self::open_session(backup, password).await {
            Ok(session) => self.run_full_restore(&session).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(summary) => {
                info!(slug, ?summary, "Full restore completed");
                Ok(summary)
            }
            Err(e) => Err(self.report("restore", e)),
        }
    }

    async fn run_full_restore(&self, session: &ArchiveSession) -> Result<RestoreSummary> {
        let host = &self.host;
        let backup = session.backup();
        let mut summary = RestoreSummary::default();

        if let Err(e) = host.core.stop().await {
            warn!(error = %e, "Can't stop core application");
        }
        let installed = host.addons.installed().await?;
        for addon in &installed {
            if let Err(e) = host.addons.stop(&addon.slug).await {
                warn!(slug = %addon.slug, error = %e, "Can't stop add-on");
            }
        }

        summary.folders = session
            .restore_folders(&self.config.folders_root, &host.mounts, backup.folders())
            .await;

        session.restore_registries(host.registries.as_ref(), true).await?;

        let mut core_update = None;
        if backup.homeassistant().is_some() {
            core_update = session.restore_homeassistant(&host.core).await?;
            summary.homeassistant = true;
        }

        session.restore_repositories(host.repositories.as_ref()).await?;

        // Add-ons installed now but absent from the backup go away
        let wanted: HashSet<&str> = backup.addon_slugs().into_iter().collect();
        for addon in installed.iter().filter(|a| !wanted.contains(a.slug.as_str())) {
            match host.addons.uninstall(&addon.slug).await {
                Ok(()) => info!(slug = %addon.slug, "Add-on uninstalled"),
                Err(e) => warn!(slug = %addon.slug, error = %e, "Can't uninstall add-on"),
            }
        }

        let slugs: Vec<String> = backup.addons().iter().map(|a| a.slug.clone()).collect();
        let (outcome, follow_ups) = session.restore_addons(host.addons.as_ref(), &slugs).await;
        summary.addons = outcome;

        await_follow_ups("core update", core_update.into_iter().collect()).await;
        await_follow_ups("add-on start", follow_ups).await;
        self.ensure_core_running().await?;

        Ok(summary)
    }

    /// Restore the selected components of any backup
    pub async fn restore_partial(
        &self,
        slug: &str,
        selection: Selection,
        password: Option<&str>,
    ) -> Result<RestoreSummary> {
        let selection = selection.normalized();
        if selection.is_empty() {
            return Err(BackupError::NothingSelected);
        }
        let backup = self
            .prepare_restore(slug, password)
            .await
            .map_err(|e| self.report("restore", e))?;
        if selection.homeassistant && backup.homeassistant().is_none() {
            return Err(BackupError::InvalidBackup(format!(
                "Backup {} has no core configuration",
                slug
            )));
        }

        let _guard = self.acquire()?;
        info!(slug, ?selection, "Partial restore started");
        let result = match Self::open_session(backup, password).await {
            Ok(session) => self.run_partial_restore(&session, &selection).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(summary) => {
                info!(slug, ?summary, "Partial restore completed");
                Ok(summary)
            }
            Err(e) => Err(self.report("restore", e)),
        }
    }

    async fn run_partial_restore(&self, session: &ArchiveSession, selection: &Selection) -> Result<RestoreSummary> {
        let host = &self.host;
        let mut summary = RestoreSummary::default();

        session.restore_registries(host.registries.as_ref(), false).await?;

        let mut core_update = None;
        if selection.homeassistant {
            if let Err(e) = host.core.stop().await {
                warn!(error = %e, "Can't stop core application");
            }
            core_update = session.restore_homeassistant(&host.core).await?;
            summary.homeassistant = true;
        }

        if !selection.folders.is_empty() {
            summary.folders = session
                .restore_folders(&self.config.folders_root, &host.mounts, &selection.folders)
                .await;
        }

        let mut follow_ups = Vec::new();
        if !selection.addons.is_empty() {
            session.restore_repositories(host.repositories.as_ref()).await?;
            let (outcome, tasks) = session.restore_addons(host.addons.as_ref(), &selection.addons).await;
            summary.addons = outcome;
            follow_ups = tasks;
        }

        await_follow_ups("core update", core_update.into_iter().collect()).await;
        await_follow_ups("add-on start", follow_ups).await;
        self.ensure_core_running().await?;

        Ok(summary)
    }

    /// Start the core if it is down, restart it if its API doesn't answer
    async fn ensure_core_running(&self) -> Result<()> {
        let core = &self.host.core;
        if !core.is_running().await {
            info!("Starting core application");
            core.start().await?;
        } else if !core.api_responds().await {
            warn!("Core application API doesn't respond, restarting");
            core.restart().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup_made_on(version: &str) -> Backup {
        let manifest = Manifest::new("test", "2024-06-01T00:00:00+00:00", BackupType::Full, version, true);
        Backup::new(manifest, Path::new("/tmp"), None)
    }

    #[test]
    fn test_check_compatible() {
        assert!(check_compatible(&backup_made_on("2024.5.0"), "2024.6.0").is_ok());
        assert!(check_compatible(&backup_made_on("2024.6.0"), "2024.6.0").is_ok());
        assert!(check_compatible(&backup_made_on("dev"), "2024.6.0").is_ok());
        assert!(matches!(
            check_compatible(&backup_made_on("2024.7.1"), "2024.6.0"),
            Err(BackupError::IncompatibleVersion { .. })
        ));
    }

    #[test]
    fn test_selection_normalized() {
        let selection = Selection {
            folders: vec!["share".to_string(), "homeassistant".to_string()],
            ..Default::default()
        }
        .normalized();
        assert!(selection.homeassistant);
        assert_eq!(selection.folders, ["share".to_string()]);

        assert!(Selection::default().normalized().is_empty());
    }
}
