//! Backup archives.
//!
//! A backup is a plain tar file holding `backup.json` plus one component
//! archive per add-on, folder and the core configuration. [`Backup`] is the
//! catalog view of one file; [`ArchiveSession`] is an open archive with a
//! private working directory, used while creating or restoring.

pub mod manifest;
pub mod securetar;

use crate::crypto::{self, CipherKey, CIPHER_NAME};
use crate::utils::errors::{BackupError, Result};
use manifest::{AddonEntry, BackupType, HomeAssistantEntry, Manifest, LEGACY_MANIFEST_NAME, MANIFEST_NAME};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// One backup file and its manifest
#[derive(Debug, Clone)]
pub struct Backup {
    manifest: Manifest,
    tarfile: PathBuf,
    location: Option<String>,
}

impl Backup {
    /// A backup that does not exist on disk yet; it will be written to
    /// `<dir>/<slug>.tar`.
    pub fn new(manifest: Manifest, dir: &Path, location: Option<String>) -> Self {
        let tarfile = dir.join(format!("{}.tar", manifest.slug));
        Self {
            manifest,
            tarfile,
            location,
        }
    }

    /// Read the manifest of an existing backup file
    pub async fn load(tarfile: PathBuf, location: Option<String>) -> Result<Self> {
        let path = tarfile.clone();
        let manifest = tokio::task::spawn_blocking(move || read_manifest(&path)).await??;
        Ok(Self {
            manifest,
            tarfile,
            location,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn slug(&self) -> &str {
        &self.manifest.slug
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn date(&self) -> &str {
        &self.manifest.date
    }

    pub fn kind(&self) -> BackupType {
        self.manifest.kind
    }

    pub fn protected(&self) -> bool {
        self.manifest.protected
    }

    pub fn compressed(&self) -> bool {
        self.manifest.compressed
    }

    pub fn supervisor_version(&self) -> &str {
        &self.manifest.supervisor_version
    }

    pub fn addons(&self) -> &[AddonEntry] {
        &self.manifest.addons
    }

    pub fn addon_slugs(&self) -> Vec<&str> {
        self.manifest.addons.iter().map(|a| a.slug.as_str()).collect()
    }

    pub fn folders(&self) -> &[String] {
        &self.manifest.folders
    }

    pub fn homeassistant(&self) -> Option<&HomeAssistantEntry> {
        self.manifest.homeassistant.as_ref()
    }

    pub fn repositories(&self) -> &[String] {
        &self.manifest.repositories
    }

    pub fn tarfile(&self) -> &Path {
        &self.tarfile
    }

    /// Storage location holding the file, `None` for the local default
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// True until the backing file exists
    pub fn is_new(&self) -> bool {
        !self.tarfile.is_file()
    }

    pub fn size_bytes(&self) -> u64 {
        fs::metadata(&self.tarfile).map(|m| m.len()).unwrap_or(0)
    }

    pub fn size_mb(&self) -> f64 {
        let mb = self.size_bytes() as f64 / (1024.0 * 1024.0);
        (mb * 100.0).round() / 100.0
    }
}

fn strip_current_dir(path: &Path) -> &Path {
    path.strip_prefix(".").unwrap_or(path)
}

/// Find and parse the manifest inside a backup file
fn read_manifest(tarfile: &Path) -> Result<Manifest> {
    let file = File::open(tarfile)?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut legacy = None;

    let entries = archive
        .entries()
        .map_err(|e| BackupError::InvalidBackup(format!("Can't read {}: {}", tarfile.display(), e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| BackupError::InvalidBackup(format!("Corrupt archive: {}", e)))?;
        let path = entry.path()?.into_owned();
        let name = strip_current_dir(&path);

        if name == Path::new(MANIFEST_NAME) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Manifest::parse(&data);
        }
        if name == Path::new(LEGACY_MANIFEST_NAME) {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            legacy = Some(data);
        }
    }

    match legacy {
        Some(data) => Manifest::parse(&data),
        None => Err(BackupError::InvalidBackup(format!(
            "No manifest in {}",
            tarfile.display()
        ))),
    }
}

/// An open backup with its private working directory.
///
/// New backups collect their component archives in the working directory,
/// which lives next to the destination so the final rename stays on one
/// filesystem. Only [`ArchiveSession::finalize`] produces the backup file;
/// dropping the session in any other way removes the working directory and
/// leaves no file behind.
pub struct ArchiveSession {
    backup: Backup,
    key: Option<CipherKey>,
    workdir: TempDir,
}

impl ArchiveSession {
    /// Start a new backup
    pub fn create(backup: Backup, password: Option<&str>) -> Result<Self> {
        let parent = backup
            .tarfile
            .parent()
            .ok_or_else(|| BackupError::InvalidBackup("Backup path has no parent".to_string()))?;
        fs::create_dir_all(parent)?;
        let workdir = tempfile::Builder::new().prefix(".backup-").tempdir_in(parent)?;

        let mut session = Self {
            backup,
            key: None,
            workdir,
        };
        if session.set_password(password) {
            session.backup.manifest.protected = true;
            session.backup.manifest.crypto = Some(CIPHER_NAME.to_string());
        }

        debug!(slug = %session.backup.slug(), workdir = %session.workdir.path().display(), "Backup session created");
        Ok(session)
    }

    /// Open an existing backup, unpacking its components into a working
    /// directory
    pub async fn open(backup: Backup) -> Result<Self> {
        if backup.is_new() {
            return Err(BackupError::NotFound(backup.slug().to_string()));
        }

        let workdir = tempfile::Builder::new().prefix(".restore-").tempdir()?;
        let source = backup.tarfile.clone();
        let target = workdir.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut archive = tar::Archive::new(BufReader::new(File::open(&source)?));
            archive
                .unpack(&target)
                .map_err(|e| BackupError::InvalidBackup(format!("Can't unpack {}: {}", source.display(), e)))
        })
        .await??;

        debug!(slug = %backup.slug(), "Backup opened");
        Ok(Self {
            backup,
            key: None,
            workdir,
        })
    }

    /// Install the key for `password`. Returns false, changing nothing,
    /// when the password is missing or empty.
    pub fn set_password(&mut self, password: Option<&str>) -> bool {
        match password.and_then(CipherKey::from_password) {
            Some(key) => {
                self.key = Some(key);
                true
            }
            None => false,
        }
    }

    pub fn backup(&self) -> &Backup {
        &self.backup
    }

    pub(crate) fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.backup.manifest
    }

    pub(crate) fn key(&self) -> Option<&CipherKey> {
        self.key.as_ref()
    }

    pub(crate) fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Path of the component archive named `base`
    pub(crate) fn component_path(&self, base: &str) -> PathBuf {
        self.workdir
            .path()
            .join(securetar::archive_name(base, self.backup.compressed()))
    }

    /// Scratch directory outside the working directory, so it never ends
    /// up inside the backup
    pub(crate) fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        let parent = self.workdir.path().parent().unwrap_or_else(|| Path::new("."));
        Ok(tempfile::Builder::new().prefix(prefix).tempdir_in(parent)?)
    }

    /// Check the installed key against the backup content before anything
    /// destructive happens
    pub async fn validate_password(&self) -> Result<()> {
        if !self.backup.protected() {
            return Ok(());
        }
        let key = self.key.clone().ok_or(BackupError::WrongPassword)?;

        if let Some(component) = self.smallest_component() {
            let gzip = self.backup.compressed();
            let valid = tokio::task::spawn_blocking(move || securetar::verify_key(&component, Some(&key), gzip)).await??;
            if !valid {
                return Err(BackupError::WrongPassword);
            }
            return Ok(());
        }

        match self.backup.manifest.docker.registries.values().next() {
            Some(credential) => {
                crypto::decrypt(Some(&key), &credential.password).map_err(|_| BackupError::WrongPassword)?;
            }
            None => warn!(
                slug = %self.backup.slug(),
                "Backup holds nothing encrypted, accepting password unverified"
            ),
        }
        Ok(())
    }

    fn smallest_component(&self) -> Option<PathBuf> {
        let suffix = securetar::archive_name("", self.backup.compressed());
        fs::read_dir(self.workdir.path())
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(&suffix))
            .filter_map(|entry| entry.metadata().ok().map(|m| (m.len(), entry.path())))
            .min()
            .map(|(_, path)| path)
    }

    /// Write the manifest and bundle the working directory into the final
    /// backup file. The bundle is staged next to the destination and
    /// renamed into place, so the file is either complete or absent.
    pub async fn finalize(self) -> Result<Backup> {
        let ArchiveSession { backup, workdir, .. } = self;

        if !backup.is_new() {
            warn!(slug = %backup.slug(), "Backup file already exists, discarding changes");
            return Err(BackupError::InvalidBackup(format!(
                "{} already exists",
                backup.tarfile.display()
            )));
        }
        backup.manifest.validate()?;

        let backup = tokio::task::spawn_blocking(move || -> Result<Backup> {
            let data = serde_json::to_vec_pretty(&backup.manifest)?;
            fs::write(workdir.path().join(MANIFEST_NAME), data)?;

            let parent = backup.tarfile.parent().unwrap_or_else(|| Path::new("."));
            let staged = tempfile::Builder::new()
                .prefix(".backup-")
                .suffix(".tar")
                .tempfile_in(parent)?;
            {
                let mut builder = tar::Builder::new(BufWriter::new(staged.as_file()));
                builder.append_dir_all(".", workdir.path())?;
                builder.into_inner()?.flush()?;
            }
            staged.as_file().sync_all()?;
            staged.persist_noclobber(&backup.tarfile).map_err(|e| e.error)?;

            drop(workdir);
            Ok(backup)
        })
        .await??;

        info!(slug = %backup.slug(), path = %backup.tarfile.display(), "Backup written");
        Ok(backup)
    }
}

#[cfg(test)]
mod tests {
    use super::manifest::Manifest;
    use super::*;

    const DATE: &str = "2024-06-01T12:00:00+00:00";

    fn new_backup(dir: &Path, name: &str) -> Backup {
        let manifest = Manifest::new(name, DATE, BackupType::Partial, "2024.6.0", false);
        Backup::new(manifest, dir, None)
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_finalize_and_load() {
        let temp = TempDir::new().unwrap();
        let backup = new_backup(temp.path(), "test");
        assert!(backup.is_new());

        let mut session = ArchiveSession::create(backup, None).unwrap();
        session.manifest_mut().folders.push("share".to_string());
        fs::write(session.component_path("share"), b"payload").unwrap();
        let written = session.finalize().await.unwrap();

        assert!(!written.is_new());
        assert_eq!(leftovers(temp.path()), vec![format!("{}.tar", written.slug())]);

        let loaded = Backup::load(written.tarfile().to_path_buf(), None).await.unwrap();
        assert_eq!(loaded.manifest(), written.manifest());
        assert_eq!(loaded.folders(), &["share".to_string()]);
        assert!(loaded.size_bytes() > 0);
    }

    #[tokio::test]
    async fn test_dropped_session_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let backup = new_backup(temp.path(), "aborted");
        let tarfile = backup.tarfile().to_path_buf();

        let session = ArchiveSession::create(backup, Some("secret")).unwrap();
        fs::write(session.component_path("share"), b"payload").unwrap();
        drop(session);

        assert!(!tarfile.exists());
        assert!(leftovers(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_finalize_refuses_existing_file() {
        let temp = TempDir::new().unwrap();
        let backup = new_backup(temp.path(), "twice");
        fs::write(backup.tarfile(), b"existing").unwrap();

        let session = ArchiveSession::create(backup.clone(), None).unwrap();
        assert!(session.finalize().await.is_err());
        assert_eq!(fs::read(backup.tarfile()).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn test_password_marks_protected() {
        let temp = TempDir::new().unwrap();
        let session = ArchiveSession::create(new_backup(temp.path(), "locked"), Some("secret")).unwrap();
        assert!(session.backup().protected());
        assert_eq!(session.backup().manifest().crypto.as_deref(), Some("aes128"));

        let session = ArchiveSession::create(new_backup(temp.path(), "open"), Some("")).unwrap();
        assert!(!session.backup().protected());
    }

    #[tokio::test]
    async fn test_set_password_ignores_empty() {
        let temp = TempDir::new().unwrap();
        let mut session = ArchiveSession::create(new_backup(temp.path(), "x"), Some("secret")).unwrap();
        assert!(!session.set_password(Some("")));
        assert!(!session.set_password(None));
        assert!(session.key().is_some());
    }

    #[tokio::test]
    async fn test_legacy_manifest_name() {
        let temp = TempDir::new().unwrap();
        let manifest = Manifest::new("legacy", DATE, BackupType::Full, "2021.1.0", true);
        let path = temp.path().join("legacy.tar");
        {
            let mut builder = tar::Builder::new(File::create(&path).unwrap());
            let data = serde_json::to_vec(&manifest).unwrap();
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, "./snapshot.json", data.as_slice()).unwrap();
            builder.finish().unwrap();
        }

        let loaded = Backup::load(path, Some("nas".to_string())).await.unwrap();
        assert_eq!(loaded.name(), "legacy");
        assert_eq!(loaded.location(), Some("nas"));
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("garbage.tar");
        fs::write(&path, vec![0xAB; 2048]).unwrap();
        assert!(Backup::load(path, None).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_password() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("share");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("file.txt"), b"content").unwrap();

        let dest = temp.path().join("backups");
        let mut session = ArchiveSession::create(new_backup(&dest, "locked"), Some("correct")).unwrap();
        let target = session.component_path("share");
        securetar::create_from_dir(&source, &target, session.key(), false, &[]).unwrap();
        session.manifest_mut().folders.push("share".to_string());
        let backup = session.finalize().await.unwrap();

        let mut session = ArchiveSession::open(backup.clone()).await.unwrap();
        assert!(matches!(session.validate_password().await, Err(BackupError::WrongPassword)));
        session.set_password(Some("wrong"));
        assert!(matches!(session.validate_password().await, Err(BackupError::WrongPassword)));
        session.set_password(Some("correct"));
        session.validate_password().await.unwrap();
    }

    #[tokio::test]
    async fn test_validate_password_without_encrypted_content() {
        let temp = TempDir::new().unwrap();
        let session = ArchiveSession::create(new_backup(temp.path(), "empty"), Some("correct")).unwrap();
        let backup = session.finalize().await.unwrap();
        assert!(backup.protected());

        // Nothing to test-decrypt, so any key passes; a missing one still fails
        let mut session = ArchiveSession::open(backup).await.unwrap();
        assert!(matches!(session.validate_password().await, Err(BackupError::WrongPassword)));
        session.set_password(Some("anything"));
        session.validate_password().await.unwrap();
    }
}
