//! Shared folder components, stored as `<name>.tar[.gz]` with `/` in the
//! folder name replaced by `_`.

use super::Outcome;
use crate::archive::{securetar, ArchiveSession};
use crate::host::{MountPoint, MountTable};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const FOLDER_HOMEASSISTANT: &str = "homeassistant";
pub const FOLDER_SHARE: &str = "share";
pub const FOLDER_ADDONS: &str = "addons/local";
pub const FOLDER_SSL: &str = "ssl";
pub const FOLDER_MEDIA: &str = "media";

/// Folders captured by a full backup. The core configuration has its own
/// component.
pub const ALL_FOLDERS: [&str; 4] = [FOLDER_SHARE, FOLDER_ADDONS, FOLDER_SSL, FOLDER_MEDIA];

/// Component name of a folder
pub fn folder_archive_base(folder: &str) -> String {
    folder.replace('/', "_")
}

/// Mounts unmounted for the lifetime of the guard; they are mounted again
/// on drop whatever happened in between.
struct Unmounted<'a> {
    table: &'a dyn MountTable,
    mounts: Vec<MountPoint>,
}

impl<'a> Unmounted<'a> {
    fn unmount_all(table: &'a dyn MountTable, mounts: Vec<MountPoint>) -> anyhow::Result<Self> {
        let mut guard = Self {
            table,
            mounts: Vec::with_capacity(mounts.len()),
        };
        for mount in mounts {
            table
                .unmount(&mount)
                .with_context(|| format!("Can't unmount {}", mount.target.display()))?;
            guard.mounts.push(mount);
        }
        Ok(guard)
    }
}

impl Drop for Unmounted<'_> {
    fn drop(&mut self) {
        for mount in self.mounts.drain(..) {
            if let Err(e) = fs::create_dir_all(&mount.target) {
                warn!(mount = %mount.name, error = %e, "Can't recreate mount point");
            }
            if let Err(e) = self.table.mount(&mount) {
                warn!(mount = %mount.name, error = %e, "Can't mount again after restore");
            }
        }
    }
}

/// Remove everything inside `dir`, creating it if missing
fn clear_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

impl ArchiveSession {
    /// Capture folders below `root` one at a time. Missing folders are
    /// skipped with a warning and left out of the manifest.
    pub async fn store_folders(&mut self, root: &Path, mounts: &Arc<dyn MountTable>, folders: &[String]) -> Outcome {
        let mut outcome = Outcome::default();
        for folder in folders {
            let source = root.join(folder);
            if !source.is_dir() {
                warn!(folder = %folder, "Can't find folder, skipping");
                continue;
            }

            let result = self.store_folder(&source, mounts, folder).await;
            if outcome.record("folder", folder, result).is_some() {
                self.manifest_mut().folders.push(folder.clone());
            }
        }
        outcome
    }

    async fn store_folder(&self, source: &Path, mounts: &Arc<dyn MountTable>, folder: &str) -> anyhow::Result<()> {
        // External mounts have their own lifecycle and are never captured
        let excluded: Vec<PathBuf> = mounts
            .mounts_under(source)?
            .into_iter()
            .map(|mount| mount.target)
            .collect();

        let source = source.to_path_buf();
        let target = self.component_path(&folder_archive_base(folder));
        let key = self.key().cloned();
        let gzip = self.backup().compressed();
        let size = tokio::task::spawn_blocking(move || {
            securetar::create_from_dir(&source, &target, key.as_ref(), gzip, &excluded)
        })
        .await?
        .with_context(|| format!("Can't archive folder {}", folder))?;

        info!(folder, size, "Folder captured");
        Ok(())
    }

    /// Restore folders below `root` one at a time
    pub async fn restore_folders(&self, root: &Path, mounts: &Arc<dyn MountTable>, folders: &[String]) -> Outcome {
        let mut outcome = Outcome::default();
        for folder in folders {
            let result = self.restore_folder(root, mounts, folder).await;
            outcome.record("folder", folder, result);
        }
        outcome
    }

    async fn restore_folder(&self, root: &Path, mounts: &Arc<dyn MountTable>, folder: &str) -> anyhow::Result<()> {
        let source = self.component_path(&folder_archive_base(folder));
        if !source.is_file() {
            anyhow::bail!("No archive for folder {} in backup", folder);
        }

        let target = root.join(folder);
        let mounts = Arc::clone(mounts);
        let key = self.key().cloned();
        let gzip = self.backup().compressed();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let nested = mounts.mounts_under(&target)?;
            let _unmounted = Unmounted::unmount_all(mounts.as_ref(), nested)?;

            clear_dir(&target).with_context(|| format!("Can't clear {}", target.display()))?;
            securetar::extract_to_dir(&source, &target, key.as_ref(), gzip)
                .with_context(|| format!("Can't unpack {}", source.display()))?;
            Ok(())
        })
        .await??;

        info!(folder, "Folder restored");
        Ok(())
    }
}
