//! Core application configuration, stored as `homeassistant.tar[.gz]`.
//!
//! The component holds an inner `homeassistant.json` with the version and
//! the database flag, and the configuration directory under `data/`.

use crate::archive::manifest::HomeAssistantEntry;
use crate::archive::{securetar, ArchiveSession};
use crate::host::{CoreApplication, FollowUp};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub const CORE_ARCHIVE: &str = "homeassistant";
const CORE_METADATA: &str = "homeassistant.json";
const CORE_DATA: &str = "data";

/// Database files left out when the database is excluded
pub const DATABASE_FILES: [&str; 3] = [
    "home-assistant_v2.db",
    "home-assistant_v2.db-wal",
    "home-assistant_v2.db-shm",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CoreMetadata {
    version: String,
    #[serde(default)]
    exclude_database: bool,
}

impl ArchiveSession {
    /// Capture the core configuration and record it in the manifest
    pub async fn store_homeassistant(&mut self, core: &dyn CoreApplication, exclude_database: bool) -> anyhow::Result<()> {
        let version = core.version().await?;
        let staging = self.scratch_dir(".homeassistant-")?;
        core.export_config(staging.path(), exclude_database)
            .await
            .context("Can't export core configuration")?;

        let metadata = serde_json::to_vec_pretty(&CoreMetadata {
            version: version.clone(),
            exclude_database,
        })?;
        let excluded: Vec<PathBuf> = if exclude_database {
            DATABASE_FILES.iter().map(|name| staging.path().join(name)).collect()
        } else {
            Vec::new()
        };

        let target = self.component_path(CORE_ARCHIVE);
        let key = self.key().cloned();
        let gzip = self.backup().compressed();
        let size = tokio::task::spawn_blocking(move || {
            securetar::write_archive(&target, key.as_ref(), gzip, |builder| {
                let mut header = tar::Header::new_gnu();
                header.set_size(metadata.len() as u64);
                header.set_mode(0o644);
                header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
                builder.append_data(&mut header, CORE_METADATA, metadata.as_slice())?;
                securetar::append_tree(builder, staging.path(), Path::new(CORE_DATA), &excluded)
            })
        })
        .await?
        .context("Can't archive core configuration")?;

        info!(version = %version, size, exclude_database, "Core configuration captured");
        self.manifest_mut().homeassistant = Some(HomeAssistantEntry {
            version,
            exclude_database,
            size,
        });
        Ok(())
    }

    /// Restore the core configuration. When the running version differs
    /// from the backed up one, the update is started in the background and
    /// returned for the caller to await.
    pub async fn restore_homeassistant(&self, core: &Arc<dyn CoreApplication>) -> anyhow::Result<Option<FollowUp>> {
        let entry = self
            .backup()
            .homeassistant()
            .cloned()
            .context("Backup has no core configuration")?;
        let source = self.component_path(CORE_ARCHIVE);
        if !source.is_file() {
            anyhow::bail!("No core configuration archive in backup");
        }

        let staging = self.scratch_dir(".homeassistant-")?;
        let target = staging.path().to_path_buf();
        let key = self.key().cloned();
        let gzip = self.backup().compressed();
        let metadata = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<CoreMetadata>> {
            securetar::extract_to_dir(&source, &target, key.as_ref(), gzip)?;
            let path = target.join(CORE_METADATA);
            if !path.is_file() {
                return Ok(None);
            }
            Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
        })
        .await?
        .context("Can't unpack core configuration")?;

        core.import_config(&staging.path().join(CORE_DATA))
            .await
            .context("Can't import core configuration")?;

        let wanted = metadata.map(|m| m.version).unwrap_or(entry.version);
        let running = core.version().await?;
        info!(version = %wanted, "Core configuration restored");
        if running == wanted {
            return Ok(None);
        }

        info!(from = %running, to = %wanted, "Scheduling core version change");
        let core = Arc::clone(core);
        Ok(Some(tokio::spawn(async move { core.update(&wanted).await })))
    }
}
