//! Add-on repository URLs, stored in the manifest.

use crate::archive::ArchiveSession;
use crate::host::RepositoryStore;
use tracing::{info, warn};

impl ArchiveSession {
    pub async fn store_repositories(&mut self, store: &dyn RepositoryStore) -> anyhow::Result<()> {
        let repositories = store.repositories().await?;
        info!(count = repositories.len(), "Repositories captured");
        self.manifest_mut().repositories = repositories;
        Ok(())
    }

    /// Register the backed up repositories that are missing. A repository
    /// that fails to register doesn't stop the others.
    pub async fn restore_repositories(&self, store: &dyn RepositoryStore) -> anyhow::Result<()> {
        let current = store.repositories().await?;
        for url in self.backup().repositories() {
            if current.contains(url) {
                continue;
            }
            match store.add(url).await {
                Ok(()) => info!(url = %url, "Repository added"),
                Err(e) => warn!(url = %url, error = %e, "Can't add repository"),
            }
        }
        Ok(())
    }
}
