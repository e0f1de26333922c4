//! Container registry credentials, stored in the manifest. Passwords are
//! encrypted when the backup is protected.

use crate::archive::ArchiveSession;
use crate::crypto;
use crate::host::RegistryStore;
use crate::utils::errors::{BackupError, Result};
use std::collections::BTreeMap;
use tracing::info;

impl ArchiveSession {
    pub async fn store_registries(&mut self, store: &dyn RegistryStore) -> Result<()> {
        let registries = store.registries().await?;
        let key = self.key().cloned();

        let stored: BTreeMap<_, _> = registries
            .into_iter()
            .map(|(host, mut credential)| {
                credential.password = crypto::encrypt(key.as_ref(), &credential.password);
                (host, credential)
            })
            .collect();

        info!(count = stored.len(), "Registry credentials captured");
        self.manifest_mut().docker.registries = stored;
        Ok(())
    }

    /// Restore registry credentials, merged into the live ones or replacing
    /// them. A password that doesn't decrypt means the key is wrong.
    pub async fn restore_registries(&self, store: &dyn RegistryStore, replace: bool) -> Result<()> {
        let key = self.key();
        let mut restored = BTreeMap::new();
        for (host, credential) in &self.backup().manifest().docker.registries {
            let mut credential = credential.clone();
            credential.password =
                crypto::decrypt(key, &credential.password).map_err(|_| BackupError::WrongPassword)?;
            restored.insert(host.clone(), credential);
        }

        let merged = if replace {
            restored
        } else {
            let mut current = store.registries().await?;
            current.extend(restored);
            current
        };

        info!(count = merged.len(), replace, "Registry credentials restored");
        store.save(merged).await?;
        Ok(())
    }
}
