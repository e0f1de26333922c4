//! Add-on components, stored as `<slug>.tar[.gz]`.

use super::Outcome;
use crate::archive::manifest::AddonEntry;
use crate::archive::{securetar, ArchiveSession};
use crate::host::{AddonInfo, AddonRuntime, FollowUp};
use anyhow::Context;
use tracing::info;

impl ArchiveSession {
    /// Capture add-ons one at a time. Successful captures are added to the
    /// manifest; failures are skipped.
    pub async fn store_addons(&mut self, runtime: &dyn AddonRuntime, addons: &[AddonInfo]) -> Outcome {
        let mut outcome = Outcome::default();
        for addon in addons {
            let result = self.store_addon(runtime, addon).await;
            if let Some(entry) = outcome.record("addon", &addon.slug, result) {
                self.manifest_mut().addons.push(entry);
            }
        }
        outcome
    }

    async fn store_addon(&self, runtime: &dyn AddonRuntime, addon: &AddonInfo) -> anyhow::Result<AddonEntry> {
        let staging = self.scratch_dir(".addon-")?;
        runtime
            .export(&addon.slug, staging.path())
            .await
            .with_context(|| format!("Can't export add-on {}", addon.slug))?;

        let target = self.component_path(&addon.slug);
        let key = self.key().cloned();
        let gzip = self.backup().compressed();
        let size = tokio::task::spawn_blocking(move || {
            securetar::create_from_dir(staging.path(), &target, key.as_ref(), gzip, &[])
        })
        .await??;

        info!(slug = %addon.slug, size, "Add-on captured");
        Ok(AddonEntry {
            slug: addon.slug.clone(),
            name: addon.name.clone(),
            version: addon.version.clone(),
            size,
        })
    }

    /// Restore add-ons one at a time. Returns what happened and the
    /// follow-up tasks of the restored add-ons.
    pub async fn restore_addons(&self, runtime: &dyn AddonRuntime, slugs: &[String]) -> (Outcome, Vec<FollowUp>) {
        let mut outcome = Outcome::default();
        let mut follow_ups = Vec::new();
        for slug in slugs {
            let result = self.restore_addon(runtime, slug).await;
            if let Some(Some(task)) = outcome.record("addon", slug, result) {
                follow_ups.push(task);
            }
        }
        (outcome, follow_ups)
    }

    async fn restore_addon(&self, runtime: &dyn AddonRuntime, slug: &str) -> anyhow::Result<Option<FollowUp>> {
        let source = self.component_path(slug);
        if !source.is_file() {
            anyhow::bail!("No archive for add-on {} in backup", slug);
        }

        let staging = self.scratch_dir(".addon-")?;
        let target = staging.path().to_path_buf();
        let key = self.key().cloned();
        let gzip = self.backup().compressed();
        tokio::task::spawn_blocking(move || securetar::extract_to_dir(&source, &target, key.as_ref(), gzip))
            .await?
            .with_context(|| format!("Can't unpack add-on {}", slug))?;

        let follow_up = runtime
            .restore(slug, staging.path())
            .await
            .with_context(|| format!("Can't restore add-on {}", slug))?;

        info!(slug, "Add-on restored");
        Ok(follow_up)
    }
}
