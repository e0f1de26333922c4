//! Backup manifest, serialized as `backup.json` at the root of every
//! backup archive. It is never encrypted so backups can be listed without
//! their password.

use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

/// Schema version this engine reads and writes
pub const SCHEMA_VERSION: u32 = 2;

/// Manifest file name
pub const MANIFEST_NAME: &str = "backup.json";

/// Manifest file name used by older backups, read-only
pub const LEGACY_MANIFEST_NAME: &str = "snapshot.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Partial,
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackupType::Full => f.pad("full"),
            BackupType::Partial => f.pad("partial"),
        }
    }
}

/// An add-on captured in the backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddonEntry {
    pub slug: String,
    pub name: String,
    pub version: String,
    /// Size of the component archive in bytes
    #[serde(default)]
    pub size: u64,
}

/// Core application configuration captured in the backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomeAssistantEntry {
    pub version: String,
    #[serde(default)]
    pub exclude_database: bool,
    #[serde(default)]
    pub size: u64,
}

/// Registry login. `password` is ciphertext in protected backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSection {
    #[serde(default)]
    pub registries: BTreeMap<String, RegistryCredential>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub slug: String,
    pub name: String,
    pub date: String,
    #[serde(rename = "type")]
    pub kind: BackupType,
    pub supervisor_version: String,
    #[serde(default)]
    pub protected: bool,
    #[serde(default = "default_compressed")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto: Option<String>,
    #[serde(default)]
    pub addons: Vec<AddonEntry>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub homeassistant: Option<HomeAssistantEntry>,
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(default)]
    pub docker: DockerSection,
}

fn default_compressed() -> bool {
    true
}

/// Slug of a backup: first 8 hex digits of the SHA-1 of `"{date} - {name}"`
/// in lower case.
pub fn create_slug(name: &str, date: &str) -> String {
    let digest = Sha1::digest(format!("{} - {}", date, name).to_lowercase().as_bytes());
    digest.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

impl Manifest {
    /// Manifest of a new, still empty backup
    pub fn new(name: &str, date: &str, kind: BackupType, supervisor_version: &str, compressed: bool) -> Self {
        Self {
            version: SCHEMA_VERSION,
            slug: create_slug(name, date),
            name: name.to_string(),
            date: date.to_string(),
            kind,
            supervisor_version: supervisor_version.to_string(),
            protected: false,
            compressed,
            crypto: None,
            addons: Vec::new(),
            folders: Vec::new(),
            homeassistant: None,
            repositories: Vec::new(),
            docker: DockerSection::default(),
        }
    }

    /// Parse and validate manifest bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| BackupError::InvalidBackup(format!("Can't parse manifest: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(BackupError::InvalidBackup(msg));

        if self.version != SCHEMA_VERSION {
            return invalid(format!(
                "Unsupported backup version {} (expected {})",
                self.version, SCHEMA_VERSION
            ));
        }
        if self.slug.is_empty() || !self.slug.chars().all(|c| c.is_ascii_alphanumeric()) {
            return invalid(format!("Invalid slug {:?}", self.slug));
        }
        if self.name.is_empty() {
            return invalid("Backup name is empty".to_string());
        }
        if DateTime::parse_from_rfc3339(&self.date).is_err() {
            return invalid(format!("Invalid date {:?}", self.date));
        }
        if self.protected && self.crypto.as_deref() != Some(crate::crypto::CIPHER_NAME) {
            return invalid(format!("Unsupported crypto {:?}", self.crypto));
        }

        let mut slugs = HashSet::new();
        if let Some(dup) = self.addons.iter().find(|a| !slugs.insert(a.slug.as_str())) {
            return invalid(format!("Add-on {} listed twice", dup.slug));
        }
        let mut folders = HashSet::new();
        if let Some(dup) = self.folders.iter().find(|f| !folders.insert(f.as_str())) {
            return invalid(format!("Folder {} listed twice", dup));
        }

        Ok(())
    }

    pub fn date_time(&self) -> Option<DateTime<FixedOffset>> {
        DateTime::parse_from_rfc3339(&self.date).ok()
    }
}

/// Compare two dotted supervisor versions (`2024.6.1`, `2024.06.0.dev1`).
/// Returns `None` when either side has no leading number.
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    fn parts(version: &str) -> Option<Vec<u64>> {
        let parts: Vec<u64> = version
            .split('.')
            .map_while(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok()
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts)
        }
    }

    let (mut a, mut b) = (parts(a)?, parts(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}
