//! Backup Engine Library
//!
//! Creates and restores versioned, optionally encrypted backups of a
//! supervised system: the core application's configuration, add-ons,
//! shared folders, registry credentials and repositories.

pub mod archive;
pub mod catalog;
pub mod components;
pub mod config;
pub mod crypto;
pub mod host;
pub mod manager;
pub mod utils;

// Re-export commonly used types
pub use archive::manifest::{BackupType, Manifest};
pub use archive::{ArchiveSession, Backup};
pub use catalog::Catalog;
pub use config::Config;
pub use manager::{BackupManager, BackupOptions, RestoreSummary, Selection};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
