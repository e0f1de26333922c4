//! Error types for the backup engine.

use crate::crypto::CryptoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid backup: {0}")]
    InvalidBackup(String),

    #[error("Backup {0} not found")]
    NotFound(String),

    #[error("Backup {0} is not a full backup")]
    WrongBackupType(String),

    #[error("Invalid password for protected backup")]
    WrongPassword,

    #[error("Backup was made on supervisor version {archive}, can't restore on {current}")]
    IncompatibleVersion { archive: String, current: String },

    #[error("A backup or restore is already running, try again later")]
    Busy,

    #[error("Nothing selected")]
    NothingSelected,

    #[error("{0}")]
    JobFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    /// Errors raised while validating a request, before any state was touched.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BackupError::InvalidBackup(_)
                | BackupError::NotFound(_)
                | BackupError::WrongBackupType(_)
                | BackupError::WrongPassword
                | BackupError::IncompatibleVersion { .. }
                | BackupError::Busy
                | BackupError::NothingSelected
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
