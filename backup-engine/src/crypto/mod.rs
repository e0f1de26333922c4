//! Password based encryption for protected backups.
//!
//! This module provides:
//! - Iterated SHA-256 key and IV derivation
//! - AES-128-CBC encryption of short strings (registry passwords)
//! - Streaming AES-128-CBC for component sub-archives

pub mod cipher;
pub mod kdf;
pub mod stream;

pub use cipher::{decrypt, encrypt, CipherKey};
pub use kdf::{derive_iv, derive_key};
pub use stream::{DecryptReader, EncryptWriter};

use thiserror::Error;

/// Cipher identifier written to the manifest of protected backups
pub const CIPHER_NAME: &str = "aes128";

/// AES block size in bytes
pub const BLOCK_SIZE: usize = 16;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid base64 data: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid padding - wrong password or corrupted data")]
    InvalidPadding,

    #[error("Decrypted data is not valid UTF-8")]
    InvalidUtf8,

    #[error("Ciphertext is truncated")]
    Truncated,
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
