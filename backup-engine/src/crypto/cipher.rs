//! AES-128-CBC encryption of short strings.
//!
//! Used for the registry passwords stored in the manifest. Output is
//! base64 of the PKCS#7 padded ciphertext.

use super::kdf::{derive_iv, derive_key, derive_salted_iv, KEY_SIZE};
use super::{CryptoError, Result};
use aes::Aes128;
use base64::{engine::general_purpose::STANDARD, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub(crate) type Aes128CbcEnc = cbc::Encryptor<Aes128>;
pub(crate) type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Key and IV derived from a backup password. Never persisted; wiped
/// from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    key: [u8; KEY_SIZE],
    iv: [u8; KEY_SIZE],
}

impl CipherKey {
    /// Derive a key from a password. Empty passwords yield no key.
    pub fn from_password(password: &str) -> Option<Self> {
        if password.is_empty() {
            return None;
        }

        let key = derive_key(password);
        let iv = derive_iv(&key);
        Some(Self { key, iv })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        STANDARD.encode(ciphertext)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let data = STANDARD.decode(ciphertext)?;
        let plaintext = Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&data)
            .map_err(|_| CryptoError::InvalidPadding)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    pub(crate) fn stream_encryptor(&self, salt: &[u8]) -> Aes128CbcEnc {
        let iv = derive_salted_iv(&self.key, salt);
        Aes128CbcEnc::new(&self.key.into(), &iv.into())
    }

    pub(crate) fn stream_decryptor(&self, salt: &[u8]) -> Aes128CbcDec {
        let iv = derive_salted_iv(&self.key, salt);
        Aes128CbcDec::new(&self.key.into(), &iv.into())
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Encrypt a string, or return it unchanged when there is no key
pub fn encrypt(key: Option<&CipherKey>, plaintext: &str) -> String {
    match key {
        Some(key) => key.encrypt(plaintext),
        None => plaintext.to_string(),
    }
}

/// Decrypt a string, or return it unchanged when there is no key
pub fn decrypt(key: Option<&CipherKey>, ciphertext: &str) -> Result<String> {
    match key {
        Some(key) => key.decrypt(ciphertext),
        None => Ok(ciphertext.to_string()),
    }
}
