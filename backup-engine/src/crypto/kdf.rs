//! Key stretching.
//!
//! There is no salt: the same password always yields the same key, and the
//! IV used for field encryption is derived from that key. Existing archives
//! depend on this, so it must not change.

use sha2::{Digest, Sha256};

/// Number of SHA-256 rounds applied to the input
pub const HASH_ROUNDS: usize = 100;

/// Length of derived keys and IVs
pub const KEY_SIZE: usize = 16;

fn stretch(input: &[u8]) -> [u8; KEY_SIZE] {
    let mut digest = Sha256::digest(input);
    for _ in 1..HASH_ROUNDS {
        digest = Sha256::digest(digest);
    }

    let mut out = [0u8; KEY_SIZE];
    out.copy_from_slice(&digest[..KEY_SIZE]);
    out
}

/// Derive the AES key from a password
pub fn derive_key(password: &str) -> [u8; KEY_SIZE] {
    stretch(password.as_bytes())
}

/// Derive the field encryption IV from a key
pub fn derive_iv(key: &[u8]) -> [u8; KEY_SIZE] {
    stretch(key)
}

/// Derive the IV of one component stream from the key and its salt
pub fn derive_salted_iv(key: &[u8], salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut input = Vec::with_capacity(key.len() + salt.len());
    input.extend_from_slice(key);
    input.extend_from_slice(salt);
    stretch(&input)
}
