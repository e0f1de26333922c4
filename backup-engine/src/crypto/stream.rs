//! Streaming AES-128-CBC for component sub-archives.
//!
//! An encrypted stream starts with a random 16 byte salt that is mixed into
//! the IV, followed by the PKCS#7 padded ciphertext. Without a key both
//! adapters pass bytes through untouched.

use super::cipher::{Aes128CbcDec, Aes128CbcEnc, CipherKey};
use super::{CryptoError, BLOCK_SIZE};
use cbc::cipher::block_padding::{Padding, Pkcs7};
use cbc::cipher::consts::U16;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut};
use std::io::{self, Read, Write};

/// Length of the salt header of an encrypted stream
pub const SALT_SIZE: usize = 16;

const READ_CHUNK: usize = 64 * 1024;

fn invalid_data(err: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Encrypts everything written to it. Call [`EncryptWriter::finish`] to
/// write the final padded block.
pub struct EncryptWriter<W: Write> {
    inner: W,
    cipher: Option<Aes128CbcEnc>,
    pending: Vec<u8>,
}

impl<W: Write> EncryptWriter<W> {
    pub fn new(mut inner: W, key: Option<&CipherKey>) -> io::Result<Self> {
        let cipher = match key {
            Some(key) => {
                let salt: [u8; SALT_SIZE] = rand::random();
                inner.write_all(&salt)?;
                Some(key.stream_encryptor(&salt))
            }
            None => None,
        };

        Ok(Self {
            inner,
            cipher,
            pending: Vec::with_capacity(READ_CHUNK),
        })
    }

    /// Pad and encrypt the remaining bytes and return the inner writer
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(cipher) = self.cipher.take() {
            let tail = cipher.encrypt_padded_vec_mut::<Pkcs7>(&self.pending);
            self.inner.write_all(&tail)?;
            self.pending.clear();
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(cipher) = self.cipher.as_mut() else {
            return self.inner.write(buf);
        };

        self.pending.extend_from_slice(buf);
        let complete = self.pending.len() - self.pending.len() % BLOCK_SIZE;
        if complete > 0 {
            for block in self.pending[..complete].chunks_exact_mut(BLOCK_SIZE) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            self.inner.write_all(&self.pending[..complete])?;
            self.pending.drain(..complete);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts a stream produced by [`EncryptWriter`]. A bad final padding,
/// which is what a wrong password usually produces, is reported as
/// `InvalidData`.
pub struct DecryptReader<R: Read> {
    inner: R,
    cipher: Option<Aes128CbcDec>,
    ready: Vec<u8>,
    pos: usize,
    // Ciphertext not decrypted yet; the last block is held back until EOF
    raw: Vec<u8>,
    eof: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut inner: R, key: Option<&CipherKey>) -> io::Result<Self> {
        let cipher = match key {
            Some(key) => {
                let mut salt = [0u8; SALT_SIZE];
                inner.read_exact(&mut salt).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => invalid_data(CryptoError::Truncated),
                    _ => e,
                })?;
                Some(key.stream_decryptor(&salt))
            }
            None => None,
        };

        Ok(Self {
            inner,
            cipher,
            ready: Vec::new(),
            pos: 0,
            raw: Vec::new(),
            eof: false,
        })
    }

    fn fill(&mut self) -> io::Result<()> {
        let Some(cipher) = self.cipher.as_mut() else {
            return Ok(());
        };

        let mut chunk = vec![0u8; READ_CHUNK];
        let n = self.inner.read(&mut chunk)?;

        if n == 0 {
            self.eof = true;
            if self.raw.len() != BLOCK_SIZE {
                return Err(invalid_data(CryptoError::Truncated));
            }

            let block = GenericArray::<u8, U16>::from_mut_slice(&mut self.raw[..]);
            cipher.decrypt_block_mut(block);
            let plain = Pkcs7::unpad(block).map_err(|_| invalid_data(CryptoError::InvalidPadding))?;

            self.ready = plain.to_vec();
            self.pos = 0;
            self.raw.clear();
            return Ok(());
        }

        self.raw.extend_from_slice(&chunk[..n]);

        // Blocks followed by more data can't carry the padding
        let keep = match self.raw.len() % BLOCK_SIZE {
            0 => BLOCK_SIZE,
            rest => rest,
        };
        let take = self.raw.len().saturating_sub(keep);
        if take > 0 {
            let mut out: Vec<u8> = self.raw.drain(..take).collect();
            for block in out.chunks_exact_mut(BLOCK_SIZE) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            self.ready = out;
            self.pos = 0;
        }
        Ok(())
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cipher.is_none() {
            return self.inner.read(buf);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.pos < self.ready.len() {
                let n = buf.len().min(self.ready.len() - self.pos);
                buf[..n].copy_from_slice(&self.ready[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
        }
    }
}
