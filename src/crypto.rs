//! Authenticated encryption of individual records.
//!
//! A record is `nonce || ciphertext || tag` under AES-256-GCM. Every call
//! to [`RecordCipher::seal`] draws a fresh random nonce, so each record
//! decrypts on its own.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::keys::EncryptionKey;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Errors sealing or opening a record.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to create cipher: {0}")]
    Cipher(String),

    #[error("nonce generation failed: {0}")]
    Nonce(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("record too short: {0} bytes")]
    Truncated(usize),

    #[error("decryption failed (wrong key or tampered record)")]
    Decrypt,
}

/// Cipher bound to the process key.
#[derive(Clone)]
pub struct RecordCipher {
    cipher: Aes256Gcm,
}

impl RecordCipher {
    pub fn new(key: &EncryptionKey) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` into a self-contained record.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| CryptoError::Nonce(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut record = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(&ciphertext);
        Ok(record)
    }

    /// Decrypt a record produced by [`seal`](Self::seal).
    pub fn open(&self, record: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if record.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(record.len()));
        }
        let (nonce_bytes, ciphertext) = record.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}
