//! Encryption key acquisition.
//!
//! The key file holds one line: URL-safe base64 of 32 random bytes. It is
//! read if present, otherwise generated once and written owner-only. Any
//! failure here is fatal to startup.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::secure_fs;

/// Length of the symmetric key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Symmetric key material. Wiped on drop; never printed.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate fresh key material from the OS CSPRNG.
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| KeyError::Rng(e.to_string()))?;
        let key = Self(bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Decode the key-file text form.
    pub fn decode(text: &str) -> Result<Self, KeyError> {
        let decoded = Zeroizing::new(
            URL_SAFE
                .decode(text.trim())
                .map_err(|e| KeyError::Encoding(e.to_string()))?,
        );
        if decoded.len() != KEY_LEN {
            return Err(KeyError::InvalidLength {
                expected: KEY_LEN,
                actual: decoded.len(),
            });
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self(bytes))
    }

    /// Encode to the key-file text form.
    pub fn encode(&self) -> Zeroizing<String> {
        Zeroizing::new(URL_SAFE.encode(self.0))
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Errors acquiring or loading the key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read key file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write key file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to create key directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("key file is not valid base64: {0}")]
    Encoding(String),

    #[error("key has wrong length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("random number generator failed: {0}")]
    Rng(String),
}

/// Owns the key file path and the key loaded from it for the life of the
/// process.
#[derive(Debug)]
pub struct KeyManager {
    path: PathBuf,
    key: Arc<EncryptionKey>,
}

impl KeyManager {
    /// Load the key at `path`, generating and persisting one on first run.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let path = path.into();
        let key = if path.exists() {
            tracing::debug!(path = %path.display(), "loading existing encryption key");
            load_key(&path)?
        } else {
            generate_key_file(&path)?
        };
        Ok(Self {
            path,
            key: Arc::new(key),
        })
    }

    pub fn key(&self) -> Arc<EncryptionKey> {
        Arc::clone(&self.key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read and validate an existing key file without ever creating one.
pub fn load_key(path: &Path) -> Result<EncryptionKey, KeyError> {
    let text = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.to_path_buf(),
        source,
    })?);
    EncryptionKey::decode(&text)
}

fn generate_key_file(path: &Path) -> Result<EncryptionKey, KeyError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            secure_fs::create_private_dir_all(parent).map_err(|source| KeyError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    let key = EncryptionKey::generate()?;
    let write_err = |source: io::Error| KeyError::Write {
        path: path.to_path_buf(),
        source,
    };

    // The key is written in full beside the target and then linked into
    // place, so `path` never exists half-written.
    let staging = staging_path(path);
    let linked =
        write_staged_key(&staging, &key).and_then(|()| std::fs::hard_link(&staging, path));
    let _ = std::fs::remove_file(&staging);
    match linked {
        Ok(()) => {}
        // Another process won the race; use its key.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return load_key(path),
        Err(e) => return Err(write_err(e)),
    }

    tracing::info!(path = %path.display(), "generated new encryption key");
    Ok(key)
}

/// Hidden, uniquely named sibling of the key file.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "encryption.key".into());
    path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()))
}

fn write_staged_key(staging: &Path, key: &EncryptionKey) -> io::Result<()> {
    let mut file = secure_fs::create_private_new(staging)?;
    let encoded = key.encode();
    file.write_all(encoded.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}
