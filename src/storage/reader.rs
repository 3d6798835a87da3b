//! Decryption of stored records for authorized review.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::path::Path;

use super::StorageError;
use crate::crypto::RecordCipher;

/// Decrypt every line of a `keywords.log.enc` file, in order.
///
/// Blank lines are skipped. The first undecodable or unauthenticated line
/// fails the whole read with its line number.
pub fn read_keyword_log(path: &Path, cipher: &RecordCipher) -> Result<Vec<String>, StorageError> {
    let content = std::fs::read_to_string(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let corrupt = |line: usize, reason: String| StorageError::CorruptRecord {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut lines = Vec::new();
    for (index, encoded) in content.lines().enumerate() {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            continue;
        }
        let record = STANDARD
            .decode(encoded)
            .map_err(|e| corrupt(index + 1, e.to_string()))?;
        let plaintext = cipher
            .open(&record)
            .map_err(|e| corrupt(index + 1, e.to_string()))?;
        let text = String::from_utf8(plaintext)
            .map_err(|_| corrupt(index + 1, "plaintext is not UTF-8".into()))?;
        lines.push(text);
    }
    Ok(lines)
}

/// Decrypt one `.png.enc` file back to its image bytes.
pub fn decrypt_screenshot(path: &Path, cipher: &RecordCipher) -> Result<Vec<u8>, StorageError> {
    let record = std::fs::read(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    cipher.open(&record).map_err(StorageError::from)
}
