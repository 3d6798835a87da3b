//! Encrypted, day-partitioned storage.
//!
//! Layout under the log directory:
//!
//! ```text
//! <root>/<YYYYMMDD>/keywords.log.enc                      one base64 record per line
//! <root>/<YYYYMMDD>/Screenshots/<YYYYMMDD_HHMMSS>.png.enc raw record bytes
//! ```
//!
//! The partition is chosen from the event's own timestamp. Every record is
//! sealed before any byte of it reaches the filesystem.

pub mod reader;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Local, NaiveDate};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::collector::{CaptureEvent, KeywordEvent, ScreenshotEvent};
use crate::crypto::{CryptoError, RecordCipher};
use crate::keys::EncryptionKey;
use crate::secure_fs;

pub use reader::{decrypt_screenshot, read_keyword_log};

pub const KEYWORD_LOG_NAME: &str = "keywords.log.enc";
pub const SCREENSHOT_DIR_NAME: &str = "Screenshots";
pub const SCREENSHOT_EXTENSION: &str = "png.enc";

/// Upper bound on `_n` suffixes tried for one second's screenshots.
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Errors writing a single record. Each one costs only that record.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("no free screenshot name left for {path}")]
    NamesExhausted { path: PathBuf },

    #[error("line {line} of {path} is not a valid record: {reason}")]
    CorruptRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// One calendar day's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyPartition {
    date: NaiveDate,
    dir: PathBuf,
}

impl DailyPartition {
    pub fn for_timestamp(root: &Path, timestamp: &DateTime<Local>) -> Self {
        let date = timestamp.date_naive();
        Self {
            date,
            dir: root.join(date.format("%Y%m%d").to_string()),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keyword_log(&self) -> PathBuf {
        self.dir.join(KEYWORD_LOG_NAME)
    }

    pub fn screenshot_dir(&self) -> PathBuf {
        self.dir.join(SCREENSHOT_DIR_NAME)
    }

    /// Create the partition and its screenshot directory, owner-only.
    /// Safe to race with other writers.
    ///
    /// Directories that already existed, including the store root, are
    /// tightened back to owner-only on every call.
    pub fn ensure(&self) -> Result<(), StorageError> {
        let screenshots = self.screenshot_dir();
        let create_err = |path: &Path, source| StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        };
        secure_fs::create_private_dir_all(&screenshots)
            .map_err(|e| create_err(&screenshots, e))?;

        let dirs = self
            .dir
            .parent()
            .into_iter()
            .chain([self.dir.as_path(), screenshots.as_path()]);
        for dir in dirs {
            secure_fs::restrict_dir(dir).map_err(|e| create_err(dir, e))?;
        }
        Ok(())
    }
}

/// The open keyword log of the most recently written partition.
struct ActiveLog {
    date: NaiveDate,
    path: PathBuf,
    file: File,
}

/// Seals events and writes them into their daily partitions.
pub struct StorageEngine {
    root: PathBuf,
    cipher: RecordCipher,
    // One writer at a time for keyword appends; also holds the active
    // partition's handle so a date change swaps it.
    active: Mutex<Option<ActiveLog>>,
}

impl StorageEngine {
    pub fn new(root: impl Into<PathBuf>, key: &EncryptionKey) -> Result<Self, StorageError> {
        Ok(Self {
            root: root.into(),
            cipher: RecordCipher::new(key)?,
            active: Mutex::new(None),
        })
    }

    pub fn partition_for(&self, timestamp: &DateTime<Local>) -> DailyPartition {
        DailyPartition::for_timestamp(&self.root, timestamp)
    }

    /// Store one admitted event. Returns the file it went into.
    pub fn write(&self, event: &CaptureEvent) -> Result<PathBuf, StorageError> {
        match event {
            CaptureEvent::Keyword(run) => self.write_keyword(run),
            CaptureEvent::Screenshot(shot) => self.write_screenshot(shot),
        }
    }

    /// Append one sealed keyword line to the day's log.
    pub fn write_keyword(&self, event: &KeywordEvent) -> Result<PathBuf, StorageError> {
        let partition = self.partition_for(&event.timestamp);
        if let Err(e) = partition.ensure() {
            // The cached handle may point into a directory that is gone.
            self.active.lock().unwrap_or_else(|p| p.into_inner()).take();
            return Err(e);
        }

        let plaintext = zeroize::Zeroizing::new(format_keyword_line(event));
        let record = self.cipher.seal(plaintext.as_bytes())?;
        let mut line = STANDARD.encode(&record);
        line.push('\n');

        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        let current = match active.take() {
            Some(log) if log.date == partition.date() && log.path.exists() => log,
            _ => {
                let path = partition.keyword_log();
                let file = secure_fs::open_private_append(&path).map_err(|source| {
                    StorageError::Write {
                        path: path.clone(),
                        source,
                    }
                })?;
                tracing::debug!(partition = %partition.dir().display(), "keyword log opened");
                ActiveLog {
                    date: partition.date(),
                    path,
                    file,
                }
            }
        };

        let log = active.insert(current);
        if let Err(source) = append_line(&mut log.file, line.as_bytes()) {
            let path = log.path.clone();
            // Reopen next time rather than trust a handle that just failed.
            *active = None;
            return Err(StorageError::Write { path, source });
        }
        Ok(log.path.clone())
    }

    /// Write one sealed screenshot into a file of its own.
    pub fn write_screenshot(&self, event: &ScreenshotEvent) -> Result<PathBuf, StorageError> {
        let partition = self.partition_for(&event.timestamp);
        partition.ensure()?;

        let record = self.cipher.seal(&event.image)?;
        let dir = partition.screenshot_dir();
        let stem = event.timestamp.format("%Y%m%d_%H%M%S").to_string();
        let (path, mut file) = reserve_screenshot_name(&dir, &stem)?;

        let written = file.write_all(&record).and_then(|()| file.sync_all());
        if let Err(source) = written {
            drop(file);
            let _ = std::fs::remove_file(&path);
            return Err(StorageError::Write { path, source });
        }
        Ok(path)
    }
}

/// Canonical pre-encryption form of a keyword run.
pub fn format_keyword_line(event: &KeywordEvent) -> String {
    format!(
        "[{}] {}: \"{}\"",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event.process_name,
        event.text
    )
}

/// Append a whole line, truncating back on failure so no fragment stays.
fn append_line(file: &mut File, line: &[u8]) -> io::Result<()> {
    let start = file.metadata()?.len();
    if let Err(e) = file.write_all(line) {
        let _ = file.set_len(start);
        return Err(e);
    }
    Ok(())
}

/// Create `<stem>.png.enc`, or `<stem>_<n>.png.enc` if taken.
fn reserve_screenshot_name(dir: &Path, stem: &str) -> Result<(PathBuf, File), StorageError> {
    for n in 0..MAX_NAME_ATTEMPTS {
        let name = if n == 0 {
            format!("{stem}.{SCREENSHOT_EXTENSION}")
        } else {
            format!("{stem}_{n}.{SCREENSHOT_EXTENSION}")
        };
        let path = dir.join(name);
        match secure_fs::create_private_new(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(StorageError::Write { path, source }),
        }
    }
    Err(StorageError::NamesExhausted {
        path: dir.join(format!("{stem}.{SCREENSHOT_EXTENSION}")),
    })
}
