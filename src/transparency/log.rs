//! Capture counters for the status report.
//!
//! Only counts are kept here: how many events each source produced and
//! what became of them. Nothing typed or seen on screen is recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::collector::SourceKind;
use crate::secure_fs;

/// Capture statistics, cumulative across runs when persisted.
#[derive(Debug)]
pub struct CaptureStats {
    /// Keyword runs emitted by the keystroke source
    keyword_events: AtomicU64,
    /// Screenshots emitted by the screenshot source
    screenshot_events: AtomicU64,
    /// Events that passed the filter
    events_admitted: AtomicU64,
    /// Events the filter discarded
    events_rejected: AtomicU64,
    /// Encrypted records on disk
    records_written: AtomicU64,
    /// Records lost to encryption or I/O failures
    records_failed: AtomicU64,
    /// Events lost to a full or closed queue
    events_dropped: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            keyword_events: AtomicU64::new(0),
            screenshot_events: AtomicU64::new(0),
            events_admitted: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats that load from and save to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!("could not load previous capture stats: {e}");
        }

        stats
    }

    pub fn record_captured(&self, kind: SourceKind) {
        let counter = match kind {
            SourceKind::Keystroke => &self.keyword_events,
            SourceKind::Screenshot => &self.screenshot_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.events_admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.records_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            keyword_events: self.keyword_events.load(Ordering::Relaxed),
            screenshot_events: self.screenshot_events.load(Ordering::Relaxed),
            events_admitted: self.events_admitted.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        self.stats().summary()
    }

    /// Save counters to disk (0600).
    pub fn save(&self) -> Result<(), std::io::Error> {
        let Some(ref path) = self.persist_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            secure_fs::create_private_dir_all(parent)?;
        }

        let stats = self.stats();
        let persisted = PersistedStats {
            keyword_events: stats.keyword_events,
            screenshot_events: stats.screenshot_events,
            events_admitted: stats.events_admitted,
            events_rejected: stats.events_rejected,
            records_written: stats.records_written,
            records_failed: stats.records_failed,
            events_dropped: stats.events_dropped,
            last_updated: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&persisted)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        let mut file = secure_fs::open_private_truncate(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(persisted) = read_persisted(path)? {
                self.keyword_events
                    .store(persisted.keyword_events, Ordering::Relaxed);
                self.screenshot_events
                    .store(persisted.screenshot_events, Ordering::Relaxed);
                self.events_admitted
                    .store(persisted.events_admitted, Ordering::Relaxed);
                self.events_rejected
                    .store(persisted.events_rejected, Ordering::Relaxed);
                self.records_written
                    .store(persisted.records_written, Ordering::Relaxed);
                self.records_failed
                    .store(persisted.records_failed, Ordering::Relaxed);
                self.events_dropped
                    .store(persisted.events_dropped, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatsSnapshot {
    pub keyword_events: u64,
    pub screenshot_events: u64,
    pub events_admitted: u64,
    pub events_rejected: u64,
    pub records_written: u64,
    pub records_failed: u64,
    pub events_dropped: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

impl CaptureStatsSnapshot {
    pub fn summary(&self) -> String {
        format!(
            "Capture Statistics:\n\
             - Keyword runs captured: {}\n\
             - Screenshots captured: {}\n\
             - Events admitted by filter: {}\n\
             - Events rejected by filter: {}\n\
             - Encrypted records written: {}\n\
             - Records lost to write errors: {}\n\
             - Events dropped (queue full): {}\n\
             - Session duration: {} seconds\n\
             \n\
             Storage Guarantee:\n\
             - Records are encrypted before they reach disk\n\
             - Nothing is sent over the network",
            self.keyword_events,
            self.screenshot_events,
            self.events_admitted,
            self.events_rejected,
            self.records_written,
            self.records_failed,
            self.events_dropped,
            self.session_duration_secs
        )
    }
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    #[serde(default)]
    pub keyword_events: u64,
    #[serde(default)]
    pub screenshot_events: u64,
    #[serde(default)]
    pub events_admitted: u64,
    #[serde(default)]
    pub events_rejected: u64,
    #[serde(default)]
    pub records_written: u64,
    #[serde(default)]
    pub records_failed: u64,
    #[serde(default)]
    pub events_dropped: u64,
    pub last_updated: DateTime<Utc>,
}

/// Read a stats file written by [`CaptureStats::save`], if it exists.
pub fn read_persisted(path: &Path) -> Result<Option<PersistedStats>, std::io::Error> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
}

/// Thread-safe shared capture stats.
pub type SharedCaptureStats = Arc<CaptureStats>;

pub fn create_shared_stats() -> SharedCaptureStats {
    Arc::new(CaptureStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedCaptureStats {
    Arc::new(CaptureStats::with_persistence(path))
}
