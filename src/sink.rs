//! Error and event reporting outside the encrypted store.
//!
//! Reports carry a severity, the reporting component, and a message that
//! must never contain captured content.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::secure_fs;

/// How bad a reported condition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Lifecycle notice, nothing wrong
    Info,
    /// One record was dropped; the pipeline continues
    Recoverable,
    /// A feature is disabled; the pipeline continues
    Degraded,
    /// Startup aborted
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Recoverable => "RECOVERABLE",
            Severity::Degraded => "DEGRADED",
            Severity::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for error and lifecycle reports. Shared by every worker.
pub trait ErrorSink: Send + Sync {
    fn report(&self, severity: Severity, component: &str, message: &str);
}

pub type SharedErrorSink = Arc<dyn ErrorSink>;

/// Append-only plaintext log file, one line per report.
pub struct FileErrorSink {
    path: PathBuf,
    file: Mutex<File>,
    run_id: Uuid,
}

impl FileErrorSink {
    /// Open (or create, 0600) the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            secure_fs::create_private_dir_all(parent)?;
        }
        let file = secure_fs::open_private_append(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            run_id: Uuid::new_v4(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifier stamped on every line written during this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn format_line(&self, severity: Severity, component: &str, message: &str) -> String {
        format!(
            "[{}] {} {}: {} (run={})\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            severity,
            component,
            message.replace('\n', " "),
            self.run_id
        )
    }
}

impl ErrorSink for FileErrorSink {
    fn report(&self, severity: Severity, component: &str, message: &str) {
        trace_report(severity, component, message);

        let line = self.format_line(severity, component, message);
        let mut file = self.file.lock().unwrap_or_else(|p| p.into_inner());
        if let Err(e) = file.write_all(line.as_bytes()) {
            eprintln!(
                "Could not write to error log at {}: {e}. Original report: {}",
                self.path.display(),
                line.trim_end()
            );
        }
    }
}

/// Mirror a report on the console diagnostics stream.
pub fn trace_report(severity: Severity, component: &str, message: &str) {
    match severity {
        Severity::Info => tracing::info!(component, "{message}"),
        Severity::Recoverable | Severity::Degraded => {
            tracing::warn!(component, severity = %severity, "{message}")
        }
        Severity::Fatal => tracing::error!(component, "{message}"),
    }
}

/// One captured report, as held by [`MemoryErrorSink`].
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub component: String,
    pub message: String,
}

/// In-memory sink for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    entries: Mutex<Vec<ErrorReport>>,
}

impl MemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ErrorReport> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Reports at `severity` from `component`.
    pub fn matching(&self, severity: Severity, component: &str) -> Vec<ErrorReport> {
        self.entries()
            .into_iter()
            .filter(|r| r.severity == severity && r.component == component)
            .collect()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, severity: Severity, component: &str, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(ErrorReport {
                timestamp: Local::now(),
                severity,
                component: component.to_string(),
                message: message.to_string(),
            });
    }
}
