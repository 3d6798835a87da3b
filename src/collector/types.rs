//! Capture event types.
//!
//! Events hold typed text and image bytes in memory only, between capture
//! and encryption. Their `Debug` output never includes that content.

use chrono::{DateTime, Local};
use std::fmt;

/// Process tag used when the foreground process cannot be resolved.
pub const UNKNOWN_PROCESS: &str = "unknown";

/// A run of text typed into one foreground process.
#[derive(Clone, PartialEq, Eq)]
pub struct KeywordEvent {
    /// When the run was flushed
    pub timestamp: DateTime<Local>,
    /// Foreground process the text was typed into
    pub process_name: String,
    pub text: String,
}

impl KeywordEvent {
    pub fn new(
        timestamp: DateTime<Local>,
        process_name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            process_name: process_name.into(),
            text: text.into(),
        }
    }
}

impl fmt::Debug for KeywordEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeywordEvent")
            .field("timestamp", &self.timestamp)
            .field("process_name", &self.process_name)
            .field("text_chars", &self.text.chars().count())
            .finish()
    }
}

/// One full-screen image.
#[derive(Clone, PartialEq, Eq)]
pub struct ScreenshotEvent {
    pub timestamp: DateTime<Local>,
    /// Encoded image (PNG)
    pub image: Vec<u8>,
}

impl ScreenshotEvent {
    pub fn new(timestamp: DateTime<Local>, image: Vec<u8>) -> Self {
        Self { timestamp, image }
    }
}

impl fmt::Debug for ScreenshotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenshotEvent")
            .field("timestamp", &self.timestamp)
            .field("image_bytes", &self.image.len())
            .finish()
    }
}

/// Unified event type produced by capture sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Keyword(KeywordEvent),
    Screenshot(ScreenshotEvent),
}

impl CaptureEvent {
    pub fn kind(&self) -> SourceKind {
        match self {
            CaptureEvent::Keyword(_) => SourceKind::Keystroke,
            CaptureEvent::Screenshot(_) => SourceKind::Screenshot,
        }
    }
}

/// Which signal a source captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Keystroke,
    Screenshot,
}

impl SourceKind {
    pub fn name(&self) -> &'static str {
        match self {
            SourceKind::Keystroke => "keystroke",
            SourceKind::Screenshot => "screenshot",
        }
    }
}

/// A decoded key press from a platform keyboard backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyInput {
    Char(char),
    Backspace,
    Enter,
    Tab,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_content() {
        let event = CaptureEvent::Keyword(KeywordEvent::new(Local::now(), "firefox", "hunter2"));
        let shown = format!("{event:?}");
        assert!(shown.contains("firefox"));
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("text_chars: 7"));

        let shot = CaptureEvent::Screenshot(ScreenshotEvent::new(Local::now(), vec![1, 2, 3]));
        assert!(format!("{shot:?}").contains("image_bytes: 3"));
    }

    #[test]
    fn test_kind() {
        let event = CaptureEvent::Screenshot(ScreenshotEvent::new(Local::now(), Vec::new()));
        assert_eq!(event.kind(), SourceKind::Screenshot);
        assert_eq!(SourceKind::Keystroke.name(), "keystroke");
    }
}
