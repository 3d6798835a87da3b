//! Event collection module for the parental monitor.
//!
//! A [`CaptureSource`] produces [`CaptureEvent`]s into an [`EventSink`].
//! Two sources exist, keystrokes and screenshots, each driven by
//! platform backends chosen once at startup through [`Platform`].

pub mod keystroke;
pub mod screenshot;
pub mod types;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "windows")]
pub mod windows;

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError,
};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::sink::{Severity, SharedErrorSink};
use crate::transparency::SharedCaptureStats;

// Re-export commonly used types
pub use keystroke::{ForegroundLookup, KeyInputBackend, KeystrokeSettings, KeystrokeSource};
pub use screenshot::{ScreenGrabber, ScreenshotSource};
pub use types::{
    CaptureEvent, KeyInput, KeywordEvent, ScreenshotEvent, SourceKind, UNKNOWN_PROCESS,
};

/// How long a source waits on a full queue before dropping an event.
const EMIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Errors that can occur during event collection.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture source is already running")]
    AlreadyRunning,

    /// A platform tool, device or permission is missing. The source is
    /// disabled but the pipeline keeps going.
    #[error("capture unavailable: {0}")]
    Unavailable(String),

    #[error("capture backend failed: {0}")]
    Backend(String),

    #[error("capture worker did not stop within {0:?}")]
    StopTimeout(Duration),
}

/// Lifecycle of a capture source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Shared, lock-free holder for a [`SourceState`].
#[derive(Debug, Clone)]
pub(crate) struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SourceState::Stopped as u8)))
    }

    pub(crate) fn get(&self) -> SourceState {
        match self.0.load(Ordering::SeqCst) {
            1 => SourceState::Starting,
            2 => SourceState::Running,
            3 => SourceState::Stopping,
            _ => SourceState::Stopped,
        }
    }

    pub(crate) fn set(&self, state: SourceState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Capability shared by every capture source.
pub trait CaptureSource: Send {
    fn kind(&self) -> SourceKind;

    fn state(&self) -> SourceState;

    /// Begin producing events into `sink`.
    ///
    /// Returns [`CaptureError::Unavailable`] and stays `Stopped` when the
    /// platform cannot support this source.
    fn start(&mut self, sink: EventSink) -> Result<(), CaptureError>;

    /// Cancel the worker, flush anything buffered into the sink, and wait
    /// at most `timeout` for it to exit. Calling it again is harmless.
    fn stop(&mut self, timeout: Duration) -> Result<(), CaptureError>;
}

/// Where sources deliver events. Cheap to clone; one clone per worker.
#[derive(Clone)]
pub struct EventSink {
    sender: Sender<CaptureEvent>,
    stats: SharedCaptureStats,
    errors: SharedErrorSink,
}

impl EventSink {
    pub fn new(
        sender: Sender<CaptureEvent>,
        stats: SharedCaptureStats,
        errors: SharedErrorSink,
    ) -> Self {
        Self {
            sender,
            stats,
            errors,
        }
    }

    /// Hand an event to the pipeline. Returns false if it was dropped.
    pub fn emit(&self, event: CaptureEvent) -> bool {
        let kind = event.kind();
        self.stats.record_captured(kind);

        match self.sender.send_timeout(event, EMIT_TIMEOUT) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.record_dropped();
                self.errors.report(
                    Severity::Recoverable,
                    kind.name(),
                    "event queue full; event dropped",
                );
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                self.stats.record_dropped();
                false
            }
        }
    }

    /// Report a condition on behalf of a source. Never pass captured
    /// content here.
    pub fn report(&self, severity: Severity, component: &str, message: &str) {
        self.errors.report(severity, component, message);
    }
}

/// A background thread with a cancellation channel and a bounded join.
///
/// Cancellation is signalled by dropping the sender half, so a worker
/// blocked in `select!` wakes immediately.
pub(crate) struct Worker<T> {
    cancel: Option<Sender<()>>,
    done: Receiver<()>,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    pub(crate) fn spawn<F>(name: &str, body: F) -> Result<Self, CaptureError>
    where
        F: FnOnce(Receiver<()>) -> T + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let (done_tx, done_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // Disconnects `done` when the body returns or unwinds.
                let _done = done_tx;
                body(cancel_rx)
            })
            .map_err(|e| CaptureError::Backend(format!("failed to spawn {name} thread: {e}")))?;

        Ok(Self {
            cancel: Some(cancel_tx),
            done: done_rx,
            handle: Some(handle),
        })
    }

    /// Signal cancellation and wait up to `timeout` for the thread to
    /// finish. On timeout the worker is kept so a later call can retry.
    pub(crate) fn stop(&mut self, timeout: Duration) -> Result<Option<T>, CaptureError> {
        self.cancel.take();
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };

        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => handle
                .join()
                .map(Some)
                .map_err(|_| CaptureError::Backend("capture worker panicked".into())),
            Err(RecvTimeoutError::Timeout) => {
                self.handle = Some(handle);
                Err(CaptureError::StopTimeout(timeout))
            }
        }
    }
}

/// True once the worker's cancel sender has been dropped.
pub(crate) fn is_cancelled(cancel: &Receiver<()>) -> bool {
    matches!(cancel.try_recv(), Err(TryRecvError::Disconnected))
}

/// The platforms with capture backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// evdev keyboard, xdotool foreground lookup, stdout screenshot tools
    Linux,
    /// Low-level keyboard hook, Win32 foreground lookup, GDI screen capture
    Windows,
}

impl Platform {
    /// The platform this binary was built for, if it has backends.
    pub fn detect() -> Option<Self> {
        if cfg!(target_os = "linux") {
            Some(Platform::Linux)
        } else if cfg!(target_os = "windows") {
            Some(Platform::Windows)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        }
    }

    /// Build the keystroke and screenshot sources for this platform.
    ///
    /// Returns nothing for a platform that was not compiled in.
    pub fn sources(&self, config: &Config) -> Vec<Box<dyn CaptureSource>> {
        match self {
            #[cfg(target_os = "linux")]
            Platform::Linux => linux::sources(config),
            #[cfg(target_os = "windows")]
            Platform::Windows => windows::sources(config),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = config;
                Vec::new()
            }
        }
    }
}
