//! Capture lifecycle.
//!
//! [`Pipeline::start`] checks consent, acquires the key, starts a writer
//! thread that filters and stores events, and then starts every capture
//! source. The returned [`Handle`] blocks until shutdown is requested and
//! stops everything within a bounded time.

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::collector::{
    CaptureError, CaptureEvent, CaptureSource, EventSink, Platform, SourceKind, Worker,
};
use crate::config::{Config, ConfigError};
use crate::filter::{FilterDecision, FilterEngine};
use crate::keys::{KeyError, KeyManager};
use crate::sink::{Severity, SharedErrorSink};
use crate::storage::{StorageEngine, StorageError};
use crate::transparency::{
    create_shared_stats, create_shared_stats_with_persistence, CaptureStatsSnapshot,
    SharedCaptureStats,
};

/// Events buffered between the sources and the writer.
const QUEUE_CAPACITY: usize = 1024;

const COMPONENT: &str = "pipeline";

/// Conditions that abort startup before any capture begins.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("EULA not accepted; set eula_accepted to true in the configuration to enable monitoring")]
    ConsentNotGiven,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("encryption key unavailable: {0}")]
    Key(#[from] KeyError),

    #[error("cannot initialise storage: {0}")]
    Storage(StorageError),

    #[error("failed to start writer: {0}")]
    Writer(CaptureError),

    #[error("no capture source could be started")]
    NoActiveSources,
}

/// Cross-thread shutdown request.
///
/// Firing drops the only sender, which wakes every waiter at once.
#[derive(Clone)]
pub struct ShutdownSignal {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    fired: Receiver<()>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            fired: rx,
        }
    }

    /// Request shutdown. Safe to call any number of times from any thread.
    pub fn trigger(&self) {
        self.trigger
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.fired.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn wait(&self) {
        let _ = self.fired.recv();
    }

    /// Wait up to `timeout`; true if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.fired.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened during [`Handle::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// False if an earlier call already shut the pipeline down
    pub performed: bool,
    /// Sources that did not stop within the bound
    pub sources_timed_out: Vec<SourceKind>,
    /// True if queued writes did not finish within the bound
    pub writer_timed_out: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.sources_timed_out.is_empty() && !self.writer_timed_out
    }
}

/// Entry point for starting capture.
pub struct Pipeline;

impl Pipeline {
    /// Start capture with the backends for the current platform.
    pub fn start(config: &Config, errors: SharedErrorSink) -> Result<Handle, FatalError> {
        check_consent(config, &errors)?;
        let sources = match Platform::detect() {
            Some(platform) => {
                tracing::info!(platform = platform.name(), "selecting capture backends");
                platform.sources(config)
            }
            None => Vec::new(),
        };
        Self::start_with(config, errors, sources)
    }

    /// Start capture with caller-provided sources.
    pub fn start_with(
        config: &Config,
        errors: SharedErrorSink,
        sources: Vec<Box<dyn CaptureSource>>,
    ) -> Result<Handle, FatalError> {
        check_consent(config, &errors)?;
        config.validate().map_err(|e| fatal(&errors, e.into()))?;
        errors.report(Severity::Info, COMPONENT, "EULA accepted; starting capture");

        let keys =
            KeyManager::acquire(&config.encryption_key_file).map_err(|e| fatal(&errors, e.into()))?;
        let storage = StorageEngine::new(&config.log_directory, &keys.key())
            .map_err(|e| fatal(&errors, FatalError::Storage(e)))?;
        let filter = FilterEngine::new(config);
        let stats = match config.stats_file {
            Some(ref path) => create_shared_stats_with_persistence(path.clone()),
            None => create_shared_stats(),
        };

        let (events_tx, events_rx) = bounded(QUEUE_CAPACITY);
        let writer = {
            let writer_errors = errors.clone();
            let writer_stats = stats.clone();
            Worker::spawn("record-writer", move |cancel| {
                run_writer(
                    &events_rx,
                    &cancel,
                    &filter,
                    &storage,
                    &writer_stats,
                    &writer_errors,
                )
            })
            .map_err(|e| fatal(&errors, FatalError::Writer(e)))?
        };

        let sink = EventSink::new(events_tx, stats.clone(), errors.clone());
        let mut running = Vec::new();
        let mut active = Vec::new();
        for mut source in sources {
            let kind = source.kind();
            match source.start(sink.clone()) {
                Ok(()) => {
                    errors.report(Severity::Info, kind.name(), "capture started");
                    active.push(kind);
                    running.push(source);
                }
                Err(e) => {
                    errors.report(
                        Severity::Degraded,
                        kind.name(),
                        &format!("capture disabled: {e}"),
                    );
                }
            }
        }
        drop(sink);

        let inner = Arc::new(HandleInner {
            signal: ShutdownSignal::new(),
            running: Mutex::new(Some(Running {
                sources: running,
                writer,
            })),
            stats,
            errors: errors.clone(),
            active_sources: active,
            shutdown_timeout: config.shutdown_timeout,
            log_directory: config.log_directory.clone(),
        });

        if inner.active_sources.is_empty() {
            inner.stop(config.shutdown_timeout);
            return Err(fatal(&errors, FatalError::NoActiveSources));
        }

        Ok(Handle { inner })
    }
}

fn check_consent(config: &Config, errors: &SharedErrorSink) -> Result<(), FatalError> {
    if config.eula_accepted {
        Ok(())
    } else {
        Err(fatal(errors, FatalError::ConsentNotGiven))
    }
}

fn fatal(errors: &SharedErrorSink, error: FatalError) -> FatalError {
    errors.report(Severity::Fatal, COMPONENT, &error.to_string());
    error
}

/// Filter and store events until cancelled, then drain what is queued.
fn run_writer(
    events: &Receiver<CaptureEvent>,
    cancel: &Receiver<()>,
    filter: &FilterEngine,
    storage: &StorageEngine,
    stats: &SharedCaptureStats,
    errors: &SharedErrorSink,
) {
    let process = |event: CaptureEvent| {
        let kind = event.kind();
        match filter.decide(&event) {
            FilterDecision::Admit => stats.record_admitted(),
            decision => {
                tracing::debug!(kind = kind.name(), ?decision, "event rejected by filter");
                stats.record_rejected();
                return;
            }
        }
        match storage.write(&event) {
            Ok(path) => {
                tracing::debug!(kind = kind.name(), path = %path.display(), "record stored");
                stats.record_written();
            }
            Err(e) => {
                stats.record_failed();
                errors.report(
                    Severity::Recoverable,
                    "storage",
                    &format!("{} record dropped: {e}", kind.name()),
                );
            }
        }
    };

    loop {
        select! {
            recv(events) -> msg => match msg {
                Ok(event) => process(event),
                Err(_) => break,
            },
            recv(cancel) -> _ => {
                while let Ok(event) = events.try_recv() {
                    process(event);
                }
                break;
            }
        }
    }
}

struct Running {
    sources: Vec<Box<dyn CaptureSource>>,
    writer: Worker<()>,
}

struct HandleInner {
    signal: ShutdownSignal,
    running: Mutex<Option<Running>>,
    stats: SharedCaptureStats,
    errors: SharedErrorSink,
    active_sources: Vec<SourceKind>,
    shutdown_timeout: Duration,
    log_directory: PathBuf,
}

impl HandleInner {
    fn stop(&self, timeout: Duration) -> ShutdownReport {
        self.signal.trigger();
        let Some(mut running) = self
            .running
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        else {
            return ShutdownReport::default();
        };

        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport {
            performed: true,
            ..ShutdownReport::default()
        };

        // Sources first, so their final flushes reach the queue.
        for source in running.sources.iter_mut() {
            let kind = source.kind();
            if let Err(e) = source.stop(deadline.saturating_duration_since(Instant::now())) {
                self.errors.report(
                    Severity::Degraded,
                    kind.name(),
                    &format!("did not stop cleanly: {e}"),
                );
                report.sources_timed_out.push(kind);
            }
        }

        if let Err(e) = running
            .writer
            .stop(deadline.saturating_duration_since(Instant::now()))
        {
            self.errors.report(
                Severity::Degraded,
                "storage",
                &format!("queued records not written before exit: {e}"),
            );
            report.writer_timed_out = true;
        }

        if let Err(e) = self.stats.save() {
            tracing::warn!("could not save capture stats: {e}");
        }

        let snapshot = self.stats.stats();
        self.errors.report(
            Severity::Info,
            COMPONENT,
            &format!(
                "capture stopped ({} records written, {} rejected, {} failed, {} dropped)",
                snapshot.records_written,
                snapshot.events_rejected,
                snapshot.records_failed,
                snapshot.events_dropped
            ),
        );
        report
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.stop(self.shutdown_timeout);
    }
}

/// A running pipeline. Clones share the same pipeline.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl Handle {
    /// Signal that requests shutdown; hand it to a Ctrl+C handler.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.inner.signal.clone()
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) {
        self.inner.signal.wait();
    }

    /// Stop every source, flush buffered runs, and wait at most `timeout`
    /// for queued records to be written. Later calls return at once.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.inner.stop(timeout)
    }

    /// Shut down with the configured timeout.
    pub fn shutdown_default(&self) -> ShutdownReport {
        self.inner.stop(self.inner.shutdown_timeout)
    }

    pub fn active_sources(&self) -> &[SourceKind] {
        &self.inner.active_sources
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.inner.stats.stats()
    }

    pub fn log_directory(&self) -> &std::path::Path {
        &self.inner.log_directory
    }
}
