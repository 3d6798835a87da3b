//! Periodic screenshot capture.

use chrono::Local;
use crossbeam_channel::{after, select, Receiver};
use std::time::Duration;

use super::{
    CaptureError, CaptureEvent, CaptureSource, EventSink, ScreenshotEvent, SourceKind,
    SourceState, StateCell, Worker,
};
use crate::sink::Severity;

/// Platform screen capture.
pub trait ScreenGrabber: Send {
    /// Check that capture can work at all (display present, tool installed).
    fn probe(&mut self) -> Result<(), CaptureError>;

    /// Capture the primary display as PNG bytes, in memory only.
    fn grab(&mut self) -> Result<Vec<u8>, CaptureError>;
}

/// Emits one [`ScreenshotEvent`] per interval.
///
/// A failed grab is reported as recoverable and the next interval is
/// tried as usual.
pub struct ScreenshotSource {
    grabber: Option<Box<dyn ScreenGrabber>>,
    interval: Duration,
    state: StateCell,
    worker: Option<Worker<Box<dyn ScreenGrabber>>>,
}

impl ScreenshotSource {
    pub fn new(grabber: Box<dyn ScreenGrabber>, interval: Duration) -> Self {
        Self {
            grabber: Some(grabber),
            interval,
            state: StateCell::new(),
            worker: None,
        }
    }
}

impl CaptureSource for ScreenshotSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Screenshot
    }

    fn state(&self) -> SourceState {
        self.state.get()
    }

    fn start(&mut self, sink: EventSink) -> Result<(), CaptureError> {
        if self.state.get() != SourceState::Stopped || self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let Some(mut grabber) = self.grabber.take() else {
            return Err(CaptureError::Unavailable(
                "screen grabber was lost by an earlier worker".into(),
            ));
        };

        self.state.set(SourceState::Starting);
        if let Err(e) = grabber.probe() {
            self.grabber = Some(grabber);
            self.state.set(SourceState::Stopped);
            return Err(e);
        }

        let interval = self.interval;
        let state = self.state.clone();
        self.state.set(SourceState::Running);

        let worker = Worker::spawn("screenshot-capture", move |cancel| {
            run_capture_loop(&mut *grabber, interval, &sink, &cancel);
            state.set(SourceState::Stopped);
            grabber
        });

        match worker {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.state.set(SourceState::Stopped);
                Err(e)
            }
        }
    }

    fn stop(&mut self, timeout: Duration) -> Result<(), CaptureError> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        if self.state.get() != SourceState::Stopped {
            self.state.set(SourceState::Stopping);
        }

        match worker.stop(timeout) {
            Ok(returned) => {
                if let Some(grabber) = returned {
                    self.grabber = Some(grabber);
                }
                self.state.set(SourceState::Stopped);
                Ok(())
            }
            Err(e @ CaptureError::StopTimeout(_)) => {
                self.worker = Some(worker);
                Err(e)
            }
            Err(e) => {
                self.state.set(SourceState::Stopped);
                Err(e)
            }
        }
    }
}

fn run_capture_loop(
    grabber: &mut dyn ScreenGrabber,
    interval: Duration,
    sink: &EventSink,
    cancel: &Receiver<()>,
) {
    loop {
        select! {
            recv(cancel) -> _ => break,
            recv(after(interval)) -> _ => match grabber.grab() {
                Ok(image) => {
                    tracing::debug!(bytes = image.len(), "screenshot captured");
                    sink.emit(CaptureEvent::Screenshot(ScreenshotEvent::new(Local::now(), image)));
                }
                Err(e) => sink.report(
                    Severity::Recoverable,
                    SourceKind::Screenshot.name(),
                    &format!("screen capture failed: {e}"),
                ),
            },
        }
    }
}
