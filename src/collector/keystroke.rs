//! Keystroke capture.
//!
//! Key presses are grouped into runs per foreground process. A run is
//! emitted as one [`KeywordEvent`] when the foreground process changes,
//! on Enter or Tab, after `idle_flush` of silence, or when the source
//! stops. A run reaching `max_run_chars` is split at its last whitespace;
//! the unfinished word is carried into the next run, never cut. Runs that
//! are empty or whitespace only are never emitted.

use chrono::{DateTime, Local};
use crossbeam_channel::Receiver;
use std::time::{Duration, Instant};
use zeroize::Zeroize;

use super::{
    is_cancelled, CaptureError, CaptureEvent, CaptureSource, EventSink, KeyInput, KeywordEvent,
    SourceKind, SourceState, StateCell, Worker, UNKNOWN_PROCESS,
};
use crate::config::Config;
use crate::sink::Severity;

/// Longest the worker blocks on the keyboard before checking for cancel.
const POLL_SLICE: Duration = Duration::from_millis(200);

/// Platform keyboard input.
pub trait KeyInputBackend: Send {
    /// Acquire the keyboard. Fails with [`CaptureError::Unavailable`] when
    /// the device, hook or permission is missing.
    fn open(&mut self) -> Result<(), CaptureError>;

    /// Wait up to `timeout` for the next key press.
    fn next_key(&mut self, timeout: Duration) -> Result<Option<KeyInput>, CaptureError>;

    fn close(&mut self);
}

/// Resolves the process owning the focused window.
pub trait ForegroundLookup: Send {
    /// Executable name, or `None` when it cannot be determined.
    fn foreground_process(&mut self) -> Option<String>;
}

/// Run-flush thresholds.
#[derive(Debug, Clone)]
pub struct KeystrokeSettings {
    pub idle_flush: Duration,
    pub max_run_chars: usize,
}

impl From<&Config> for KeystrokeSettings {
    fn from(config: &Config) -> Self {
        Self {
            idle_flush: config.idle_flush,
            max_run_chars: config.max_run_chars,
        }
    }
}

/// Text typed into one process since the last flush.
pub(crate) struct KeyRunBuffer {
    process: String,
    text: String,
    chars: usize,
    last_input: Option<Instant>,
    // Wall-clock time of the last key, stamped on the emitted run.
    last_key_at: Option<DateTime<Local>>,
    max_chars: usize,
}

impl KeyRunBuffer {
    pub(crate) fn new(max_chars: usize) -> Self {
        Self {
            process: String::new(),
            text: String::new(),
            chars: 0,
            last_input: None,
            last_key_at: None,
            max_chars: max_chars.max(1),
        }
    }

    /// Apply one key typed into `process`. Returns the runs completed by it.
    pub(crate) fn push(&mut self, process: &str, key: KeyInput, now: Instant) -> Vec<KeywordEvent> {
        let mut completed = Vec::new();

        if self.process != process {
            completed.extend(self.flush());
            self.process.clear();
            self.process.push_str(process);
        }
        self.last_input = Some(now);
        self.last_key_at = Some(Local::now());

        match key {
            KeyInput::Char(c) if !c.is_control() => {
                self.text.push(c);
                self.chars += 1;
                if self.chars >= self.max_chars {
                    completed.extend(self.split_at_word_boundary());
                }
            }
            KeyInput::Char(_) => {}
            KeyInput::Backspace => {
                if self.text.pop().is_some() {
                    self.chars -= 1;
                }
            }
            KeyInput::Enter | KeyInput::Tab => completed.extend(self.flush()),
        }

        completed
    }

    /// Take the buffered run, if it holds anything but whitespace.
    pub(crate) fn flush(&mut self) -> Option<KeywordEvent> {
        let event = self.run_event(&self.text);
        self.last_input = None;
        self.last_key_at = None;
        self.chars = 0;
        self.text.zeroize();
        event
    }

    /// Emit everything up to the last whitespace and keep the word after it.
    /// Without any whitespace the run keeps growing until one is typed or
    /// another flush trigger fires.
    fn split_at_word_boundary(&mut self) -> Option<KeywordEvent> {
        let boundary = self.text.rfind(char::is_whitespace)?;
        let event = self.run_event(&self.text[..boundary]);

        let mut carried = self.text[boundary..].trim_start().to_string();
        self.text.zeroize();
        self.text.push_str(&carried);
        self.chars = carried.chars().count();
        carried.zeroize();
        event
    }

    fn run_event(&self, text: &str) -> Option<KeywordEvent> {
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| {
            let at = self.last_key_at.unwrap_or_else(Local::now);
            KeywordEvent::new(at, self.process.as_str(), trimmed)
        })
    }

    /// Time left before the buffered run goes idle, if anything is buffered.
    pub(crate) fn time_until_idle(&self, idle: Duration, now: Instant) -> Option<Duration> {
        if self.chars == 0 {
            return None;
        }
        self.last_input
            .map(|at| (at + idle).saturating_duration_since(now))
    }

    pub(crate) fn is_idle(&self, idle: Duration, now: Instant) -> bool {
        self.time_until_idle(idle, now)
            .is_some_and(|left| left.is_zero())
    }
}

/// Capture source turning key presses into keyword runs.
pub struct KeystrokeSource {
    backend: Option<Box<dyn KeyInputBackend>>,
    lookup: Option<Box<dyn ForegroundLookup>>,
    settings: KeystrokeSettings,
    state: StateCell,
    worker: Option<Worker<(Box<dyn KeyInputBackend>, Box<dyn ForegroundLookup>)>>,
}

impl KeystrokeSource {
    pub fn new(
        backend: Box<dyn KeyInputBackend>,
        lookup: Box<dyn ForegroundLookup>,
        settings: KeystrokeSettings,
    ) -> Self {
        Self {
            backend: Some(backend),
            lookup: Some(lookup),
            settings,
            state: StateCell::new(),
            worker: None,
        }
    }
}

impl CaptureSource for KeystrokeSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Keystroke
    }

    fn state(&self) -> SourceState {
        self.state.get()
    }

    fn start(&mut self, sink: EventSink) -> Result<(), CaptureError> {
        if self.state.get() != SourceState::Stopped || self.worker.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        let (Some(mut backend), Some(mut lookup)) = (self.backend.take(), self.lookup.take())
        else {
            return Err(CaptureError::Unavailable(
                "keyboard backend was lost by an earlier worker".into(),
            ));
        };

        self.state.set(SourceState::Starting);
        if let Err(e) = backend.open() {
            self.backend = Some(backend);
            self.lookup = Some(lookup);
            self.state.set(SourceState::Stopped);
            return Err(e);
        }

        let settings = self.settings.clone();
        let state = self.state.clone();
        self.state.set(SourceState::Running);

        let worker = Worker::spawn("keystroke-capture", move |cancel| {
            let result = run_capture_loop(&mut *backend, &mut *lookup, &settings, &sink, &cancel);
            backend.close();
            if let Err(e) = result {
                sink.report(
                    Severity::Degraded,
                    SourceKind::Keystroke.name(),
                    &format!("keyboard capture stopped: {e}"),
                );
            }
            state.set(SourceState::Stopped);
            (backend, lookup)
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
                if let Some((backend, lookup)) = returned {
                    self.backend = Some(backend);
                    self.lookup = Some(lookup);
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
    backend: &mut dyn KeyInputBackend,
    lookup: &mut dyn ForegroundLookup,
    settings: &KeystrokeSettings,
    sink: &EventSink,
    cancel: &Receiver<()>,
) -> Result<(), CaptureError> {
    let mut buffer = KeyRunBuffer::new(settings.max_run_chars);

    let outcome = loop {
        if is_cancelled(cancel) {
            break Ok(());
        }

        let wait = buffer
            .time_until_idle(settings.idle_flush, Instant::now())
            .map_or(POLL_SLICE, |left| left.min(POLL_SLICE));

        match backend.next_key(wait) {
            Ok(Some(key)) => {
                let process = lookup
                    .foreground_process()
                    .unwrap_or_else(|| UNKNOWN_PROCESS.to_string());
                for run in buffer.push(&process, key, Instant::now()) {
                    sink.emit(CaptureEvent::Keyword(run));
                }
            }
            Ok(None) => {
                if buffer.is_idle(settings.idle_flush, Instant::now()) {
                    if let Some(run) = buffer.flush() {
                        sink.emit(CaptureEvent::Keyword(run));
                    }
                }
            }
            Err(e) => break Err(e),
        }
    };

    if let Some(run) = buffer.flush() {
        sink.emit(CaptureEvent::Keyword(run));
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterEngine;
    use crate::sink::MemoryErrorSink;
    use crate::transparency::create_shared_stats;
    use crossbeam_channel::{bounded, unbounded, Sender};
    use std::sync::Arc;

    fn type_str(buffer: &mut KeyRunBuffer, process: &str, text: &str) -> Vec<KeywordEvent> {
        let now = Instant::now();
        text.chars()
            .flat_map(|c| buffer.push(process, KeyInput::Char(c), now))
            .collect()
    }

    #[test]
    fn test_enter_flushes_run() {
        let mut buffer = KeyRunBuffer::new(512);
        assert!(type_str(&mut buffer, "firefox", "hello").is_empty());
        let runs = buffer.push("firefox", KeyInput::Enter, Instant::now());
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].process_name, "firefox");
        assert_eq!(runs[0].text, "hello");
    }

    #[test]
    fn test_process_change_flushes_previous_run() {
        let mut buffer = KeyRunBuffer::new(512);
        type_str(&mut buffer, "slack", "hi");
        let runs = type_str(&mut buffer, "chrome", "x");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].process_name, "slack");
        assert_eq!(runs[0].text, "hi");

        let rest = buffer.flush().unwrap();
        assert_eq!(rest.process_name, "chrome");
        assert_eq!(rest.text, "x");
    }

    #[test]
    fn test_backspace_edits_run() {
        let mut buffer = KeyRunBuffer::new(512);
        type_str(&mut buffer, "app", "cart");
        buffer.push("app", KeyInput::Backspace, Instant::now());
        buffer.push("app", KeyInput::Backspace, Instant::now());
        type_str(&mut buffer, "app", "t");
        assert_eq!(buffer.flush().unwrap().text, "cat");

        // Backspace on an empty run is a no-op
        assert!(buffer.push("app", KeyInput::Backspace, Instant::now()).is_empty());
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_whitespace_only_run_is_discarded() {
        let mut buffer = KeyRunBuffer::new(512);
        type_str(&mut buffer, "app", "   ");
        assert!(buffer.push("app", KeyInput::Tab, Instant::now()).is_empty());
        assert!(buffer.flush().is_none());
    }

    #[test]
    fn test_max_chars_splits_at_last_whitespace() {
        let mut buffer = KeyRunBuffer::new(4);
        let runs = type_str(&mut buffer, "app", "ab cdefg");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].text, "ab");
        // No whitespace since the split, so the word keeps growing
        assert_eq!(buffer.flush().unwrap().text, "cdefg");
    }

    #[test]
    fn test_long_word_is_never_cut() {
        let mut buffer = KeyRunBuffer::new(4);
        assert!(type_str(&mut buffer, "app", "abcdefg").is_empty());
        let runs = type_str(&mut buffer, "app", " h");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].text, "abcdefg");
        assert_eq!(buffer.flush().unwrap().text, "h");
    }

    #[test]
    fn test_excluded_word_survives_length_split() {
        let filter = FilterEngine::from_lists(&[], &["password".to_string()]);
        let emitted = |typed: &str| {
            let mut buffer = KeyRunBuffer::new(512);
            let mut runs = type_str(&mut buffer, "firefox", typed);
            runs.extend(buffer.flush());
            runs
        };

        // One long word straddling the limit stays whole and is rejected
        let runs = emitted(&format!("{}password123", "a".repeat(508)));
        assert_eq!(runs.len(), 1);
        assert!(!filter.admit(&CaptureEvent::Keyword(runs[0].clone())));

        // Words before the limit go out on their own; the straddling word
        // is carried over intact
        let runs = emitted(&format!("{}password123", "word ".repeat(101)));
        assert_eq!(runs.len(), 2);
        let admitted: Vec<_> = runs
            .into_iter()
            .filter(|run| filter.admit(&CaptureEvent::Keyword(run.clone())))
            .collect();
        assert_eq!(admitted.len(), 1);
        assert!(!admitted[0].text.contains("pass"));
        assert!(!admitted[0].text.contains("word123"));
    }

    #[test]
    fn test_run_is_stamped_with_last_key_time() {
        let mut buffer = KeyRunBuffer::new(512);
        let before = Local::now();
        type_str(&mut buffer, "app", "late");
        let typed = Local::now();
        std::thread::sleep(Duration::from_millis(50));

        let run = buffer.flush().unwrap();
        assert!(run.timestamp >= before && run.timestamp <= typed);
    }

    #[test]
    fn test_idle_deadline() {
        let mut buffer = KeyRunBuffer::new(512);
        let idle = Duration::from_secs(5);
        let start = Instant::now();
        assert!(buffer.time_until_idle(idle, start).is_none());

        buffer.push("app", KeyInput::Char('a'), start);
        assert_eq!(buffer.time_until_idle(idle, start), Some(idle));
        assert!(!buffer.is_idle(idle, start + Duration::from_secs(4)));
        assert!(buffer.is_idle(idle, start + Duration::from_secs(5)));
    }

    /// Replays scripted keys, then reports silence.
    struct ScriptedKeys {
        keys: Receiver<KeyInput>,
        fail_open: bool,
    }

    impl KeyInputBackend for ScriptedKeys {
        fn open(&mut self) -> Result<(), CaptureError> {
            if self.fail_open {
                Err(CaptureError::Unavailable("no keyboard".into()))
            } else {
                Ok(())
            }
        }

        fn next_key(&mut self, timeout: Duration) -> Result<Option<KeyInput>, CaptureError> {
            Ok(self.keys.recv_timeout(timeout).ok())
        }

        fn close(&mut self) {}
    }

    struct FixedProcess(&'static str);

    impl ForegroundLookup for FixedProcess {
        fn foreground_process(&mut self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn source(fail_open: bool, idle: Duration) -> (KeystrokeSource, Sender<KeyInput>) {
        let (tx, rx) = unbounded();
        let source = KeystrokeSource::new(
            Box::new(ScriptedKeys {
                keys: rx,
                fail_open,
            }),
            Box::new(FixedProcess("firefox")),
            KeystrokeSettings {
                idle_flush: idle,
                max_run_chars: 512,
            },
        );
        (source, tx)
    }

    fn sink() -> (EventSink, Receiver<CaptureEvent>) {
        let (tx, rx) = bounded(64);
        let sink = EventSink::new(tx, create_shared_stats(), Arc::new(MemoryErrorSink::new()));
        (sink, rx)
    }

    #[test]
    fn test_unavailable_backend_stays_stopped() {
        let (mut source, _keys) = source(true, Duration::from_secs(5));
        let (sink, _rx) = sink();
        assert!(matches!(source.start(sink), Err(CaptureError::Unavailable(_))));
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(source.stop(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn test_stop_flushes_partial_run() {
        let (mut source, keys) = source(false, Duration::from_secs(60));
        let (sink, rx) = sink();
        source.start(sink).unwrap();
        assert_eq!(source.state(), SourceState::Running);
        assert!(matches!(
            source.start(self::sink().0),
            Err(CaptureError::AlreadyRunning)
        ));

        for c in "partial".chars() {
            keys.send(KeyInput::Char(c)).unwrap();
        }
        // Let the worker drain the scripted keys before cancelling.
        std::thread::sleep(Duration::from_millis(300));
        source.stop(Duration::from_secs(2)).unwrap();
        assert_eq!(source.state(), SourceState::Stopped);

        match rx.try_recv().unwrap() {
            CaptureEvent::Keyword(run) => {
                assert_eq!(run.text, "partial");
                assert_eq!(run.process_name, "firefox");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_idle_flush_emits_without_stop() {
        let (mut source, keys) = source(false, Duration::from_millis(100));
        let (sink, rx) = sink();
        source.start(sink).unwrap();

        for c in "idle".chars() {
            keys.send(KeyInput::Char(c)).unwrap();
        }
        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, CaptureEvent::Keyword(ref run) if run.text == "idle"));

        source.stop(Duration::from_secs(2)).unwrap();
    }
}
