//! Integration tests for the capture pipeline, driven by scripted backends.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parental_monitor::collector::{
    CaptureError, CaptureSource, EventSink, ForegroundLookup, KeyInput, KeyInputBackend,
    KeystrokeSettings, KeystrokeSource, ScreenGrabber, ScreenshotSource, SourceKind, SourceState,
};
use parental_monitor::storage::{
    decrypt_screenshot, read_keyword_log, KEYWORD_LOG_NAME, SCREENSHOT_DIR_NAME,
};
use parental_monitor::transparency::read_persisted;
use parental_monitor::{
    load_key, Config, FatalError, MemoryErrorSink, Pipeline, RecordCipher, Severity,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Keys tagged with the process they are typed into.
struct ScriptedKeyboard {
    keys: Receiver<(String, KeyInput)>,
    focus: Arc<Mutex<String>>,
}

impl KeyInputBackend for ScriptedKeyboard {
    fn open(&mut self) -> Result<(), CaptureError> {
        Ok(())
    }

    fn next_key(&mut self, timeout: Duration) -> Result<Option<KeyInput>, CaptureError> {
        match self.keys.recv_timeout(timeout) {
            Ok((process, key)) => {
                *self.focus.lock().unwrap() = process;
                Ok(Some(key))
            }
            Err(_) => Ok(None),
        }
    }

    fn close(&mut self) {}
}

struct ScriptedFocus(Arc<Mutex<String>>);

impl ForegroundLookup for ScriptedFocus {
    fn foreground_process(&mut self) -> Option<String> {
        Some(self.0.lock().unwrap().clone())
    }
}

struct Typist {
    keys: Sender<(String, KeyInput)>,
}

impl Typist {
    fn type_line(&self, process: &str, text: &str) {
        for c in text.chars() {
            self.key(process, KeyInput::Char(c));
        }
        self.key(process, KeyInput::Enter);
    }

    fn key(&self, process: &str, key: KeyInput) {
        self.keys.send((process.to_string(), key)).unwrap();
    }

    /// Wait until the source has consumed every scripted key.
    fn drained(&self) {
        wait_until(|| self.keys.is_empty());
        thread::sleep(Duration::from_millis(100));
    }
}

fn keystroke_source(config: &Config) -> (Box<dyn CaptureSource>, Typist) {
    let (tx, rx) = unbounded();
    let focus = Arc::new(Mutex::new(String::new()));
    let source = KeystrokeSource::new(
        Box::new(ScriptedKeyboard {
            keys: rx,
            focus: focus.clone(),
        }),
        Box::new(ScriptedFocus(focus)),
        KeystrokeSettings::from(config),
    );
    (Box::new(source), Typist { keys: tx })
}

struct FakeScreen {
    available: bool,
}

impl ScreenGrabber for FakeScreen {
    fn probe(&mut self) -> Result<(), CaptureError> {
        if self.available {
            Ok(())
        } else {
            Err(CaptureError::Unavailable("screenshot tool missing".into()))
        }
    }

    fn grab(&mut self) -> Result<Vec<u8>, CaptureError> {
        Ok(b"\x89PNG\r\n\x1a\nfake image".to_vec())
    }
}

fn screenshot_source(available: bool, interval: Duration) -> Box<dyn CaptureSource> {
    Box::new(ScreenshotSource::new(
        Box::new(FakeScreen { available }),
        interval,
    ))
}

/// Records whether it was ever started; optionally never stops in time.
struct SpySource {
    kind: SourceKind,
    started: Arc<AtomicBool>,
    stop_times_out: bool,
}

impl SpySource {
    fn new(started: &Arc<AtomicBool>) -> Self {
        Self {
            kind: SourceKind::Keystroke,
            started: started.clone(),
            stop_times_out: false,
        }
    }
}

impl CaptureSource for SpySource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn state(&self) -> SourceState {
        SourceState::Stopped
    }

    fn start(&mut self, _sink: EventSink) -> Result<(), CaptureError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self, timeout: Duration) -> Result<(), CaptureError> {
        if self.stop_times_out {
            thread::sleep(timeout.min(Duration::from_millis(200)));
            return Err(CaptureError::StopTimeout(timeout));
        }
        Ok(())
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        log_directory: root.join("data"),
        encryption_key_file: root.join("keys").join("encryption.key"),
        error_log_file: Some(root.join("error.log")),
        stats_file: None,
        include_processes: Vec::new(),
        exclude_words: vec!["secret".into()],
        eula_accepted: true,
        idle_flush: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(10));
    }
}

fn cipher(config: &Config) -> RecordCipher {
    RecordCipher::new(&load_key(&config.encryption_key_file).unwrap()).unwrap()
}

fn partitions(config: &Config) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(&config.log_directory) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries.map(|e| e.unwrap().path()).collect();
    dirs.sort();
    dirs
}

/// Every decrypted keyword line across all partitions.
fn stored_keywords(config: &Config) -> Vec<String> {
    let cipher = cipher(config);
    partitions(config)
        .into_iter()
        .map(|dir| dir.join(KEYWORD_LOG_NAME))
        .filter(|log| log.exists())
        .flat_map(|log| read_keyword_log(&log, &cipher).unwrap())
        .collect()
}

#[test]
fn test_consent_gate_blocks_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        eula_accepted: false,
        ..test_config(tmp.path())
    };
    let errors = Arc::new(MemoryErrorSink::new());
    let started = Arc::new(AtomicBool::new(false));

    let result = Pipeline::start_with(
        &config,
        errors.clone(),
        vec![Box::new(SpySource::new(&started))],
    );

    assert!(matches!(result, Err(FatalError::ConsentNotGiven)));
    assert!(!started.load(Ordering::SeqCst));
    assert!(!config.log_directory.exists());
    assert!(!config.encryption_key_file.exists());
    assert_eq!(errors.matching(Severity::Fatal, "pipeline").len(), 1);
}

#[test]
fn test_invalid_config_is_fatal_before_key_creation() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        screenshot_interval_minutes: 0,
        ..test_config(tmp.path())
    };

    let result = Pipeline::start_with(&config, Arc::new(MemoryErrorSink::new()), Vec::new());
    assert!(matches!(result, Err(FatalError::InvalidConfig(_))));
    assert!(!config.encryption_key_file.exists());
}

#[test]
fn test_unreadable_key_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    std::fs::create_dir_all(config.encryption_key_file.parent().unwrap()).unwrap();
    std::fs::write(&config.encryption_key_file, "too-short").unwrap();
    let started = Arc::new(AtomicBool::new(false));

    let result = Pipeline::start_with(
        &config,
        Arc::new(MemoryErrorSink::new()),
        vec![Box::new(SpySource::new(&started))],
    );
    assert!(matches!(result, Err(FatalError::Key(_))));
    assert!(!started.load(Ordering::SeqCst));
}

#[test]
fn test_filtering_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        include_processes: vec!["browser".into()],
        ..test_config(tmp.path())
    };
    let (keys, typist) = keystroke_source(&config);
    let handle =
        Pipeline::start_with(&config, Arc::new(MemoryErrorSink::new()), vec![keys]).unwrap();

    typist.type_line("chat", "hello from chat");
    typist.type_line("browser.exe", "homework help");
    typist.type_line("browser", "the secret plan");
    wait_until(|| {
        let s = handle.stats();
        s.records_written + s.events_rejected >= 3
    });
    let report = handle.shutdown(Duration::from_secs(5));
    assert!(report.performed);

    let stored = stored_keywords(&config);
    assert_eq!(stored.len(), 1);
    assert!(stored[0].ends_with("browser.exe: \"homework help\""));
    assert!(stored.iter().all(|l| !l.contains("chat") && !l.contains("secret")));

    let stats = handle.stats();
    assert_eq!(stats.events_rejected, 2);
    assert_eq!(stats.records_written, 1);
}

#[test]
fn test_degraded_screenshot_keeps_keystrokes_running() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let errors = Arc::new(MemoryErrorSink::new());
    let (keys, typist) = keystroke_source(&config);

    let handle = Pipeline::start_with(
        &config,
        errors.clone(),
        vec![keys, screenshot_source(false, Duration::from_secs(60))],
    )
    .unwrap();
    assert_eq!(handle.active_sources(), &[SourceKind::Keystroke]);

    typist.type_line("editor", "still typing");
    wait_until(|| handle.stats().records_written >= 1);
    handle.shutdown(Duration::from_secs(5));

    assert_eq!(stored_keywords(&config).len(), 1);
    let degraded = errors.matching(Severity::Degraded, "screenshot");
    assert_eq!(degraded.len(), 1);
    assert!(degraded[0].message.contains("screenshot tool missing"));
}

#[test]
fn test_no_active_sources_is_fatal() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());

    let result = Pipeline::start_with(
        &config,
        Arc::new(MemoryErrorSink::new()),
        vec![screenshot_source(false, Duration::from_secs(60))],
    );
    assert!(matches!(result, Err(FatalError::NoActiveSources)));
}

#[test]
fn test_shutdown_flushes_partial_run_and_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let (keys, typist) = keystroke_source(&config);
    let handle =
        Pipeline::start_with(&config, Arc::new(MemoryErrorSink::new()), vec![keys]).unwrap();

    for c in "unfinished".chars() {
        typist.key("notes", KeyInput::Char(c));
    }
    typist.drained();

    // Shut down from another thread while the main thread waits.
    let remote = handle.clone();
    let stopper = thread::spawn(move || remote.shutdown(Duration::from_secs(5)));
    handle.wait();
    let first = stopper.join().unwrap();
    let second = handle.shutdown(Duration::from_secs(5));

    assert!(first.performed && first.is_clean());
    assert!(!second.performed);

    let stored = stored_keywords(&config);
    assert_eq!(stored.len(), 1);
    assert!(stored[0].ends_with("notes: \"unfinished\""));
}

#[test]
fn test_screenshots_are_encrypted_and_decryptable() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let handle = Pipeline::start_with(
        &config,
        Arc::new(MemoryErrorSink::new()),
        vec![screenshot_source(true, Duration::from_millis(50))],
    )
    .unwrap();

    wait_until(|| handle.stats().records_written >= 2);
    handle.shutdown(Duration::from_secs(5));

    let cipher = cipher(&config);
    let shots: Vec<PathBuf> = partitions(&config)
        .into_iter()
        .flat_map(|dir| std::fs::read_dir(dir.join(SCREENSHOT_DIR_NAME)).unwrap())
        .map(|e| e.unwrap().path())
        .collect();
    assert!(shots.len() >= 2);
    for shot in shots {
        assert!(shot.to_string_lossy().ends_with(".png.enc"));
        let raw = std::fs::read(&shot).unwrap();
        assert!(!raw.windows(4).any(|w| w == b"fake"));
        assert!(decrypt_screenshot(&shot, &cipher)
            .unwrap()
            .starts_with(b"\x89PNG"));
    }
}

#[test]
fn test_stats_are_persisted_on_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let stats_path = tmp.path().join("stats.json");
    let config = Config {
        stats_file: Some(stats_path.clone()),
        ..test_config(tmp.path())
    };
    let (keys, typist) = keystroke_source(&config);
    let handle =
        Pipeline::start_with(&config, Arc::new(MemoryErrorSink::new()), vec![keys]).unwrap();

    typist.type_line("editor", "one");
    wait_until(|| handle.stats().records_written >= 1);
    assert!(handle.shutdown_default().performed);

    let persisted = read_persisted(&stats_path).unwrap().unwrap();
    assert_eq!(persisted.records_written, 1);
    assert_eq!(persisted.keyword_events, 1);
}

#[cfg(unix)]
#[test]
fn test_key_and_partitions_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let (keys, typist) = keystroke_source(&config);
    let handle =
        Pipeline::start_with(&config, Arc::new(MemoryErrorSink::new()), vec![keys]).unwrap();

    typist.type_line("editor", "private");
    wait_until(|| handle.stats().records_written >= 1);
    handle.shutdown(Duration::from_secs(5));

    let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode(&config.encryption_key_file), 0o600);
    for dir in partitions(&config) {
        assert_eq!(mode(&dir), 0o700);
        assert_eq!(mode(&dir.join(SCREENSHOT_DIR_NAME)), 0o700);
        assert_eq!(mode(&dir.join(KEYWORD_LOG_NAME)), 0o600);
    }
}

#[cfg(unix)]
#[test]
fn test_storage_failure_drops_one_record_and_recovers() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let errors = Arc::new(MemoryErrorSink::new());
    let (keys, typist) = keystroke_source(&config);
    let handle = Pipeline::start_with(&config, errors.clone(), vec![keys]).unwrap();

    typist.type_line("editor", "before");
    wait_until(|| handle.stats().records_written >= 1);

    // A plain file where the store root should be
    std::fs::remove_dir_all(&config.log_directory).unwrap();
    std::fs::write(&config.log_directory, b"blocker").unwrap();
    typist.type_line("editor", "during");
    wait_until(|| handle.stats().records_failed >= 1);

    std::fs::remove_file(&config.log_directory).unwrap();
    typist.type_line("editor", "after");
    wait_until(|| handle.stats().records_written >= 2);
    let report = handle.shutdown(Duration::from_secs(5));
    assert!(report.is_clean());

    let stored = stored_keywords(&config);
    assert_eq!(stored.len(), 1);
    assert!(stored[0].ends_with("editor: \"after\""));

    let failures = errors.matching(Severity::Recoverable, "storage");
    assert_eq!(failures.len(), 1);
    assert!(!failures[0].message.contains("during"));
    let stats = handle.stats();
    assert_eq!(stats.records_failed, 1);
    assert_eq!(stats.records_written, 2);
}

#[test]
fn test_source_missing_stop_bound_is_degraded_and_shutdown_returns() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let errors = Arc::new(MemoryErrorSink::new());
    let (keys, typist) = keystroke_source(&config);
    let stuck = SpySource {
        kind: SourceKind::Screenshot,
        stop_times_out: true,
        ..SpySource::new(&Arc::new(AtomicBool::new(false)))
    };
    let handle =
        Pipeline::start_with(&config, errors.clone(), vec![keys, Box::new(stuck)]).unwrap();

    typist.type_line("editor", "kept");
    wait_until(|| handle.stats().records_written >= 1);

    let started = Instant::now();
    let report = handle.shutdown(Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(report.performed);
    assert!(!report.is_clean());
    assert_eq!(report.sources_timed_out, vec![SourceKind::Screenshot]);
    let degraded = errors.matching(Severity::Degraded, "screenshot");
    assert_eq!(degraded.len(), 1);
    assert!(degraded[0].message.contains("did not stop cleanly"));

    assert_eq!(stored_keywords(&config).len(), 1);
}
