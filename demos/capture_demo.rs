//! Demonstration of the Parental Monitor capture pipeline.
//!
//! This example shows how to:
//! 1. Build a throwaway configuration in a temporary directory
//! 2. Start the pipeline with the platform's capture backends
//! 3. Stop it after a fixed period or on Ctrl+C
//! 4. Decrypt and print what was stored
//!
//! Run with: cargo run --example capture_demo
//!
//! Note: On Linux the keyboard backend needs read access to /dev/input
//! (usually membership of the `input` group) and screenshots need grim,
//! maim or ImageMagick's import.

use std::sync::Arc;
use std::time::Duration;

use parental_monitor::{
    load_key,
    storage::{read_keyword_log, DailyPartition},
    Config, MemoryErrorSink, Pipeline, RecordCipher, Severity, MONITORING_NOTICE,
};

const DEMO_DURATION: Duration = Duration::from_secs(30);

fn main() {
    println!("Parental Monitor - Capture Demo");
    println!("===============================");
    println!();
    println!("{MONITORING_NOTICE}");

    let workspace = tempfile::tempdir().expect("temporary directory");
    let config = Config {
        log_directory: workspace.path().join("data"),
        encryption_key_file: workspace.path().join("encryption.key"),
        error_log_file: Some(workspace.path().join("error.log")),
        stats_file: None,
        screenshot_interval_minutes: 1,
        idle_flush: Duration::from_secs(3),
        eula_accepted: true,
        ..Config::default()
    };
    let errors = Arc::new(MemoryErrorSink::new());

    let handle = match Pipeline::start(&config, errors.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Error starting capture: {e}");
            for report in errors.entries() {
                eprintln!("  {} {}: {}", report.severity, report.component, report.message);
            }
            return;
        }
    };

    println!("Storage: {}", config.log_directory.display());
    for kind in handle.active_sources() {
        println!("  {}: enabled", kind.name());
    }
    for report in errors.entries() {
        if report.severity == Severity::Degraded {
            println!("  {}: {}", report.component, report.message);
        }
    }
    println!();
    println!(
        "Capturing for {} seconds; type something and press Enter...",
        DEMO_DURATION.as_secs()
    );

    let signal = handle.shutdown_signal();
    ctrlc::set_handler(move || signal.trigger()).expect("Error setting Ctrl+C handler");

    let signal = handle.shutdown_signal();
    if !signal.wait_timeout(DEMO_DURATION) {
        println!("Time is up.");
    }

    println!();
    println!("Stopping capture...");
    let report = handle.shutdown_default();
    if !report.is_clean() {
        println!("Warning: shutdown did not finish cleanly: {report:?}");
    }

    println!();
    println!("{}", handle.stats().summary());

    let key = load_key(&config.encryption_key_file).expect("demo key");
    let cipher = RecordCipher::new(&key).expect("cipher");
    let partition = DailyPartition::for_timestamp(&config.log_directory, &chrono::Local::now());
    let log = partition.keyword_log();
    if !log.exists() {
        println!("No keyword runs were stored.");
        return;
    }

    println!();
    println!("Decrypted keyword log ({}):", log.display());
    for line in read_keyword_log(&log, &cipher).expect("readable log") {
        println!("  {line}");
    }
}
