//! Parental Monitor CLI
//!
//! Consent-gated activity capture with encrypted local storage.

use anyhow::Context;
use clap::{Parser, Subcommand};
use parental_monitor::{
    config::Config,
    crypto::RecordCipher,
    keys::load_key,
    secure_fs,
    sink::FileErrorSink,
    storage::{decrypt_screenshot, read_keyword_log},
    transparency::read_persisted,
    Pipeline, MONITORING_NOTICE, VERSION,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "parental-monitor")]
#[command(version = VERSION)]
#[command(about = "Consent-gated activity capture with encrypted local storage", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start capturing until interrupted
    Start,

    /// Decrypt a keywords.log.enc file
    DecryptKeywords {
        /// Encrypted keyword log
        #[arg(long)]
        file: PathBuf,

        /// Key file (defaults to the configured one)
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Write plaintext here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Decrypt a .png.enc screenshot
    DecryptScreenshot {
        /// Encrypted screenshot
        #[arg(long)]
        file: PathBuf,

        /// Key file (defaults to the configured one)
        #[arg(long)]
        key_file: Option<PathBuf>,

        /// Where to write the PNG
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Show configuration and capture statistics
    Status,

    /// Show configuration
    Config {
        /// Write the current (or default) configuration to the config file
        #[arg(long)]
        write: bool,
    },

    /// Display the monitoring notice
    Notice,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::config_path);

    let config = match Config::load_from(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Start => cmd_start(&config),
        Commands::DecryptKeywords {
            file,
            key_file,
            output,
        } => cmd_decrypt_keywords(&config, &file, key_file, output),
        Commands::DecryptScreenshot {
            file,
            key_file,
            output,
        } => cmd_decrypt_screenshot(&config, &file, key_file, &output),
        Commands::Status => cmd_status(&config),
        Commands::Config { write } => cmd_config(&config, &config_path, write),
        Commands::Notice => {
            println!("{MONITORING_NOTICE}");
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_start(config: &Config) -> anyhow::Result<()> {
    println!("Parental Monitor v{VERSION}");
    println!("{MONITORING_NOTICE}");

    let error_log = config.error_log_path();
    let sink = FileErrorSink::open(&error_log)
        .with_context(|| format!("cannot open error log {}", error_log.display()))?;
    tracing::info!(path = %error_log.display(), run = %sink.run_id(), "error log opened");

    let handle = Pipeline::start(config, Arc::new(sink))?;

    println!("Capturing:");
    for kind in handle.active_sources() {
        println!("  {}: enabled", kind.name());
    }
    println!(
        "  Screenshot interval: {} minute(s)",
        config.screenshot_interval_minutes
    );
    println!("  Storage: {}", handle.log_directory().display());
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let signal = handle.shutdown_signal();
    ctrlc::set_handler(move || signal.trigger()).context("cannot install Ctrl+C handler")?;

    handle.wait();
    println!();
    println!("Stopping...");

    let report = handle.shutdown_default();
    if !report.is_clean() {
        eprintln!(
            "Warning: shutdown exceeded {:?}; see {}",
            config.shutdown_timeout,
            error_log.display()
        );
    }

    println!();
    println!("{}", handle.stats().summary());
    Ok(())
}

fn resolve_cipher(config: &Config, key_file: Option<PathBuf>) -> anyhow::Result<RecordCipher> {
    let key_path = key_file.unwrap_or_else(|| config.encryption_key_file.clone());
    let key = load_key(&key_path)?;
    Ok(RecordCipher::new(&key)?)
}

fn cmd_decrypt_keywords(
    config: &Config,
    file: &Path,
    key_file: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let cipher = resolve_cipher(config, key_file)?;
    let lines = read_keyword_log(file, &cipher)?;

    match output {
        Some(path) => {
            let mut out = secure_fs::open_private_truncate(&path)
                .with_context(|| format!("cannot write {}", path.display()))?;
            for line in &lines {
                writeln!(out, "{line}")?;
            }
            println!("Decrypted {} record(s) to {}", lines.len(), path.display());
        }
        None => {
            for line in &lines {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn cmd_decrypt_screenshot(
    config: &Config,
    file: &Path,
    key_file: Option<PathBuf>,
    output: &Path,
) -> anyhow::Result<()> {
    let cipher = resolve_cipher(config, key_file)?;
    let image = decrypt_screenshot(file, &cipher)?;

    let mut out = secure_fs::open_private_truncate(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    out.write_all(&image)?;
    println!("Decrypted screenshot to {}", output.display());
    Ok(())
}

fn cmd_status(config: &Config) -> anyhow::Result<()> {
    println!("Parental Monitor Status");
    println!("=======================");
    println!();

    println!("Configuration:");
    println!(
        "  EULA accepted: {}",
        if config.eula_accepted { "yes" } else { "no" }
    );
    println!(
        "  Screenshot interval: {} minute(s)",
        config.screenshot_interval_minutes
    );
    println!(
        "  Include processes: {}",
        if config.include_processes.is_empty() {
            "(all)".to_string()
        } else {
            config.include_processes.join(", ")
        }
    );
    println!("  Exclude words: {}", config.exclude_words.len());
    println!(
        "  Key file: {} ({})",
        config.encryption_key_file.display(),
        if config.encryption_key_file.exists() {
            "present"
        } else {
            "not yet created"
        }
    );
    println!("  Storage: {}", config.log_directory.display());
    println!("  Day partitions: {}", count_partitions(&config.log_directory));
    println!("  Error log: {}", config.error_log_path().display());
    println!();

    let persisted = config
        .stats_file
        .as_deref()
        .map(read_persisted)
        .transpose()
        .context("cannot read stats")?
        .flatten();

    match persisted {
        Some(stats) => {
            println!("Cumulative Statistics (as of {}):", stats.last_updated);
            println!("  Keyword runs captured: {}", stats.keyword_events);
            println!("  Screenshots captured: {}", stats.screenshot_events);
            println!("  Admitted by filter: {}", stats.events_admitted);
            println!("  Rejected by filter: {}", stats.events_rejected);
            println!("  Records written: {}", stats.records_written);
            println!("  Records failed: {}", stats.records_failed);
            println!("  Events dropped: {}", stats.events_dropped);
        }
        None => println!("No previous session data found."),
    }
    Ok(())
}

/// Number of `YYYYMMDD` directories under the store root.
fn count_partitions(root: &Path) -> usize {
    std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    name.len() == 8 && name.chars().all(|c| c.is_ascii_digit())
                })
                .count()
        })
        .unwrap_or(0)
}

fn cmd_config(config: &Config, path: &Path, write: bool) -> anyhow::Result<()> {
    if write {
        config.save_to(path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {}", path.display());
    println!();
    let json = serde_json::to_string_pretty(config)?;
    println!("{json}");
    Ok(())
}
