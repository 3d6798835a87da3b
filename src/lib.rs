//! Parental Monitor - consent-gated activity capture with encrypted local storage.
//!
//! This library captures typed text and periodic screenshots on the local
//! machine and keeps them in an encrypted, day-partitioned store for later
//! review by the person who installed it.
//!
//! # Guarantees
//!
//! - **Consent first**: nothing is captured until `eula_accepted` is set
//! - **Encrypted at rest**: every record is sealed with AES-256-GCM before it is written
//! - **Owner-only files**: directories are 0700 and files 0600 on unix
//! - **Local only**: nothing is transmitted anywhere
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Parental Monitor                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐                                              │
//! │  │  Keystroke  │──┐                                           │
//! │  │   Source    │  │   ┌──────────┐   ┌──────────────────┐     │
//! │  └─────────────┘  ├──▶│  Filter  │──▶│  StorageEngine   │     │
//! │  ┌─────────────┐  │   └──────────┘   │ (encrypt+append) │     │
//! │  │ Screenshot  │──┘                  └──────────────────┘     │
//! │  │   Source    │          │                   │               │
//! │  └─────────────┘          ▼                   ▼               │
//! │                   ┌──────────────┐    ┌──────────────┐        │
//! │                   │ CaptureStats │    │  ErrorSink   │        │
//! │                   └──────────────┘    └──────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use parental_monitor::{Config, FileErrorSink, Pipeline};
//!
//! let config = Config::load().expect("config");
//! let sink = Arc::new(FileErrorSink::open(config.error_log_path()).expect("error log"));
//!
//! let handle = Pipeline::start(&config, sink).expect("pipeline");
//! handle.wait();
//! handle.shutdown_default();
//! ```

pub mod collector;
pub mod config;
pub mod crypto;
pub mod filter;
pub mod keys;
pub mod pipeline;
pub mod secure_fs;
pub mod sink;
pub mod storage;
pub mod transparency;

// Re-export key types at crate root for convenience
pub use collector::{CaptureError, CaptureEvent, CaptureSource, EventSink, Platform, SourceKind};
pub use config::{Config, ConfigError};
pub use crypto::{CryptoError, RecordCipher};
pub use filter::{FilterDecision, FilterEngine};
pub use keys::{load_key, EncryptionKey, KeyError, KeyManager};
pub use pipeline::{FatalError, Handle, Pipeline, ShutdownReport, ShutdownSignal};
pub use sink::{ErrorSink, FileErrorSink, MemoryErrorSink, Severity, SharedErrorSink};
pub use storage::{DailyPartition, StorageEngine, StorageError};
pub use transparency::{CaptureStats, CaptureStatsSnapshot, SharedCaptureStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Notice describing what is monitored, shown before capture starts.
pub const MONITORING_NOTICE: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║              PARENTAL MONITOR - MONITORING NOTICE                ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This computer is monitored by the person who installed this     ║
║  software.                                                       ║
║                                                                  ║
║  ✓ WHAT IS CAPTURED:                                             ║
║    • Text typed into the configured applications                 ║
║    • The name of the application the text was typed into         ║
║    • A screenshot of the whole screen at a fixed interval        ║
║                                                                  ║
║  ✗ WHAT IS NEVER CAPTURED:                                       ║
║    • Typed text containing any configured exclude word           ║
║    • Anything, until the EULA has been accepted                  ║
║                                                                  ║
║  All records are encrypted on this machine and never sent over   ║
║  the network. Only the holder of the key file can read them.     ║
║                                                                  ║
║  Collection statistics are available anytime with:               ║
║    parental-monitor status                                       ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
