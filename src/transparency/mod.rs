//! Transparency module for the parental monitor.
//!
//! Counts what the monitor captured and stored so the `status` command
//! can report it without opening the encrypted store.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_stats, create_shared_stats_with_persistence, read_persisted, CaptureStats,
    CaptureStatsSnapshot, PersistedStats, SharedCaptureStats,
};
