//! Configuration for the parental monitor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "parental-monitor";

/// Main configuration. Every field has a default, so a partial file
/// overrides only what it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the encrypted, day-partitioned store
    pub log_directory: PathBuf,

    /// Where the symmetric key lives
    pub encryption_key_file: PathBuf,

    /// Minutes between screenshots
    pub screenshot_interval_minutes: u64,

    /// Only keyword runs typed into these processes are kept (empty = all)
    pub include_processes: Vec<String>,

    /// Keyword runs containing any of these are dropped whole
    pub exclude_words: Vec<String>,

    /// Nothing is captured until this is true
    pub eula_accepted: bool,

    /// Plaintext error/event log; defaults to `error.log` beside `log_directory`
    pub error_log_file: Option<PathBuf>,

    /// Flush a keyword run after this much keyboard silence
    #[serde(with = "duration_serde")]
    pub idle_flush: Duration,

    /// Flush a keyword run once it reaches this many characters
    pub max_run_chars: usize,

    /// Upper bound on how long shutdown waits for sources and writes
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Where capture counters are persisted between runs
    pub stats_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);

        Self {
            log_directory: data_dir.join("ParentalMonitorData"),
            encryption_key_file: data_dir.join("encryption.key"),
            screenshot_interval_minutes: 5,
            include_processes: ["chrome", "firefox", "slack", "msedge", "brave"]
                .into_iter()
                .map(String::from)
                .collect(),
            exclude_words: ["password", "secret", "pswd"]
                .into_iter()
                .map(String::from)
                .collect(),
            eula_accepted: false,
            error_log_file: None,
            idle_flush: Duration::from_secs(5),
            max_run_chars: 512,
            shutdown_timeout: Duration::from_secs(5),
            stats_file: Some(data_dir.join("stats.json")),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.json")
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.screenshot_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "screenshot_interval_minutes must be greater than zero".into(),
            ));
        }
        if self.idle_flush.is_zero() {
            return Err(ConfigError::Invalid("idle_flush must be greater than zero".into()));
        }
        if self.max_run_chars == 0 {
            return Err(ConfigError::Invalid("max_run_chars must be greater than zero".into()));
        }
        if self.log_directory.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("log_directory is empty".into()));
        }
        if self.encryption_key_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("encryption_key_file is empty".into()));
        }
        Ok(())
    }

    pub fn screenshot_interval(&self) -> Duration {
        Duration::from_secs(self.screenshot_interval_minutes.saturating_mul(60))
    }

    /// Resolved error log location, outside the encrypted tree.
    pub fn error_log_path(&self) -> PathBuf {
        if let Some(ref path) = self.error_log_file {
            return path.clone();
        }
        self.log_directory
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join("error.log")
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
