//! Configuration and settings management
//!
//! Loads settings from environment variables and defines pipeline constants.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: Option<String>,

    /// Watched channel specifier: `-100…` id, `@username` or a `t.me/…` link
    pub channel: Option<String>,

    /// Legacy alias for `channel`, kept for older deployments
    pub chat_id: Option<String>,

    /// Root directory for locally written artifacts
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Path of the persisted progress state
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Path of the append-only failure log
    #[serde(default = "default_failed_file")]
    pub failed_file: PathBuf,

    /// Path of the process log file
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    /// Remote destination passed to the transfer tool (e.g. `remote:bucket/dir`)
    pub rclone_dest: Option<String>,

    /// Extra arguments appended to every transfer tool invocation
    #[serde(default = "default_rclone_args")]
    pub rclone_args: String,

    /// Number of concurrent upload workers
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    /// Page size for historical replay
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay in seconds between replayed messages
    #[serde(default = "default_rate_delay_base")]
    pub rate_delay_base: f64,

    /// Number of historical messages to replay; `<= 0` disables backfill
    #[serde(default)]
    pub history_limit: i64,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/data/downloads")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/data/state.json")
}

fn default_failed_file() -> PathBuf {
    PathBuf::from("/data/failed_messages.json")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("/data/logs/tg-siphon.log")
}

fn default_rclone_args() -> String {
    "--transfers=4 --checkers=8 --contimeout=30s --low-level-retries=5 --retries=3 --stats-one-line"
        .to_string()
}

const fn default_upload_workers() -> usize {
    2
}

const fn default_batch_size() -> usize {
    50
}

const fn default_rate_delay_base() -> f64 {
    0.5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            telegram_token: None,
            channel: None,
            chat_id: None,
            download_dir: default_download_dir(),
            state_file: default_state_file(),
            failed_file: default_failed_file(),
            log_file: default_log_file(),
            rclone_dest: None,
            rclone_args: default_rclone_args(),
            upload_workers: default_upload_workers(),
            batch_size: default_batch_size(),
            rate_delay_base: default_rate_delay_base(),
            history_limit: 0,
        }
    }
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start off by merging in the "default" configuration file
            .add_source(File::with_name("config/default").required(false))
            // Add in the current environment file
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Add in a local configuration file
            // This file shouldn't be checked into git
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from the environment (with a prefix of APP)
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Also add settings from environment variables directly (without prefix)
            // Note: Environment::default() auto-converts UPPER_SNAKE_CASE to snake_case
            // ignore_empty treats empty env vars as unset; try_parsing converts
            // numeric values like UPLOAD_WORKERS=4 into their typed form
            .add_source(
                Environment::default()
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    /// Returns the watched channel specifier, honoring the `CHAT_ID` alias
    #[must_use]
    pub fn target_channel(&self) -> Option<&str> {
        self.channel
            .as_deref()
            .or(self.chat_id.as_deref())
            .filter(|s| !s.trim().is_empty())
    }

    /// Returns the names of required environment variables that are unset
    #[must_use]
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self
            .telegram_token
            .as_deref()
            .is_none_or(|t| t.trim().is_empty())
        {
            missing.push("TELEGRAM_TOKEN");
        }
        if self.target_channel().is_none() {
            missing.push("CHANNEL");
        }
        if self
            .rclone_dest
            .as_deref()
            .is_none_or(|d| d.trim().is_empty())
        {
            missing.push("RCLONE_DEST");
        }
        missing
    }
}

// ===== Pipeline constants =====

/// Upper bound on the recently-processed id set; oldest quartile is evicted
/// by numeric value once exceeded
pub const SEEN_CAP: usize = 100_000;

/// Interval between periodic statistics summaries and state flushes
pub const STATS_INTERVAL_SECS: u64 = 3600;

/// Bounded wait used by upload workers when popping the queue, so a raised
/// shutdown signal is observed within one wait interval
pub const UPLOAD_POP_WAIT_SECS: u64 = 1;

/// Upper bound on waiting for upload workers to drain at shutdown
pub const WORKER_JOIN_TIMEOUT_SECS: u64 = 30;

/// Delay between fetched history pages
pub const BACKFILL_PAGE_DELAY_MS: u64 = 500;

/// Initial backoff for transient Telegram API failures
pub const SOURCE_RETRY_INITIAL_BACKOFF_MS: u64 = 100;
/// Backoff ceiling for transient Telegram API failures
pub const SOURCE_RETRY_MAX_BACKOFF_MS: u64 = 5_000;
/// Attempt count for transient Telegram API failures
pub const SOURCE_RETRY_MAX_ATTEMPTS: usize = 3;
