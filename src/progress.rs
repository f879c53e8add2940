//! Durable progress tracking
//!
//! The progress state is the single source of truth for "what has already
//! been done". It is loaded once at startup, mutated only from the dispatch
//! context, and rewritten wholesale after every terminal message outcome so a
//! crash loses at most one in-flight message.

use crate::config::SEEN_CAP;
use crate::source::ChannelMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{error, info};

/// Errors raised by state or failure-log persistence helpers. These never
/// escape to the ingestion loop; callers log and continue.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Standard I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Terminal outcome of a dispatched message, used for counter bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// A photo was downloaded
    Photo,
    /// A video was downloaded
    Video,
    /// A generic file was downloaded
    File,
    /// A text body or sidecar-only message was saved
    Text,
    /// The message could not be fully processed
    Failed,
}

/// Aggregate counters persisted alongside the watermark
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Statistics {
    /// Messages that reached any terminal outcome
    pub total_processed: u64,
    /// Successfully downloaded photos
    pub downloaded_photos: u64,
    /// Successfully downloaded videos
    pub downloaded_videos: u64,
    /// Successfully downloaded generic files
    pub downloaded_files: u64,
    /// Saved text messages and sidecar-only artifacts
    pub text_messages: u64,
    /// Messages that ended in failure
    pub failed_downloads: u64,
    /// When this state was first created
    pub start_time: DateTime<Utc>,
    /// When a counter last changed
    pub last_update: DateTime<Utc>,
}

impl Default for Statistics {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            total_processed: 0,
            downloaded_photos: 0,
            downloaded_videos: 0,
            downloaded_files: 0,
            text_messages: 0,
            failed_downloads: 0,
            start_time: now,
            last_update: now,
        }
    }
}

fn default_cap() -> usize {
    SEEN_CAP
}

/// Crash-recoverable record of which messages have been handled
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressState {
    #[serde(default)]
    last_processed_id: i64,
    #[serde(default)]
    processed_ids: HashSet<i64>,
    #[serde(default)]
    statistics: Statistics,
    #[serde(skip, default = "default_cap")]
    cap: usize,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    /// Create an empty state with the default seen-id capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(SEEN_CAP)
    }

    /// Create an empty state with a custom seen-id capacity. Smaller caps
    /// make the eviction rule observable in tests.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            last_processed_id: 0,
            processed_ids: HashSet::new(),
            statistics: Statistics::default(),
            cap,
        }
    }

    /// Largest message identifier ever marked processed
    #[must_use]
    pub fn last_processed_id(&self) -> i64 {
        self.last_processed_id
    }

    /// Whether `id` already reached a terminal outcome
    #[must_use]
    pub fn is_seen(&self, id: i64) -> bool {
        self.processed_ids.contains(&id)
    }

    /// Number of identifiers currently retained in the seen set
    #[must_use]
    pub fn seen_count(&self) -> usize {
        self.processed_ids.len()
    }

    /// Aggregate counters
    #[must_use]
    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Record `id` as processed and advance the watermark.
    ///
    /// When the seen set grows past its capacity, the numerically lowest
    /// quartile is evicted. Identifiers are provider-assigned and roughly
    /// time-ordered, so this approximates oldest-first eviction.
    pub fn mark_seen(&mut self, id: i64) {
        self.processed_ids.insert(id);
        if self.processed_ids.len() > self.cap {
            let mut sorted: Vec<i64> = self.processed_ids.iter().copied().collect();
            sorted.sort_unstable();
            let cutoff = sorted[sorted.len() / 4];
            self.processed_ids.retain(|seen| *seen >= cutoff);
        }
        if id > self.last_processed_id {
            self.last_processed_id = id;
        }
    }

    /// Bump the counter matching a terminal outcome
    pub fn record_outcome(&mut self, kind: OutcomeKind) {
        self.statistics.total_processed += 1;
        self.statistics.last_update = Utc::now();
        match kind {
            OutcomeKind::Photo => self.statistics.downloaded_photos += 1,
            OutcomeKind::Video => self.statistics.downloaded_videos += 1,
            OutcomeKind::File => self.statistics.downloaded_files += 1,
            OutcomeKind::Text => self.statistics.text_messages += 1,
            OutcomeKind::Failed => self.statistics.failed_downloads += 1,
        }
    }
}

/// Reads and rewrites the persisted progress state
#[derive(Debug, Clone)]
pub struct ProgressStore {
    path: PathBuf,
}

impl ProgressStore {
    /// Create a store persisting to `path`
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the persisted state. Absence or corruption falls back to a fresh
    /// empty state; loading never fails the process.
    pub async fn load(&self) -> ProgressState {
        match self.try_load().await {
            Ok(Some(state)) => {
                info!(
                    last_id = state.last_processed_id(),
                    seen = state.seen_count(),
                    "loaded state"
                );
                state
            }
            Ok(None) => {
                info!("no previous state, fresh start");
                ProgressState::new()
            }
            Err(e) => {
                error!("load state error, using fresh: {e}");
                ProgressState::new()
            }
        }
    }

    /// Persist `state`, replacing the previous snapshot wholesale. Errors
    /// degrade durability but never crash ingestion; they are logged and
    /// swallowed.
    pub async fn save(&self, state: &ProgressState) {
        if let Err(e) = self.try_save(state).await {
            error!("save state error: {e}");
        }
    }

    async fn try_load(&self) -> Result<Option<ProgressState>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    async fn try_save(&self, state: &ProgressState) -> Result<(), StoreError> {
        let raw = serde_json::to_vec_pretty(state)?;
        // Write-then-rename keeps the previous snapshot intact if the
        // process dies mid-write.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// One entry of the append-only failure audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Identifier of the failed message
    pub message_id: i64,
    /// Chat the message belonged to
    pub chat_id: i64,
    /// Original message timestamp
    pub date: DateTime<Utc>,
    /// Human-readable failure reason
    pub error: String,
    /// When the failure was recorded
    pub error_time: DateTime<Utc>,
}

/// Append-only log of messages that could not be fully processed. Never read
/// back by the running process.
#[derive(Debug, Clone)]
pub struct FailureLog {
    path: PathBuf,
}

impl FailureLog {
    /// Create a failure log persisting to `path`
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Append a failure record for `msg`. Errors are logged and swallowed.
    pub async fn append(&self, msg: &ChannelMessage, reason: &str) {
        if let Err(e) = self.try_append(msg, reason).await {
            error!("append failure record error: {e}");
        }
    }

    async fn try_append(&self, msg: &ChannelMessage, reason: &str) -> Result<(), StoreError> {
        let mut records: Vec<FailureRecord> = match tokio::fs::read(&self.path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        records.push(FailureRecord {
            message_id: msg.id,
            chat_id: msg.chat_id,
            date: msg.date,
            error: reason.to_string(),
            error_time: Utc::now(),
        });
        let raw = serde_json::to_vec_pretty(&records)?;
        tokio::fs::write(&self.path, raw).await?;
        Ok(())
    }
}
