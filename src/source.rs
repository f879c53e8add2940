//! Message source interface and message model
//!
//! The pipeline consumes messages through the [`MessageSource`] trait so the
//! concrete provider client can be swapped (or mocked) without touching
//! dispatch, backfill or artifact logic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur while talking to the message provider
#[derive(Error, Debug)]
pub enum SourceError {
    /// Provider-side throttling; the operation must be repeated after the
    /// indicated delay
    #[error("rate limited by provider, retry after {retry_after:?}")]
    RateLimited {
        /// How long the provider asked us to wait
        retry_after: Duration,
    },
    /// The media handle is no longer valid and must be re-obtained by
    /// re-fetching the message
    #[error("media reference is stale and must be re-fetched")]
    StaleMediaReference,
    /// The operation cannot be expressed against this provider surface
    #[error("operation not supported by this source: {0}")]
    Unsupported(&'static str),
    /// Any other provider API failure
    #[error("source api error: {0}")]
    Api(String),
    /// Local I/O failure while materializing a download
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle to a downloadable media payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef {
    /// Provider-assigned file identifier
    pub file_id: String,
}

/// Media payload attached to a message, reduced to the kinds the pipeline
/// distinguishes. Provider media with no dedicated arm is folded into
/// `Document` by the adapter, so unknown kinds fail safe to a generic file.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaKind {
    /// A photo
    Photo(MediaRef),
    /// A document, video or any other file-backed payload
    Document {
        /// Downloadable handle
        media: MediaRef,
        /// MIME type when the provider reports one
        mime: Option<String>,
    },
    /// A geographic point, rendered as a text sidecar
    Geo {
        /// Latitude in degrees
        latitude: f64,
        /// Longitude in degrees
        longitude: f64,
    },
}

impl MediaKind {
    /// Downloadable handle of this payload, if it has one
    #[must_use]
    pub fn media_ref(&self) -> Option<&MediaRef> {
        match self {
            Self::Photo(media) | Self::Document { media, .. } => Some(media),
            Self::Geo { .. } => None,
        }
    }
}

/// A single message observed on the watched channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    /// Provider-assigned identifier, monotonically increasing within a chat
    pub id: i64,
    /// Identifier of the chat the message belongs to
    pub chat_id: i64,
    /// Album grouping identifier for multi-part posts
    pub group_id: Option<String>,
    /// Message timestamp
    pub date: DateTime<Utc>,
    /// Text body or media caption
    pub text: Option<String>,
    /// Attached media payload, if any
    pub media: Option<MediaKind>,
}

/// Interface to the external messaging provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Start the live event feed. Messages from every chat the account can
    /// see are forwarded; the consumer filters by chat at runtime. Intended
    /// to be called once per process.
    ///
    /// # Errors
    ///
    /// Returns an error if the live feed cannot be started.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, SourceError>;

    /// Fetch one page of up to `limit` historical messages with identifiers
    /// greater than `after_id`, ordered oldest first. An empty page means the
    /// history is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the page cannot be fetched.
    async fn fetch_history(
        &self,
        chat: &str,
        limit: usize,
        after_id: i64,
    ) -> Result<Vec<ChannelMessage>, SourceError>;

    /// Download a media payload to `dest` (the adapter may append a file
    /// extension) and return the path actually written.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::StaleMediaReference`] when the handle expired,
    /// [`SourceError::RateLimited`] on provider throttling, or another
    /// variant for terminal failures.
    async fn download(&self, media: &MediaRef, dest: &Path) -> Result<PathBuf, SourceError>;

    /// Re-read a single message by identifier, used to refresh stale media
    /// handles. `Ok(None)` means the message is gone (or the provider cannot
    /// re-read messages).
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup itself fails.
    async fn refetch(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<ChannelMessage>, SourceError>;

    /// Resolve a `@username` style specifier to a numeric chat identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the specifier cannot be resolved.
    async fn resolve_identity(&self, specifier: &str) -> Result<i64, SourceError>;

    /// Join a public channel by username.
    ///
    /// # Errors
    ///
    /// Returns an error if joining fails or is unsupported.
    async fn join_public(&self, specifier: &str) -> Result<(), SourceError>;

    /// Join a chat through an invite code.
    ///
    /// # Errors
    ///
    /// Returns an error if joining fails or is unsupported.
    async fn join_invite(&self, code: &str) -> Result<(), SourceError>;
}
