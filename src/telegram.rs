//! Telegram Bot API message source adapter
//!
//! Implements [`MessageSource`] over `teloxide`. Live updates are forwarded
//! through an unbounded channel by a background dispatcher; media is fetched
//! with `get_file` + `download_file`. Two operations have no Bot API
//! surface and degrade explicitly: history pagination (bots cannot read
//! channel history, so pages come back empty after a one-time warning) and
//! per-message re-reads (`refetch` reports the message as gone).

use crate::config::{
    SOURCE_RETRY_INITIAL_BACKOFF_MS, SOURCE_RETRY_MAX_ATTEMPTS, SOURCE_RETRY_MAX_BACKOFF_MS,
};
use crate::source::{ChannelMessage, MediaKind, MediaRef, MessageSource, SourceError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{FileId, Message as TgMessage, Recipient};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

/// Error fragments that mean the media handle must be re-obtained before a
/// download can succeed
const STALE_REFERENCE_PATTERNS: &[&str] = &[
    "file reference has expired",
    "wrong file_id",
    "wrong file id",
    "temporarily unavailable",
];

/// Message source backed by the Telegram Bot API
pub struct BotApiSource {
    bot: Bot,
    history_warned: AtomicBool,
}

impl BotApiSource {
    /// Create a source for the given bot token
    #[must_use]
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
            history_warned: AtomicBool::new(false),
        }
    }
}

/// Map a `teloxide` request error onto the source error taxonomy
fn map_request_error(e: teloxide::RequestError) -> SourceError {
    if let teloxide::RequestError::RetryAfter(wait) = &e {
        return SourceError::RateLimited {
            retry_after: wait.duration(),
        };
    }
    let text = e.to_string();
    let lower = text.to_lowercase();
    if STALE_REFERENCE_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
    {
        return SourceError::StaleMediaReference;
    }
    SourceError::Api(text)
}

fn is_transient(e: &teloxide::RequestError) -> bool {
    matches!(
        e,
        teloxide::RequestError::Network(_) | teloxide::RequestError::Io(_)
    )
}

/// Retry a Telegram API operation on transient network failures with
/// exponential backoff and jitter. Semantic failures (rate limits, API
/// rejections) are returned to the caller untouched.
async fn retry_transient<F, Fut, T>(operation: F) -> Result<T, teloxide::RequestError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, teloxide::RequestError>>,
{
    let retry_strategy = ExponentialBackoff::from_millis(SOURCE_RETRY_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(SOURCE_RETRY_MAX_BACKOFF_MS))
        .map(jitter)
        .take(SOURCE_RETRY_MAX_ATTEMPTS);

    RetryIf::spawn(retry_strategy, operation, is_transient).await
}

/// Convert a raw update into the pipeline's message model
fn convert_message(msg: &TgMessage) -> ChannelMessage {
    ChannelMessage {
        id: i64::from(msg.id.0),
        chat_id: msg.chat.id.0,
        group_id: msg.media_group_id().map(|g| g.0.clone()),
        date: msg.date,
        text: msg.text().or_else(|| msg.caption()).map(ToString::to_string),
        media: convert_media(msg),
    }
}

/// Reduce the update's media to the kinds the pipeline distinguishes. Media
/// with no dedicated arm falls through to `Document`, so unknown kinds are
/// handled as generic files.
fn convert_media(msg: &TgMessage) -> Option<MediaKind> {
    let file_ref = |id: &FileId| MediaRef {
        file_id: id.0.clone(),
    };

    if let Some(photo) = msg.photo().and_then(|sizes| sizes.last()) {
        return Some(MediaKind::Photo(file_ref(&photo.file.id)));
    }
    if let Some(doc) = msg.document() {
        return Some(MediaKind::Document {
            media: file_ref(&doc.file.id),
            mime: doc.mime_type.as_ref().map(ToString::to_string),
        });
    }
    if let Some(video) = msg.video() {
        return Some(MediaKind::Document {
            media: file_ref(&video.file.id),
            mime: video.mime_type.as_ref().map(ToString::to_string),
        });
    }
    if let Some(location) = msg.location() {
        return Some(MediaKind::Geo {
            latitude: location.latitude,
            longitude: location.longitude,
        });
    }
    if let Some(audio) = msg.audio() {
        return Some(MediaKind::Document {
            media: file_ref(&audio.file.id),
            mime: audio.mime_type.as_ref().map(ToString::to_string),
        });
    }
    if let Some(voice) = msg.voice() {
        return Some(MediaKind::Document {
            media: file_ref(&voice.file.id),
            mime: voice.mime_type.as_ref().map(ToString::to_string),
        });
    }
    if let Some(note) = msg.video_note() {
        return Some(MediaKind::Document {
            media: file_ref(&note.file.id),
            mime: None,
        });
    }
    if let Some(animation) = msg.animation() {
        return Some(MediaKind::Document {
            media: file_ref(&animation.file.id),
            mime: animation.mime_type.as_ref().map(ToString::to_string),
        });
    }
    if let Some(sticker) = msg.sticker() {
        return Some(MediaKind::Document {
            media: file_ref(&sticker.file.id),
            mime: None,
        });
    }
    None
}

async fn forward_update(
    msg: TgMessage,
    tx: mpsc::UnboundedSender<ChannelMessage>,
) -> ResponseResult<()> {
    if tx.send(convert_message(&msg)).is_err() {
        warn!("live feed consumer dropped, discarding update");
    }
    respond(())
}

#[async_trait]
impl MessageSource for BotApiSource {
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ChannelMessage>, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let bot = self.bot.clone();
        let handler = dptree::entry()
            .branch(Update::filter_channel_post().endpoint(forward_update))
            .branch(Update::filter_message().endpoint(forward_update));
        tokio::spawn(async move {
            Dispatcher::builder(bot, handler)
                .dependencies(dptree::deps![tx])
                .build()
                .dispatch()
                .await;
        });
        Ok(rx)
    }

    async fn fetch_history(
        &self,
        chat: &str,
        _limit: usize,
        _after_id: i64,
    ) -> Result<Vec<ChannelMessage>, SourceError> {
        // The Bot API offers no history pagination; only accounts with an
        // MTProto session can page a channel's past. Deployments over this
        // adapter run listen-only (HISTORY_LIMIT=0).
        if !self.history_warned.swap(true, Ordering::Relaxed) {
            warn!(
                chat,
                "bot api cannot page channel history; backfill will find nothing"
            );
        }
        Ok(Vec::new())
    }

    async fn download(&self, media: &MediaRef, dest: &Path) -> Result<PathBuf, SourceError> {
        let file_id = FileId(media.file_id.clone());
        let file = retry_transient(|| async { self.bot.get_file(file_id.clone()).await })
            .await
            .map_err(map_request_error)?;

        // Keep the remote payload's extension so the artifact stays openable.
        let path = match Path::new(&file.path).extension().and_then(|e| e.to_str()) {
            Some(ext) => dest.with_extension(ext),
            None => dest.to_path_buf(),
        };

        let mut out = tokio::fs::File::create(&path).await?;
        self.bot
            .download_file(&file.path, &mut out)
            .await
            .map_err(|e| SourceError::Api(format!("download failed: {e}")))?;
        out.flush().await?;
        Ok(path)
    }

    async fn refetch(
        &self,
        chat_id: i64,
        message_id: i64,
    ) -> Result<Option<ChannelMessage>, SourceError> {
        // Bots cannot re-read a message by identifier.
        debug!(chat_id, message_id, "refetch unsupported over bot api");
        Ok(None)
    }

    async fn resolve_identity(&self, specifier: &str) -> Result<i64, SourceError> {
        let username = specifier.strip_prefix('@').unwrap_or(specifier);
        let chat = self
            .bot
            .get_chat(Recipient::ChannelUsername(format!("@{username}")))
            .await
            .map_err(map_request_error)?;
        Ok(chat.id.0)
    }

    async fn join_public(&self, _specifier: &str) -> Result<(), SourceError> {
        Err(SourceError::Unsupported(
            "bots cannot join channels; add the bot as a member instead",
        ))
    }

    async fn join_invite(&self, _code: &str) -> Result<(), SourceError> {
        Err(SourceError::Unsupported(
            "bots cannot use invite links; add the bot as a member instead",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::Seconds;

    #[test]
    fn retry_after_maps_to_rate_limited() {
        let err = teloxide::RequestError::RetryAfter(Seconds::from_seconds(42));
        match map_request_error(err) {
            SourceError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(42));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn stale_patterns_map_to_stale_reference() {
        let err = teloxide::RequestError::Api(teloxide::ApiError::Unknown(
            "Bad Request: file reference has expired".to_string(),
        ));
        assert!(matches!(
            map_request_error(err),
            SourceError::StaleMediaReference
        ));
    }

    #[test]
    fn other_api_errors_stay_terminal() {
        let err = teloxide::RequestError::Api(teloxide::ApiError::Unknown(
            "Bad Request: chat not found".to_string(),
        ));
        assert!(matches!(map_request_error(err), SourceError::Api(_)));
    }
}
