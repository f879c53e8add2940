//! Message classification and routing
//!
//! One dispatcher instance drives both the live feed and historical replay.
//! Every message ends in a terminal state (downloaded, text saved, or
//! failed); the outcome is durably recorded before the dispatcher returns so
//! a crash mid-download can neither silently reprocess a message nor lose
//! the record of an attempt.

use crate::artifact::ArtifactWriter;
use crate::progress::{FailureLog, OutcomeKind, ProgressState, ProgressStore};
use crate::source::{ChannelMessage, MediaKind, MessageSource, SourceError};
use tracing::{debug, warn};

enum Attempt {
    Saved(OutcomeKind),
    Failed(String),
    /// No media and no text; nothing to write but the message still counts
    /// as handled.
    Nothing,
}

/// Routes classified messages to the artifact writer and records outcomes
pub struct Dispatcher {
    writer: ArtifactWriter,
    store: ProgressStore,
    failures: FailureLog,
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(writer: ArtifactWriter, store: ProgressStore, failures: FailureLog) -> Self {
        Self {
            writer,
            store,
            failures,
        }
    }

    /// Process one message to a terminal state.
    ///
    /// Already-seen identifiers are skipped outright, which makes replay
    /// idempotent for both the live and backfill paths. Provider throttling
    /// is waited out and the same message retried, so rate limiting never
    /// drops a message. All other failures are terminal: counted, logged to
    /// the failure record, marked seen and persisted.
    pub async fn dispatch(
        &self,
        source: &dyn MessageSource,
        state: &mut ProgressState,
        msg: &ChannelMessage,
    ) {
        if state.is_seen(msg.id) {
            debug!(message_id = msg.id, "already processed, skipping");
            return;
        }

        let attempt = loop {
            match self.attempt(source, msg).await {
                Ok(attempt) => break attempt,
                Err(SourceError::RateLimited { retry_after }) => {
                    warn!(
                        message_id = msg.id,
                        ?retry_after,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) => break Attempt::Failed(e.to_string()),
            }
        };

        match attempt {
            Attempt::Saved(kind) => state.record_outcome(kind),
            Attempt::Failed(reason) => {
                state.record_outcome(OutcomeKind::Failed);
                self.failures.append(msg, &reason).await;
            }
            Attempt::Nothing => {}
        }
        state.mark_seen(msg.id);
        self.store.save(state).await;
    }

    /// Classify the message and run the matching writer path. Only
    /// [`SourceError::RateLimited`] escapes as an error; everything else is
    /// folded into a terminal [`Attempt`].
    async fn attempt(
        &self,
        source: &dyn MessageSource,
        msg: &ChannelMessage,
    ) -> Result<Attempt, SourceError> {
        match &msg.media {
            None => match &msg.text {
                Some(text) => Ok(match self.writer.save_text(msg, text).await {
                    Ok(_) => Attempt::Saved(OutcomeKind::Text),
                    Err(e) => Attempt::Failed(format!("text write failed: {e}")),
                }),
                None => Ok(Attempt::Nothing),
            },
            Some(MediaKind::Geo {
                latitude,
                longitude,
            }) => Ok(match self.writer.save_geo(msg, *latitude, *longitude).await {
                Ok(_) => Attempt::Saved(OutcomeKind::Text),
                Err(e) => Attempt::Failed(format!("geo save failed: {e}")),
            }),
            Some(MediaKind::Photo(media)) => {
                match self.writer.save_media(source, msg, media).await {
                    Ok(_) => Ok(Attempt::Saved(OutcomeKind::Photo)),
                    Err(e @ SourceError::RateLimited { .. }) => Err(e),
                    Err(e) => Ok(Attempt::Failed(format!("photo download failed: {e}"))),
                }
            }
            Some(MediaKind::Document { media, mime }) => {
                match self.writer.save_media(source, msg, media).await {
                    Ok(_) => {
                        let kind = if mime.as_deref().is_some_and(|m| m.starts_with("video/")) {
                            OutcomeKind::Video
                        } else {
                            OutcomeKind::File
                        };
                        Ok(Attempt::Saved(kind))
                    }
                    Err(e @ SourceError::RateLimited { .. }) => Err(e),
                    Err(e) => Ok(Attempt::Failed(format!(
                        "document/video download failed: {e}"
                    ))),
                }
            }
        }
    }
}
