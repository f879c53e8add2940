//! Historical message replay
//!
//! Replays history newer than the persisted watermark once at startup, then
//! the process switches to live-only ingestion. Replay is rate limited to
//! stay under provider throttling and shares the dispatcher's seen-id guard
//! with the live path, so neither can double-process a message.

use crate::config::BACKFILL_PAGE_DELAY_MS;
use crate::dispatch::Dispatcher;
use crate::progress::ProgressState;
use crate::source::{MessageSource, SourceError};
use std::time::Duration;
use tracing::{error, info, warn};

/// Paginated, rate-limited historical replay
pub struct BackfillController {
    history_limit: i64,
    batch_size: usize,
    message_delay: Duration,
    page_delay: Duration,
}

impl BackfillController {
    /// Create a controller. A non-positive `history_limit` turns the whole
    /// run into a no-op (listen-only mode).
    #[must_use]
    pub fn new(history_limit: i64, batch_size: usize, message_delay: Duration) -> Self {
        Self {
            history_limit,
            batch_size,
            message_delay,
            page_delay: Duration::from_millis(BACKFILL_PAGE_DELAY_MS),
        }
    }

    #[cfg(test)]
    fn without_delays(history_limit: i64, batch_size: usize) -> Self {
        Self {
            history_limit,
            batch_size,
            message_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
        }
    }

    /// Run the replay to completion and return the number of messages
    /// dispatched.
    ///
    /// The cursor starts at the persisted watermark and advances to the last
    /// identifier of every non-empty page regardless of per-message outcome,
    /// so one failing message cannot halt forward progress. An empty page or
    /// the configured history limit ends the replay.
    pub async fn run(
        &self,
        source: &dyn MessageSource,
        dispatcher: &Dispatcher,
        state: &mut ProgressState,
        chat: &str,
    ) -> usize {
        if self.history_limit <= 0 {
            info!("skip backfill; listen-only mode");
            return 0;
        }
        let limit = usize::try_from(self.history_limit).unwrap_or(0);

        let mut processed = 0;
        let mut cursor = state.last_processed_id().max(0);
        loop {
            let want = self.batch_size.min(limit - processed);
            if want == 0 {
                break;
            }
            let page = match source.fetch_history(chat, want, cursor).await {
                Ok(page) => page,
                Err(SourceError::RateLimited { retry_after }) => {
                    warn!(?retry_after, "backfill rate limited, backing off");
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Err(e) => {
                    error!("backfill history fetch failed: {e}");
                    break;
                }
            };
            if page.is_empty() {
                info!("backfill done");
                break;
            }
            if let Some(last) = page.last() {
                cursor = last.id;
            }
            for msg in &page {
                if state.is_seen(msg.id) {
                    continue;
                }
                dispatcher.dispatch(source, state, msg).await;
                processed += 1;
                if processed >= limit {
                    break;
                }
                tokio::time::sleep(self.message_delay).await;
            }
            tokio::time::sleep(self.page_delay).await;
        }
        info!(processed, "backfill finished");
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactWriter;
    use crate::progress::{FailureLog, ProgressStore};
    use crate::source::{ChannelMessage, MediaKind, MediaRef, MockMessageSource};
    use crate::uploader::UploadQueue;
    use chrono::Utc;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tg-siphon-bf-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn dispatcher(dir: &Path) -> Dispatcher {
        let queue = Arc::new(UploadQueue::new());
        Dispatcher::new(
            ArtifactWriter::new(dir.to_path_buf(), queue),
            ProgressStore::new(dir.join("state.json")),
            FailureLog::new(dir.join("failed.json")),
        )
    }

    fn bare_message(id: i64) -> ChannelMessage {
        ChannelMessage {
            id,
            chat_id: -100200300,
            group_id: None,
            date: Utc::now(),
            text: None,
            media: None,
        }
    }

    fn page(ids: std::ops::RangeInclusive<i64>) -> Vec<ChannelMessage> {
        ids.map(bare_message).collect()
    }

    #[tokio::test]
    async fn non_positive_limit_disables_backfill() {
        let dir = scratch_dir();
        let source = MockMessageSource::new();
        let mut state = ProgressState::new();

        let controller = BackfillController::without_delays(0, 4);
        let processed = controller
            .run(&source, &dispatcher(&dir), &mut state, "@chan")
            .await;
        assert_eq!(processed, 0);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn limit_is_spread_over_pages() {
        let dir = scratch_dir();
        let mut source = MockMessageSource::new();
        // limit 10, batch 4: pages of 4, 4 and 2 are requested.
        source
            .expect_fetch_history()
            .withf(|_, limit, after| *limit == 4 && *after == 0)
            .times(1)
            .returning(|_, _, _| Ok(page(1..=4)));
        source
            .expect_fetch_history()
            .withf(|_, limit, after| *limit == 4 && *after == 4)
            .times(1)
            .returning(|_, _, _| Ok(page(5..=8)));
        source
            .expect_fetch_history()
            .withf(|_, limit, after| *limit == 2 && *after == 8)
            .times(1)
            .returning(|_, _, _| Ok(page(9..=10)));
        let mut state = ProgressState::new();

        let controller = BackfillController::without_delays(10, 4);
        let processed = controller
            .run(&source, &dispatcher(&dir), &mut state, "@chan")
            .await;

        assert_eq!(processed, 10);
        assert_eq!(state.last_processed_id(), 10);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn empty_page_terminates_backfill() {
        let dir = scratch_dir();
        let mut source = MockMessageSource::new();
        source
            .expect_fetch_history()
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        let mut state = ProgressState::new();

        let controller = BackfillController::without_delays(10, 4);
        let processed = controller
            .run(&source, &dispatcher(&dir), &mut state, "@chan")
            .await;
        assert_eq!(processed, 0);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn cursor_advances_past_failing_pages() {
        let dir = scratch_dir();
        let mut source = MockMessageSource::new();
        // Every download in the first page fails; the cursor must still move
        // to the page's last id.
        source
            .expect_fetch_history()
            .withf(|_, _, after| *after == 0)
            .times(1)
            .returning(|_, _, _| {
                Ok((1..=4)
                    .map(|id| ChannelMessage {
                        media: Some(MediaKind::Photo(MediaRef {
                            file_id: format!("pic-{id}"),
                        })),
                        ..bare_message(id)
                    })
                    .collect())
            });
        source
            .expect_fetch_history()
            .withf(|_, _, after| *after == 4)
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        source
            .expect_download()
            .returning(|_, _| Err(SourceError::Api("gone".to_string())));
        let mut state = ProgressState::new();

        let controller = BackfillController::without_delays(10, 4);
        let processed = controller
            .run(&source, &dispatcher(&dir), &mut state, "@chan")
            .await;

        assert_eq!(processed, 4);
        assert_eq!(state.statistics().failed_downloads, 4);
        assert_eq!(state.last_processed_id(), 4);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn seen_messages_are_not_dispatched_again() {
        let dir = scratch_dir();
        let mut source = MockMessageSource::new();
        // A page that overlaps the watermark boundary: id 3 is already seen.
        source
            .expect_fetch_history()
            .withf(|_, _, after| *after == 3)
            .times(1)
            .returning(|_, _, _| Ok(page(3..=4)));
        source
            .expect_fetch_history()
            .withf(|_, _, after| *after == 4)
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));
        let mut state = ProgressState::new();
        state.mark_seen(2);
        state.mark_seen(3);

        let controller = BackfillController::without_delays(10, 4);
        let processed = controller
            .run(&source, &dispatcher(&dir), &mut state, "@chan")
            .await;

        // Only id 4 was new.
        assert_eq!(processed, 1);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }
}
