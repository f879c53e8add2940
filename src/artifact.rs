//! Local artifact writing
//!
//! Turns a classified message into local files: downloaded media, caption
//! sidecars and rendered text bodies. Paths derive deterministically from the
//! message identifier (and album group), so repeated attempts overwrite
//! rather than duplicate. Every produced file is enqueued for upload before
//! control returns to the dispatcher.

use crate::source::{ChannelMessage, MediaKind, MediaRef, MessageSource, SourceError};
use crate::uploader::UploadQueue;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Writes artifacts under a fixed storage root and hands them to the upload
/// queue.
pub struct ArtifactWriter {
    root: PathBuf,
    queue: Arc<UploadQueue>,
}

impl ArtifactWriter {
    /// Create a writer storing artifacts under `root`
    #[must_use]
    pub fn new(root: PathBuf, queue: Arc<UploadQueue>) -> Self {
        Self { root, queue }
    }

    /// Deterministic media destination: `{id}` or `{id}-{group}` under the
    /// storage root. The source appends the payload's file extension.
    fn media_stem(&self, msg: &ChannelMessage) -> PathBuf {
        let base = match &msg.group_id {
            Some(group) => format!("{}-{group}", msg.id),
            None => msg.id.to_string(),
        };
        self.root.join(base)
    }

    fn text_path(&self, msg: &ChannelMessage) -> PathBuf {
        self.root.join(format!("{}.txt", msg.id))
    }

    /// Write a message's text body to `{id}.txt` and enqueue it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save_text(
        &self,
        msg: &ChannelMessage,
        body: &str,
    ) -> Result<PathBuf, std::io::Error> {
        let path = self.text_path(msg);
        tokio::fs::write(&path, body).await?;
        self.queue.push(path.clone()).await;
        Ok(path)
    }

    /// Render a geo point (plus the original caption, when present) to
    /// `{id}.txt` and enqueue it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save_geo(
        &self,
        msg: &ChannelMessage,
        latitude: f64,
        longitude: f64,
    ) -> Result<PathBuf, std::io::Error> {
        let mut body = format!("lat: {latitude}\nlon: {longitude}");
        if let Some(text) = &msg.text {
            body.push_str("\n\n");
            body.push_str(text);
        }
        let path = self.text_path(msg);
        tokio::fs::write(&path, body).await?;
        self.queue.push(path.clone()).await;
        Ok(path)
    }

    /// Download a media payload, write the caption sidecar when the message
    /// carries one, and enqueue everything written.
    ///
    /// A stale media reference is refreshed exactly once by re-fetching the
    /// message; any other failure, or a failed retry, is terminal for this
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::RateLimited`] for provider throttling (the
    /// caller retries after the delay) or another variant for terminal
    /// failures.
    pub async fn save_media(
        &self,
        source: &dyn MessageSource,
        msg: &ChannelMessage,
        media: &MediaRef,
    ) -> Result<PathBuf, SourceError> {
        let dest = self.media_stem(msg);
        let path = self.download_with_refresh(source, msg, media, &dest).await?;
        self.queue.push(path.clone()).await;

        if let Some(text) = &msg.text {
            let sidecar = path.with_extension("txt");
            match tokio::fs::write(&sidecar, text).await {
                Ok(()) => self.queue.push(sidecar).await,
                Err(e) => warn!(message_id = msg.id, "sidecar write failed: {e}"),
            }
        }
        Ok(path)
    }

    async fn download_with_refresh(
        &self,
        source: &dyn MessageSource,
        msg: &ChannelMessage,
        media: &MediaRef,
        dest: &std::path::Path,
    ) -> Result<PathBuf, SourceError> {
        match source.download(media, dest).await {
            Err(SourceError::StaleMediaReference) => {
                debug!(message_id = msg.id, "media reference expired, re-fetching");
                let fresh = source.refetch(msg.chat_id, msg.id).await?;
                let fresh_ref = fresh
                    .as_ref()
                    .and_then(|m| m.media.as_ref())
                    .and_then(MediaKind::media_ref)
                    .ok_or(SourceError::StaleMediaReference)?;
                source.download(fresh_ref, dest).await
            }
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockMessageSource;
    use chrono::Utc;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tg-siphon-art-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    fn message(id: i64, group_id: Option<&str>, text: Option<&str>) -> ChannelMessage {
        ChannelMessage {
            id,
            chat_id: -100200300,
            group_id: group_id.map(str::to_owned),
            date: Utc::now(),
            text: text.map(str::to_owned),
            media: None,
        }
    }

    #[tokio::test]
    async fn text_artifact_is_written_and_enqueued() {
        let dir = scratch_dir();
        let queue = Arc::new(UploadQueue::new());
        let writer = ArtifactWriter::new(dir.clone(), queue.clone());

        let msg = message(5, None, Some("hello"));
        let path = writer.save_text(&msg, "hello").await.expect("save text");

        assert_eq!(path, dir.join("5.txt"));
        let body = tokio::fs::read_to_string(&path).await.expect("read back");
        assert_eq!(body, "hello");
        assert_eq!(queue.len().await, 1);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn geo_artifact_includes_caption() {
        let dir = scratch_dir();
        let queue = Arc::new(UploadQueue::new());
        let writer = ArtifactWriter::new(dir.clone(), queue.clone());

        let msg = message(9, None, Some("meet here"));
        let path = writer
            .save_geo(&msg, 51.5074, -0.1278)
            .await
            .expect("save geo");

        let body = tokio::fs::read_to_string(&path).await.expect("read back");
        assert_eq!(body, "lat: 51.5074\nlon: -0.1278\n\nmeet here");
        assert_eq!(queue.len().await, 1);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn media_stem_uses_group_id_when_present() {
        let dir = scratch_dir();
        let queue = Arc::new(UploadQueue::new());
        let writer = ArtifactWriter::new(dir.clone(), queue.clone());

        let grouped = message(12, Some("777"), None);
        assert_eq!(writer.media_stem(&grouped), dir.join("12-777"));
        let single = message(12, None, None);
        assert_eq!(writer.media_stem(&single), dir.join("12"));

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn media_download_writes_sidecar_for_caption() {
        let dir = scratch_dir();
        let queue = Arc::new(UploadQueue::new());
        let writer = ArtifactWriter::new(dir.clone(), queue.clone());

        let mut msg = message(21, None, Some("caption"));
        let media = MediaRef {
            file_id: "abc".to_string(),
        };
        msg.media = Some(MediaKind::Photo(media.clone()));

        let mut source = MockMessageSource::new();
        source.expect_download().returning(|_, dest| {
            let path = dest.with_extension("jpg");
            std::fs::write(&path, b"jpeg").expect("write media");
            Ok(path)
        });

        let path = writer
            .save_media(&source, &msg, &media)
            .await
            .expect("save media");
        assert_eq!(path, dir.join("21.jpg"));
        assert!(dir.join("21.txt").exists());
        // Media file plus sidecar
        assert_eq!(queue.len().await, 2);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn stale_reference_is_refreshed_once() {
        let dir = scratch_dir();
        let queue = Arc::new(UploadQueue::new());
        let writer = ArtifactWriter::new(dir.clone(), queue.clone());

        let media = MediaRef {
            file_id: "old".to_string(),
        };
        let mut msg = message(33, None, None);
        msg.media = Some(MediaKind::Photo(media.clone()));

        let refreshed = ChannelMessage {
            media: Some(MediaKind::Photo(MediaRef {
                file_id: "new".to_string(),
            })),
            ..msg.clone()
        };

        let mut source = MockMessageSource::new();
        source
            .expect_download()
            .times(1)
            .returning(|_, _| Err(SourceError::StaleMediaReference));
        source
            .expect_refetch()
            .times(1)
            .returning(move |_, _| Ok(Some(refreshed.clone())));
        source
            .expect_download()
            .withf(|media, _| media.file_id == "new")
            .times(1)
            .returning(|_, dest| {
                let path = dest.with_extension("jpg");
                std::fs::write(&path, b"jpeg").expect("write media");
                Ok(path)
            });

        let path = writer
            .save_media(&source, &msg, &media)
            .await
            .expect("save media after refresh");
        assert_eq!(path, dir.join("33.jpg"));
        assert_eq!(queue.len().await, 1);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }

    #[tokio::test]
    async fn vanished_message_on_refresh_is_terminal() {
        let dir = scratch_dir();
        let queue = Arc::new(UploadQueue::new());
        let writer = ArtifactWriter::new(dir.clone(), queue.clone());

        let media = MediaRef {
            file_id: "old".to_string(),
        };
        let mut msg = message(34, None, None);
        msg.media = Some(MediaKind::Photo(media.clone()));

        let mut source = MockMessageSource::new();
        source
            .expect_download()
            .returning(|_, _| Err(SourceError::StaleMediaReference));
        source.expect_refetch().returning(|_, _| Ok(None));

        let result = writer.save_media(&source, &msg, &media).await;
        assert!(matches!(result, Err(SourceError::StaleMediaReference)));
        assert!(queue.is_empty().await);

        tokio::fs::remove_dir_all(&dir).await.expect("cleanup");
    }
}
