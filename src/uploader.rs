//! Upload queue and worker pool
//!
//! Finished artifacts are handed from the dispatch context to a bounded pool
//! of upload workers through a single shared queue. Workers invoke the
//! transfer tool and delete the local file only after a confirmed transfer;
//! failed transfers keep the local file in place for the next startup rescan.

use crate::config::UPLOAD_POP_WAIT_SECS;
use crate::transfer::Transfer;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Unbounded queue of file paths pending upload. Safe for one producer and
/// many consumers.
#[derive(Default)]
pub struct UploadQueue {
    items: Mutex<VecDeque<PathBuf>>,
    notify: Notify,
}

impl UploadQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a file path; ownership of the local file passes to the queue
    pub async fn push(&self, path: PathBuf) {
        self.items.lock().await.push_back(path);
        self.notify.notify_one();
    }

    /// Pop one path, waiting at most `wait` for an item to appear. The
    /// bounded wait keeps worker loops responsive to shutdown.
    pub async fn pop_timeout(&self, wait: Duration) -> Option<PathBuf> {
        if let Some(path) = self.items.lock().await.pop_front() {
            return Some(path);
        }
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        self.items.lock().await.pop_front()
    }

    /// Whether the queue currently holds no items
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Number of queued items
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

/// Spawn `count` upload workers draining `queue` into `remote_dest`.
///
/// Workers run until `shutdown` is cancelled and the queue is drained; the
/// returned handles must be awaited (with a bound) before process exit so no
/// in-flight transfer is abandoned mid-copy.
#[must_use]
pub fn spawn_workers(
    count: usize,
    queue: Arc<UploadQueue>,
    transfer: Arc<dyn Transfer>,
    remote_dest: String,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            tokio::spawn(worker_loop(
                id,
                queue.clone(),
                transfer.clone(),
                remote_dest.clone(),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn worker_loop(
    id: usize,
    queue: Arc<UploadQueue>,
    transfer: Arc<dyn Transfer>,
    remote_dest: String,
    shutdown: CancellationToken,
) {
    let wait = Duration::from_secs(UPLOAD_POP_WAIT_SECS);
    loop {
        if shutdown.is_cancelled() && queue.is_empty().await {
            break;
        }
        let Some(path) = queue.pop_timeout(wait).await else {
            continue;
        };
        upload_one(id, &path, transfer.as_ref(), &remote_dest).await;
    }
    info!(worker = id, "upload worker stopped");
}

async fn upload_one(id: usize, path: &Path, transfer: &dyn Transfer, remote_dest: &str) {
    let name = path
        .file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
    let remote = format!("{}/{name}", remote_dest.trim_end_matches('/'));
    match transfer.copy(path, &remote).await {
        Ok(()) => {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                // Already gone is fine; another cleanup beat us to it.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(worker = id, file = %name, "local cleanup failed: {e}"),
            }
            info!(worker = id, file = %name, "uploaded & cleaned");
        }
        Err(e) => {
            warn!(worker = id, file = %name, error = %e, "upload failed, kept local");
        }
    }
}

/// Enqueue every regular file already present under `root`. Recovers files
/// written before a prior crash that never reached the remote destination.
pub async fn scan_local_files(root: &Path, queue: &UploadQueue) -> usize {
    let mut found = 0;
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(e) => {
            warn!(root = %root.display(), "local rescan failed: {e}");
            return 0;
        }
    };
    loop {
        match dir.next_entry().await {
            Ok(Some(entry)) => {
                let is_file = entry
                    .file_type()
                    .await
                    .map(|t| t.is_file())
                    .unwrap_or(false);
                if is_file {
                    queue.push(entry.path()).await;
                    found += 1;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(root = %root.display(), "local rescan aborted: {e}");
                break;
            }
        }
    }
    found
}
