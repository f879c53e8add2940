//! Remote transfer tool interface
//!
//! The transfer tool is injected behind the [`Transfer`] trait so the
//! subprocess invocation can be swapped for a native SDK call without
//! touching queue or worker logic.

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

/// Errors raised by a transfer attempt
#[derive(Error, Debug)]
pub enum TransferError {
    /// The tool binary could not be spawned
    #[error("failed to run transfer tool: {0}")]
    Spawn(#[from] std::io::Error),
    /// The tool ran but reported failure through its exit status
    #[error("transfer tool exited with status {code}: {stderr}")]
    Failed {
        /// Exit code, `-1` when terminated by a signal
        code: i32,
        /// Captured standard error output
        stderr: String,
    },
}

/// Copies one local file to a remote destination
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Copy `local` to `remote`. The tool is treated as a black box; only the
    /// exit status is examined.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool cannot be spawned or exits non-zero.
    async fn copy(&self, local: &Path, remote: &str) -> Result<(), TransferError>;
}

/// `rclone copyto` invoked as a subprocess
pub struct RcloneTransfer {
    binary: String,
    extra_args: Vec<String>,
}

impl RcloneTransfer {
    /// Create a transfer backed by the `rclone` binary on `PATH`, with
    /// `extra_args` (a whitespace-separated tunable string) passed through
    /// unexamined on every invocation.
    #[must_use]
    pub fn new(extra_args: &str) -> Self {
        Self::with_binary("rclone", extra_args)
    }

    fn with_binary(binary: &str, extra_args: &str) -> Self {
        Self {
            binary: binary.to_string(),
            extra_args: extra_args.split_whitespace().map(str::to_owned).collect(),
        }
    }
}

#[async_trait]
impl Transfer for RcloneTransfer {
    async fn copy(&self, local: &Path, remote: &str) -> Result<(), TransferError> {
        let output = Command::new(&self.binary)
            .arg("copyto")
            .arg(local)
            .arg(remote)
            .args(&self.extra_args)
            .output()
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransferError::Failed {
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
