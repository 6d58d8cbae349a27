//! Advisory lock file guarding a store directory.
//!
//! The lock is a plain file created with `create_new` and tagged with the
//! owning process id. It keeps two engine instances from opening the same
//! directory; it does not arbitrate anything within a process.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::constants::process_marker;
use crate::error::StoreError;

/// An exclusive marker file.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the lock file, failing with [`StoreError::Locked`] if it exists.
    pub async fn acquire(&self) -> Result<(), StoreError> {
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;

        match opened {
            Ok(mut file) => {
                file.write_all(&process_marker()).await?;
                file.sync_all().await?;
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::AlreadyExists | ErrorKind::PermissionDenied) => {
                let contents = tokio::fs::read(&self.path).await.unwrap_or_default();
                Err(StoreError::Locked {
                    path: self.path.clone(),
                    contents,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the lock file.
    pub async fn release(&self) -> Result<(), StoreError> {
        tokio::fs::remove_file(&self.path).await?;
        Ok(())
    }

    /// Release the lock after a failure, logging instead of returning errors.
    pub async fn release_quietly(&self) {
        if let Err(e) = self.release().await {
            tracing::warn!("failed to release lock {}: {e}", self.path.display());
        }
    }
}
