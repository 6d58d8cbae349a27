//! Fixed-page-size random access file.
//!
//! A [`PagedFile`] addresses its file as an array of `page_size` byte pages.
//! Reads go straight to the file; writes, truncations and flushes are pushed
//! onto the file's [`Sequential`] queue when the method is called, so callers
//! observe them in submission order even if they await out of order.
//!
//! # Invariants
//!
//! - Reads past end of file yield zero bytes, never an error
//! - Every written buffer is exactly one page long
//! - `flush` resolves only after every write queued before it is durable

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::constants::State;
use crate::error::StoreError;
use crate::options::StoreOptions;
use crate::storage::io;
use crate::storage::sequential::Sequential;

struct Handle {
    state: State,
    file: Option<Arc<File>>,
}

/// A file read and written in whole pages.
pub struct PagedFile {
    path: PathBuf,
    page_size: usize,
    queue: Sequential,
    handle: Mutex<Handle>,
}

impl PagedFile {
    /// Describe a paged file at `path`. Nothing is touched until [`open`](Self::open).
    ///
    /// # Panics
    /// Panics if `page_size` is zero.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be positive");
        Self {
            path: path.into(),
            page_size,
            queue: Sequential::new(),
            handle: Mutex::new(Handle {
                state: State::Closed,
                file: None,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Open (and optionally create or truncate) the underlying file.
    pub async fn open(&self, options: StoreOptions) -> Result<(), StoreError> {
        self.transition("open", State::Closed, State::Opening)?;

        match self.open_file(options).await {
            Ok(file) => {
                let mut handle = self.lock();
                handle.file = Some(Arc::new(file));
                handle.state = State::Open;
                Ok(())
            }
            Err(e) => {
                self.lock().state = State::Closed;
                Err(e)
            }
        }
    }

    async fn open_file(&self, options: StoreOptions) -> Result<File, StoreError> {
        if !options.create && !io::exists(&self.path).await? {
            return Err(StoreError::Missing {
                path: self.path.clone(),
            });
        }

        let path = self.path.clone();
        let file = io::blocking(move || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(options.create)
                .truncate(options.truncate)
                .open(path)
        })
        .await?;
        Ok(file)
    }

    /// Read page `index` into a fresh buffer.
    pub async fn read_page(&self, index: u64) -> Result<Vec<u8>, StoreError> {
        let file = self.file("read_page")?;
        let page = io::read_at(file, self.offset(index), self.page_size).await?;
        Ok(page)
    }

    /// Read page `index` into `buf[offset..offset + page_size]`.
    pub async fn read_page_into(
        &self,
        index: u64,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<(), StoreError> {
        let end = offset + self.page_size;
        if end > buf.len() {
            return Err(StoreError::InvalidArgument(format!(
                "buffer of {} bytes cannot hold a page at offset {offset}",
                buf.len()
            )));
        }
        let page = self.read_page(index).await?;
        buf[offset..end].copy_from_slice(&page);
        Ok(())
    }

    /// Queue a write of `page` at page `index`.
    pub fn write_page(
        &self,
        index: u64,
        page: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let queued = self.check_page(&page).and_then(|()| {
            let file = self.file("write_page")?;
            let offset = self.offset(index);
            Ok(self.queue.push(async move {
                io::write_at(file, offset, page).await?;
                Ok::<(), StoreError>(())
            }))
        });
        async move { queued?.await }
    }

    /// Queue a durable sync of everything written before this call.
    pub fn flush(&self) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let queued = self.file("flush").map(|file| {
            self.queue.push(async move {
                io::sync_data(file).await?;
                Ok::<(), StoreError>(())
            })
        });
        async move { queued?.await }
    }

    /// Queue a resize of the file to exactly `pages` pages.
    pub fn truncate(&self, pages: u64) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let queued = self.file("truncate").map(|file| {
            let len = self.offset(pages);
            self.queue.push(async move {
                io::blocking(move || file.set_len(len)).await?;
                Ok::<(), StoreError>(())
            })
        });
        async move { queued?.await }
    }

    /// Number of pages, counting a trailing partial page as a whole one.
    pub async fn page_count(&self) -> Result<u64, StoreError> {
        let file = self.file("page_count")?;
        let len = io::file_len(file).await?;
        Ok(len.div_ceil(self.page_size as u64))
    }

    /// Flush pending writes and close the file.
    pub async fn close(&self) -> Result<(), StoreError> {
        self.transition("close", State::Open, State::Closing)?;
        let flushed = match self.file("close") {
            Ok(file) => {
                self.queue
                    .push(async move {
                        io::sync_data(file).await?;
                        Ok::<(), StoreError>(())
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        let mut handle = self.lock();
        handle.file = None;
        handle.state = State::Closed;
        flushed
    }

    fn check_page(&self, page: &[u8]) -> Result<(), StoreError> {
        if page.len() == self.page_size {
            Ok(())
        } else {
            Err(StoreError::InvalidArgument(format!(
                "page of {} bytes, expected {}",
                page.len(),
                self.page_size
            )))
        }
    }

    const fn offset(&self, index: u64) -> u64 {
        index * self.page_size as u64
    }

    fn file(&self, operation: &'static str) -> Result<Arc<File>, StoreError> {
        let handle = self.lock();
        match (&handle.file, handle.state) {
            (Some(file), State::Open | State::Closing) => Ok(Arc::clone(file)),
            (_, state) => Err(StoreError::bad_state(operation, state)),
        }
    }

    fn transition(&self, operation: &'static str, from: State, to: State) -> Result<(), StoreError> {
        let mut handle = self.lock();
        if handle.state != from {
            return Err(StoreError::bad_state(operation, handle.state));
        }
        handle.state = to;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Handle> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::tempdir;

    async fn open_file(path: &Path, page_size: usize) -> PagedFile {
        let file = PagedFile::new(path, page_size);
        file.open(StoreOptions::default()).await.expect("open");
        file
    }

    #[tokio::test]
    async fn test_write_then_read_page() {
        let dir = tempdir().expect("create temp dir");
        let file = open_file(&dir.path().join("pages"), 16).await;

        file.write_page(2, vec![7u8; 16]).await.expect("write");
        assert_eq!(file.read_page(2).await.expect("read"), vec![7u8; 16]);
        assert_eq!(file.page_count().await.expect("count"), 3);
        // Hole before page 2 reads as zeros.
        assert_eq!(file.read_page(0).await.expect("read"), vec![0u8; 16]);
        // So does anything past the end.
        assert_eq!(file.read_page(9).await.expect("read"), vec![0u8; 16]);
    }

    #[tokio::test]
    async fn test_writes_apply_in_submission_order() {
        let dir = tempdir().expect("create temp dir");
        let file = open_file(&dir.path().join("pages"), 4).await;

        let first = file.write_page(0, vec![1; 4]);
        let second = file.write_page(0, vec![2; 4]);
        let flushed = file.flush();
        second.await.expect("second");
        first.await.expect("first");
        flushed.await.expect("flush");

        assert_eq!(file.read_page(0).await.expect("read"), vec![2; 4]);
    }

    #[tokio::test]
    async fn test_read_page_into_offset() {
        let dir = tempdir().expect("create temp dir");
        let file = open_file(&dir.path().join("pages"), 4).await;
        file.write_page(1, b"abcd".to_vec()).await.expect("write");

        let mut buf = vec![0u8; 10];
        file.read_page_into(1, &mut buf, 3).await.expect("read into");
        assert_eq!(&buf, b"\0\0\0abcd\0\0\0");

        let err = file
            .read_page_into(1, &mut buf, 8)
            .await
            .expect_err("buffer too small");
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_wrong_page_length_rejected() {
        let dir = tempdir().expect("create temp dir");
        let file = open_file(&dir.path().join("pages"), 8).await;
        let err = file.write_page(0, vec![0; 7]).await.expect_err("too short");
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_truncate() {
        let dir = tempdir().expect("create temp dir");
        let file = open_file(&dir.path().join("pages"), 8).await;
        file.write_page(4, vec![1; 8]).await.expect("write");
        file.truncate(2).await.expect("truncate");
        assert_eq!(file.page_count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn test_missing_without_create() {
        let dir = tempdir().expect("create temp dir");
        let file = PagedFile::new(dir.path().join("absent"), 8);
        let err = file
            .open(StoreOptions::default().create(false))
            .await
            .expect_err("missing");
        assert_eq!(err.code(), Some(ErrorCode::Missing));
        assert_eq!(file.state(), State::Closed);
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("pages");
        let file = open_file(&path, 8).await;
        let pending = file.write_page(0, vec![3; 8]);
        file.close().await.expect("close");
        pending.await.expect("queued write");

        let err = file.read_page(0).await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));
        let err = file.write_page(0, vec![0; 8]).await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));

        // The write queued before close reached the disk.
        let reopened = open_file(&path, 8).await;
        assert_eq!(reopened.read_page(0).await.expect("read"), vec![3; 8]);
    }

    #[tokio::test]
    async fn test_truncate_option_wipes_file() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("pages");
        let file = open_file(&path, 8).await;
        file.write_page(3, vec![1; 8]).await.expect("write");
        file.close().await.expect("close");

        let file = PagedFile::new(&path, 8);
        file.open(StoreOptions::default().truncate(true))
            .await
            .expect("open");
        assert_eq!(file.page_count().await.expect("count"), 0);
    }
}
