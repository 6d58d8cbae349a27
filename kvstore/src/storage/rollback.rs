//! Paged file with an undo journal.
//!
//! A [`RollbackFile`] makes a batch of in-place page writes look atomic
//! across crashes. Before a page is first overwritten in an epoch, its current
//! contents are appended to the journal and synced. [`RollbackFile::checkpoint`]
//! makes the data durable and empties the journal, which ends the epoch. If the
//! process dies mid-epoch, the next [`RollbackFile::open`] copies every journaled
//! pre-image back, returning the data file to its state at the last checkpoint.
//!
//! # Journal slot layout
//!
//! | Offset | Field                                      |
//! |--------|--------------------------------------------|
//! | 0-7    | Page index (u64 BE)                        |
//! | 8-11   | CRC32 of page index and pre-image (u32 BE) |
//! | 12-    | Pre-image (`page_size` bytes)              |
//!
//! Replay stops at the first slot whose checksum does not match, which covers
//! a slot torn by a crash while it was being written.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::constants::State;
use crate::error::StoreError;
use crate::options::StoreOptions;
use crate::storage::paged_file::PagedFile;
use crate::storage::sequential::Sequential;

/// Bytes of a journal slot before the pre-image.
pub const SLOT_HEADER_BYTES: usize = 8 + 4;

/// A paged data file guarded by an undo journal.
pub struct RollbackFile {
    data: Arc<PagedFile>,
    journal: Arc<PagedFile>,
    page_size: usize,
    queue: Sequential,
    /// Page indices journaled since the last checkpoint.
    journaled: Arc<Mutex<HashSet<u64>>>,
    state: Mutex<State>,
}

impl RollbackFile {
    #[must_use]
    pub fn new(data: impl Into<PathBuf>, journal: impl Into<PathBuf>, page_size: usize) -> Self {
        Self {
            data: Arc::new(PagedFile::new(data, page_size)),
            journal: Arc::new(PagedFile::new(journal, page_size + SLOT_HEADER_BYTES)),
            page_size,
            queue: Sequential::new(),
            journaled: Arc::new(Mutex::new(HashSet::new())),
            state: Mutex::new(State::Closed),
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn state(&self) -> State {
        *lock(&self.state)
    }

    /// Open both files and roll back any interrupted epoch.
    ///
    /// Returns the number of pages restored from the journal.
    pub async fn open(&self, options: StoreOptions) -> Result<u64, StoreError> {
        {
            let mut state = lock(&self.state);
            if *state != State::Closed {
                return Err(StoreError::bad_state("open", *state));
            }
            *state = State::Opening;
        }

        match self.open_files(options).await {
            Ok(restored) => {
                *lock(&self.state) = State::Open;
                Ok(restored)
            }
            Err(e) => {
                for file in [&self.data, &self.journal] {
                    if file.state() == State::Open {
                        let _ = file.close().await;
                    }
                }
                *lock(&self.state) = State::Closed;
                Err(e)
            }
        }
    }

    async fn open_files(&self, options: StoreOptions) -> Result<u64, StoreError> {
        self.data.open(options).await?;
        self.journal.open(options.create(true)).await?;
        self.replay().await
    }

    async fn replay(&self) -> Result<u64, StoreError> {
        let slots = self.journal.page_count().await?;
        if slots == 0 {
            return Ok(0);
        }

        let mut restored = 0;
        for slot in 0..slots {
            let bytes = self.journal.read_page(slot).await?;
            let Some((index, image)) = decode_slot(&bytes) else {
                tracing::warn!(
                    "journal {} slot {slot} failed its checksum, stopping replay",
                    self.journal.path().display()
                );
                break;
            };
            self.data.write_page(index, image.to_vec()).await?;
            restored += 1;
        }

        self.data.flush().await?;
        self.journal.truncate(0).await?;
        self.journal.flush().await?;

        if restored > 0 {
            tracing::info!(
                "rolled back {restored} page(s) of {}",
                self.data.path().display()
            );
        }
        Ok(restored)
    }

    /// Read page `index` of the data file.
    pub async fn read_page(&self, index: u64) -> Result<Vec<u8>, StoreError> {
        self.ensure_open("read_page")?;
        self.data.read_page(index).await
    }

    /// Read page `index` into `buf[offset..offset + page_size]`.
    pub async fn read_page_into(
        &self,
        index: u64,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<(), StoreError> {
        self.ensure_open("read_page_into")?;
        self.data.read_page_into(index, buf, offset).await
    }

    /// Number of pages in the data file.
    pub async fn page_count(&self) -> Result<u64, StoreError> {
        self.ensure_open("page_count")?;
        self.data.page_count().await
    }

    /// Queue a write of `page`, journaling the current contents first if this
    /// is the page's first write since the last checkpoint.
    pub fn write_page(
        &self,
        index: u64,
        page: Vec<u8>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let queued = self.ensure_open("write_page").and_then(|()| {
            if page.len() != self.page_size {
                return Err(StoreError::InvalidArgument(format!(
                    "page of {} bytes, expected {}",
                    page.len(),
                    self.page_size
                )));
            }

            let data = Arc::clone(&self.data);
            let journal = Arc::clone(&self.journal);
            let journaled = Arc::clone(&self.journaled);
            Ok(self.queue.push(async move {
                let slot = {
                    let journaled = lock(&journaled);
                    (!journaled.contains(&index)).then(|| journaled.len() as u64)
                };

                if let Some(slot) = slot {
                    let image = data.read_page(index).await?;
                    journal.write_page(slot, encode_slot(index, &image)).await?;
                    journal.flush().await?;
                    lock(&journaled).insert(index);
                }

                data.write_page(index, page).await
            }))
        });
        async move { queued?.await }
    }

    /// Queue a durable sync of the data file.
    pub fn flush(&self) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let queued = self.ensure_open("flush").map(|()| {
            let data = Arc::clone(&self.data);
            self.queue.push(async move { data.flush().await })
        });
        async move { queued?.await }
    }

    /// Queue the end of the current epoch: sync data, then empty the journal.
    pub fn checkpoint(&self) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let queued = self.ensure_open("checkpoint").map(|()| self.push_checkpoint());
        async move { queued?.await }
    }

    fn push_checkpoint(&self) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let data = Arc::clone(&self.data);
        let journal = Arc::clone(&self.journal);
        let journaled = Arc::clone(&self.journaled);
        self.queue.push(async move {
            data.flush().await?;
            journal.truncate(0).await?;
            journal.flush().await?;
            lock(&journaled).clear();
            Ok::<(), StoreError>(())
        })
    }

    /// Checkpoint and close both files.
    pub async fn close(&self) -> Result<(), StoreError> {
        {
            let mut state = lock(&self.state);
            if *state != State::Open {
                return Err(StoreError::bad_state("close", *state));
            }
            *state = State::Closing;
        }

        let checkpointed = self.push_checkpoint().await;
        let data_closed = self.data.close().await;
        let journal_closed = self.journal.close().await;
        *lock(&self.state) = State::Closed;

        checkpointed.and(data_closed).and(journal_closed)
    }

    fn ensure_open(&self, operation: &'static str) -> Result<(), StoreError> {
        match *lock(&self.state) {
            State::Open => Ok(()),
            state => Err(StoreError::bad_state(operation, state)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn slot_checksum(index: &[u8], image: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(index);
    hasher.update(image);
    hasher.finalize()
}

/// Build the journal slot recording `image` as the pre-image of page `index`.
#[must_use]
pub fn encode_slot(index: u64, image: &[u8]) -> Vec<u8> {
    let index_bytes = index.to_be_bytes();
    let mut slot = Vec::with_capacity(SLOT_HEADER_BYTES + image.len());
    slot.extend_from_slice(&index_bytes);
    slot.extend_from_slice(&slot_checksum(&index_bytes, image).to_be_bytes());
    slot.extend_from_slice(image);
    slot
}

/// Split a journal slot into page index and pre-image, if its checksum holds.
#[must_use]
pub fn decode_slot(slot: &[u8]) -> Option<(u64, &[u8])> {
    if slot.len() < SLOT_HEADER_BYTES {
        return None;
    }
    let (index_bytes, rest) = slot.split_at(8);
    let (checksum, image) = rest.split_at(4);
    let stored = u32::from_be_bytes(checksum.try_into().ok()?);
    if stored != slot_checksum(index_bytes, image) {
        return None;
    }
    let index = u64::from_be_bytes(index_bytes.try_into().ok()?);
    Some((index, image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::path::Path;
    use tempfile::tempdir;

    const PAGE: usize = 16;

    async fn open_rollback(dir: &Path) -> (RollbackFile, u64) {
        let file = RollbackFile::new(dir.join("data"), dir.join("journal"), PAGE);
        let restored = file.open(StoreOptions::default()).await.expect("open");
        (file, restored)
    }

    #[test]
    fn test_slot_checksum_detects_damage() {
        let mut slot = encode_slot(5, &[9u8; PAGE]);
        assert_eq!(slot.len(), PAGE + SLOT_HEADER_BYTES);
        assert_eq!(decode_slot(&slot), Some((5, &[9u8; PAGE][..])));

        slot[20] ^= 0xff;
        assert_eq!(decode_slot(&slot), None);
        assert_eq!(decode_slot(&[0u8; PAGE + SLOT_HEADER_BYTES]), None);
    }

    #[tokio::test]
    async fn test_crash_before_checkpoint_rolls_back() {
        let dir = tempdir().expect("create temp dir");

        {
            let (file, restored) = open_rollback(dir.path()).await;
            assert_eq!(restored, 0);
            file.write_page(0, vec![b'a'; PAGE]).await.expect("write");
            file.checkpoint().await.expect("checkpoint");

            file.write_page(0, vec![b'b'; PAGE]).await.expect("write");
            file.write_page(0, vec![b'c'; PAGE]).await.expect("rewrite");
            file.write_page(3, vec![b'd'; PAGE]).await.expect("write");
            assert_eq!(file.read_page(0).await.expect("read"), vec![b'c'; PAGE]);
            // Dropped without checkpoint or close.
        }

        let (file, restored) = open_rollback(dir.path()).await;
        assert_eq!(restored, 2);
        assert_eq!(file.read_page(0).await.expect("read"), vec![b'a'; PAGE]);
        assert_eq!(file.read_page(3).await.expect("read"), vec![0u8; PAGE]);
        file.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_checkpoint_makes_writes_permanent() {
        let dir = tempdir().expect("create temp dir");

        {
            let (file, _) = open_rollback(dir.path()).await;
            file.write_page(1, vec![7; PAGE]).await.expect("write");
            file.checkpoint().await.expect("checkpoint");
        }

        let (file, restored) = open_rollback(dir.path()).await;
        assert_eq!(restored, 0);
        assert_eq!(file.read_page(1).await.expect("read"), vec![7; PAGE]);
    }

    #[tokio::test]
    async fn test_close_checkpoints() {
        let dir = tempdir().expect("create temp dir");

        let (file, _) = open_rollback(dir.path()).await;
        let pending = file.write_page(2, vec![4; PAGE]);
        file.close().await.expect("close");
        pending.await.expect("queued write");

        let journal_len = std::fs::metadata(dir.path().join("journal"))
            .expect("journal metadata")
            .len();
        assert_eq!(journal_len, 0);

        let (file, restored) = open_rollback(dir.path()).await;
        assert_eq!(restored, 0);
        assert_eq!(file.read_page(2).await.expect("read"), vec![4; PAGE]);
    }

    #[tokio::test]
    async fn test_flush_keeps_epoch_open() {
        let dir = tempdir().expect("create temp dir");

        {
            let (file, _) = open_rollback(dir.path()).await;
            file.write_page(2, vec![5; PAGE]).await.expect("write");
            file.flush().await.expect("flush");
            assert_eq!(file.page_count().await.expect("page count"), 3);

            let mut buf = vec![1u8; 2 * PAGE];
            file.read_page_into(2, &mut buf, PAGE)
                .await
                .expect("read into");
            assert_eq!(&buf[..PAGE], &[1u8; PAGE]);
            assert_eq!(&buf[PAGE..], &[5u8; PAGE]);
            // Dropped without checkpoint: a flush does not end the epoch.
        }

        let (file, restored) = open_rollback(dir.path()).await;
        assert_eq!(restored, 1);
        assert_eq!(file.read_page(2).await.expect("read"), vec![0u8; PAGE]);
    }

    #[tokio::test]
    async fn test_torn_slot_stops_replay() {
        let dir = tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("data"), vec![b'x'; 2 * PAGE]).expect("write data");

        let mut journal = encode_slot(1, &[b'o'; PAGE]);
        let mut torn = encode_slot(0, &[b'o'; PAGE]);
        torn.truncate(PAGE);
        journal.extend_from_slice(&torn);
        std::fs::write(dir.path().join("journal"), journal).expect("write journal");

        let (file, restored) = open_rollback(dir.path()).await;
        assert_eq!(restored, 1);
        assert_eq!(file.read_page(0).await.expect("read"), vec![b'x'; PAGE]);
        assert_eq!(file.read_page(1).await.expect("read"), vec![b'o'; PAGE]);
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let dir = tempdir().expect("create temp dir");
        let file = RollbackFile::new(dir.path().join("data"), dir.path().join("journal"), PAGE);

        let err = file.read_page(0).await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));
        let err = file.write_page(0, vec![0; PAGE]).await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));
        let err = file.page_count().await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));
        let err = file.flush().await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));

        let err = file
            .open(StoreOptions::default().create(false))
            .await
            .expect_err("missing");
        assert_eq!(err.code(), Some(ErrorCode::Missing));
        assert_eq!(file.state(), State::Closed);
    }
}
