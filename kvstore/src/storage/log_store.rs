//! Append-only record log.
//!
//! A [`LogStore`] keeps variable-length records in two files inside its
//! directory. `data` holds the payloads back to back; `index` holds one
//! big-endian u64 cumulative offset per record, preceded by a zero sentinel.
//! Record `i` therefore spans `offset[i]..offset[i + 1]` of `data`, and a
//! lookup costs one 16-byte index read.
//!
//! # Durability
//!
//! An append writes and syncs the payload before it writes and syncs the new
//! offset, so the index never points at bytes that are not on disk. The
//! in-memory length only advances after both syncs succeed. Appends run one at
//! a time on the store's queue in the order they were called.
//!
//! # Validation
//!
//! Opening with `validate` replays the whole index: the sentinel must be zero,
//! offsets must never decrease or point past the data file, the index must be
//! a whole number of offsets. With `fix`, both files are cut back to the last
//! consistent record instead of failing. Payload bytes past the last offset
//! are what a crash between the two syncs of an append leaves behind; they
//! are discarded on every open.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt, stream};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::constants::{DATA_FILE_NAME, INDEX_FILE_NAME, LOCK_FILE_NAME, POINTER_BYTES, State};
use crate::error::StoreError;
use crate::options::{QueryOptions, StoreOptions};
use crate::storage::io;
use crate::storage::lock_file::LockFile;
use crate::storage::sequential::Sequential;

const OFFSET_BYTES: u64 = POINTER_BYTES as u64;

/// Lazy reader over one record's bytes.
pub type RecordReader = tokio::io::Take<tokio::fs::File>;

#[derive(Clone)]
struct Files {
    data: Arc<File>,
    index: Arc<File>,
}

struct Shared {
    state: State,
    files: Option<Files>,
    /// Number of durable records.
    length: u64,
    /// Data file bytes covered by the index.
    data_bytes: u64,
}

/// An append-only sequence of byte records.
pub struct LogStore {
    directory: PathBuf,
    lock: Arc<LockFile>,
    queue: Sequential,
    shared: Arc<Mutex<Shared>>,
}

impl LogStore {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            lock: Arc::new(LockFile::new(directory.join(LOCK_FILE_NAME))),
            directory,
            queue: Sequential::new(),
            shared: Arc::new(Mutex::new(Shared {
                state: State::Closed,
                files: None,
                length: 0,
                data_bytes: 0,
            })),
        }
    }

    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub fn state(&self) -> State {
        guard(&self.shared).state
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> u64 {
        guard(&self.shared).length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of payload stored.
    #[must_use]
    pub fn data_bytes(&self) -> u64 {
        guard(&self.shared).data_bytes
    }

    /// Bytes of the offset index, sentinel included.
    #[must_use]
    pub fn index_bytes(&self) -> u64 {
        (self.len() + 1) * OFFSET_BYTES
    }

    /// Total bytes on disk across both files.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.data_bytes() + self.index_bytes()
    }

    /// Acquire the lock, open both files and check the index.
    pub async fn open(&self, options: StoreOptions) -> Result<(), StoreError> {
        {
            let mut shared = guard(&self.shared);
            if shared.state != State::Closed {
                return Err(StoreError::bad_state("open", shared.state));
            }
            shared.state = State::Opening;
        }

        if let Err(e) = self.prepare_directory(options).await {
            guard(&self.shared).state = State::Closed;
            return Err(e);
        }
        if let Err(e) = self.lock.acquire().await {
            guard(&self.shared).state = State::Closed;
            return Err(e);
        }

        match self.load(options).await {
            Ok((files, length, data_bytes)) => {
                let mut shared = guard(&self.shared);
                shared.files = Some(files);
                shared.length = length;
                shared.data_bytes = data_bytes;
                shared.state = State::Open;
                drop(shared);
                tracing::info!(
                    "opened log store {} with {length} record(s)",
                    self.directory.display()
                );
                Ok(())
            }
            Err(e) => {
                self.lock.release_quietly().await;
                guard(&self.shared).state = State::Closed;
                Err(e)
            }
        }
    }

    async fn prepare_directory(&self, options: StoreOptions) -> Result<(), StoreError> {
        if options.create {
            tokio::fs::create_dir_all(&self.directory).await?;
        } else if !io::exists(&self.directory.join(INDEX_FILE_NAME)).await? {
            return Err(StoreError::Missing {
                path: self.directory.clone(),
            });
        }
        Ok(())
    }

    async fn load(&self, options: StoreOptions) -> Result<(Files, u64, u64), StoreError> {
        let files = Files {
            data: Arc::new(open_file(self.directory.join(DATA_FILE_NAME), options).await?),
            index: Arc::new(open_file(self.directory.join(INDEX_FILE_NAME), options).await?),
        };

        let index_len = io::file_len(Arc::clone(&files.index)).await?;
        let (records, data_bytes) = if index_len == 0 {
            io::write_at(Arc::clone(&files.index), 0, 0u64.to_be_bytes().to_vec()).await?;
            io::sync_data(Arc::clone(&files.index)).await?;
            (0, 0)
        } else {
            let data_len = io::file_len(Arc::clone(&files.data)).await?;
            let index = io::read_at(Arc::clone(&files.index), 0, usize_from(index_len)?).await?;
            if options.validate {
                match check_index(&index, data_len) {
                    Ok(checked) => checked,
                    Err(damage) => {
                        self.repair_or_fail(&files, options, &damage).await?;
                        (damage.records, damage.data_bytes)
                    }
                }
            } else {
                let records = (index_len / OFFSET_BYTES).saturating_sub(1);
                (records, offset_at(&index, records))
            }
        };

        self.discard_tail(&files, data_bytes).await?;
        Ok((files, records, data_bytes))
    }

    /// Cut payload bytes no offset covers, left by an append torn between
    /// its data and index syncs.
    async fn discard_tail(&self, files: &Files, data_bytes: u64) -> Result<(), StoreError> {
        let data_len = io::file_len(Arc::clone(&files.data)).await?;
        if data_len <= data_bytes {
            return Ok(());
        }
        tracing::warn!(
            "discarding {} unindexed byte(s) at the end of log store {}",
            data_len - data_bytes,
            self.directory.display()
        );
        let data = Arc::clone(&files.data);
        io::blocking(move || data.set_len(data_bytes)).await?;
        io::sync_data(Arc::clone(&files.data)).await?;
        Ok(())
    }

    async fn repair_or_fail(
        &self,
        files: &Files,
        options: StoreOptions,
        damage: &Damage,
    ) -> Result<(), StoreError> {
        if !options.fix {
            return Err(StoreError::corrupted(format!(
                "log store {}: {}",
                self.directory.display(),
                damage.reason
            )));
        }

        tracing::warn!(
            "repairing log store {}: {}; keeping {} record(s)",
            self.directory.display(),
            damage.reason,
            damage.records
        );
        let index = Arc::clone(&files.index);
        let index_len = (damage.records + 1) * OFFSET_BYTES;
        io::blocking(move || index.set_len(index_len)).await?;
        // The sentinel itself may have been the damaged offset.
        io::write_at(Arc::clone(&files.index), 0, 0u64.to_be_bytes().to_vec()).await?;
        let data = Arc::clone(&files.data);
        let data_len = damage.data_bytes;
        io::blocking(move || data.set_len(data_len)).await?;
        io::sync_data(Arc::clone(&files.index)).await?;
        io::sync_data(Arc::clone(&files.data)).await?;
        Ok(())
    }

    /// Queue `payload` as the next record, resolving to its index once durable.
    pub fn append<P: Into<Vec<u8>>>(
        &self,
        payload: P,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send + use<P> {
        let payload = payload.into();
        let queued = self.files("append").map(|files| {
            let shared = Arc::clone(&self.shared);
            let lock = Arc::clone(&self.lock);
            self.queue.push(async move {
                let (length, start) = {
                    let shared = guard(&shared);
                    // An earlier append may have failed the store meanwhile.
                    if !matches!(shared.state, State::Open | State::Closing) {
                        return Err(StoreError::bad_state("append", shared.state));
                    }
                    (shared.length, shared.data_bytes)
                };
                let end = start + payload.len() as u64;

                let written = async {
                    io::write_at(Arc::clone(&files.data), start, payload).await?;
                    io::sync_data(Arc::clone(&files.data)).await?;
                    let slot = (length + 1) * OFFSET_BYTES;
                    io::write_at(Arc::clone(&files.index), slot, end.to_be_bytes().to_vec())
                        .await?;
                    io::sync_data(Arc::clone(&files.index)).await
                }
                .await;

                match written {
                    Ok(()) => {
                        let mut shared = guard(&shared);
                        shared.length = length + 1;
                        shared.data_bytes = end;
                        Ok(length)
                    }
                    Err(e) => {
                        fail(&shared, &lock).await;
                        Err(StoreError::from(e))
                    }
                }
            })
        });
        async move { queued?.await }
    }

    /// Resolves once every append queued before this call is durable.
    pub fn flush(&self) -> impl Future<Output = Result<(), StoreError>> + Send + use<> {
        let queued = self.files("flush").map(|_| self.queue.barrier());
        async move {
            queued?.await?;
            Ok(())
        }
    }

    /// Lazy reader over record `index`.
    pub async fn get(&self, index: u64) -> Result<RecordReader, StoreError> {
        let files = self.files("get")?;
        let length = self.len();
        if index >= length {
            return Err(StoreError::OutOfBounds { index, length });
        }

        match self.open_record(&files, index).await {
            Ok(reader) => Ok(reader),
            Err(e) => {
                fail(&self.shared, &self.lock).await;
                Err(e.into())
            }
        }
    }

    async fn open_record(&self, files: &Files, index: u64) -> std::io::Result<RecordReader> {
        let bounds = io::read_at(Arc::clone(&files.index), index * OFFSET_BYTES, 16).await?;
        let start = offset_at(&bounds, 0);
        let end = offset_at(&bounds, 1);

        let mut file = tokio::fs::File::open(self.directory.join(DATA_FILE_NAME)).await?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(file.take(end.saturating_sub(start)))
    }

    /// Read all of record `index`.
    pub async fn read(&self, index: u64) -> Result<Vec<u8>, StoreError> {
        let mut reader = self.get(index).await?;
        let mut record = Vec::new();
        if let Err(e) = reader.read_to_end(&mut record).await {
            fail(&self.shared, &self.lock).await;
            return Err(e.into());
        }
        Ok(record)
    }

    /// Record indices selected by `options`.
    #[must_use]
    pub fn keys(&self, options: QueryOptions) -> impl Iterator<Item = u64> + use<> {
        options.positions(self.len())
    }

    /// `(index, record)` pairs selected by `options`.
    pub fn entries(
        &self,
        options: QueryOptions,
    ) -> impl Stream<Item = Result<(u64, Vec<u8>), StoreError>> + '_ {
        stream::iter(self.keys(options))
            .then(move |index| async move { Ok::<_, StoreError>((index, self.read(index).await?)) })
    }

    /// Records selected by `options`.
    pub fn values(
        &self,
        options: QueryOptions,
    ) -> impl Stream<Item = Result<Vec<u8>, StoreError>> + '_ {
        stream::iter(self.keys(options)).then(move |index| self.read(index))
    }

    /// Wait for queued appends, close both files and release the lock.
    pub async fn close(&self) -> Result<(), StoreError> {
        {
            let mut shared = guard(&self.shared);
            if shared.state != State::Open {
                return Err(StoreError::bad_state("close", shared.state));
            }
            shared.state = State::Closing;
        }

        let drained = self.queue.barrier().await;
        {
            let mut shared = guard(&self.shared);
            shared.files = None;
            shared.state = State::Closed;
        }
        self.lock.release().await?;
        tracing::info!("closed log store {}", self.directory.display());
        Ok(drained?)
    }

    fn files(&self, operation: &'static str) -> Result<Files, StoreError> {
        let shared = guard(&self.shared);
        match (&shared.files, shared.state) {
            (Some(files), State::Open) => Ok(files.clone()),
            (_, state) => Err(StoreError::bad_state(operation, state)),
        }
    }
}

/// How much of a damaged log can be kept.
#[derive(Debug, PartialEq, Eq)]
struct Damage {
    reason: String,
    records: u64,
    data_bytes: u64,
}

/// Verify raw index bytes against the data file length.
///
/// Returns `(records, data_bytes)` for a consistent index.
fn check_index(index: &[u8], data_len: u64) -> Result<(u64, u64), Damage> {
    let whole = index.len() / POINTER_BYTES;
    if whole == 0 || offset_at(index, 0) != 0 {
        return Err(Damage {
            reason: "index sentinel is not zero".to_string(),
            records: 0,
            data_bytes: 0,
        });
    }

    let mut previous = 0;
    for i in 1..whole as u64 {
        let offset = offset_at(index, i);
        if offset < previous || offset > data_len {
            return Err(Damage {
                reason: format!(
                    "offset {offset} of record {} is outside {previous}..={data_len}",
                    i - 1
                ),
                records: i - 1,
                data_bytes: previous,
            });
        }
        previous = offset;
    }

    let records = whole as u64 - 1;
    if index.len() % POINTER_BYTES != 0 {
        return Err(Damage {
            reason: format!("{} trailing index byte(s)", index.len() % POINTER_BYTES),
            records,
            data_bytes: previous,
        });
    }
    Ok((records, previous))
}

fn offset_at(index: &[u8], slot: u64) -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    let start = slot as usize * POINTER_BYTES;
    index
        .get(start..start + POINTER_BYTES)
        .and_then(|bytes| bytes.try_into().ok())
        .map_or(0, u64::from_be_bytes)
}

fn usize_from(len: u64) -> Result<usize, StoreError> {
    usize::try_from(len).map_err(|_| StoreError::corrupted(format!("index of {len} bytes")))
}

async fn open_file(path: PathBuf, options: StoreOptions) -> Result<File, StoreError> {
    let file = io::blocking(move || {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(options.truncate)
            .open(path)
    })
    .await?;
    Ok(file)
}

/// Mark the store failed and give the lock back.
async fn fail(shared: &Mutex<Shared>, lock: &LockFile) {
    let held = {
        let mut shared = guard(shared);
        let held = matches!(shared.state, State::Open | State::Closing);
        shared.state = State::Failed;
        shared.files = None;
        held
    };
    if held {
        lock.release_quietly().await;
    }
}

fn guard(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    async fn open_store(dir: &Path) -> LogStore {
        let store = LogStore::new(dir);
        store.open(StoreOptions::default()).await.expect("open");
        store
    }

    fn offsets(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempdir().expect("create temp dir");
        let store = open_store(dir.path()).await;

        for payload in ["foo", "bar", "baz"] {
            store.append(payload).await.expect("append");
        }

        assert_eq!(store.len(), 3);
        assert_eq!(store.read(0).await.expect("read"), b"foo");
        assert_eq!(store.read(1).await.expect("read"), b"bar");
        assert_eq!(store.read(2).await.expect("read"), b"baz");

        let err = store.get(3).await.expect_err("out of bounds");
        assert_eq!(err.code(), Some(ErrorCode::OutOfBounds));
        store.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_get_is_a_lazy_reader() {
        let dir = tempdir().expect("create temp dir");
        let store = open_store(dir.path()).await;
        store.append(b"hello world".to_vec()).await.expect("append");
        store.append(b"!".to_vec()).await.expect("append");

        let mut reader = store.get(0).await.expect("get");
        let mut first = [0u8; 5];
        reader.read_exact(&mut first).await.expect("read head");
        assert_eq!(&first, b"hello");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.expect("read rest");
        assert_eq!(rest, b" world");
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_call_order() {
        let dir = tempdir().expect("create temp dir");
        let store = open_store(dir.path()).await;

        let pending: Vec<_> = (0..20u8).map(|i| store.append(vec![i; usize::from(i)])).collect();
        let indices = futures::future::try_join_all(pending)
            .await
            .expect("appends");
        assert_eq!(indices, (0..20).collect::<Vec<u64>>());

        store.flush().await.expect("flush");
        for i in 0..20u8 {
            assert_eq!(
                store.read(u64::from(i)).await.expect("read"),
                vec![i; usize::from(i)]
            );
        }
        assert_eq!(store.data_bytes(), (0..20).sum::<u64>());
        assert_eq!(store.index_bytes(), 21 * 8);
    }

    #[tokio::test]
    async fn test_reopen_preserves_records() {
        let dir = tempdir().expect("create temp dir");
        {
            let store = open_store(dir.path()).await;
            store.append("one").await.expect("append");
            store.append("").await.expect("append");
            store.append("three").await.expect("append");
            store.close().await.expect("close");
        }

        let store = open_store(dir.path()).await;
        assert_eq!(store.len(), 3);
        assert_eq!(store.read(1).await.expect("read"), b"");
        assert_eq!(store.read(2).await.expect("read"), b"three");
        assert_eq!(store.append("four").await.expect("append"), 3);
        assert_eq!(store.bytes(), 12 + 5 * 8);
    }

    #[tokio::test]
    async fn test_range_queries() {
        let dir = tempdir().expect("create temp dir");
        let store = open_store(dir.path()).await;
        for i in 0..6u8 {
            store.append(vec![b'a' + i]).await.expect("append");
        }

        let keys: Vec<u64> = store.keys(QueryOptions::new().gte(2).lt(5)).collect();
        assert_eq!(keys, vec![2, 3, 4]);

        let values: Vec<Vec<u8>> = store
            .values(QueryOptions::new().reverse(true).limit(2))
            .try_collect()
            .await
            .expect("values");
        assert_eq!(values, vec![b"f".to_vec(), b"e".to_vec()]);

        let entries: Vec<(u64, Vec<u8>)> = store
            .entries(QueryOptions::new().gt(3))
            .try_collect()
            .await
            .expect("entries");
        assert_eq!(entries, vec![(4, b"e".to_vec()), (5, b"f".to_vec())]);
    }

    #[tokio::test]
    async fn test_second_open_is_locked() {
        let dir = tempdir().expect("create temp dir");
        let first = open_store(dir.path()).await;
        let second = LogStore::new(dir.path());

        let err = second
            .open(StoreOptions::default())
            .await
            .expect_err("locked");
        assert_eq!(err.code(), Some(ErrorCode::Locked));
        assert_eq!(second.state(), State::Closed);

        first.close().await.expect("close");
        second.open(StoreOptions::default()).await.expect("open");
    }

    #[tokio::test]
    async fn test_missing_without_create() {
        let dir = tempdir().expect("create temp dir");
        let store = LogStore::new(dir.path().join("absent"));
        let err = store
            .open(StoreOptions::default().create(false))
            .await
            .expect_err("missing");
        assert_eq!(err.code(), Some(ErrorCode::Missing));
    }

    #[tokio::test]
    async fn test_operations_require_open() {
        let dir = tempdir().expect("create temp dir");
        let store = LogStore::new(dir.path());
        let err = store.append("x").await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));
        let err = store.get(0).await.expect_err("closed");
        assert_eq!(err.code(), Some(ErrorCode::BadState));
    }

    #[tokio::test]
    async fn test_corrupt_index_fails_and_releases_lock() {
        let dir = tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("data"), b"abcdef").expect("write data");
        std::fs::write(dir.path().join("index"), offsets(&[0, 3, 2])).expect("write index");

        let store = LogStore::new(dir.path());
        let err = store
            .open(StoreOptions::default())
            .await
            .expect_err("corrupted");
        assert_eq!(err.code(), Some(ErrorCode::Corrupted));
        assert!(!dir.path().join("lock").exists());
    }

    #[tokio::test]
    async fn test_fix_truncates_to_last_good_record() {
        let dir = tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("data"), b"abcdef").expect("write data");
        std::fs::write(dir.path().join("index"), offsets(&[0, 3, 2])).expect("write index");

        let store = LogStore::new(dir.path());
        store
            .open(StoreOptions::default().fix(true))
            .await
            .expect("open with fix");
        assert_eq!(store.len(), 1);
        assert_eq!(store.read(0).await.expect("read"), b"abc");
        store.close().await.expect("close");

        assert_eq!(
            std::fs::read(dir.path().join("index")).expect("read index"),
            offsets(&[0, 3])
        );
        assert_eq!(
            std::fs::read(dir.path().join("data")).expect("read data"),
            b"abc"
        );
    }

    #[tokio::test]
    async fn test_skip_validation_trusts_index() {
        let dir = tempdir().expect("create temp dir");
        std::fs::write(dir.path().join("data"), b"abcdefXYZ").expect("write data");
        std::fs::write(dir.path().join("index"), offsets(&[0, 2, 6])).expect("write index");

        let store = LogStore::new(dir.path());
        store
            .open(StoreOptions::default().validate(false))
            .await
            .expect("open");
        assert_eq!(store.len(), 2);
        assert_eq!(store.read(1).await.expect("read"), b"cdef");
    }

    #[tokio::test]
    async fn test_torn_append_tail_is_discarded() {
        let dir = tempdir().expect("create temp dir");
        {
            let store = open_store(dir.path()).await;
            store.append("foo").await.expect("append");
            store.close().await.expect("close");
        }

        // Crash after the payload sync but before the offset write.
        let mut data = std::fs::read(dir.path().join("data")).expect("read data");
        data.extend_from_slice(b"partial");
        std::fs::write(dir.path().join("data"), data).expect("write data");

        let store = open_store(dir.path()).await;
        assert_eq!(store.len(), 1);
        assert_eq!(store.data_bytes(), 3);
        assert_eq!(
            std::fs::read(dir.path().join("data")).expect("read data"),
            b"foo"
        );
        assert_eq!(store.append("bar").await.expect("append"), 1);
        assert_eq!(store.read(1).await.expect("read"), b"bar");
    }

    #[tokio::test]
    async fn test_queued_append_after_failure_does_not_write() {
        let dir = tempdir().expect("create temp dir");
        let store = open_store(dir.path()).await;

        // Hold the queue so the append is still pending when the store fails.
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let held = store.queue.push(async move {
            let _ = gate.await;
            Ok::<_, StoreError>(())
        });
        let pending = store.append("late");
        fail(&store.shared, &store.lock).await;
        release.send(()).expect("release queue");

        held.await.expect("held job");
        let err = pending.await.expect_err("failed store");
        assert_eq!(err.code(), Some(ErrorCode::BadState));
        assert_eq!(
            std::fs::metadata(dir.path().join("data")).expect("data").len(),
            0
        );
        assert!(!dir.path().join("lock").exists());
    }

    #[test]
    fn test_check_index() {
        assert_eq!(check_index(&offsets(&[0, 3, 5]), 5), Ok((2, 5)));
        assert_eq!(check_index(&offsets(&[0]), 0), Ok((0, 0)));

        let damage = check_index(&offsets(&[1, 3]), 3).expect_err("bad sentinel");
        assert_eq!((damage.records, damage.data_bytes), (0, 0));

        let damage = check_index(&offsets(&[0, 3, 9]), 5).expect_err("past data");
        assert_eq!((damage.records, damage.data_bytes), (1, 3));

        let mut odd = offsets(&[0, 2]);
        odd.push(7);
        let damage = check_index(&odd, 2).expect_err("trailing byte");
        assert_eq!((damage.records, damage.data_bytes), (1, 2));

        // Payload past the last offset is a torn append, not damage.
        assert_eq!(check_index(&offsets(&[0, 2]), 4), Ok((1, 2)));
    }
}
