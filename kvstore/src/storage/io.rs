//! Filesystem helpers used by the file layer.
//!
//! Positional reads and writes on a shared `File` handle, block-size probing,
//! existence checks and directory syncing. Blocking calls run on tokio's
//! blocking pool so they never stall the queue workers.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Block size assumed when the platform cannot report one.
pub const DEFAULT_BLOCK_SIZE: u64 = 4096;

/// Run a blocking filesystem closure on the blocking pool.
pub async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::other(format!("blocking task failed: {e}")))?
}

/// Read `len` bytes at `offset`; bytes past end of file read as zeros.
pub async fn read_at(file: Arc<File>, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    blocking(move || {
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match positional_read(&file, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(buf)
    })
    .await
}

/// Write all of `buf` at `offset`.
pub async fn write_at(file: Arc<File>, offset: u64, buf: Vec<u8>) -> io::Result<()> {
    blocking(move || {
        let mut written = 0;
        while written < buf.len() {
            match positional_write(&file, &buf[written..], offset + written as u64) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    })
    .await
}

/// Flush file data (not necessarily metadata) to the device.
pub async fn sync_data(file: Arc<File>) -> io::Result<()> {
    blocking(move || file.sync_data()).await
}

/// Current length of the file in bytes.
pub async fn file_len(file: Arc<File>) -> io::Result<u64> {
    blocking(move || Ok(file.metadata()?.len())).await
}

/// Replace the contents of `path` with `bytes` and sync them.
pub async fn write_durable(path: &Path, bytes: Vec<u8>) -> io::Result<()> {
    let path = path.to_path_buf();
    blocking(move || {
        use std::io::Write;
        let mut file = File::create(path)?;
        file.write_all(&bytes)?;
        file.sync_all()
    })
    .await
}

/// Whether `path` exists.
pub async fn exists(path: &Path) -> io::Result<bool> {
    tokio::fs::try_exists(path).await
}

/// Make a directory's entries (renames, removals) durable.
pub async fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let path = path.to_path_buf();
        blocking(move || File::open(path)?.sync_all()).await
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Probe the physical block size of the filesystem holding `dir`.
///
/// Writes a one-byte scratch file and reads back its preferred I/O block
/// size. Platforms without that information report [`DEFAULT_BLOCK_SIZE`].
pub async fn block_size(dir: &Path) -> io::Result<u64> {
    let probe: PathBuf = dir.join(format!(".blksize-{}", std::process::id()));
    tokio::fs::write(&probe, b"a").await?;
    let metadata = tokio::fs::metadata(&probe).await;
    tokio::fs::remove_file(&probe).await?;
    let metadata = metadata?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let size = metadata.blksize();
        Ok(if size == 0 { DEFAULT_BLOCK_SIZE } else { size })
    }
    #[cfg(not(unix))]
    {
        let _ = metadata;
        Ok(DEFAULT_BLOCK_SIZE)
    }
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn positional_write(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn open(path: &Path) -> Arc<File> {
        Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .expect("open file"),
        )
    }

    #[tokio::test]
    async fn test_write_then_read_at() {
        let dir = tempdir().expect("create temp dir");
        let file = open(&dir.path().join("f"));

        write_at(Arc::clone(&file), 10, b"hello".to_vec())
            .await
            .expect("write");
        let buf = read_at(Arc::clone(&file), 10, 5).await.expect("read");
        assert_eq!(buf, b"hello");
        assert_eq!(file_len(file).await.expect("len"), 15);
    }

    #[tokio::test]
    async fn test_read_past_end_is_zero_filled() {
        let dir = tempdir().expect("create temp dir");
        let file = open(&dir.path().join("f"));
        write_at(Arc::clone(&file), 0, b"ab".to_vec())
            .await
            .expect("write");

        let buf = read_at(file, 1, 4).await.expect("read");
        assert_eq!(buf, vec![b'b', 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_block_size_is_positive() {
        let dir = tempdir().expect("create temp dir");
        let size = block_size(dir.path()).await.expect("probe");
        assert!(size > 0);
        // The probe file is cleaned up.
        let mut entries = std::fs::read_dir(dir.path()).expect("read dir");
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_write_durable_replaces_contents() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("doc");
        write_durable(&path, b"first version".to_vec())
            .await
            .expect("write");
        write_durable(&path, b"second".to_vec()).await.expect("rewrite");
        assert_eq!(std::fs::read(&path).expect("read"), b"second");
    }

    #[tokio::test]
    async fn test_exists() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("f");
        assert!(!exists(&path).await.expect("exists"));
        std::fs::write(&path, b"x").expect("write");
        assert!(exists(&path).await.expect("exists"));
    }
}
