//! Constants shared by the stores and the file layer.

use std::fmt;

/// Width in bytes of every on-disk pointer (page ids, log offsets, journal tags).
pub const POINTER_BYTES: usize = 8;

/// Name of the lock file inside a store directory.
pub const LOCK_FILE_NAME: &str = "lock";

/// Name of the metadata document of a B+tree store.
pub const META_FILE_NAME: &str = "meta";

/// Pre-image of the metadata document kept while a B+tree commit is in flight.
pub const META_UNDO_FILE_NAME: &str = "meta.undo";

/// Name of the payload file (log store) or page file (B+tree store).
pub const DATA_FILE_NAME: &str = "data";

/// Name of the offset file of a log store.
pub const INDEX_FILE_NAME: &str = "index";

/// Name of the undo journal of a rollback file.
pub const JOURNAL_FILE_NAME: &str = "journal";

/// Lifecycle state of a file or store handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Opening,
    Open,
    Closing,
    /// An operation failed midway; the handle must be dropped.
    Failed,
}

impl State {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker written into a lock file identifying the owning process.
#[must_use]
pub fn process_marker() -> Vec<u8> {
    std::process::id().to_string().into_bytes()
}
