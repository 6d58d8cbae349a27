//! File-backed storage engine.
//!
//! # Layers
//!
//! - [`Sequential`]: a single-worker job queue that orders file mutations
//! - [`PagedFile`]: fixed-size page reads and writes on one file
//! - [`RollbackFile`]: a paged file plus an undo journal, giving atomic epochs
//! - [`BTreeStore`]: an ordered key-value store on a rollback file
//! - [`LogStore`]: an append-only record log with an offset index
//! - [`FreeList`]: a first-fit allocator over a caller-provided byte arena
//! - [`LockFile`]: single-process ownership of a store directory
//!
//! Every store directory holds a `lock` file while open.

pub mod btree;
pub mod codec;
pub mod free_list;
pub mod io;
mod lock_file;
mod log_store;
mod paged_file;
mod rollback;
mod sequential;

pub use btree::{BTreeStore, TreeOptions};
pub use free_list::{FreeList, FreeListError};
pub use lock_file::LockFile;
pub use log_store::{LogStore, RecordReader};
pub use paged_file::PagedFile;
pub use rollback::RollbackFile;
pub use sequential::{SequenceError, Sequential};
