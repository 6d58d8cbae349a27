//! Embedded file-backed storage engines.
//!
//! Two stores share one file layer:
//!
//! - [`BTreeStore`]: an ordered map of fixed-width keys to fixed-width
//!   values, crash consistent through an undo journal
//! - [`LogStore`]: an append-only log of variable-length records
//!
//! Both own their directory through a lock file while open and report
//! failures as [`StoreError`].

pub mod config;
pub mod constants;
pub mod error;
pub mod options;
pub mod storage;

pub use constants::State;
pub use error::{ErrorCode, StoreError};
pub use options::{QueryOptions, StoreOptions};
pub use storage::{BTreeStore, LogStore, TreeOptions};
