//! Disk-based B+tree store.
//!
//! # Structure
//!
//! - Internal nodes: separator keys and child page ids
//! - Leaves: key-value pairs, doubly linked for range scans
//!
//! Keys and values have fixed widths chosen when the store is created. Pages
//! are stored in a [`RollbackFile`](super::RollbackFile) next to a JSON
//! metadata document; see [`layout`] for the page formats.
//!
//! # Usage
//!
//! ```no_run
//! use kvstore::options::{QueryOptions, StoreOptions};
//! use kvstore::storage::btree::{BTreeStore, TreeOptions};
//! use futures::TryStreamExt;
//!
//! # async fn demo() -> Result<(), kvstore::error::StoreError> {
//! let mut store = BTreeStore::new("./tree");
//! store
//!     .open(StoreOptions::default(), TreeOptions::new().key_bytes(4).value_bytes(4))
//!     .await?;
//! store.set(b"key1", b"val1").await?;
//! let keys: Vec<Vec<u8>> = store.keys(QueryOptions::new().limit(10)).try_collect().await?;
//! store.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod layout;
mod node;
mod tree;

pub use layout::{MIN_ORDER, Meta};
pub use node::{Leaf, Node, PageId};
pub use tree::{BTreeStore, Comparator, Entry, TreeOptions};
