//! Store metadata and page layout derivation.
//!
//! The fan-out of a tree is fixed when the store is created, from the block
//! size of the filesystem holding it, so that an internal node fits in as few
//! whole blocks as possible and a leaf uses every slot its blocks can hold.
//!
//! # Page layouts
//!
//! Internal node:
//!
//! | Field    | Width                           |
//! |----------|---------------------------------|
//! | size     | `node_size_bytes`               |
//! | keys     | `(node_order - 1) * key_bytes`  |
//! | children | `node_order * 8`                |
//!
//! Leaf:
//!
//! | Field  | Width                        |
//! |--------|------------------------------|
//! | size   | `leaf_size_bytes`            |
//! | prev   | 8                            |
//! | next   | 8                            |
//! | keys   | `leaf_order * key_bytes`     |
//! | values | `leaf_order * value_bytes`   |
//!
//! Both live in pages of [`Meta::page_size`] bytes, the larger of the two
//! rounded up to whole blocks.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::POINTER_BYTES;
use crate::error::StoreError;
use crate::storage::codec::{MAX_WIDTH, byte_width};
use crate::storage::io;

use super::node::PageId;

/// Smallest fan-out a valid store may have.
pub const MIN_ORDER: usize = 4;

/// Persistent description of a tree, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    /// Number of entries.
    pub size: u64,
    /// Number of internal levels above the leaves.
    pub depth: u64,
    pub node_order: usize,
    pub leaf_order: usize,
    pub block_size: u64,
    pub node_size_bytes: usize,
    pub leaf_size_bytes: usize,
    pub key_bytes: usize,
    pub value_bytes: usize,
    pub root: PageId,
    pub first: PageId,
    pub last: PageId,
    /// Next unused page id.
    pub next_id: PageId,
}

impl Meta {
    /// Derive the layout of a new, empty store whose root leaf is page 1.
    pub fn create(block_size: u64, key_bytes: usize, value_bytes: usize) -> Result<Self, StoreError> {
        if key_bytes == 0 || value_bytes == 0 {
            return Err(StoreError::InvalidArgument(
                "key_bytes and value_bytes must be positive".to_string(),
            ));
        }
        let block = usize::try_from(block_size)
            .ok()
            .filter(|&block| block > 0)
            .ok_or_else(|| StoreError::InvalidArgument(format!("block size {block_size}")))?;

        let (node_order, node_size_bytes) = node_order(block, key_bytes);
        let (leaf_order, leaf_size_bytes) =
            leaf_order(block, key_bytes, value_bytes, node_order, node_size_bytes);

        let meta = Self {
            size: 0,
            depth: 0,
            node_order,
            leaf_order,
            block_size,
            node_size_bytes,
            leaf_size_bytes,
            key_bytes,
            value_bytes,
            root: 1,
            first: 1,
            last: 1,
            next_id: 2,
        };
        tracing::debug!(
            "derived layout for block size {block_size}: node order {node_order}, leaf order {leaf_order}, page {} bytes",
            meta.page_size()
        );
        Ok(meta)
    }

    /// Bytes used by an encoded internal node.
    #[must_use]
    pub const fn node_bytes(&self) -> usize {
        self.node_size_bytes
            + (self.node_order - 1) * self.key_bytes
            + self.node_order * POINTER_BYTES
    }

    /// Bytes used by an encoded leaf.
    #[must_use]
    pub const fn leaf_bytes(&self) -> usize {
        self.leaf_size_bytes
            + 2 * POINTER_BYTES
            + self.leaf_order * (self.key_bytes + self.value_bytes)
    }

    /// Size of every page in the data file.
    #[must_use]
    pub fn page_size(&self) -> usize {
        let bytes = self.node_bytes().max(self.leaf_bytes());
        usize::try_from(self.block_size)
            .ok()
            .filter(|&block| block > 0)
            .map_or(bytes, |block| bytes.next_multiple_of(block))
    }

    /// Minimum children of a non-root internal node.
    #[must_use]
    pub const fn min_node_size(&self) -> usize {
        self.node_order.div_ceil(2)
    }

    /// Minimum entries of a non-root leaf.
    #[must_use]
    pub const fn min_leaf_size(&self) -> usize {
        self.leaf_order.div_ceil(2)
    }

    /// Checks without which pages cannot even be decoded.
    pub fn check_layout(&self) -> Result<(), StoreError> {
        if self.block_size < 1 {
            return Err(StoreError::corrupted("bad block_size"));
        }
        for (name, width) in [
            ("node_size_bytes", self.node_size_bytes),
            ("leaf_size_bytes", self.leaf_size_bytes),
        ] {
            if !(1..=MAX_WIDTH).contains(&width) {
                return Err(StoreError::corrupted(format!("bad {name}: {width}")));
            }
        }
        if self.key_bytes < 1 {
            return Err(StoreError::corrupted("bad key_bytes"));
        }
        if self.value_bytes < 1 {
            return Err(StoreError::corrupted("bad value_bytes"));
        }
        if self.node_order < 2 || byte_width(self.node_order as u64) > self.node_size_bytes {
            return Err(StoreError::corrupted(format!(
                "bad node_order: {}",
                self.node_order
            )));
        }
        if self.leaf_order < 2 || byte_width(self.leaf_order as u64) > self.leaf_size_bytes {
            return Err(StoreError::corrupted(format!(
                "bad leaf_order: {}",
                self.leaf_order
            )));
        }
        Ok(())
    }

    /// Reject out-of-range structural fields.
    pub fn validate(&self) -> Result<(), StoreError> {
        self.check_layout()?;
        if self.node_order < MIN_ORDER {
            return Err(StoreError::corrupted(format!(
                "bad node_order: {}",
                self.node_order
            )));
        }
        if self.leaf_order < MIN_ORDER {
            return Err(StoreError::corrupted(format!(
                "bad leaf_order: {}",
                self.leaf_order
            )));
        }
        if self.next_id < 2 {
            return Err(StoreError::corrupted(format!("bad next_id: {}", self.next_id)));
        }
        for (name, id) in [("root", self.root), ("first", self.first), ("last", self.last)] {
            if id < 1 || id >= self.next_id {
                return Err(StoreError::corrupted(format!("bad {name}: {id}")));
            }
        }
        if self.depth == 0 && (self.root != self.first || self.root != self.last) {
            return Err(StoreError::corrupted("root leaf is not the only leaf"));
        }
        Ok(())
    }

    /// Read and parse the metadata document at `path`.
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let json = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Write the metadata document to `path` and sync it.
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_vec(self).map_err(|e| std::io::Error::other(e.to_string()))?;
        io::write_durable(path, json).await?;
        Ok(())
    }
}

/// Largest fan-out whose node fits in whole blocks, and its size field width.
fn node_order(block: usize, key_bytes: usize) -> (usize, usize) {
    let item = key_bytes + POINTER_BYTES;
    let mut num_blocks = 0;
    let mut width = 1;
    loop {
        num_blocks += 1;
        // width + (order - 1) * key_bytes + order * 8 <= available
        let free = (block * num_blocks + key_bytes).saturating_sub(width);
        let order = free / item;
        if byte_width(order as u64) > width {
            width += 1;
            num_blocks -= 1;
            continue;
        }
        if order > MIN_ORDER {
            return (order, width);
        }
    }
}

/// Leaf fan-out: at least `node_order`, plus whatever the block slack holds.
fn leaf_order(
    block: usize,
    key_bytes: usize,
    value_bytes: usize,
    node_order: usize,
    node_width: usize,
) -> (usize, usize) {
    let item = key_bytes + value_bytes;
    let mut width = node_width;
    loop {
        let required = width + 2 * POINTER_BYTES + node_order * item;
        let available = required.next_multiple_of(block);
        let order = node_order + (available - required) / item;
        if byte_width(order as u64) <= width {
            return (order, width);
        }
        width += 1;
    }
}
