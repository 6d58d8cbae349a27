//! Decoded internal nodes and leaves, and their page codecs.
//!
//! Field widths come from [`Meta`]; see the layout tables in
//! [`layout`](super::layout). Unused key, child and value slots are zero.

use std::cmp::Ordering;

use crate::constants::POINTER_BYTES;
use crate::error::StoreError;
use crate::storage::codec::{read_be, write_be};

use super::layout::Meta;

/// Identifier of a page; page `id` lives at page index `id` of the data file.
pub type PageId = u64;

/// Three-way key comparison.
pub type Compare<'a> = &'a (dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync);

/// An internal page: `size` children separated by `size - 1` keys.
///
/// `children[i]` holds keys in `[keys[i - 1], keys[i])`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub keys: Vec<Vec<u8>>,
    pub children: Vec<PageId>,
}

impl Node {
    /// Number of children.
    #[must_use]
    pub fn size(&self) -> usize {
        self.children.len()
    }

    /// Slot of the child whose subtree may hold `key`.
    #[must_use]
    pub fn child_index(&self, key: &[u8], compare: Compare<'_>) -> usize {
        self.keys
            .partition_point(|probe| compare(probe, key) != Ordering::Greater)
    }

    /// Keep the first `at` children and return `(separator, right half)`.
    ///
    /// The separator is the key that divided the two halves; it belongs to
    /// neither of them afterwards.
    pub fn split_at(&mut self, at: usize) -> (Vec<u8>, Self) {
        let children = self.children.split_off(at);
        let keys = self.keys.split_off(at);
        let separator = self.keys.pop().unwrap_or_default();
        (separator, Self { keys, children })
    }

    /// Append `right`, joined under `separator`.
    pub fn absorb(&mut self, separator: Vec<u8>, mut right: Self) {
        self.keys.push(separator);
        self.keys.append(&mut right.keys);
        self.children.append(&mut right.children);
    }

    /// Encode into a zero-padded page of `page_size` bytes.
    #[must_use]
    pub fn encode(&self, meta: &Meta, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        let width = meta.node_size_bytes;
        write_be(&mut page[..width], self.size() as u64);

        let keys_start = width;
        for (i, key) in self.keys.iter().enumerate() {
            let start = keys_start + i * meta.key_bytes;
            page[start..start + meta.key_bytes].copy_from_slice(key);
        }

        let children_start = keys_start + (meta.node_order - 1) * meta.key_bytes;
        for (i, child) in self.children.iter().enumerate() {
            let start = children_start + i * POINTER_BYTES;
            page[start..start + POINTER_BYTES].copy_from_slice(&child.to_be_bytes());
        }
        page
    }

    /// Decode an internal page, rejecting impossible sizes.
    pub fn decode(page: &[u8], meta: &Meta) -> Result<Self, StoreError> {
        if page.len() < meta.node_bytes() {
            return Err(StoreError::corrupted("short node page"));
        }
        let width = meta.node_size_bytes;
        let size = usize::try_from(read_be(&page[..width])).unwrap_or(usize::MAX);
        if size == 0 || size > meta.node_order {
            return Err(StoreError::corrupted(format!("node size {size}")));
        }

        let keys = (0..size - 1)
            .map(|i| {
                let start = width + i * meta.key_bytes;
                page[start..start + meta.key_bytes].to_vec()
            })
            .collect();

        let children_start = width + (meta.node_order - 1) * meta.key_bytes;
        let children = (0..size)
            .map(|i| read_be(&page[children_start + i * POINTER_BYTES..][..POINTER_BYTES]))
            .collect();

        Ok(Self { keys, children })
    }
}

/// A leaf page: sorted keys with parallel values, linked to its neighbours.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leaf {
    /// Previous leaf in key order, 0 if none.
    pub prev: PageId,
    /// Next leaf in key order, 0 if none.
    pub next: PageId,
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
}

impl Leaf {
    /// Number of entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.keys.len()
    }

    /// `Ok(slot)` of `key`, or `Err(slot)` where it would be inserted.
    pub fn find(&self, key: &[u8], compare: Compare<'_>) -> Result<usize, usize> {
        self.keys.binary_search_by(|probe| compare(probe, key))
    }

    /// Splice a new entry in at `slot`.
    pub fn insert(&mut self, slot: usize, key: &[u8], value: &[u8]) {
        self.keys.insert(slot, key.to_vec());
        self.values.insert(slot, value.to_vec());
    }

    /// Remove the entry at `slot`.
    pub fn remove(&mut self, slot: usize) {
        self.keys.remove(slot);
        self.values.remove(slot);
    }

    /// Keep the first `at` entries and return the rest as an unlinked leaf.
    pub fn split_at(&mut self, at: usize) -> Self {
        Self {
            prev: 0,
            next: 0,
            keys: self.keys.split_off(at),
            values: self.values.split_off(at),
        }
    }

    /// Append the entries of `right`. Links are left to the caller.
    pub fn absorb(&mut self, mut right: Self) {
        self.keys.append(&mut right.keys);
        self.values.append(&mut right.values);
    }

    /// Encode into a zero-padded page of `page_size` bytes.
    #[must_use]
    pub fn encode(&self, meta: &Meta, page_size: usize) -> Vec<u8> {
        let mut page = vec![0u8; page_size];
        let width = meta.leaf_size_bytes;
        write_be(&mut page[..width], self.size() as u64);
        page[width..width + POINTER_BYTES].copy_from_slice(&self.prev.to_be_bytes());
        page[width + POINTER_BYTES..width + 2 * POINTER_BYTES]
            .copy_from_slice(&self.next.to_be_bytes());

        let keys_start = width + 2 * POINTER_BYTES;
        for (i, key) in self.keys.iter().enumerate() {
            let start = keys_start + i * meta.key_bytes;
            page[start..start + meta.key_bytes].copy_from_slice(key);
        }

        let values_start = keys_start + meta.leaf_order * meta.key_bytes;
        for (i, value) in self.values.iter().enumerate() {
            let start = values_start + i * meta.value_bytes;
            page[start..start + meta.value_bytes].copy_from_slice(value);
        }
        page
    }

    /// Decode a leaf page, rejecting impossible sizes.
    pub fn decode(page: &[u8], meta: &Meta) -> Result<Self, StoreError> {
        if page.len() < meta.leaf_bytes() {
            return Err(StoreError::corrupted("short leaf page"));
        }
        let width = meta.leaf_size_bytes;
        let size = usize::try_from(read_be(&page[..width])).unwrap_or(usize::MAX);
        if size > meta.leaf_order {
            return Err(StoreError::corrupted(format!("leaf size {size}")));
        }

        let prev = read_be(&page[width..width + POINTER_BYTES]);
        let next = read_be(&page[width + POINTER_BYTES..width + 2 * POINTER_BYTES]);

        let keys_start = width + 2 * POINTER_BYTES;
        let keys = (0..size)
            .map(|i| page[keys_start + i * meta.key_bytes..][..meta.key_bytes].to_vec())
            .collect();

        let values_start = keys_start + meta.leaf_order * meta.key_bytes;
        let values = (0..size)
            .map(|i| page[values_start + i * meta.value_bytes..][..meta.value_bytes].to_vec())
            .collect();

        Ok(Self {
            prev,
            next,
            keys,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn key(n: u32) -> Vec<u8> {
        n.to_be_bytes().to_vec()
    }

    fn meta() -> Meta {
        Meta::create(64, 4, 4).expect("layout")
    }

    #[test]
    fn test_child_index_uses_upper_bound() {
        let node = Node {
            keys: vec![key(10), key(20)],
            children: vec![1, 2, 3],
        };
        assert_eq!(node.child_index(&key(5), &bytewise), 0);
        // Separators belong to the right-hand child.
        assert_eq!(node.child_index(&key(10), &bytewise), 1);
        assert_eq!(node.child_index(&key(19), &bytewise), 1);
        assert_eq!(node.child_index(&key(20), &bytewise), 2);
        assert_eq!(node.child_index(&key(99), &bytewise), 2);
    }

    #[test]
    fn test_leaf_find() {
        let leaf = Leaf {
            keys: vec![key(1), key(3), key(5)],
            values: vec![key(0); 3],
            ..Leaf::default()
        };
        assert_eq!(leaf.find(&key(3), &bytewise), Ok(1));
        assert_eq!(leaf.find(&key(4), &bytewise), Err(2));
        assert_eq!(leaf.find(&key(0), &bytewise), Err(0));
    }

    #[test]
    fn test_node_split_and_absorb() {
        let mut node = Node {
            keys: vec![key(10), key(20), key(30), key(40), key(50)],
            children: vec![1, 2, 3, 4, 5, 6],
        };
        let (separator, right) = node.split_at(3);
        assert_eq!(separator, key(30));
        assert_eq!(node.children, vec![1, 2, 3]);
        assert_eq!(node.keys, vec![key(10), key(20)]);
        assert_eq!(right.children, vec![4, 5, 6]);
        assert_eq!(right.keys, vec![key(40), key(50)]);

        node.absorb(separator, right);
        assert_eq!(node.size(), 6);
        assert_eq!(node.keys.len(), 5);
        assert_eq!(node.keys[2], key(30));
    }

    #[test]
    fn test_node_codec() {
        let meta = meta();
        let node = Node {
            keys: vec![key(7), key(9)],
            children: vec![3, 4, 12],
        };
        let page = node.encode(&meta, meta.page_size());
        assert_eq!(page.len(), 64);
        assert_eq!(page[0], 3);
        assert_eq!(Node::decode(&page, &meta).expect("decode"), node);
    }

    #[test]
    fn test_leaf_codec() {
        let meta = meta();
        let leaf = Leaf {
            prev: 2,
            next: 9,
            keys: vec![key(1), key(2)],
            values: vec![key(100), key(200)],
        };
        let page = leaf.encode(&meta, meta.page_size());
        assert_eq!(Leaf::decode(&page, &meta).expect("decode"), leaf);

        // A zeroed page is an empty, unlinked leaf.
        let empty = Leaf::decode(&vec![0u8; meta.page_size()], &meta).expect("decode");
        assert_eq!(empty, Leaf::default());
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let meta = meta();
        let mut page = vec![0u8; meta.page_size()];
        page[0] = 6;
        assert!(Leaf::decode(&page, &meta).is_err());
        assert!(Node::decode(&page, &meta).is_err());

        // An internal node always has a child.
        page[0] = 0;
        assert!(Node::decode(&page, &meta).is_err());
    }
}
