//! Ordered key-value store over a B+tree of fixed-size pages.
//!
//! # Design
//!
//! All pages live in one [`RollbackFile`]; page `id` is page index `id`.
//! Every mutating call stages the pages it touches in a [`Batch`] and commits
//! them as one rollback epoch:
//!
//! 1. if the metadata changes, save its previous version as `meta.undo`
//! 2. write the staged pages (each first write is journaled)
//! 3. atomically replace `meta`
//! 4. checkpoint the rollback file
//! 5. remove `meta.undo`
//!
//! Opening after a crash rolls the pages back; if that restored anything,
//! `meta.undo` is the matching metadata and replaces `meta`.
//!
//! # Invariants
//!
//! - Keys within a page are strictly increasing under the comparator
//! - Non-root pages hold at least `ceil(order / 2)` children or entries
//! - A page splits when it exceeds its order; two siblings merge when their
//!   combined size fits one page and are rebalanced evenly otherwise
//! - Leaves form a doubly linked list from `first` to `last` in key order
//! - Page ids are never reused; pages dropped by a merge are abandoned

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, TryStreamExt, stream};
use lru::LruCache;

use crate::constants::{
    DATA_FILE_NAME, JOURNAL_FILE_NAME, LOCK_FILE_NAME, META_FILE_NAME, META_UNDO_FILE_NAME, State,
};
use crate::error::StoreError;
use crate::options::{QueryOptions, StoreOptions};
use crate::storage::io;
use crate::storage::lock_file::LockFile;
use crate::storage::rollback::RollbackFile;

use super::layout::Meta;
use super::node::{Leaf, Node, PageId};

/// Decoded pages kept per cache.
const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(10) {
    Some(capacity) => capacity,
    None => panic!("cache capacity must be positive"),
};

/// Total order used for keys.
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

/// A key and its value.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Options that only apply to B+tree stores.
#[derive(Clone, Default)]
pub struct TreeOptions {
    /// Key width. Required when creating a store, checked otherwise.
    pub key_bytes: Option<usize>,
    /// Value width. Required when creating a store, checked otherwise.
    pub value_bytes: Option<usize>,
    /// Key order; bytewise when unset.
    pub comparator: Option<Comparator>,
    /// Block size to derive the layout from instead of probing the filesystem.
    pub block_size: Option<u64>,
}

impl fmt::Debug for TreeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeOptions")
            .field("key_bytes", &self.key_bytes)
            .field("value_bytes", &self.value_bytes)
            .field("comparator", &self.comparator.as_ref().map(|_| "custom"))
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl TreeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn key_bytes(mut self, key_bytes: usize) -> Self {
        self.key_bytes = Some(key_bytes);
        self
    }

    #[must_use]
    pub const fn value_bytes(mut self, value_bytes: usize) -> Self {
        self.value_bytes = Some(value_bytes);
        self
    }

    #[must_use]
    pub fn comparator<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static,
    {
        self.comparator = Some(Arc::new(comparator));
        self
    }

    #[must_use]
    pub const fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }
}

/// A persistent B+tree mapping fixed-width keys to fixed-width values.
pub struct BTreeStore {
    directory: PathBuf,
    lock: LockFile,
    state: State,
    tree: Option<Tree>,
}

impl BTreeStore {
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            lock: LockFile::new(directory.join(LOCK_FILE_NAME)),
            directory,
            state: State::Closed,
            tree: None,
        }
    }

    #[must_use]
    pub fn location(&self) -> &Path {
        &self.directory
    }

    #[must_use]
    pub const fn state(&self) -> State {
        self.state
    }

    fn meta(&self) -> Option<&Meta> {
        self.tree.as_ref().map(|tree| &tree.meta)
    }

    /// Number of entries (0 unless open).
    #[must_use]
    pub fn len(&self) -> u64 {
        self.meta().map_or(0, |meta| meta.size)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Internal levels above the leaves (0 unless open).
    #[must_use]
    pub fn depth(&self) -> u64 {
        self.meta().map_or(0, |meta| meta.depth)
    }

    #[must_use]
    pub fn node_order(&self) -> usize {
        self.meta().map_or(0, |meta| meta.node_order)
    }

    #[must_use]
    pub fn leaf_order(&self) -> usize {
        self.meta().map_or(0, |meta| meta.leaf_order)
    }

    #[must_use]
    pub fn key_bytes(&self) -> usize {
        self.meta().map_or(0, |meta| meta.key_bytes)
    }

    #[must_use]
    pub fn value_bytes(&self) -> usize {
        self.meta().map_or(0, |meta| meta.value_bytes)
    }

    /// Lock the directory and load (or create) the tree.
    pub async fn open(
        &mut self,
        options: StoreOptions,
        tree_options: TreeOptions,
    ) -> Result<(), StoreError> {
        if self.state != State::Closed {
            return Err(StoreError::bad_state("open", self.state));
        }
        self.state = State::Opening;

        match self.open_tree(options, tree_options).await {
            Ok(tree) => {
                tracing::info!(
                    "opened B+tree store {} ({} entries, depth {})",
                    self.directory.display(),
                    tree.meta.size,
                    tree.meta.depth
                );
                self.tree = Some(tree);
                self.state = State::Open;
                Ok(())
            }
            Err(e) => {
                self.state = State::Closed;
                Err(e)
            }
        }
    }

    async fn open_tree(
        &self,
        options: StoreOptions,
        tree_options: TreeOptions,
    ) -> Result<Tree, StoreError> {
        if options.create {
            tokio::fs::create_dir_all(&self.directory).await?;
        } else if !io::exists(&self.directory.join(META_FILE_NAME)).await? {
            return Err(StoreError::Missing {
                path: self.directory.clone(),
            });
        }

        self.lock.acquire().await?;
        match Tree::load(&self.directory, options, tree_options).await {
            Ok(tree) => Ok(tree),
            Err(e) => {
                self.lock.release_quietly().await;
                Err(e)
            }
        }
    }

    /// Flush everything, close the page file and release the lock.
    pub async fn close(&mut self) -> Result<(), StoreError> {
        if self.state != State::Open {
            return Err(StoreError::bad_state("close", self.state));
        }
        self.state = State::Closing;

        let closed = match self.tree.take() {
            Some(tree) => tree.file.close().await,
            None => Ok(()),
        };
        let released = self.lock.release().await;
        self.state = State::Closed;
        tracing::info!("closed B+tree store {}", self.directory.display());
        closed.and(released)
    }

    /// Whether `key` is present.
    pub async fn has(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// The value stored under `key`.
    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let tree = self.tree("get")?;
        tree.check_key(key)?;
        let result = tree.get(key).await;
        self.settle(result).await
    }

    /// Insert or overwrite. Returns whether the number of entries changed.
    pub async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let tree = self.tree("set")?;
        tree.check_key(key)?;
        tree.check_value(value)?;
        let result = tree.set(key, value).await;
        self.settle(result).await
    }

    /// Remove `key`. Returns whether it was present.
    pub async fn delete(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        let tree = self.tree("delete")?;
        tree.check_key(key)?;
        let result = tree.delete(key).await;
        self.settle(result).await
    }

    /// Entries at the key-order positions selected by `options`.
    pub fn entries(
        &mut self,
        options: QueryOptions,
    ) -> impl Stream<Item = Result<Entry, StoreError>> + '_ {
        stream::try_unfold((self, Scan::Start(options)), |(store, scan)| async move {
            let advanced = store.advance(scan).await;
            match store.settle(advanced).await? {
                Some((entry, cursor)) => Ok(Some((entry, (store, Scan::At(cursor))))),
                None => Ok(None),
            }
        })
    }

    /// Keys at the positions selected by `options`.
    pub fn keys(
        &mut self,
        options: QueryOptions,
    ) -> impl Stream<Item = Result<Vec<u8>, StoreError>> + '_ {
        self.entries(options).map_ok(|(key, _)| key)
    }

    /// Values at the positions selected by `options`.
    pub fn values(
        &mut self,
        options: QueryOptions,
    ) -> impl Stream<Item = Result<Vec<u8>, StoreError>> + '_ {
        self.entries(options).map_ok(|(_, value)| value)
    }

    async fn advance(&mut self, scan: Scan) -> Result<Option<(Entry, Cursor)>, StoreError> {
        let tree = self.tree("entries")?;
        let cursor = match scan {
            Scan::Start(options) => match tree.seek(&options).await? {
                Some(cursor) => cursor,
                None => return Ok(None),
            },
            Scan::At(cursor) => cursor,
        };
        tree.step(cursor).await
    }

    fn tree(&mut self, operation: &'static str) -> Result<&mut Tree, StoreError> {
        match (self.state, self.tree.as_mut()) {
            (State::Open, Some(tree)) => Ok(tree),
            (state, _) => Err(StoreError::bad_state(operation, state)),
        }
    }

    /// Fail the store if `result` is an error that leaves it untrustworthy.
    async fn settle<T>(&mut self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        let fatal = result.as_ref().err().filter(|e| {
            !matches!(
                e,
                StoreError::BadState { .. } | StoreError::InvalidArgument(_)
            )
        });
        if let Some(e) = fatal {
            tracing::warn!("B+tree store {} failed: {e}", self.directory.display());
            self.state = State::Failed;
            self.tree = None;
            self.lock.release_quietly().await;
        }
        result
    }
}

enum Scan {
    Start(QueryOptions),
    At(Cursor),
}

/// Position of the next entry of a scan.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    leaf: PageId,
    /// `None` means the last entry of the leaf.
    slot: Option<usize>,
    remaining: u64,
    reverse: bool,
}

enum Staged {
    Node(Node),
    Leaf(Leaf),
}

/// Pages touched by one mutating call.
#[derive(Default)]
struct Batch {
    pages: BTreeMap<PageId, Staged>,
    dropped: Vec<PageId>,
}

impl Batch {
    fn node(&mut self, id: PageId, node: Node) {
        self.pages.insert(id, Staged::Node(node));
    }

    fn leaf(&mut self, id: PageId, leaf: Leaf) {
        self.pages.insert(id, Staged::Leaf(leaf));
    }

    fn drop_page(&mut self, id: PageId) {
        self.pages.remove(&id);
        self.dropped.push(id);
    }
}

/// An internal node on the path to a leaf, and the child slot taken.
struct Step {
    id: PageId,
    node: Node,
    slot: usize,
}

/// State of an open tree.
struct Tree {
    directory: PathBuf,
    meta: Meta,
    page_size: usize,
    file: RollbackFile,
    comparator: Comparator,
    nodes: LruCache<PageId, Arc<Node>>,
    leaves: LruCache<PageId, Arc<Leaf>>,
}

impl Tree {
    async fn load(
        directory: &Path,
        options: StoreOptions,
        tree_options: TreeOptions,
    ) -> Result<Self, StoreError> {
        let existed = io::exists(&directory.join(META_FILE_NAME)).await?;
        if options.truncate {
            for name in [
                META_FILE_NAME,
                META_UNDO_FILE_NAME,
                DATA_FILE_NAME,
                JOURNAL_FILE_NAME,
            ] {
                remove_if_exists(&directory.join(name)).await?;
            }
        }

        // A truncated store is recreated even without `create`.
        let (meta, file) = if existed && !options.truncate {
            Self::recover(directory, options).await?
        } else if options.create || existed {
            Self::create(directory, &tree_options).await?
        } else {
            return Err(StoreError::Missing {
                path: directory.to_path_buf(),
            });
        };

        let checked = check_widths(&meta, &tree_options).and_then(|()| {
            if options.validate {
                meta.validate()
            } else {
                Ok(())
            }
        });
        if let Err(e) = checked {
            let _ = file.close().await;
            return Err(e);
        }

        let comparator: Comparator = match tree_options.comparator {
            Some(comparator) => comparator,
            None => Arc::new(bytewise),
        };
        Ok(Self {
            directory: directory.to_path_buf(),
            page_size: meta.page_size(),
            meta,
            file,
            comparator,
            nodes: LruCache::new(CACHE_CAPACITY),
            leaves: LruCache::new(CACHE_CAPACITY),
        })
    }

    async fn create(
        directory: &Path,
        tree_options: &TreeOptions,
    ) -> Result<(Meta, RollbackFile), StoreError> {
        let (Some(key_bytes), Some(value_bytes)) =
            (tree_options.key_bytes, tree_options.value_bytes)
        else {
            return Err(StoreError::InvalidArgument(
                "key_bytes and value_bytes are required to create a store".to_string(),
            ));
        };
        let block_size = match tree_options.block_size {
            Some(block_size) => block_size,
            None => io::block_size(directory).await?,
        };
        let meta = Meta::create(block_size, key_bytes, value_bytes)?;
        remove_if_exists(&directory.join(META_UNDO_FILE_NAME)).await?;

        let page_size = meta.page_size();
        let file = page_file(directory, page_size);
        file.open(StoreOptions::default().truncate(true)).await?;
        let written = async {
            file.write_page(meta.root, Leaf::default().encode(&meta, page_size))
                .await?;
            file.checkpoint().await?;
            save_meta(directory, &meta).await
        }
        .await;
        if let Err(e) = written {
            let _ = file.close().await;
            return Err(e);
        }

        tracing::info!(
            "created B+tree store {} (node order {}, leaf order {}, {} byte pages)",
            directory.display(),
            meta.node_order,
            meta.leaf_order,
            page_size
        );
        Ok((meta, file))
    }

    /// Open an existing store, rolling back an interrupted commit.
    async fn recover(
        directory: &Path,
        options: StoreOptions,
    ) -> Result<(Meta, RollbackFile), StoreError> {
        let meta = Meta::load(&directory.join(META_FILE_NAME)).await?;
        meta.check_layout()?;

        let file = page_file(directory, meta.page_size());
        let restored = file.open(options.create(false).truncate(false)).await?;

        match restore_meta(directory, meta, restored).await {
            Ok(meta) => Ok((meta, file)),
            Err(e) => {
                let _ = file.close().await;
                Err(e)
            }
        }
    }

    fn check_key(&self, key: &[u8]) -> Result<(), StoreError> {
        if key.len() == self.meta.key_bytes {
            Ok(())
        } else {
            Err(StoreError::InvalidArgument(format!(
                "key of {} bytes, expected {}",
                key.len(),
                self.meta.key_bytes
            )))
        }
    }

    fn check_value(&self, value: &[u8]) -> Result<(), StoreError> {
        if value.len() == self.meta.value_bytes {
            Ok(())
        } else {
            Err(StoreError::InvalidArgument(format!(
                "value of {} bytes, expected {}",
                value.len(),
                self.meta.value_bytes
            )))
        }
    }

    fn check_id(&self, id: PageId) -> Result<(), StoreError> {
        if id == 0 || id >= self.meta.next_id {
            return Err(StoreError::corrupted(format!("page id {id} out of range")));
        }
        Ok(())
    }

    async fn read_node(&mut self, id: PageId) -> Result<Arc<Node>, StoreError> {
        if let Some(node) = self.nodes.get(&id) {
            return Ok(Arc::clone(node));
        }
        self.check_id(id)?;
        let page = self.file.read_page(id).await?;
        let node = Arc::new(Node::decode(&page, &self.meta)?);
        self.nodes.put(id, Arc::clone(&node));
        Ok(node)
    }

    async fn read_leaf(&mut self, id: PageId) -> Result<Arc<Leaf>, StoreError> {
        if let Some(leaf) = self.leaves.get(&id) {
            return Ok(Arc::clone(leaf));
        }
        self.check_id(id)?;
        let page = self.file.read_page(id).await?;
        let leaf = Arc::new(Leaf::decode(&page, &self.meta)?);
        self.leaves.put(id, Arc::clone(&leaf));
        Ok(leaf)
    }

    /// An owned copy of node `id`, preferring a version staged in `batch`.
    async fn load_node(&mut self, batch: &Batch, id: PageId) -> Result<Node, StoreError> {
        if let Some(Staged::Node(node)) = batch.pages.get(&id) {
            return Ok(node.clone());
        }
        Ok(Node::clone(&*self.read_node(id).await?))
    }

    /// An owned copy of leaf `id`, preferring a version staged in `batch`.
    async fn load_leaf(&mut self, batch: &Batch, id: PageId) -> Result<Leaf, StoreError> {
        if let Some(Staged::Leaf(leaf)) = batch.pages.get(&id) {
            return Ok(leaf.clone());
        }
        Ok(Leaf::clone(&*self.read_leaf(id).await?))
    }

    const fn allocate(&mut self) -> PageId {
        let id = self.meta.next_id;
        self.meta.next_id += 1;
        id
    }

    async fn find_leaf(&mut self, key: &[u8]) -> Result<PageId, StoreError> {
        let compare = Arc::clone(&self.comparator);
        let mut id = self.meta.root;
        for _ in 0..self.meta.depth {
            let node = self.read_node(id).await?;
            id = node.children[node.child_index(key, &*compare)];
        }
        Ok(id)
    }

    /// Internal nodes from the root down to `key`'s leaf, and the leaf id.
    async fn descend(&mut self, key: &[u8]) -> Result<(Vec<Step>, PageId), StoreError> {
        let compare = Arc::clone(&self.comparator);
        let mut path = Vec::new();
        let mut id = self.meta.root;
        for _ in 0..self.meta.depth {
            let node = self.read_node(id).await?;
            let slot = node.child_index(key, &*compare);
            let child = node.children[slot];
            path.push(Step {
                id,
                node: Node::clone(&node),
                slot,
            });
            id = child;
        }
        Ok((path, id))
    }

    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let compare = Arc::clone(&self.comparator);
        let id = self.find_leaf(key).await?;
        let leaf = self.read_leaf(id).await?;
        Ok(leaf
            .find(key, &*compare)
            .ok()
            .map(|slot| leaf.values[slot].clone()))
    }

    async fn set(&mut self, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let compare = Arc::clone(&self.comparator);
        let before = self.meta.clone();
        let (mut path, leaf_id) = self.descend(key).await?;
        let mut leaf = Leaf::clone(&*self.read_leaf(leaf_id).await?);
        let mut batch = Batch::default();

        let slot = match leaf.find(key, &*compare) {
            Ok(slot) => {
                leaf.values[slot] = value.to_vec();
                batch.leaf(leaf_id, leaf);
                self.commit(batch, &before).await?;
                return Ok(false);
            }
            Err(slot) => slot,
        };
        leaf.insert(slot, key, value);
        self.meta.size += 1;

        let mut carry = None;
        if leaf.size() > self.meta.leaf_order {
            let right_id = self.allocate();
            let mut right = leaf.split_at(leaf.size() / 2);
            right.prev = leaf_id;
            right.next = leaf.next;
            leaf.next = right_id;
            if right.next == 0 {
                self.meta.last = right_id;
            } else {
                let mut after = self.load_leaf(&batch, right.next).await?;
                after.prev = right_id;
                batch.leaf(right.next, after);
            }
            tracing::debug!("split leaf {leaf_id} into {right_id}");
            carry = Some((right.keys[0].clone(), right_id));
            batch.leaf(right_id, right);
        }
        batch.leaf(leaf_id, leaf);

        while let Some((separator, right_id)) = carry.take() {
            if let Some(Step { id, mut node, slot }) = path.pop() {
                node.keys.insert(slot, separator);
                node.children.insert(slot + 1, right_id);
                if node.size() > self.meta.node_order {
                    let new_id = self.allocate();
                    let (separator, right) = node.split_at(node.size() / 2);
                    tracing::debug!("split node {id} into {new_id}");
                    batch.node(new_id, right);
                    carry = Some((separator, new_id));
                }
                batch.node(id, node);
            } else {
                let root_id = self.allocate();
                batch.node(
                    root_id,
                    Node {
                        keys: vec![separator],
                        children: vec![self.meta.root, right_id],
                    },
                );
                self.meta.root = root_id;
                self.meta.depth += 1;
                tracing::debug!("new root {root_id}, depth {}", self.meta.depth);
            }
        }

        self.commit(batch, &before).await?;
        Ok(true)
    }

    async fn delete(&mut self, key: &[u8]) -> Result<bool, StoreError> {
        let compare = Arc::clone(&self.comparator);
        let before = self.meta.clone();
        let (mut path, leaf_id) = self.descend(key).await?;
        let mut leaf = Leaf::clone(&*self.read_leaf(leaf_id).await?);
        let Ok(slot) = leaf.find(key, &*compare) else {
            return Ok(false);
        };
        leaf.remove(slot);
        self.meta.size -= 1;

        let mut batch = Batch::default();
        let mut parent = match path.pop() {
            Some(parent) if leaf.size() < self.meta.min_leaf_size() => parent,
            _ => {
                batch.leaf(leaf_id, leaf);
                self.commit(batch, &before).await?;
                return Ok(true);
            }
        };
        self.rebalance_leaf(&mut batch, &mut parent, leaf_id, leaf)
            .await?;

        loop {
            match path.pop() {
                Some(mut grand) if parent.node.size() < self.meta.min_node_size() => {
                    self.rebalance_node(&mut batch, &mut grand, parent.id, parent.node)
                        .await?;
                    parent = grand;
                }
                _ => {
                    batch.node(parent.id, parent.node);
                    break;
                }
            }
        }

        self.collapse_root(&mut batch).await?;
        self.commit(batch, &before).await?;
        Ok(true)
    }

    /// Merge or rotate an underfull leaf with a sibling under `parent`.
    async fn rebalance_leaf(
        &mut self,
        batch: &mut Batch,
        parent: &mut Step,
        leaf_id: PageId,
        leaf: Leaf,
    ) -> Result<(), StoreError> {
        let (left_slot, left_id, right_id) = sibling_pair(parent)?;
        debug_assert!(leaf_id == left_id || leaf_id == right_id);
        let (mut left, right) = if parent.slot == 0 {
            (leaf, self.load_leaf(batch, right_id).await?)
        } else {
            (self.load_leaf(batch, left_id).await?, leaf)
        };
        let total = left.size() + right.size();
        let right_next = right.next;
        left.absorb(right);

        if total <= self.meta.leaf_order {
            left.next = right_next;
            if right_next == 0 {
                self.meta.last = left_id;
            } else {
                let mut after = self.load_leaf(batch, right_next).await?;
                after.prev = left_id;
                batch.leaf(right_next, after);
            }
            parent.node.keys.remove(left_slot);
            parent.node.children.remove(left_slot + 1);
            tracing::debug!("merged leaf {right_id} into {left_id}");
            batch.leaf(left_id, left);
            batch.drop_page(right_id);
        } else {
            let mut moved = left.split_at(total / 2);
            moved.prev = left_id;
            moved.next = right_next;
            parent.node.keys[left_slot] = moved.keys[0].clone();
            batch.leaf(left_id, left);
            batch.leaf(right_id, moved);
        }
        Ok(())
    }

    /// Merge or rotate an underfull internal node with a sibling under `parent`.
    async fn rebalance_node(
        &mut self,
        batch: &mut Batch,
        parent: &mut Step,
        node_id: PageId,
        node: Node,
    ) -> Result<(), StoreError> {
        let (left_slot, left_id, right_id) = sibling_pair(parent)?;
        let (mut left, right) = if parent.slot == 0 {
            (node, self.load_node(batch, right_id).await?)
        } else {
            (self.load_node(batch, left_id).await?, node)
        };
        debug_assert!(node_id == left_id || node_id == right_id);
        let total = left.size() + right.size();
        let separator = std::mem::take(&mut parent.node.keys[left_slot]);
        left.absorb(separator, right);

        if total <= self.meta.node_order {
            parent.node.keys.remove(left_slot);
            parent.node.children.remove(left_slot + 1);
            tracing::debug!("merged node {right_id} into {left_id}");
            batch.node(left_id, left);
            batch.drop_page(right_id);
        } else {
            let (separator, moved) = left.split_at(total / 2);
            parent.node.keys[left_slot] = separator;
            batch.node(left_id, left);
            batch.node(right_id, moved);
        }
        Ok(())
    }

    /// Replace single-child roots by their child.
    async fn collapse_root(&mut self, batch: &mut Batch) -> Result<(), StoreError> {
        while self.meta.depth > 0 {
            let root = self.load_node(batch, self.meta.root).await?;
            if root.size() > 1 {
                break;
            }
            let old = self.meta.root;
            self.meta.root = root.children[0];
            self.meta.depth -= 1;
            batch.drop_page(old);
            tracing::debug!(
                "collapsed root {old} into {}, depth {}",
                self.meta.root,
                self.meta.depth
            );
        }
        Ok(())
    }

    async fn commit(&mut self, batch: Batch, before: &Meta) -> Result<(), StoreError> {
        let meta_changed = self.meta != *before;
        let undo = self.directory.join(META_UNDO_FILE_NAME);
        if meta_changed {
            before.save(&undo).await?;
            io::sync_dir(&self.directory).await?;
        }

        let writes: Vec<_> = batch
            .pages
            .iter()
            .map(|(&id, staged)| {
                let page = match staged {
                    Staged::Node(node) => node.encode(&self.meta, self.page_size),
                    Staged::Leaf(leaf) => leaf.encode(&self.meta, self.page_size),
                };
                self.file.write_page(id, page)
            })
            .collect();
        futures::future::try_join_all(writes).await?;

        if meta_changed {
            save_meta(&self.directory, &self.meta).await?;
        }
        self.file.checkpoint().await?;
        if meta_changed {
            tokio::fs::remove_file(&undo).await?;
        }

        for id in batch.dropped {
            self.nodes.pop(&id);
            self.leaves.pop(&id);
        }
        for (id, staged) in batch.pages {
            match staged {
                Staged::Node(node) => {
                    self.nodes.put(id, Arc::new(node));
                }
                Staged::Leaf(leaf) => {
                    self.leaves.put(id, Arc::new(leaf));
                }
            }
        }
        Ok(())
    }

    /// Cursor at the first position selected by `options`.
    async fn seek(&mut self, options: &QueryOptions) -> Result<Option<Cursor>, StoreError> {
        let positions = options.positions(self.meta.size);
        let Some(start) = positions.first() else {
            return Ok(None);
        };
        let reverse = positions.is_reverse();
        let remaining = positions.len() as u64;

        // Entries to skip from the end the walk starts at.
        let (mut skip, mut id) = if reverse {
            (self.meta.size - 1 - start, self.meta.last)
        } else {
            (start, self.meta.first)
        };
        loop {
            let leaf = self.read_leaf(id).await?;
            let size = leaf.size();
            if let Some(offset) = usize::try_from(skip).ok().filter(|&offset| offset < size) {
                let slot = if reverse { size - 1 - offset } else { offset };
                return Ok(Some(Cursor {
                    leaf: id,
                    slot: Some(slot),
                    remaining,
                    reverse,
                }));
            }
            skip -= size as u64;
            id = if reverse { leaf.prev } else { leaf.next };
        }
    }

    /// The entry under `cursor` and the cursor after it.
    async fn step(&mut self, cursor: Cursor) -> Result<Option<(Entry, Cursor)>, StoreError> {
        if cursor.remaining == 0 {
            return Ok(None);
        }
        let leaf = self.read_leaf(cursor.leaf).await?;
        let slot = cursor
            .slot
            .unwrap_or_else(|| leaf.size().saturating_sub(1));
        let (Some(key), Some(value)) = (leaf.keys.get(slot), leaf.values.get(slot)) else {
            return Err(StoreError::corrupted(format!(
                "leaf {} has no entry {slot}",
                cursor.leaf
            )));
        };

        let (leaf_id, slot) = match (cursor.reverse, slot) {
            (true, 0) => (leaf.prev, None),
            (true, slot) => (cursor.leaf, Some(slot - 1)),
            (false, slot) if slot + 1 < leaf.size() => (cursor.leaf, Some(slot + 1)),
            (false, _) => (leaf.next, Some(0)),
        };
        let next = Cursor {
            leaf: leaf_id,
            slot,
            remaining: cursor.remaining - 1,
            reverse: cursor.reverse,
        };
        Ok(Some(((key.clone(), value.clone()), next)))
    }
}

fn bytewise(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// `(left slot, left id, right id)` of the sibling pair around `step.slot`.
fn sibling_pair(step: &Step) -> Result<(usize, PageId, PageId), StoreError> {
    let left_slot = step.slot.saturating_sub(1);
    match (
        step.node.children.get(left_slot),
        step.node.children.get(left_slot + 1),
    ) {
        (Some(&left), Some(&right)) => Ok((left_slot, left, right)),
        _ => Err(StoreError::corrupted(format!(
            "node {} has no sibling for child {}",
            step.id, step.slot
        ))),
    }
}

fn check_widths(meta: &Meta, tree_options: &TreeOptions) -> Result<(), StoreError> {
    for (name, given, stored) in [
        ("key_bytes", tree_options.key_bytes, meta.key_bytes),
        ("value_bytes", tree_options.value_bytes, meta.value_bytes),
    ] {
        if let Some(given) = given.filter(|&given| given != stored) {
            return Err(StoreError::InvalidArgument(format!(
                "{name} is {stored}, not {given}"
            )));
        }
    }
    Ok(())
}

fn page_file(directory: &Path, page_size: usize) -> RollbackFile {
    RollbackFile::new(
        directory.join(DATA_FILE_NAME),
        directory.join(JOURNAL_FILE_NAME),
        page_size,
    )
}

/// Atomically replace the metadata document.
async fn save_meta(directory: &Path, meta: &Meta) -> Result<(), StoreError> {
    let path = directory.join(META_FILE_NAME);
    let staging = directory.join(format!("{META_FILE_NAME}.tmp"));
    meta.save(&staging).await?;
    tokio::fs::rename(&staging, &path).await?;
    io::sync_dir(directory).await?;
    Ok(())
}

/// Pick the metadata matching the pages after a rollback of `restored` pages.
async fn restore_meta(directory: &Path, meta: Meta, restored: u64) -> Result<Meta, StoreError> {
    let undo = directory.join(META_UNDO_FILE_NAME);
    if !io::exists(&undo).await? {
        return Ok(meta);
    }
    if restored == 0 {
        tokio::fs::remove_file(&undo).await?;
        return Ok(meta);
    }

    let previous = Meta::load(&undo).await?;
    previous.check_layout()?;
    tokio::fs::rename(&undo, directory.join(META_FILE_NAME)).await?;
    io::sync_dir(directory).await?;
    tracing::warn!(
        "restored metadata of {} from an interrupted commit",
        directory.display()
    );
    Ok(previous)
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
