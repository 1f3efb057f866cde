use std::sync::Arc;

use crate::buffer::{PageId, INVALID_PAGE_ID};
use crate::error::VellumResult;
use crate::storage::codec::{
    BPlusTreeHeaderPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec,
};
use crate::storage::index::{BPlusTree, IndexKey};
use crate::storage::page::{BPlusTreeLeafPage, BPlusTreePage, RecordId};

/// Forward iterator over the leaf chain. It caches the current leaf image
/// and holds no latches between `next` calls; following a sibling pointer
/// takes a short read latch. Under concurrent writers the view is weakly
/// consistent.
#[derive(Debug)]
pub struct TreeIndexIterator<K: IndexKey> {
    tree: Arc<BPlusTree<K>>,
    leaf_page_id: PageId,
    leaf: BPlusTreeLeafPage<K>,
    cursor: usize,
}

impl<K: IndexKey> TreeIndexIterator<K> {
    fn exhausted(tree: Arc<BPlusTree<K>>) -> Self {
        Self {
            tree,
            leaf_page_id: INVALID_PAGE_ID,
            leaf: BPlusTreeLeafPage::new(0),
            cursor: 0,
        }
    }

    /// Position before the first entry of the tree.
    pub(crate) fn begin(tree: Arc<BPlusTree<K>>) -> VellumResult<Self> {
        let header_guard = tree.buffer_pool.fetch_page_read(tree.header_page_id())?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(Self::exhausted(tree));
        }
        let mut cur_guard = tree.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);

        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(cur_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_guard = tree.buffer_pool.fetch_page_read(internal.child_at(0))?;
                    cur_guard = child_guard;
                }
                BPlusTreePage::Leaf(leaf) => {
                    let leaf_page_id = cur_guard.page_id();
                    drop(cur_guard);
                    return Ok(Self {
                        tree,
                        leaf_page_id,
                        leaf,
                        cursor: 0,
                    });
                }
            }
        }
    }

    /// Position at the first entry whose key is `>=` the probe.
    pub(crate) fn begin_at(tree: Arc<BPlusTree<K>>, key: K) -> VellumResult<Self> {
        let header_guard = tree.buffer_pool.fetch_page_read(tree.header_page_id())?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(Self::exhausted(tree));
        }
        let mut cur_guard = tree.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);

        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(cur_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.child_at(internal.lookup_child_index(&key));
                    let child_guard = tree.buffer_pool.fetch_page_read(child_id)?;
                    cur_guard = child_guard;
                }
                BPlusTreePage::Leaf(leaf) => {
                    let leaf_page_id = cur_guard.page_id();
                    drop(cur_guard);
                    let cursor = match leaf.lookup_index(&key) {
                        Some(index) if leaf.array[index].0 == key => index,
                        Some(index) => index + 1,
                        None => 0,
                    };
                    return Ok(Self {
                        tree,
                        leaf_page_id,
                        leaf,
                        cursor,
                    });
                }
            }
        }
    }

    /// Next `(key, value)` pair in ascending key order, or `None` at the end
    /// of the leaf chain.
    pub fn next(&mut self) -> VellumResult<Option<(K, RecordId)>> {
        loop {
            if self.leaf_page_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            if self.cursor < self.leaf.array.len() {
                let entry = self.leaf.array[self.cursor];
                self.cursor += 1;
                return Ok(Some(entry));
            }
            let next_id = self.leaf.next_page_id;
            if next_id == INVALID_PAGE_ID {
                self.leaf_page_id = INVALID_PAGE_ID;
                return Ok(None);
            }
            let guard = self.tree.buffer_pool.fetch_page_read(next_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K>(guard.data())?;
            self.leaf_page_id = next_id;
            self.leaf = leaf;
            self.cursor = 0;
        }
    }

    /// Drain the iterator into a vector; test and debugging convenience.
    pub fn collect_all(&mut self) -> VellumResult<Vec<(K, RecordId)>> {
        let mut entries = Vec::new();
        while let Some(entry) = self.next()? {
            entries.push(entry);
        }
        Ok(entries)
    }
}
