use log::trace;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::buffer::{BufferPoolManager, PageId, WritePageGuard, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec,
};
use crate::storage::index::tree_iterator::TreeIndexIterator;
use crate::storage::index::{IndexKey, IndexUndo};
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, RecordId,
};
use crate::utils::util::page_bytes_to_array;

/// Ancestors retained on a structural descent: the write guard, the decoded
/// node, and the child slot the descent followed.
type PathEntry<K> = (WritePageGuard, BPlusTreeInternalPage<K>, usize);

/// Concurrent B+Tree over buffer pool pages.
///
/// A dedicated header page anchors the root, so an empty tree is the header
/// with an invalid root id. Reads crab down with read latches. Writes run an
/// optimistic pass first (read latches down to the leaf's parent, write latch
/// on the leaf) and restart pessimistically with write latches when the leaf
/// needs structural repair. On the pessimistic descent, every latch above a
/// safe node is released as soon as the safe node is entered, the header's
/// included once the root is known safe.
#[derive(Debug)]
pub struct BPlusTree<K: IndexKey> {
    pub buffer_pool: Arc<BufferPoolManager>,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    header_page_id: PageId,
    _marker: PhantomData<K>,
}

impl<K: IndexKey> BPlusTree<K> {
    pub fn new(
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> VellumResult<Self> {
        assert!(leaf_max_size >= 2, "leaf pages need at least two entries");
        assert!(
            internal_max_size >= 3,
            "internal pages need at least three children"
        );
        assert!(
            13 + leaf_max_size as usize * (K::ENCODED_LEN + 8) <= PAGE_SIZE,
            "leaf_max_size does not fit a page"
        );
        assert!(
            13 + internal_max_size as usize * (K::ENCODED_LEN + 4) <= PAGE_SIZE,
            "internal_max_size does not fit a page"
        );
        let mut header_guard = buffer_pool.new_page()?;
        let header_page_id = header_guard.page_id();
        Self::write_header(&mut header_guard, &BPlusTreeHeaderPage::new());
        drop(header_guard);
        Ok(Self {
            buffer_pool,
            leaf_max_size,
            internal_max_size,
            header_page_id,
            _marker: PhantomData,
        })
    }

    /// Reattach to a tree whose header page already exists on disk.
    pub fn open(
        buffer_pool: Arc<BufferPoolManager>,
        header_page_id: PageId,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> Self {
        Self {
            buffer_pool,
            leaf_max_size,
            internal_max_size,
            header_page_id,
            _marker: PhantomData,
        }
    }

    pub fn header_page_id(&self) -> PageId {
        self.header_page_id
    }

    pub fn get_root_page_id(&self) -> VellumResult<PageId> {
        let guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(guard.data())?;
        Ok(header.root_page_id)
    }

    pub fn is_empty(&self) -> VellumResult<bool> {
        Ok(self.get_root_page_id()? == INVALID_PAGE_ID)
    }

    /// Point lookup with read-latch crabbing: each child is latched before
    /// its parent's latch is released.
    pub fn get_value(&self, key: K) -> VellumResult<Option<RecordId>> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut cur_guard = self.buffer_pool.fetch_page_read(header.root_page_id)?;
        drop(header_guard);

        loop {
            let (page, _) = BPlusTreePageCodec::decode::<K>(cur_guard.data())?;
            match page {
                BPlusTreePage::Leaf(leaf) => return Ok(leaf.lookup(&key)),
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.child_at(internal.lookup_child_index(&key));
                    let child_guard = self.buffer_pool.fetch_page_read(child_id)?;
                    cur_guard = child_guard;
                }
            }
        }
    }

    /// Insert a unique key. Returns false if the key is already present.
    pub fn insert(&self, key: K, rid: RecordId) -> VellumResult<bool> {
        match self.insert_optimistic(&key, rid)? {
            Some(inserted) => Ok(inserted),
            None => self.insert_pessimistic(&key, rid),
        }
    }

    /// Remove a key. Returns false if the key is absent.
    pub fn remove(&self, key: K) -> VellumResult<bool> {
        match self.remove_optimistic(&key)? {
            Some(removed) => Ok(removed),
            None => self.remove_pessimistic(&key),
        }
    }

    pub fn begin(self: &Arc<Self>) -> VellumResult<TreeIndexIterator<K>> {
        TreeIndexIterator::begin(self.clone())
    }

    pub fn begin_at(self: &Arc<Self>, key: K) -> VellumResult<TreeIndexIterator<K>> {
        TreeIndexIterator::begin_at(self.clone(), key)
    }

    fn write_header(guard: &mut WritePageGuard, header: &BPlusTreeHeaderPage) {
        guard.overwrite(&page_bytes_to_array(&BPlusTreeHeaderPageCodec::encode(
            header,
        )));
    }

    fn write_leaf(guard: &mut WritePageGuard, leaf: &BPlusTreeLeafPage<K>) {
        guard.overwrite(&page_bytes_to_array(&BPlusTreeLeafPageCodec::encode(leaf)));
    }

    fn write_internal(guard: &mut WritePageGuard, internal: &BPlusTreeInternalPage<K>) {
        guard.overwrite(&page_bytes_to_array(&BPlusTreeInternalPageCodec::encode(
            internal,
        )));
    }

    /// Optimistic insert: read latches down to the leaf's parent, then the
    /// leaf's write latch while the parent's read latch is still held (the
    /// parent pins the leaf's key range). `Ok(None)` means the leaf was full
    /// and the caller must restart pessimistically.
    fn insert_optimistic(&self, key: &K, rid: RecordId) -> VellumResult<Option<bool>> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let mut parent_guard = header_guard;
        let mut cur_id = header.root_page_id;
        loop {
            let cur_guard = self.buffer_pool.fetch_page_read(cur_id)?;
            let (page, _) = BPlusTreePageCodec::decode::<K>(cur_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.child_at(internal.lookup_child_index(key));
                    parent_guard = cur_guard;
                    cur_id = child_id;
                }
                BPlusTreePage::Leaf(_) => {
                    drop(cur_guard);
                    let mut leaf_guard = self.buffer_pool.fetch_page_write(cur_id)?;
                    drop(parent_guard);
                    let (mut leaf, _) =
                        BPlusTreeLeafPageCodec::decode::<K>(leaf_guard.data())?;
                    if leaf.lookup(key).is_some() {
                        return Ok(Some(false));
                    }
                    if leaf.is_full() {
                        trace!("optimistic insert: leaf {} full, restarting", cur_id);
                        return Ok(None);
                    }
                    leaf.insert(*key, rid);
                    Self::write_leaf(&mut leaf_guard, &leaf);
                    return Ok(Some(true));
                }
            }
        }
    }

    fn insert_pessimistic(&self, key: &K, rid: RecordId) -> VellumResult<bool> {
        let mut header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (mut header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;

        if header.root_page_id == INVALID_PAGE_ID {
            let mut root_guard = self.buffer_pool.new_page()?;
            let mut leaf = BPlusTreeLeafPage::new(self.leaf_max_size);
            leaf.insert(*key, rid);
            Self::write_leaf(&mut root_guard, &leaf);
            header.root_page_id = root_guard.page_id();
            Self::write_header(&mut header_guard, &header);
            return Ok(true);
        }

        let mut header_opt = Some((header_guard, header));
        let mut path: Vec<PathEntry<K>> = Vec::new();
        let mut cur_guard = self.buffer_pool.fetch_page_write(header.root_page_id)?;
        let (mut cur_page, _) = BPlusTreePageCodec::decode::<K>(cur_guard.data())?;
        if cur_page.is_insert_safe() {
            header_opt = None;
        }

        let (mut leaf_guard, mut leaf) = loop {
            match cur_page {
                BPlusTreePage::Leaf(leaf) => break (cur_guard, leaf),
                BPlusTreePage::Internal(internal) => {
                    let idx = internal.lookup_child_index(key);
                    let child_guard = self.buffer_pool.fetch_page_write(internal.child_at(idx))?;
                    let (child_page, _) = BPlusTreePageCodec::decode::<K>(child_guard.data())?;
                    if child_page.is_insert_safe() {
                        header_opt = None;
                        path.clear();
                    } else {
                        path.push((cur_guard, internal, idx));
                    }
                    cur_guard = child_guard;
                    cur_page = child_page;
                }
            }
        };

        if leaf.lookup(key).is_some() {
            return Ok(false);
        }
        if !leaf.is_full() {
            leaf.insert(*key, rid);
            Self::write_leaf(&mut leaf_guard, &leaf);
            return Ok(true);
        }

        // leaf split: overflow by one entry, give the upper half away
        leaf.insert(*key, rid);
        let mut right = BPlusTreeLeafPage::new(self.leaf_max_size);
        right.array = leaf.split_off_upper();
        right.next_page_id = leaf.next_page_id;

        let mut right_guard = self.buffer_pool.new_page()?;
        let right_id = right_guard.page_id();
        leaf.next_page_id = right_id;
        let mut up_key = right.array[0].0;
        let mut up_child = right_id;
        trace!(
            "leaf {} split, new right leaf {}",
            leaf_guard.page_id(),
            right_id
        );
        Self::write_leaf(&mut right_guard, &right);
        Self::write_leaf(&mut leaf_guard, &leaf);
        drop(right_guard);
        drop(leaf_guard);

        while let Some((mut guard, mut internal, _)) = path.pop() {
            internal.insert(up_key, up_child);
            if internal.child_count() <= internal.max_size {
                Self::write_internal(&mut guard, &internal);
                return Ok(true);
            }
            let (promoted, right_internal) = internal.split_off_upper();
            let mut right_guard = self.buffer_pool.new_page()?;
            Self::write_internal(&mut right_guard, &right_internal);
            Self::write_internal(&mut guard, &internal);
            trace!(
                "internal {} split, new right internal {}",
                guard.page_id(),
                right_guard.page_id()
            );
            up_key = promoted;
            up_child = right_guard.page_id();
        }

        // propagation reached the top: grow the tree by one level
        let (mut header_guard, mut header) = header_opt
            .ok_or_else(|| VellumError::Internal("root split without header latch".to_string()))?;
        let mut new_root_guard = self.buffer_pool.new_page()?;
        let new_root = BPlusTreeInternalPage::new_root(
            header.root_page_id,
            up_key,
            up_child,
            self.internal_max_size,
        );
        Self::write_internal(&mut new_root_guard, &new_root);
        header.root_page_id = new_root_guard.page_id();
        Self::write_header(&mut header_guard, &header);
        Ok(true)
    }

    /// Optimistic remove: write-latch the leaf under the parent's read
    /// latch. Falls back (`Ok(None)`) when the removal would underflow the
    /// leaf or remove its first key, both of which touch ancestors.
    fn remove_optimistic(&self, key: &K) -> VellumResult<Option<bool>> {
        let header_guard = self.buffer_pool.fetch_page_read(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(Some(false));
        }

        let mut parent_guard = header_guard;
        let mut cur_id = header.root_page_id;
        let mut is_root = true;
        loop {
            let cur_guard = self.buffer_pool.fetch_page_read(cur_id)?;
            let (page, _) = BPlusTreePageCodec::decode::<K>(cur_guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => {
                    let child_id = internal.child_at(internal.lookup_child_index(key));
                    parent_guard = cur_guard;
                    cur_id = child_id;
                    is_root = false;
                }
                BPlusTreePage::Leaf(_) => {
                    drop(cur_guard);
                    let mut leaf_guard = self.buffer_pool.fetch_page_write(cur_id)?;
                    drop(parent_guard);
                    let (mut leaf, _) =
                        BPlusTreeLeafPageCodec::decode::<K>(leaf_guard.data())?;
                    let Some(index) = leaf.find_exact(key) else {
                        return Ok(Some(false));
                    };
                    if !is_root && (leaf.size() - 1 < leaf.min_size() || index == 0) {
                        trace!("optimistic remove: leaf {} needs repair, restarting", cur_id);
                        return Ok(None);
                    }
                    leaf.array.remove(index);
                    Self::write_leaf(&mut leaf_guard, &leaf);
                    return Ok(Some(true));
                }
            }
        }
    }

    fn remove_pessimistic(&self, key: &K) -> VellumResult<bool> {
        let header_guard = self.buffer_pool.fetch_page_write(self.header_page_id)?;
        let (header, _) = BPlusTreeHeaderPageCodec::decode(header_guard.data())?;
        if header.root_page_id == INVALID_PAGE_ID {
            return Ok(false);
        }

        let mut header_opt = Some((header_guard, header));
        let mut path: Vec<PathEntry<K>> = Vec::new();
        let mut cur_guard = self.buffer_pool.fetch_page_write(header.root_page_id)?;
        let (mut cur_page, _) = BPlusTreePageCodec::decode::<K>(cur_guard.data())?;
        if cur_page.is_delete_safe(true) {
            header_opt = None;
        }

        let (mut leaf_guard, mut leaf) = loop {
            match cur_page {
                BPlusTreePage::Leaf(leaf) => break (cur_guard, leaf),
                BPlusTreePage::Internal(internal) => {
                    let idx = internal.lookup_child_index(key);
                    let child_guard = self.buffer_pool.fetch_page_write(internal.child_at(idx))?;
                    let (child_page, _) = BPlusTreePageCodec::decode::<K>(child_guard.data())?;
                    if child_page.is_delete_safe(false) {
                        header_opt = None;
                        path.clear();
                    } else {
                        path.push((cur_guard, internal, idx));
                    }
                    cur_guard = child_guard;
                    cur_page = child_page;
                }
            }
        };

        let Some(index) = leaf.find_exact(key) else {
            return Ok(false);
        };
        leaf.array.remove(index);

        if path.is_empty() {
            // the leaf is the root: no minimum applies
            Self::write_leaf(&mut leaf_guard, &leaf);
            return Ok(true);
        }

        if !leaf.is_underflow(false) {
            Self::write_leaf(&mut leaf_guard, &leaf);
            drop(leaf_guard);
            let replacement = leaf.first_key();
            Self::fix_ancestor_separators(path, key, replacement);
            return Ok(true);
        }

        // Underflow repair at the leaf level. `replacement` tracks the first
        // key of the subtree the deleted key vanished from, for separator
        // fix-up in the retained ancestors.
        let (mut parent_guard, mut parent, parent_idx) = path.pop().unwrap();
        let replacement;

        // borrow the closest entry from the left sibling
        if parent_idx > 0 {
            let left_id = parent.child_at(parent_idx - 1);
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let (mut left, _) = BPlusTreeLeafPageCodec::decode::<K>(left_guard.data())?;
            if left.can_lend() {
                let entry = left.array.pop().unwrap();
                leaf.array.insert(0, entry);
                parent.set_key_at(parent_idx, leaf.array[0].0);
                Self::write_leaf(&mut left_guard, &left);
                Self::write_leaf(&mut leaf_guard, &leaf);
                Self::write_internal(&mut parent_guard, &parent);
                let replacement = leaf.first_key();
                drop(left_guard);
                drop(leaf_guard);
                drop(parent_guard);
                Self::fix_ancestor_separators(path, key, replacement);
                return Ok(true);
            }
        }

        // borrow from the right sibling
        if parent_idx + 1 < parent.child_count() as usize {
            let right_id = parent.child_at(parent_idx + 1);
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let (mut right, _) = BPlusTreeLeafPageCodec::decode::<K>(right_guard.data())?;
            if right.can_lend() {
                let entry = right.array.remove(0);
                leaf.array.push(entry);
                if parent_idx > 0 {
                    parent.set_key_at(parent_idx, leaf.array[0].0);
                }
                parent.set_key_at(parent_idx + 1, right.array[0].0);
                Self::write_leaf(&mut right_guard, &right);
                Self::write_leaf(&mut leaf_guard, &leaf);
                Self::write_internal(&mut parent_guard, &parent);
                let replacement = leaf.first_key();
                drop(right_guard);
                drop(leaf_guard);
                drop(parent_guard);
                Self::fix_ancestor_separators(path, key, replacement);
                return Ok(true);
            }
        }

        // merge: prefer folding into the left sibling
        if parent_idx > 0 {
            let left_id = parent.child_at(parent_idx - 1);
            let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
            let (mut left, _) = BPlusTreeLeafPageCodec::decode::<K>(left_guard.data())?;
            left.array.append(&mut leaf.array);
            left.next_page_id = leaf.next_page_id;
            parent.remove_at(parent_idx);
            Self::write_leaf(&mut left_guard, &left);
            replacement = left.first_key();
            let dead_id = leaf_guard.page_id();
            drop(leaf_guard);
            let _ = self.buffer_pool.delete_page(dead_id)?;
            trace!("merged leaf {} into left sibling {}", dead_id, left_id);
        } else {
            let right_id = parent.child_at(parent_idx + 1);
            let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
            let (mut right, _) = BPlusTreeLeafPageCodec::decode::<K>(right_guard.data())?;
            leaf.array.append(&mut right.array);
            leaf.next_page_id = right.next_page_id;
            parent.remove_at(parent_idx + 1);
            Self::write_leaf(&mut leaf_guard, &leaf);
            replacement = leaf.first_key();
            drop(right_guard);
            drop(leaf_guard);
            let _ = self.buffer_pool.delete_page(right_id)?;
            trace!("merged right sibling {} into leaf", right_id);
        }

        // the parent lost a child; repair upward until a node absorbs it
        let mut cur_guard = parent_guard;
        let mut cur = parent;
        loop {
            let is_root = path.is_empty();
            if !cur.is_underflow(is_root) {
                Self::write_internal(&mut cur_guard, &cur);
                drop(cur_guard);
                Self::fix_ancestor_separators(path, key, replacement);
                return Ok(true);
            }

            if is_root {
                if cur.child_count() == 1 {
                    // the root funnels down to its only child
                    let (mut header_guard, mut header) = header_opt
                        .take()
                        .ok_or_else(|| {
                            VellumError::Internal("root collapse without header latch".to_string())
                        })?;
                    header.root_page_id = cur.child_at(0);
                    Self::write_header(&mut header_guard, &header);
                    let dead_id = cur_guard.page_id();
                    drop(cur_guard);
                    let _ = self.buffer_pool.delete_page(dead_id)?;
                    trace!("root collapsed into page {}", header.root_page_id);
                } else {
                    Self::write_internal(&mut cur_guard, &cur);
                }
                return Ok(true);
            }

            let (mut parent_guard, mut parent, parent_idx) = path.pop().unwrap();
            if parent_idx >= 1 && parent.key_at(parent_idx) == key {
                if let Some(rep) = replacement {
                    parent.set_key_at(parent_idx, rep);
                }
            }

            // rotation through the parent: borrow a child from a sibling
            if parent_idx > 0 {
                let left_id = parent.child_at(parent_idx - 1);
                let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
                let (mut left, _) = BPlusTreeInternalPageCodec::decode::<K>(left_guard.data())?;
                if left.can_lend() {
                    let (moved_key, moved_child) = left.array.pop().unwrap();
                    cur.array[0].0 = *parent.key_at(parent_idx);
                    cur.array.insert(0, (K::default(), moved_child));
                    parent.set_key_at(parent_idx, moved_key);
                    Self::write_internal(&mut cur_guard, &cur);
                    Self::write_internal(&mut left_guard, &left);
                    Self::write_internal(&mut parent_guard, &parent);
                    drop(left_guard);
                    drop(cur_guard);
                    drop(parent_guard);
                    Self::fix_ancestor_separators(path, key, replacement);
                    return Ok(true);
                }
            }

            if parent_idx + 1 < parent.child_count() as usize {
                let right_id = parent.child_at(parent_idx + 1);
                let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
                let (mut right, _) = BPlusTreeInternalPageCodec::decode::<K>(right_guard.data())?;
                if right.can_lend() {
                    let (_, moved_child) = right.array.remove(0);
                    cur.array.push((*parent.key_at(parent_idx + 1), moved_child));
                    let new_sep = right.array[0].0;
                    right.array[0].0 = K::default();
                    parent.set_key_at(parent_idx + 1, new_sep);
                    Self::write_internal(&mut cur_guard, &cur);
                    Self::write_internal(&mut right_guard, &right);
                    Self::write_internal(&mut parent_guard, &parent);
                    drop(right_guard);
                    drop(cur_guard);
                    drop(parent_guard);
                    Self::fix_ancestor_separators(path, key, replacement);
                    return Ok(true);
                }
            }

            // no sibling can lend: merge, gluing with the parent separator
            if parent_idx > 0 {
                let left_id = parent.child_at(parent_idx - 1);
                let mut left_guard = self.buffer_pool.fetch_page_write(left_id)?;
                let (mut left, _) = BPlusTreeInternalPageCodec::decode::<K>(left_guard.data())?;
                let sep = *parent.key_at(parent_idx);
                let mut moved = std::mem::take(&mut cur.array);
                moved[0].0 = sep;
                left.array.extend(moved);
                parent.remove_at(parent_idx);
                Self::write_internal(&mut left_guard, &left);
                let dead_id = cur_guard.page_id();
                drop(left_guard);
                drop(cur_guard);
                let _ = self.buffer_pool.delete_page(dead_id)?;
            } else {
                let right_id = parent.child_at(parent_idx + 1);
                let mut right_guard = self.buffer_pool.fetch_page_write(right_id)?;
                let (mut right, _) = BPlusTreeInternalPageCodec::decode::<K>(right_guard.data())?;
                let sep = *parent.key_at(parent_idx + 1);
                let mut moved = std::mem::take(&mut right.array);
                moved[0].0 = sep;
                cur.array.extend(moved);
                parent.remove_at(parent_idx + 1);
                Self::write_internal(&mut cur_guard, &cur);
                drop(right_guard);
                drop(cur_guard);
                let _ = self.buffer_pool.delete_page(right_id)?;
            }

            cur_guard = parent_guard;
            cur = parent;
        }
    }

    /// As the retained stack unwinds, any separator equal to the deleted key
    /// is replaced with the affected leaf's new first key.
    fn fix_ancestor_separators(path: Vec<PathEntry<K>>, deleted: &K, replacement: Option<K>) {
        for (mut guard, mut internal, idx) in path.into_iter().rev() {
            if idx >= 1 && internal.key_at(idx) == deleted {
                if let Some(rep) = replacement {
                    internal.set_key_at(idx, rep);
                    Self::write_internal(&mut guard, &internal);
                }
            }
        }
    }

    /// Walk the whole tree and verify the structural invariants: key order,
    /// size bounds off the root, separator bounds, uniform leaf depth, and a
    /// sorted leaf chain. Returns the number of entries.
    pub fn check_integrity(&self) -> VellumResult<usize> {
        let root_page_id = self.get_root_page_id()?;
        if root_page_id == INVALID_PAGE_ID {
            return Ok(0);
        }
        let mut leaf_depth = None;
        let count = self.check_subtree(root_page_id, None, None, true, 0, &mut leaf_depth)?;

        // leaf chain: find the leftmost leaf, then walk next pointers
        let mut page_id = root_page_id;
        loop {
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            let (page, _) = BPlusTreePageCodec::decode::<K>(guard.data())?;
            match page {
                BPlusTreePage::Internal(internal) => page_id = internal.child_at(0),
                BPlusTreePage::Leaf(_) => break,
            }
        }
        let mut last_key: Option<K> = None;
        let mut chained = 0usize;
        while page_id != INVALID_PAGE_ID {
            let guard = self.buffer_pool.fetch_page_read(page_id)?;
            let (leaf, _) = BPlusTreeLeafPageCodec::decode::<K>(guard.data())?;
            for (key, _) in &leaf.array {
                if let Some(last) = last_key {
                    if last >= *key {
                        return Err(VellumError::Internal(format!(
                            "leaf chain out of order at page {}: {:?} >= {:?}",
                            page_id, last, key
                        )));
                    }
                }
                last_key = Some(*key);
                chained += 1;
            }
            page_id = leaf.next_page_id;
        }
        if chained != count {
            return Err(VellumError::Internal(format!(
                "leaf chain sees {} entries, tree walk sees {}",
                chained, count
            )));
        }
        Ok(count)
    }

    fn check_subtree(
        &self,
        page_id: PageId,
        lower: Option<K>,
        upper: Option<K>,
        is_root: bool,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> VellumResult<usize> {
        let guard = self.buffer_pool.fetch_page_read(page_id)?;
        let (page, _) = BPlusTreePageCodec::decode::<K>(guard.data())?;
        drop(guard);
        match page {
            BPlusTreePage::Leaf(leaf) => {
                if let Some(expected) = *leaf_depth {
                    if depth != expected {
                        return Err(VellumError::Internal(format!(
                            "leaf {} at depth {}, expected {}",
                            page_id, depth, expected
                        )));
                    }
                } else {
                    *leaf_depth = Some(depth);
                }
                if leaf.is_underflow(is_root) || leaf.size() > leaf.max_size {
                    return Err(VellumError::Internal(format!(
                        "leaf {} size {} out of bounds",
                        page_id,
                        leaf.size()
                    )));
                }
                for window in leaf.array.windows(2) {
                    if window[0].0 >= window[1].0 {
                        return Err(VellumError::Internal(format!(
                            "leaf {} keys not strictly increasing",
                            page_id
                        )));
                    }
                }
                for (key, _) in &leaf.array {
                    if lower.map_or(false, |bound| *key < bound)
                        || upper.map_or(false, |bound| *key >= bound)
                    {
                        return Err(VellumError::Internal(format!(
                            "leaf {} key {:?} outside separator bounds",
                            page_id, key
                        )));
                    }
                }
                Ok(leaf.array.len())
            }
            BPlusTreePage::Internal(internal) => {
                if internal.is_underflow(is_root) || internal.child_count() > internal.max_size {
                    return Err(VellumError::Internal(format!(
                        "internal {} has {} children, out of bounds",
                        page_id,
                        internal.child_count()
                    )));
                }
                for i in 2..internal.array.len() {
                    if internal.array[i - 1].0 >= internal.array[i].0 {
                        return Err(VellumError::Internal(format!(
                            "internal {} separators not strictly increasing",
                            page_id
                        )));
                    }
                }
                let mut total = 0;
                for i in 0..internal.array.len() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(internal.array[i].0)
                    };
                    let child_upper = if i + 1 < internal.array.len() {
                        Some(internal.array[i + 1].0)
                    } else {
                        upper
                    };
                    total += self.check_subtree(
                        internal.array[i].1,
                        child_lower,
                        child_upper,
                        false,
                        depth + 1,
                        leaf_depth,
                    )?;
                }
                Ok(total)
            }
        }
    }
}

impl<K: IndexKey> IndexUndo for BPlusTree<K> {
    fn undo_insert(&self, key: &[u8], _rid: RecordId) -> VellumResult<()> {
        let key = K::decode_from_slice(key)?;
        self.remove(key)?;
        Ok(())
    }

    fn undo_delete(&self, key: &[u8], rid: RecordId) -> VellumResult<()> {
        let key = K::decode_from_slice(key)?;
        self.insert(key, rid)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use rand::seq::SliceRandom;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn rid(value: i64) -> RecordId {
        RecordId::new(value as PageId, value as u32)
    }

    fn setup_tree(
        leaf_max: u32,
        internal_max: u32,
        pool_size: usize,
    ) -> (TempDir, Arc<BPlusTree<i64>>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager =
            Arc::new(DiskManager::try_new(temp_dir.path().join("index.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let bpm = Arc::new(BufferPoolManager::new(pool_size, disk_scheduler));
        let tree = Arc::new(BPlusTree::<i64>::new(bpm, leaf_max, internal_max).unwrap());
        (temp_dir, tree)
    }

    #[test]
    fn empty_tree_behaviour() {
        let (_tmp, tree) = setup_tree(5, 3, 64);
        assert!(tree.is_empty().unwrap());
        assert_eq!(tree.get_value(1).unwrap(), None);
        assert!(!tree.remove(1).unwrap());
        assert_eq!(tree.begin().unwrap().collect_all().unwrap(), vec![]);
    }

    #[test]
    fn point_ops_on_single_leaf() {
        let (_tmp, tree) = setup_tree(5, 3, 64);
        for key in 1..=5i64 {
            assert!(tree.insert(key, rid(key)).unwrap());
        }
        assert!(!tree.is_empty().unwrap());

        assert!(tree.remove(1).unwrap());
        assert!(tree.remove(5).unwrap());

        assert_eq!(tree.get_value(1).unwrap(), None);
        assert_eq!(tree.get_value(5).unwrap(), None);
        for key in 2..=4i64 {
            assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)));
        }

        let entries = tree.begin().unwrap().collect_all().unwrap();
        assert_eq!(entries, vec![(2, rid(2)), (3, rid(3)), (4, rid(4))]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let (_tmp, tree) = setup_tree(2, 3, 64);
        for key in 1..=20i64 {
            assert!(tree.insert(key, rid(key)).unwrap());
        }
        for key in 1..=20i64 {
            assert!(!tree.insert(key, rid(key + 100)).unwrap());
            assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)));
        }
    }

    #[test]
    fn sequential_inserts_split_correctly() {
        let (_tmp, tree) = setup_tree(2, 3, 64);
        for key in 1..=64i64 {
            assert!(tree.insert(key, rid(key)).unwrap());
            assert_eq!(tree.check_integrity().unwrap(), key as usize);
        }
        for key in 1..=64i64 {
            assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)));
        }
        let entries = tree.begin().unwrap().collect_all().unwrap();
        let keys: Vec<i64> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (1..=64).collect::<Vec<_>>());
    }

    #[test]
    fn sequential_removes_merge_correctly() {
        let (_tmp, tree) = setup_tree(2, 3, 64);
        for key in 1..=32i64 {
            tree.insert(key, rid(key)).unwrap();
        }
        for key in 1..=32i64 {
            assert!(tree.remove(key).unwrap());
            let remaining = 32 - key as usize;
            assert_eq!(tree.check_integrity().unwrap(), remaining);
        }
        for key in 1..=32i64 {
            assert_eq!(tree.get_value(key).unwrap(), None);
        }
        // removing from the drained tree stays a no-op
        assert!(!tree.remove(1).unwrap());
    }

    #[test]
    fn iterator_seek_positions() {
        let (_tmp, tree) = setup_tree(2, 3, 64);
        for key in (2..=40i64).step_by(2) {
            tree.insert(key, rid(key)).unwrap();
        }

        // exact hit
        let mut iter = tree.begin_at(10).unwrap();
        assert_eq!(iter.next().unwrap(), Some((10, rid(10))));
        // between keys: lands on the next greater
        let mut iter = tree.begin_at(11).unwrap();
        assert_eq!(iter.next().unwrap(), Some((12, rid(12))));
        // past the end
        let mut iter = tree.begin_at(41).unwrap();
        assert_eq!(iter.next().unwrap(), None);
    }

    #[test]
    fn random_insert_then_remove_odds() {
        let mut rng = rand::rng();
        let mut sizes: Vec<i64> = (1..=64).collect();
        sizes.extend([200, 333]);
        for n in sizes {
            let (_tmp, tree) = setup_tree(2, 3, 64);

            let mut keys: Vec<i64> = (1..=n).collect();
            keys.shuffle(&mut rng);
            for &key in &keys {
                assert!(tree.insert(key, rid(key)).unwrap());
            }

            let mut odds: Vec<i64> = (1..=n).filter(|k| k % 2 == 1).collect();
            odds.shuffle(&mut rng);
            for &key in &odds {
                assert!(tree.remove(key).unwrap(), "remove {} of {}", key, n);
            }

            for key in 1..=n {
                let found = tree.get_value(key).unwrap();
                if key % 2 == 0 {
                    assert_eq!(found, Some(rid(key)), "even key {} of {}", key, n);
                } else {
                    assert_eq!(found, None, "odd key {} of {}", key, n);
                }
            }
            let evens = (n / 2) as usize;
            assert_eq!(tree.check_integrity().unwrap(), evens);
        }
    }

    #[test]
    fn concurrent_inserts_then_gets() {
        const THREADS: usize = 8;
        const KEYS_PER_THREAD: i64 = 250;
        let (_tmp, tree) = setup_tree(4, 4, 256);

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = vec![];
        for tid in 0..THREADS {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let start = tid as i64 * KEYS_PER_THREAD;
                barrier.wait();
                for key in start..start + KEYS_PER_THREAD {
                    assert!(tree.insert(key, rid(key)).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let total = THREADS as i64 * KEYS_PER_THREAD;
        for key in 0..total {
            assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)));
        }
        assert_eq!(tree.check_integrity().unwrap(), total as usize);

        // concurrent readers over the finished tree
        let mut handles = vec![];
        for _ in 0..THREADS {
            let tree = tree.clone();
            handles.push(thread::spawn(move || {
                use rand::Rng;
                let mut rng = rand::rng();
                for _ in 0..500 {
                    let key = rng.random_range(0..total);
                    assert_eq!(tree.get_value(key).unwrap(), Some(rid(key)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn concurrent_interleaved_deletes() {
        const THREADS: usize = 4;
        const TOTAL: i64 = 800;
        let (_tmp, tree) = setup_tree(4, 4, 256);

        for key in 0..TOTAL {
            tree.insert(key, rid(key)).unwrap();
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = vec![];
        for tid in 0..THREADS {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                // every thread deletes its interleaved residue class
                for key in (0..TOTAL).filter(|k| (*k as usize) % THREADS == tid) {
                    assert!(tree.remove(key).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..TOTAL {
            assert_eq!(tree.get_value(key).unwrap(), None);
        }
        assert_eq!(tree.check_integrity().unwrap(), 0);
    }

    #[test]
    fn mixed_concurrent_workload_converges() {
        const THREADS: usize = 6;
        const RANGE: i64 = 600;
        let (_tmp, tree) = setup_tree(4, 4, 256);

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = vec![];
        for tid in 0..THREADS {
            let tree = tree.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                let start = tid as i64 * (RANGE / THREADS as i64);
                let end = start + RANGE / THREADS as i64;
                barrier.wait();
                for key in start..end {
                    assert!(tree.insert(key, rid(key)).unwrap());
                }
                // drop the lower half of this thread's range again
                for key in start..(start + end) / 2 {
                    assert!(tree.remove(key).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut expected = 0usize;
        for tid in 0..THREADS {
            let start = tid as i64 * (RANGE / THREADS as i64);
            let end = start + RANGE / THREADS as i64;
            for key in start..end {
                let found = tree.get_value(key).unwrap();
                if key < (start + end) / 2 {
                    assert_eq!(found, None);
                } else {
                    assert_eq!(found, Some(rid(key)));
                    expected += 1;
                }
            }
        }
        assert_eq!(tree.check_integrity().unwrap(), expected);
    }
}
