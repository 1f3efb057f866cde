use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{VellumError, VellumResult};
use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Debug)]
struct LruKNode {
    // bounded to the k most recent access timestamps, oldest first
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LruKNode {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64, k: usize) {
        self.history.push_back(timestamp);
        if self.history.len() > k {
            self.history.pop_front();
        }
    }

    /// Ordering key: for a cold node (fewer than k accesses) this is the
    /// earliest recorded access; for a warm node it is the k-th most recent.
    fn order_timestamp(&self) -> u64 {
        *self.history.front().expect("node has at least one access")
    }
}

/// LRU-K replacement policy over buffer pool frames.
///
/// Frames with fewer than k recorded accesses have +inf backward k-distance
/// and live in the cold set, ordered by earliest access (classical LRU).
/// Frames with at least k accesses live in the warm set, ordered by their
/// k-th most recent access. Eviction drains the cold set first. Only
/// evictable frames are members of either set; a pinned frame still records
/// accesses through its node in the store.
#[derive(Debug)]
pub struct LruKReplacer {
    k: usize,
    replacer_size: usize,
    current_timestamp: u64,
    curr_size: usize,
    node_store: HashMap<FrameId, LruKNode>,
    cold_set: BTreeSet<(u64, FrameId)>,
    warm_set: BTreeSet<(u64, FrameId)>,
}

impl LruKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "LRU-K requires k > 0");
        Self {
            k,
            replacer_size: num_frames,
            current_timestamp: 0,
            curr_size: 0,
            node_store: HashMap::with_capacity(num_frames),
            cold_set: BTreeSet::new(),
            warm_set: BTreeSet::new(),
        }
    }

    fn queue_remove(&mut self, frame_id: FrameId, node: &LruKNode) {
        let key = (node.order_timestamp(), frame_id);
        if node.history.len() < self.k {
            self.cold_set.remove(&key);
        } else {
            self.warm_set.remove(&key);
        }
    }

    fn queue_insert(&mut self, frame_id: FrameId, node: &LruKNode) {
        let key = (node.order_timestamp(), frame_id);
        if node.history.len() < self.k {
            self.cold_set.insert(key);
        } else {
            self.warm_set.insert(key);
        }
    }
}

impl Replacer for LruKReplacer {
    fn record_access(&mut self, frame_id: FrameId) -> VellumResult<()> {
        let timestamp = self.current_timestamp;
        self.current_timestamp += 1;

        if self.node_store.contains_key(&frame_id) {
            let mut node = self.node_store.remove(&frame_id).unwrap();
            if node.is_evictable {
                self.queue_remove(frame_id, &node);
            }
            node.record_access(timestamp, self.k);
            if node.is_evictable {
                self.queue_insert(frame_id, &node);
            }
            self.node_store.insert(frame_id, node);
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(VellumError::Internal(format!(
                    "replacer is tracking {} frames, cannot add frame {}",
                    self.node_store.len(),
                    frame_id
                )));
            }
            let mut node = LruKNode::new();
            node.record_access(timestamp, self.k);
            self.node_store.insert(frame_id, node);
        }
        Ok(())
    }

    fn evict(&mut self) -> Option<FrameId> {
        let frame_id = if let Some(&(_, frame_id)) = self.cold_set.iter().next() {
            frame_id
        } else if let Some(&(_, frame_id)) = self.warm_set.iter().next() {
            frame_id
        } else {
            return None;
        };

        let node = self.node_store.remove(&frame_id).unwrap();
        self.queue_remove(frame_id, &node);
        self.curr_size -= 1;
        Some(frame_id)
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> VellumResult<()> {
        let Some(mut node) = self.node_store.remove(&frame_id) else {
            return Err(VellumError::Internal(format!(
                "frame {} not found in replacer",
                frame_id
            )));
        };
        if set_evictable && !node.is_evictable {
            node.is_evictable = true;
            self.queue_insert(frame_id, &node);
            self.curr_size += 1;
        } else if !set_evictable && node.is_evictable {
            node.is_evictable = false;
            self.queue_remove(frame_id, &node);
            self.curr_size -= 1;
        }
        self.node_store.insert(frame_id, node);
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.remove(&frame_id) {
            if node.is_evictable {
                self.queue_remove(frame_id, &node);
                self.curr_size -= 1;
            }
        }
    }

    fn size(&self) -> usize {
        self.curr_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_evictable_adjusts_size() {
        let mut replacer = LruKReplacer::new(3, 2);
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn cold_frames_evicted_before_warm() {
        let mut replacer = LruKReplacer::new(2, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(2).unwrap(); // ts=2
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(2).unwrap(); // ts=4
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        // frame 1 has 2 accesses (< k, cold), frame 2 has 3 (warm)
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn cold_ties_resolved_by_earliest_access() {
        let mut replacer = LruKReplacer::new(3, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1
        replacer.record_access(3).unwrap(); // ts=2
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(1).unwrap(); // ts=4, frame 1 warm: [0,3,4]
        replacer.record_access(3).unwrap(); // ts=5, frame 3 cold: [2,5]
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        replacer.set_evictable(3, true).unwrap();
        // frames 2 and 3 are cold; frame 2's first access (ts=1) is older
        assert_eq!(replacer.evict(), Some(2));
    }

    #[test]
    fn eviction_order_follows_kth_recent_access() {
        // k=2, seven frames, access trace 1,2,3,4,1,2,3,1,2,4 (ts 0..=9).
        // Last-two histories: f1 [4,7], f2 [5,8], f3 [2,6], f4 [3,9].
        // All warm, so the victim order is the ascending 2nd-most-recent
        // timestamp: 3, 4, 1, 2.
        let mut replacer = LruKReplacer::new(7, 2);
        for frame_id in [1, 2, 3, 4, 1, 2, 3, 1, 2, 4] {
            replacer.record_access(frame_id).unwrap();
        }
        for frame_id in 1..=4 {
            replacer.set_evictable(frame_id, true).unwrap();
        }
        assert_eq!(replacer.size(), 4);

        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn mixed_scenario() {
        let mut replacer = LruKReplacer::new(7, 2);

        for frame_id in 1..=6 {
            replacer.record_access(frame_id).unwrap(); // ts = frame_id - 1
        }
        for frame_id in 1..=5 {
            replacer.set_evictable(frame_id, true).unwrap();
        }
        replacer.set_evictable(6, false).unwrap();
        assert_eq!(replacer.size(), 5);

        // frame 1 becomes warm with history [0, 6]
        replacer.record_access(1).unwrap();

        // cold frames drain oldest-first
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.size(), 2);

        replacer.record_access(3).unwrap(); // ts=7, cold
        replacer.record_access(4).unwrap(); // ts=8
        replacer.record_access(5).unwrap(); // ts=9, frame 5 warm [4, 9]
        replacer.record_access(4).unwrap(); // ts=10, frame 4 warm [8, 10]
        replacer.set_evictable(3, true).unwrap();
        replacer.set_evictable(4, true).unwrap();
        assert_eq!(replacer.size(), 4);

        // frame 3 is the only cold frame left
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.size(), 3);

        replacer.set_evictable(6, true).unwrap();
        assert_eq!(replacer.size(), 4);
        assert_eq!(replacer.evict(), Some(6));

        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 2);
        // warm frames 5 ([4,9]) and 4 ([8,10]); 5 has the older 2nd-recent
        assert_eq!(replacer.evict(), Some(5));

        replacer.record_access(1).unwrap(); // ts=11
        replacer.record_access(1).unwrap(); // ts=12, history [11, 12]
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.evict(), Some(4));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn remove_forgets_history() {
        let mut replacer = LruKReplacer::new(4, 2);
        replacer.record_access(1).unwrap();
        replacer.record_access(2).unwrap();
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        replacer.remove(1);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(2));
        // removing an unknown frame is a no-op
        replacer.remove(42);
        assert_eq!(replacer.size(), 0);
    }
}
