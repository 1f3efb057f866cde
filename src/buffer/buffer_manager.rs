use bytes::Bytes;
use log::debug;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::buffer::buffer_pool::{BufferPool, FrameId};
use crate::buffer::page::{
    self, BasicPageGuard, FrameMeta, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID,
};
use crate::config::BufferPoolConfig;
use crate::error::{VellumError, VellumResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LruKReplacer;
use crate::utils::cache::Replacer;

#[derive(Debug)]
struct PoolState {
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    frame_meta: Vec<FrameMeta>,
    replacer: LruKReplacer,
}

/// Caches up to `pool_size` disk pages in a fixed set of frames and
/// dispenses RAII page guards.
///
/// One latch covers the page table, the free list, the replacer and the
/// frame metadata; every public operation is atomic under it. The only part
/// of guard acquisition outside the latch is taking the page latch itself,
/// which happens after the frame is pinned and therefore cannot race with
/// eviction.
#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Arc<BufferPool>,
    state: Mutex<PoolState>,
    disk_scheduler: Arc<DiskScheduler>,
}

impl BufferPoolManager {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let num_pages = config.buffer_pool_size;
        let mut free_list = VecDeque::with_capacity(num_pages);
        for frame_id in 0..num_pages {
            free_list.push_back(frame_id);
        }
        Self {
            pool: Arc::new(BufferPool::new(num_pages)),
            state: Mutex::new(PoolState {
                page_table: HashMap::with_capacity(num_pages),
                free_list,
                frame_meta: vec![FrameMeta::empty(); num_pages],
                replacer: LruKReplacer::new(num_pages, config.lru_k_k),
            }),
            disk_scheduler,
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    pub fn disk_scheduler(&self) -> Arc<DiskScheduler> {
        self.disk_scheduler.clone()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.capacity()
    }

    /// Number of frames currently eligible for eviction.
    pub fn evictable_count(&self) -> usize {
        self.state.lock().replacer.size()
    }

    pub fn free_frame_count(&self) -> usize {
        self.state.lock().free_list.len()
    }

    pub fn resident_page_count(&self) -> usize {
        self.state.lock().page_table.len()
    }

    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        state
            .page_table
            .get(&page_id)
            .map(|frame_id| state.frame_meta[*frame_id].pin_count)
    }

    /// Allocate a fresh page id, install the zeroed page pinned in a frame,
    /// and hand back a write guard on it.
    pub fn new_page(self: &Arc<Self>) -> VellumResult<WritePageGuard> {
        let mut state = self.state.lock();
        if state.free_list.is_empty() && state.replacer.size() == 0 {
            return Err(VellumError::Storage(
                "cannot create page: buffer pool is full and no frame is evictable".to_string(),
            ));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let page_id = self
            .disk_scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| VellumError::Internal(format!("disk scheduler hung up: {}", e)))??;

        self.pool.reset_frame(frame_id);
        state.page_table.insert(page_id, frame_id);
        state.frame_meta[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        state.replacer.record_access(frame_id)?;
        state.replacer.set_evictable(frame_id, false)?;
        drop(state);

        Ok(page::new_write_guard(Arc::clone(self), frame_id, page_id))
    }

    pub fn fetch_page_basic(self: &Arc<Self>, page_id: PageId) -> VellumResult<BasicPageGuard> {
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_basic_guard(Arc::clone(self), frame_id, page_id))
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> VellumResult<ReadPageGuard> {
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id, page_id))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> VellumResult<WritePageGuard> {
        let frame_id = self.pin_page(page_id)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id, page_id))
    }

    /// Drop one pin. When the count reaches zero the frame becomes
    /// evictable. The dirty flag is sticky until a flush. Returns false if
    /// the page is not resident or was not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return false;
        };
        let meta = &mut state.frame_meta[frame_id];
        if meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        if is_dirty {
            meta.is_dirty = true;
        }
        if meta.pin_count == 0 {
            let _ = state.replacer.set_evictable(frame_id, true);
        }
        true
    }

    /// Write the page image back to disk and clear its dirty bit. Returns
    /// false for a non-resident page, or when the page is write-latched and
    /// its bytes cannot be captured.
    pub fn flush_page(&self, page_id: PageId) -> VellumResult<bool> {
        let mut state = self.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        let bytes = {
            let Some(_latch) = self.pool.frame_latch(frame_id).try_read() else {
                return Ok(false);
            };
            Bytes::copy_from_slice(unsafe { self.pool.frame_slice(frame_id) })
        };
        self.disk_scheduler
            .schedule_write(page_id, bytes)?
            .recv()
            .map_err(|e| VellumError::Internal(format!("disk scheduler hung up: {}", e)))??;
        state.frame_meta[frame_id].is_dirty = false;
        Ok(true)
    }

    /// Flush every resident page and fsync the database file.
    pub fn flush_all_pages(&self) -> VellumResult<()> {
        let page_ids: Vec<PageId> = {
            let state = self.state.lock();
            state.page_table.keys().copied().collect()
        };
        for page_id in page_ids {
            self.flush_page(page_id)?;
        }
        self.disk_scheduler
            .schedule_sync()?
            .recv()
            .map_err(|e| VellumError::Internal(format!("disk scheduler hung up: {}", e)))??;
        Ok(())
    }

    /// Drop a page from the pool and deallocate it. Fails (returns false)
    /// while the page is pinned; deleting a non-resident page only forwards
    /// the deallocation.
    pub fn delete_page(&self, page_id: PageId) -> VellumResult<bool> {
        let mut state = self.state.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            if state.frame_meta[frame_id].pin_count > 0 {
                return Ok(false);
            }
            state.page_table.remove(&page_id);
            state.replacer.remove(frame_id);
            state.frame_meta[frame_id].reset();
            self.pool.reset_frame(frame_id);
            state.free_list.push_back(frame_id);
        }
        drop(state);

        self.disk_scheduler
            .schedule_deallocate(page_id)?
            .recv()
            .map_err(|e| VellumError::Internal(format!("disk scheduler hung up: {}", e)))??;
        Ok(true)
    }

    /// Pin the page, loading it from disk if needed. Called with the state
    /// latch released; returns the frame holding the page with its pin count
    /// already incremented.
    fn pin_page(&self, page_id: PageId) -> VellumResult<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(VellumError::Storage("fetch of invalid page id".to_string()));
        }
        let mut state = self.state.lock();

        if let Some(&frame_id) = state.page_table.get(&page_id) {
            state.frame_meta[frame_id].pin_count += 1;
            state.replacer.record_access(frame_id)?;
            state.replacer.set_evictable(frame_id, false)?;
            return Ok(frame_id);
        }

        if state.free_list.is_empty() && state.replacer.size() == 0 {
            return Err(VellumError::Storage(format!(
                "cannot fetch page {}: buffer pool is full and no frame is evictable",
                page_id
            )));
        }

        let frame_id = self.acquire_frame(&mut state)?;
        let data = self
            .disk_scheduler
            .schedule_read(page_id)?
            .recv()
            .map_err(|e| VellumError::Internal(format!("disk scheduler hung up: {}", e)))??;
        self.pool.fill_frame(frame_id, &data);

        state.page_table.insert(page_id, frame_id);
        state.frame_meta[frame_id] = FrameMeta {
            page_id,
            pin_count: 1,
            is_dirty: false,
        };
        state.replacer.record_access(frame_id)?;
        state.replacer.set_evictable(frame_id, false)?;
        Ok(frame_id)
    }

    /// Take a frame from the free list, or evict a victim (flushing it first
    /// if dirty) and recycle its frame.
    fn acquire_frame(&self, state: &mut PoolState) -> VellumResult<FrameId> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let Some(victim) = state.replacer.evict() else {
            return Err(VellumError::Storage(
                "cannot acquire frame: no free or evictable frame".to_string(),
            ));
        };
        let victim_meta = state.frame_meta[victim].clone();
        debug_assert_eq!(victim_meta.pin_count, 0);
        debug!(
            "evicting page {} from frame {} (dirty={})",
            victim_meta.page_id, victim, victim_meta.is_dirty
        );

        if victim_meta.page_id != INVALID_PAGE_ID {
            if victim_meta.is_dirty {
                // pin_count == 0, so no guard can be touching the bytes
                let bytes = Bytes::copy_from_slice(unsafe { self.pool.frame_slice(victim) });
                self.disk_scheduler
                    .schedule_write(victim_meta.page_id, bytes)?
                    .recv()
                    .map_err(|e| {
                        VellumError::Internal(format!("disk scheduler hung up: {}", e))
                    })??;
            }
            state.page_table.remove(&victim_meta.page_id);
        }
        state.frame_meta[victim].reset();
        Ok(victim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn setup(num_pages: usize) -> (TempDir, Arc<BufferPoolManager>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let bpm = Arc::new(BufferPoolManager::new(num_pages, disk_scheduler));
        (temp_dir, bpm)
    }

    #[test]
    fn new_page_fills_pool_then_fails() {
        let (_tmp, bpm) = setup(10);

        let mut guards = vec![];
        for expected in 0..10 {
            let guard = bpm.new_page().unwrap();
            assert_eq!(guard.page_id(), expected);
            assert!(guard.data().iter().all(|b| *b == 0));
            guards.push(guard);
        }
        assert_eq!(bpm.free_frame_count(), 0);
        assert_eq!(bpm.evictable_count(), 0);

        // every frame pinned: the eleventh page cannot be created
        assert!(bpm.new_page().is_err());

        // releasing page 0 makes its frame evictable and reusable
        guards.remove(0);
        assert_eq!(bpm.evictable_count(), 1);
        let guard = bpm.new_page().unwrap();
        assert_eq!(guard.page_id(), 10);
        assert!(bpm.pin_count(0).is_none());

        // all frames pinned again, page 0 cannot come back yet
        assert!(bpm.fetch_page_read(0).is_err());

        // page 0 was never dirtied, so it reads back as the zeroed disk image
        drop(guard);
        let page0 = bpm.fetch_page_read(0).unwrap();
        assert!(page0.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn unpin_marks_frame_evictable() {
        let (_tmp, bpm) = setup(3);

        let page1 = bpm.new_page().unwrap();
        let _page2 = bpm.new_page().unwrap();
        let _page3 = bpm.new_page().unwrap();
        assert!(bpm.new_page().is_err());

        drop(page1);
        assert_eq!(bpm.evictable_count(), 1);
        assert!(bpm.new_page().is_ok());
        assert_eq!(bpm.evictable_count(), 1);
    }

    #[test]
    fn unpin_is_rejected_without_pin() {
        let (_tmp, bpm) = setup(3);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };
        assert_eq!(bpm.pin_count(page_id), Some(0));
        assert!(!bpm.unpin_page(page_id, false));
        assert!(!bpm.unpin_page(INVALID_PAGE_ID, false));
    }

    #[test]
    fn dirty_flag_is_sticky_until_flush() {
        let (_tmp, bpm) = setup(3);
        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.mark_dirty();
            guard.page_id()
        };

        // re-pin and unpin clean: the dirty bit must survive
        drop(bpm.fetch_page_read(page_id).unwrap());
        {
            let state = bpm.state.lock();
            let frame_id = state.page_table[&page_id];
            assert!(state.frame_meta[frame_id].is_dirty);
        }

        assert!(bpm.flush_page(page_id).unwrap());
        {
            let state = bpm.state.lock();
            let frame_id = state.page_table[&page_id];
            assert!(!state.frame_meta[frame_id].is_dirty);
        }

        let read = bpm
            .disk_scheduler()
            .schedule_read(page_id)
            .unwrap()
            .recv()
            .unwrap()
            .unwrap();
        assert_eq!(read[0], 42);
    }

    #[test]
    fn eviction_writes_back_dirty_page() {
        let (_tmp, bpm) = setup(2);

        let first_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[7] = 7;
            guard.mark_dirty();
            guard.page_id()
        };

        // force the dirty page out of the pool
        let _second = bpm.new_page().unwrap();
        let _third = bpm.new_page().unwrap();
        drop(_second);
        drop(_third);
        let _fourth = bpm.new_page().unwrap();
        let _fifth = bpm.new_page().unwrap();

        // the evicted image must be readable from disk
        let guard = bpm.fetch_page_read(first_id);
        match guard {
            Ok(g) => assert_eq!(g.data()[7], 7),
            Err(_) => {
                drop(_fourth);
                let g = bpm.fetch_page_read(first_id).unwrap();
                assert_eq!(g.data()[7], 7);
            }
        }
    }

    #[test]
    fn delete_page_releases_frame() {
        let (_tmp, bpm) = setup(3);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };

        assert!(bpm.delete_page(page_id).unwrap());
        assert_eq!(bpm.resident_page_count(), 0);
        assert_eq!(bpm.free_frame_count(), 3);

        // deleting again is a forwarded no-op
        assert!(bpm.delete_page(page_id).unwrap());
    }

    #[test]
    fn delete_pinned_page_fails() {
        let (_tmp, bpm) = setup(3);
        let guard = bpm.new_page().unwrap();
        let page_id = guard.page_id();
        assert!(!bpm.delete_page(page_id).unwrap());
        drop(guard);
        assert!(bpm.delete_page(page_id).unwrap());
    }

    #[test]
    fn fetch_read_write_round_trip() {
        let (_tmp, bpm) = setup(3);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };

        {
            let mut guard = bpm.fetch_page_write(page_id).unwrap();
            guard.data_mut()[100] = 5;
            guard.mark_dirty();
            assert_eq!(bpm.pin_count(page_id), Some(1));
        }
        assert_eq!(bpm.pin_count(page_id), Some(0));

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[100], 5);
        drop(guard);

        // a basic guard pins without latching
        let basic = bpm.fetch_page_basic(page_id).unwrap();
        assert_eq!(basic.data()[100], 5);
        assert_eq!(bpm.pin_count(page_id), Some(1));
    }

    #[test]
    fn concurrent_readers_do_not_leak_pins() {
        const THREADS: usize = 8;
        let (_tmp, bpm) = setup(4);
        let page_id = {
            let mut guard = bpm.new_page().unwrap();
            guard.data_mut()[0] = 42;
            guard.mark_dirty();
            guard.page_id()
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for _ in 0..THREADS {
            let bpm = bpm.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..100 {
                    let guard = bpm.fetch_page_read(page_id).expect("fetch read");
                    assert_eq!(guard.data()[0], 42);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(bpm.pin_count(page_id), Some(0));
        assert_eq!(bpm.evictable_count(), 1);
    }

    #[test]
    fn concurrent_writers_serialize_through_the_latch() {
        const THREADS: usize = 4;
        let (_tmp, bpm) = setup(4);
        let page_id = {
            let guard = bpm.new_page().unwrap();
            guard.page_id()
        };

        let barrier = Arc::new(Barrier::new(THREADS));
        let mut handles = Vec::with_capacity(THREADS);
        for tid in 0..THREADS {
            let bpm = bpm.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..50 {
                    let mut guard = bpm.fetch_page_write(page_id).expect("fetch write");
                    let slot = guard.data()[0] as usize % THREADS;
                    guard.data_mut()[slot + 1] = tid as u8;
                    guard.data_mut()[0] = guard.data()[0].wrapping_add(1);
                    guard.mark_dirty();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let guard = bpm.fetch_page_read(page_id).unwrap();
        assert_eq!(guard.data()[0] as usize, THREADS * 50);
    }
}
