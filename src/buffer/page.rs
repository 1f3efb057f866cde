use log::error;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use std::mem::{self, ManuallyDrop};
use std::sync::Arc;

use crate::buffer::buffer_pool::{BufferPool, FrameId};
use crate::buffer::BufferPoolManager;

pub type PageId = i32;

pub const INVALID_PAGE_ID: PageId = -1;
pub const PAGE_SIZE: usize = 4096;

/// Bookkeeping for one frame, kept under the buffer pool manager's latch.
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl FrameMeta {
    pub fn empty() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self::empty()
    }
}

/// Pins a page without holding its latch. Suitable for pages that are not
/// yet shared (freshly allocated) or for latch-free metadata reads.
#[derive(Debug)]
pub struct BasicPageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    page_id: PageId,
    is_dirty: bool,
}

impl BasicPageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }
}

impl Drop for BasicPageGuard {
    fn drop(&mut self) {
        if !self.bpm.unpin_page(self.page_id, self.is_dirty) {
            error!("failed to unpin page {} from basic guard", self.page_id);
        }
    }
}

/// Holds the page's read latch and a pin for its lifetime.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    page_id: PageId,
    guard: ManuallyDrop<RwLockReadGuard<'static, ()>>,
}

impl ReadPageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if !self.bpm.unpin_page(self.page_id, false) {
            error!("failed to unpin page {} from read guard", self.page_id);
        }
    }
}

/// Holds the page's write latch and a pin for its lifetime. The dirty flag
/// accumulated through `mark_dirty`/`overwrite` is handed to the buffer pool
/// when the guard drops.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    page_id: PageId,
    is_dirty: bool,
    guard: ManuallyDrop<RwLockWriteGuard<'static, ()>>,
}

impl WritePageGuard {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { self.pool.frame_slice_mut(self.frame_id) }
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    /// Replace the page image and mark the page dirty.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        self.data_mut().copy_from_slice(data);
        self.is_dirty = true;
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        let is_dirty = self.is_dirty;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if !self.bpm.unpin_page(self.page_id, is_dirty) {
            error!("failed to unpin page {} from write guard", self.page_id);
        }
    }
}

pub(crate) fn new_basic_guard(
    bpm: Arc<BufferPoolManager>,
    frame_id: FrameId,
    page_id: PageId,
) -> BasicPageGuard {
    let pool = bpm.buffer_pool();
    BasicPageGuard {
        bpm,
        pool,
        frame_id,
        page_id,
        is_dirty: false,
    }
}

pub(crate) fn new_read_guard(
    bpm: Arc<BufferPoolManager>,
    frame_id: FrameId,
    page_id: PageId,
) -> ReadPageGuard {
    let pool = bpm.buffer_pool();
    let guard = pool.frame_latch(frame_id).read();
    // The latch is owned by `pool`, which the guard keeps alive; the guard is
    // dropped before the pool reference, so the 'static lifetime never leaks.
    let guard_static: RwLockReadGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(guard) };
    ReadPageGuard {
        bpm,
        pool,
        frame_id,
        page_id,
        guard: ManuallyDrop::new(guard_static),
    }
}

pub(crate) fn new_write_guard(
    bpm: Arc<BufferPoolManager>,
    frame_id: FrameId,
    page_id: PageId,
) -> WritePageGuard {
    let pool = bpm.buffer_pool();
    let guard = pool.frame_latch(frame_id).write();
    let guard_static: RwLockWriteGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(guard) };
    WritePageGuard {
        bpm,
        pool,
        frame_id,
        page_id,
        is_dirty: false,
        guard: ManuallyDrop::new(guard_static),
    }
}
