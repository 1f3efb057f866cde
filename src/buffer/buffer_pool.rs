use parking_lot::RwLock;
use std::cell::UnsafeCell;
use std::fmt;

use crate::buffer::page::PAGE_SIZE;

pub type FrameId = usize;

struct FrameCell {
    latch: RwLock<()>,
    data: UnsafeCell<Box<[u8; PAGE_SIZE]>>,
}

// Frame bytes are only touched while holding the frame latch (or while the
// frame is provably unreferenced, pin_count == 0 under the pool latch).
unsafe impl Sync for FrameCell {}

/// Fixed arena of page-sized frames. Each frame carries its own
/// reader/writer latch; all other bookkeeping (page table, free list,
/// replacer, frame metadata) lives in the [`BufferPoolManager`].
///
/// [`BufferPoolManager`]: crate::buffer::BufferPoolManager
pub struct BufferPool {
    capacity: usize,
    frames: Vec<FrameCell>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            frames.push(FrameCell {
                latch: RwLock::new(()),
                data: UnsafeCell::new(Box::new([0u8; PAGE_SIZE])),
            });
        }
        Self { capacity, frames }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn frame_latch(&self, frame_id: FrameId) -> &RwLock<()> {
        &self.frames[frame_id].latch
    }

    /// # Safety
    /// The caller must hold the frame latch (read or write), or otherwise
    /// guarantee the frame is unreferenced.
    pub(crate) unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        (*self.frames[frame_id].data.get()).as_slice()
    }

    /// # Safety
    /// The caller must hold the frame's write latch, or otherwise guarantee
    /// exclusive access to the frame.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        (*self.frames[frame_id].data.get()).as_mut_slice()
    }

    /// Zero a free frame. Takes the frame's write latch; free frames are
    /// uncontended so this never blocks.
    pub(crate) fn reset_frame(&self, frame_id: FrameId) {
        let _guard = self.frames[frame_id].latch.write();
        unsafe {
            self.frame_slice_mut(frame_id).fill(0);
        }
    }

    /// Install page bytes into a free frame.
    pub(crate) fn fill_frame(&self, frame_id: FrameId, data: &[u8]) {
        let _guard = self.frames[frame_id].latch.write();
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        let len = data.len().min(PAGE_SIZE);
        slice[..len].copy_from_slice(&data[..len]);
        if len < PAGE_SIZE {
            slice[len..].fill(0);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .finish()
    }
}
