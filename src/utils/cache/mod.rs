use crate::buffer::FrameId;
use crate::error::VellumResult;

pub mod lru_k;

pub trait Replacer {
    fn record_access(&mut self, frame_id: FrameId) -> VellumResult<()>;

    fn evict(&mut self) -> Option<FrameId>;

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> VellumResult<()>;

    fn remove(&mut self, frame_id: FrameId);

    fn size(&self) -> usize;
}
