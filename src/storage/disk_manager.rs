use log::warn;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::buffer::{PageId, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};

/// File-backed page store. Page ids are allocated monotonically from 0 and
/// map directly to file offsets (`page_id * PAGE_SIZE`). Reads past the end
/// of the file return a zeroed page, so a page that was allocated but never
/// flushed reads back as all zeroes.
#[derive(Debug)]
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicI32,
}

impl DiskManager {
    pub fn try_new(db_path: impl AsRef<Path>) -> VellumResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path.as_ref())?;
        let file_len = file.metadata()?.len();
        let next_page_id = (file_len as usize / PAGE_SIZE) as PageId;
        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicI32::new(next_page_id),
        })
    }

    pub fn read_page(&self, page_id: PageId) -> VellumResult<[u8; PAGE_SIZE]> {
        if page_id < 0 {
            return Err(VellumError::Storage(format!(
                "read_page: invalid page id {}",
                page_id
            )));
        }
        let mut buf = [0u8; PAGE_SIZE];
        let mut file = self.db_file.lock().unwrap();
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset >= file.metadata()?.len() {
            // never written; the zeroed image is the page's content
            return Ok(buf);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut read_total = 0;
        while read_total < PAGE_SIZE {
            let n = file.read(&mut buf[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        Ok(buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> VellumResult<()> {
        if page_id < 0 {
            return Err(VellumError::Storage(format!(
                "write_page: invalid page id {}",
                page_id
            )));
        }
        if data.len() != PAGE_SIZE {
            return Err(VellumError::Storage(format!(
                "write_page: buffer length {} != page size {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        let mut file = self.db_file.lock().unwrap();
        file.seek(SeekFrom::Start(page_id as u64 * PAGE_SIZE as u64))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn allocate_page(&self) -> VellumResult<PageId> {
        let page_id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        if page_id < 0 {
            return Err(VellumError::Internal("page id space exhausted".to_string()));
        }
        Ok(page_id)
    }

    /// Page ids are never reused; deallocation only exists so callers can
    /// signal that a page's content is dead.
    pub fn deallocate_page(&self, _page_id: PageId) -> VellumResult<()> {
        Ok(())
    }

    pub fn sync(&self) -> VellumResult<()> {
        let file = self.db_file.lock().unwrap();
        if let Err(e) = file.sync_data() {
            warn!("sync_data failed: {}", e);
            return Err(VellumError::Io(e));
        }
        Ok(())
    }
}
