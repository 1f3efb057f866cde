use crate::buffer::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{VellumError, VellumResult};
use crate::storage::tuple::Tuple;
use crate::transaction::{TransactionId, INVALID_TXN_ID};
use std::fmt::{Display, Formatter};

/// Identifies a tuple: the page holding it and the slot inside the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot_num: u32,
}

pub const INVALID_RID: RecordId = RecordId {
    page_id: INVALID_PAGE_ID,
    slot_num: u32::MAX,
};

impl RecordId {
    pub fn new(page_id: PageId, slot_num: u32) -> Self {
        Self { page_id, slot_num }
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.page_id, self.slot_num)
    }
}

/// Per-tuple visibility metadata; exactly what abort-time undo needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleMeta {
    pub insert_txn_id: TransactionId,
    pub delete_txn_id: TransactionId,
    pub is_deleted: bool,
}

impl TupleMeta {
    pub fn new(insert_txn_id: TransactionId) -> Self {
        Self {
            insert_txn_id,
            delete_txn_id: INVALID_TXN_ID,
            is_deleted: false,
        }
    }

    pub fn empty() -> Self {
        Self::new(INVALID_TXN_ID)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TupleInfo {
    pub offset: u16,
    pub size: u16,
    pub meta: TupleMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePageHeader {
    pub next_page_id: PageId,
    pub num_tuples: u16,
    pub num_deleted_tuples: u16,
    pub tuple_infos: Vec<TupleInfo>,
}

/// Slotted page:
/// ```text
///  ---------------------------------------------------------
///  | HEADER | ... FREE SPACE ... | ... INSERTED TUPLES ... |
///  ---------------------------------------------------------
///                                ^ free space pointer
/// ```
/// Tuples grow from the page tail toward the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePage {
    pub header: TablePageHeader,
    pub data: [u8; PAGE_SIZE],
}

// header prefix: next_page_id(4) + num_tuples(2) + num_deleted_tuples(2)
pub(crate) const TABLE_PAGE_HEADER_BASE: usize = 8;
// offset(2) + size(2) + insert_txn(8) + delete_txn(8) + is_deleted(1)
pub(crate) const TUPLE_INFO_SIZE: usize = 21;

impl TablePage {
    pub fn new(next_page_id: PageId) -> Self {
        Self {
            header: TablePageHeader {
                next_page_id,
                num_tuples: 0,
                num_deleted_tuples: 0,
                tuple_infos: Vec::new(),
            },
            data: [0; PAGE_SIZE],
        }
    }

    fn header_size(num_tuples: usize) -> usize {
        TABLE_PAGE_HEADER_BASE + num_tuples * TUPLE_INFO_SIZE
    }

    /// Offset the next tuple would land at, or an error if it does not fit.
    pub fn next_tuple_offset(&self, tuple: &Tuple) -> VellumResult<u16> {
        let slot_end = self
            .header
            .tuple_infos
            .last()
            .map(|info| info.offset as usize)
            .unwrap_or(PAGE_SIZE);
        let tuple_offset = slot_end.checked_sub(tuple.len()).ok_or_else(|| {
            VellumError::Storage("tuple does not fit in an empty region".to_string())
        })?;
        if Self::header_size(self.header.num_tuples as usize + 1) > tuple_offset {
            return Err(VellumError::Storage(
                "page cannot fit another tuple".to_string(),
            ));
        }
        Ok(tuple_offset as u16)
    }

    pub fn insert_tuple(&mut self, meta: &TupleMeta, tuple: &Tuple) -> VellumResult<u16> {
        let tuple_offset = self.next_tuple_offset(tuple)?;
        let slot_num = self.header.num_tuples;
        self.header.tuple_infos.push(TupleInfo {
            offset: tuple_offset,
            size: tuple.len() as u16,
            meta: *meta,
        });
        self.header.num_tuples += 1;
        if meta.is_deleted {
            self.header.num_deleted_tuples += 1;
        }
        self.data[tuple_offset as usize..tuple_offset as usize + tuple.len()]
            .copy_from_slice(&tuple.data);
        Ok(slot_num)
    }

    pub fn update_tuple_meta(&mut self, meta: TupleMeta, slot_num: u16) -> VellumResult<()> {
        let info = self
            .header
            .tuple_infos
            .get_mut(slot_num as usize)
            .ok_or_else(|| {
                VellumError::Storage(format!("slot {} out of range", slot_num))
            })?;
        if meta.is_deleted && !info.meta.is_deleted {
            self.header.num_deleted_tuples += 1;
        } else if !meta.is_deleted && info.meta.is_deleted {
            self.header.num_deleted_tuples -= 1;
        }
        info.meta = meta;
        Ok(())
    }

    /// Restore a tuple image in place. The replacement must be exactly the
    /// size of the stored image.
    pub fn update_tuple_in_place(
        &mut self,
        meta: TupleMeta,
        tuple: &Tuple,
        slot_num: u16,
    ) -> VellumResult<()> {
        let info = *self
            .header
            .tuple_infos
            .get(slot_num as usize)
            .ok_or_else(|| VellumError::Storage(format!("slot {} out of range", slot_num)))?;
        if info.size as usize != tuple.len() {
            return Err(VellumError::Storage(format!(
                "in-place update size mismatch: {} != {}",
                info.size,
                tuple.len()
            )));
        }
        self.update_tuple_meta(meta, slot_num)?;
        self.data[info.offset as usize..info.offset as usize + tuple.len()]
            .copy_from_slice(&tuple.data);
        Ok(())
    }

    pub fn tuple(&self, slot_num: u16) -> VellumResult<(TupleMeta, Tuple)> {
        let info = self
            .header
            .tuple_infos
            .get(slot_num as usize)
            .ok_or_else(|| VellumError::Storage(format!("slot {} out of range", slot_num)))?;
        let start = info.offset as usize;
        let tuple = Tuple::new(self.data[start..start + info.size as usize].to_vec());
        Ok((info.meta, tuple))
    }

    pub fn tuple_meta(&self, slot_num: u16) -> VellumResult<TupleMeta> {
        self.header
            .tuple_infos
            .get(slot_num as usize)
            .map(|info| info.meta)
            .ok_or_else(|| VellumError::Storage(format!("slot {} out of range", slot_num)))
    }

    /// Next record id on this page after `rid`, if any.
    pub fn get_next_rid(&self, rid: &RecordId) -> Option<RecordId> {
        let next_slot = rid.slot_num + 1;
        if next_slot < self.header.num_tuples as u32 {
            Some(RecordId::new(rid.page_id, next_slot))
        } else {
            None
        }
    }
}
