use bytes::{Buf, BufMut};

use crate::error::{VellumError, VellumResult};
use crate::storage::codec::DecodedData;
use crate::storage::index::IndexKey;
use crate::storage::page::{
    BPlusTreeHeaderPage, BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage,
    BPlusTreePageType, RecordId,
};

const LEAF_PAGE_TYPE: u8 = 1;
const INTERNAL_PAGE_TYPE: u8 = 2;

fn ensure_len(bytes: &[u8], need: usize, what: &str) -> VellumResult<()> {
    if bytes.len() < need {
        return Err(VellumError::Storage(format!(
            "truncated {}: have {} bytes, need {}",
            what,
            bytes.len(),
            need
        )));
    }
    Ok(())
}

pub struct RecordIdCodec;

impl RecordIdCodec {
    pub const LEN: usize = 8;

    pub fn encode(rid: &RecordId, buf: &mut impl BufMut) {
        buf.put_i32_le(rid.page_id);
        buf.put_u32_le(rid.slot_num);
    }

    pub fn decode(buf: &mut impl Buf) -> RecordId {
        let page_id = buf.get_i32_le();
        let slot_num = buf.get_u32_le();
        RecordId::new(page_id, slot_num)
    }
}

pub struct BPlusTreeHeaderPageCodec;

impl BPlusTreeHeaderPageCodec {
    pub fn encode(page: &BPlusTreeHeaderPage) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4);
        bytes.put_i32_le(page.root_page_id);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeHeaderPage>> {
        ensure_len(bytes, 4, "tree header page")?;
        let mut buf = bytes;
        let root_page_id = buf.get_i32_le();
        Ok((BPlusTreeHeaderPage { root_page_id }, 4))
    }
}

pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreeLeafPage<K>) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(13 + page.array.len() * (K::ENCODED_LEN + RecordIdCodec::LEN));
        bytes.put_u8(LEAF_PAGE_TYPE);
        bytes.put_u32_le(page.array.len() as u32);
        bytes.put_u32_le(page.max_size);
        bytes.put_i32_le(page.next_page_id);
        for (key, rid) in &page.array {
            key.encode(&mut bytes);
            RecordIdCodec::encode(rid, &mut bytes);
        }
        bytes
    }

    pub fn decode<K: IndexKey>(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreeLeafPage<K>>> {
        ensure_len(bytes, 13, "leaf page header")?;
        let mut buf = bytes;
        let page_type = buf.get_u8();
        if page_type != LEAF_PAGE_TYPE {
            return Err(VellumError::Storage(format!(
                "expected leaf page, found page type {}",
                page_type
            )));
        }
        let current_size = buf.get_u32_le() as usize;
        let max_size = buf.get_u32_le();
        let next_page_id = buf.get_i32_le();

        let entry_len = K::ENCODED_LEN + RecordIdCodec::LEN;
        ensure_len(bytes, 13 + current_size * entry_len, "leaf page entries")?;
        let mut array = Vec::with_capacity(current_size);
        for _ in 0..current_size {
            let key = K::decode(&mut buf);
            let rid = RecordIdCodec::decode(&mut buf);
            array.push((key, rid));
        }
        Ok((
            BPlusTreeLeafPage {
                max_size,
                next_page_id,
                array,
            },
            13 + current_size * entry_len,
        ))
    }
}

pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreeInternalPage<K>) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(13 + page.array.len() * (K::ENCODED_LEN + 4));
        bytes.put_u8(INTERNAL_PAGE_TYPE);
        bytes.put_u32_le(page.array.len() as u32);
        bytes.put_u32_le(page.max_size);
        // slot 0 stores only its child; its key slot is unused
        if let Some((_, child)) = page.array.first() {
            bytes.put_i32_le(*child);
        }
        for (key, child) in page.array.iter().skip(1) {
            key.encode(&mut bytes);
            bytes.put_i32_le(*child);
        }
        bytes
    }

    pub fn decode<K: IndexKey>(
        bytes: &[u8],
    ) -> VellumResult<DecodedData<BPlusTreeInternalPage<K>>> {
        ensure_len(bytes, 9, "internal page header")?;
        let mut buf = bytes;
        let page_type = buf.get_u8();
        if page_type != INTERNAL_PAGE_TYPE {
            return Err(VellumError::Storage(format!(
                "expected internal page, found page type {}",
                page_type
            )));
        }
        let current_size = buf.get_u32_le() as usize;
        let max_size = buf.get_u32_le();

        let mut consumed = 9;
        let mut array = Vec::with_capacity(current_size);
        if current_size > 0 {
            ensure_len(bytes, consumed + 4, "internal page first child")?;
            let first_child = buf.get_i32_le();
            consumed += 4;
            array.push((K::default(), first_child));

            let entry_len = K::ENCODED_LEN + 4;
            ensure_len(
                bytes,
                consumed + (current_size - 1) * entry_len,
                "internal page entries",
            )?;
            for _ in 1..current_size {
                let key = K::decode(&mut buf);
                let child = buf.get_i32_le();
                array.push((key, child));
            }
            consumed += (current_size - 1) * entry_len;
        }
        Ok((BPlusTreeInternalPage { max_size, array }, consumed))
    }
}

pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode<K: IndexKey>(page: &BPlusTreePage<K>) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(leaf) => BPlusTreeLeafPageCodec::encode(leaf),
            BPlusTreePage::Internal(internal) => BPlusTreeInternalPageCodec::encode(internal),
        }
    }

    pub fn decode<K: IndexKey>(bytes: &[u8]) -> VellumResult<DecodedData<BPlusTreePage<K>>> {
        ensure_len(bytes, 1, "tree page type byte")?;
        match bytes[0] {
            LEAF_PAGE_TYPE => {
                let (leaf, consumed) = BPlusTreeLeafPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Leaf(leaf), consumed))
            }
            INTERNAL_PAGE_TYPE => {
                let (internal, consumed) = BPlusTreeInternalPageCodec::decode(bytes)?;
                Ok((BPlusTreePage::Internal(internal), consumed))
            }
            other => Err(VellumError::Storage(format!(
                "unknown tree page type {}",
                other
            ))),
        }
    }

    pub fn page_type<K: IndexKey>(page: &BPlusTreePage<K>) -> BPlusTreePageType {
        match page {
            BPlusTreePage::Leaf(_) => BPlusTreePageType::LeafPage,
            BPlusTreePage::Internal(_) => BPlusTreePageType::InternalPage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::INVALID_PAGE_ID;

    #[test]
    fn leaf_page_round_trip() {
        let mut leaf = BPlusTreeLeafPage::<i64>::new(4);
        leaf.next_page_id = 17;
        leaf.insert(3, RecordId::new(1, 1));
        leaf.insert(9, RecordId::new(2, 5));

        let encoded = BPlusTreeLeafPageCodec::encode(&leaf);
        let (decoded, consumed) = BPlusTreeLeafPageCodec::decode::<i64>(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, leaf);
    }

    #[test]
    fn internal_page_round_trip() {
        let mut internal = BPlusTreeInternalPage::<i64>::new(4);
        internal.array.push((0, 10));
        internal.insert(8, 11);
        internal.insert(16, 12);

        let encoded = BPlusTreeInternalPageCodec::encode(&internal);
        let (decoded, consumed) = BPlusTreeInternalPageCodec::decode::<i64>(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.max_size, internal.max_size);
        assert_eq!(decoded.child_at(0), 10);
        assert_eq!(*decoded.key_at(1), 8);
        assert_eq!(decoded.child_at(2), 12);
    }

    #[test]
    fn header_page_round_trip() {
        let header = BPlusTreeHeaderPage { root_page_id: 42 };
        let encoded = BPlusTreeHeaderPageCodec::encode(&header);
        let (decoded, _) = BPlusTreeHeaderPageCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.root_page_id, 42);

        let empty = BPlusTreeHeaderPage::new();
        let (decoded, _) =
            BPlusTreeHeaderPageCodec::decode(&BPlusTreeHeaderPageCodec::encode(&empty)).unwrap();
        assert_eq!(decoded.root_page_id, INVALID_PAGE_ID);
    }

    #[test]
    fn tagged_dispatch_rejects_garbage() {
        let bytes = [99u8, 0, 0, 0, 0];
        assert!(BPlusTreePageCodec::decode::<i32>(&bytes).is_err());
    }
}
