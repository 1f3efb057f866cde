use bytes::{Buf, BufMut};

use crate::buffer::PAGE_SIZE;
use crate::error::{VellumError, VellumResult};
use crate::storage::codec::DecodedData;
use crate::storage::page::table_page::{TABLE_PAGE_HEADER_BASE, TUPLE_INFO_SIZE};
use crate::storage::page::{TablePage, TablePageHeader, TupleInfo, TupleMeta};

pub struct TablePageCodec;

impl TablePageCodec {
    /// The header is serialised over the page prefix; tuple bytes already
    /// live at their recorded offsets in `page.data`.
    pub fn encode(page: &TablePage) -> Vec<u8> {
        let mut image = page.data.to_vec();
        let mut header = Vec::with_capacity(
            TABLE_PAGE_HEADER_BASE + page.header.tuple_infos.len() * TUPLE_INFO_SIZE,
        );
        header.put_i32_le(page.header.next_page_id);
        header.put_u16_le(page.header.num_tuples);
        header.put_u16_le(page.header.num_deleted_tuples);
        for info in &page.header.tuple_infos {
            header.put_u16_le(info.offset);
            header.put_u16_le(info.size);
            header.put_i64_le(info.meta.insert_txn_id);
            header.put_i64_le(info.meta.delete_txn_id);
            header.put_u8(info.meta.is_deleted as u8);
        }
        image[..header.len()].copy_from_slice(&header);
        image
    }

    pub fn decode(bytes: &[u8]) -> VellumResult<DecodedData<TablePage>> {
        if bytes.len() < TABLE_PAGE_HEADER_BASE {
            return Err(VellumError::Storage(format!(
                "truncated table page: {} bytes",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let next_page_id = buf.get_i32_le();
        let num_tuples = buf.get_u16_le();
        let num_deleted_tuples = buf.get_u16_le();

        let header_len = TABLE_PAGE_HEADER_BASE + num_tuples as usize * TUPLE_INFO_SIZE;
        if bytes.len() < header_len {
            return Err(VellumError::Storage(format!(
                "truncated table page header: have {} bytes, need {}",
                bytes.len(),
                header_len
            )));
        }
        let mut tuple_infos = Vec::with_capacity(num_tuples as usize);
        for _ in 0..num_tuples {
            let offset = buf.get_u16_le();
            let size = buf.get_u16_le();
            let insert_txn_id = buf.get_i64_le();
            let delete_txn_id = buf.get_i64_le();
            let is_deleted = buf.get_u8() != 0;
            tuple_infos.push(TupleInfo {
                offset,
                size,
                meta: TupleMeta {
                    insert_txn_id,
                    delete_txn_id,
                    is_deleted,
                },
            });
        }

        let mut data = [0u8; PAGE_SIZE];
        let len = bytes.len().min(PAGE_SIZE);
        data[..len].copy_from_slice(&bytes[..len]);

        Ok((
            TablePage {
                header: TablePageHeader {
                    next_page_id,
                    num_tuples,
                    num_deleted_tuples,
                    tuple_infos,
                },
                data,
            },
            PAGE_SIZE.min(bytes.len()),
        ))
    }
}
