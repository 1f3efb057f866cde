mod index_page;
mod table_page;

pub use index_page::{
    BPlusTreeHeaderPageCodec, BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec,
    BPlusTreePageCodec, RecordIdCodec,
};
pub use table_page::TablePageCodec;

// decoded value + consumed byte count
pub type DecodedData<T> = (T, usize);
