mod bplus_tree;
mod tree_iterator;

pub use bplus_tree::BPlusTree;
pub use tree_iterator::TreeIndexIterator;

use bytes::{Buf, BufMut};

use crate::error::VellumResult;
use crate::storage::page::RecordId;

/// Index key: a totally ordered value with a fixed-width little-endian
/// serialisation, so page layouts stay packed and offsets computable.
pub trait IndexKey: Ord + Copy + Default + std::fmt::Debug + Send + Sync + 'static {
    const ENCODED_LEN: usize;

    fn encode(&self, buf: &mut impl BufMut);

    fn decode(buf: &mut impl Buf) -> Self;

    fn encode_to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::ENCODED_LEN);
        self.encode(&mut bytes);
        bytes
    }

    fn decode_from_slice(bytes: &[u8]) -> VellumResult<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return Err(crate::error::VellumError::Storage(format!(
                "truncated index key: have {} bytes, need {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        let mut buf = bytes;
        Ok(Self::decode(&mut buf))
    }
}

macro_rules! impl_index_key_for_int {
    ($ty:ty, $put:ident, $get:ident) => {
        impl IndexKey for $ty {
            const ENCODED_LEN: usize = std::mem::size_of::<$ty>();

            fn encode(&self, buf: &mut impl BufMut) {
                buf.$put(*self);
            }

            fn decode(buf: &mut impl Buf) -> Self {
                buf.$get()
            }
        }
    };
}

impl_index_key_for_int!(i32, put_i32_le, get_i32_le);
impl_index_key_for_int!(i64, put_i64_le, get_i64_le);
impl_index_key_for_int!(u32, put_u32_le, get_u32_le);
impl_index_key_for_int!(u64, put_u64_le, get_u64_le);

/// Type-erased undo surface consumed by the transaction manager: a
/// transaction's index write set records encoded keys, so inverting an entry
/// does not need the index's key type.
pub trait IndexUndo: Send + Sync + std::fmt::Debug {
    /// Invert a recorded insertion: remove the entry again.
    fn undo_insert(&self, key: &[u8], rid: RecordId) -> VellumResult<()>;

    /// Invert a recorded deletion: put the entry back.
    fn undo_delete(&self, key: &[u8], rid: RecordId) -> VellumResult<()>;
}
