use crate::buffer::PAGE_SIZE;

/// Pad an encoded page image out to a full page.
pub fn page_bytes_to_array(bytes: &[u8]) -> [u8; PAGE_SIZE] {
    debug_assert!(bytes.len() <= PAGE_SIZE);
    let mut data = [0u8; PAGE_SIZE];
    data[..bytes.len()].copy_from_slice(bytes);
    data
}
