use crate::block::{BLOCK_ID_SIZE, LOGICAL_BLOCK_SIZE};

pub const XATTR_BLOCK_HEADER_SIZE: usize = BLOCK_ID_SIZE;

/// Payload bytes per xattr overflow block.
pub const XATTR_BLOCK_DATA_SIZE: usize = LOGICAL_BLOCK_SIZE - XATTR_BLOCK_HEADER_SIZE;

/// The xattr blob is `name NUL value NUL name NUL value …` with the final
/// separator omitted; trailing NULs from block padding are not significant.
pub fn encode_xattrs(attrs: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut blob = Vec::new();
    for (i, (name, value)) in attrs.iter().enumerate() {
        if i > 0 {
            blob.push(0);
        }
        blob.extend_from_slice(name);
        blob.push(0);
        blob.extend_from_slice(value);
    }
    blob
}

pub fn decode_xattrs(blob: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    let end = blob.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let trimmed = &blob[..end];
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut parts = trimmed.split(|&b| b == 0);
    let mut attrs = Vec::new();
    while let Some(name) = parts.next() {
        let value = parts.next().unwrap_or(&[]);
        attrs.push((name.to_vec(), value.to_vec()));
    }
    attrs
}

/// An overflow block is `next_block(8), payload`, zero padded to the full
/// logical block so it always takes the direct write path.
pub fn pack_xattr_block(next_block: u64, data: &[u8]) -> Vec<u8> {
    assert!(data.len() <= XATTR_BLOCK_DATA_SIZE);
    let mut out = vec![0; LOGICAL_BLOCK_SIZE];
    out[..BLOCK_ID_SIZE].copy_from_slice(&next_block.to_le_bytes());
    out[BLOCK_ID_SIZE..BLOCK_ID_SIZE + data.len()].copy_from_slice(data);
    out
}

pub fn unpack_xattr_block(data: &[u8]) -> (u64, &[u8]) {
    let mut next = [0; BLOCK_ID_SIZE];
    next.copy_from_slice(&data[..BLOCK_ID_SIZE]);
    (u64::from_le_bytes(next), &data[BLOCK_ID_SIZE..])
}
