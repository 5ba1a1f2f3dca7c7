use core::fmt::{self, Debug};
use core::ops::Deref;

use crate::block::{BLOCK_ID_SIZE, LOGICAL_BLOCK_SIZE};

/// Number of data-block ids each header owns.
pub const BLOCK_IDS_PER_HEADER: usize = 32;

/// One header plus the data blocks it owns, in logical file-block numbering.
pub const FILE_HEADER_INTERVAL: u64 = BLOCK_IDS_PER_HEADER as u64 + 1;

/// Bytes of the xattr blob stored inside the primary header.
pub const XATTR_INLINE_SIZE: usize = 256;

/// Packed size of the primary header prefix; the rest of the logical block
/// is inline file data.
pub const FILE_HEADER_SIZE: usize =
    1 + 8 + (BLOCK_IDS_PER_HEADER + 2) * BLOCK_ID_SIZE + XATTR_INLINE_SIZE;

pub const FILE_HEADER_DATA_SIZE: usize = LOGICAL_BLOCK_SIZE - FILE_HEADER_SIZE;

/// Packed size of a continuation header prefix.
pub const FILE_CONTINUATION_HEADER_SIZE: usize = (BLOCK_IDS_PER_HEADER + 2) * BLOCK_ID_SIZE;

pub const FILE_CONTINUATION_HEADER_DATA_SIZE: usize =
    LOGICAL_BLOCK_SIZE - FILE_CONTINUATION_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Regular = 0,
    Directory = 1,
}

impl FileType {
    pub fn from_raw(raw: u8) -> Option<FileType> {
        match raw {
            0 => Some(FileType::Regular),
            1 => Some(FileType::Directory),
            _ => None,
        }
    }
}

/// The block ids owned by one header.
///
/// Fixed-width on disk: trailing zeroed slots are vacancies, the first zero
/// terminates the list (0 is never a valid data block, it is superblock 0).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockIds {
    ids: [u64; BLOCK_IDS_PER_HEADER],
    len: usize,
}

impl BlockIds {
    pub fn new() -> BlockIds {
        BlockIds {
            ids: [0; BLOCK_IDS_PER_HEADER],
            len: 0,
        }
    }

    pub fn from_slice(ids: &[u64]) -> BlockIds {
        assert!(ids.len() <= BLOCK_IDS_PER_HEADER);
        let mut this = BlockIds::new();
        for &id in ids {
            this.push(id);
        }
        this
    }

    pub fn push(&mut self, id: u64) {
        assert!(self.len < BLOCK_IDS_PER_HEADER, "header is full");
        self.ids[self.len] = id;
        self.len += 1;
    }

    pub fn truncate(&mut self, len: usize) {
        while self.len > len {
            self.len -= 1;
            self.ids[self.len] = 0;
        }
    }

    pub fn is_full(&self) -> bool {
        self.len == BLOCK_IDS_PER_HEADER
    }

    fn unpack(data: &[u8]) -> BlockIds {
        let mut ids = [0; BLOCK_IDS_PER_HEADER];
        let mut len = BLOCK_IDS_PER_HEADER;
        for (slot, id) in ids.iter_mut().enumerate() {
            *id = read_u64(data, slot * BLOCK_ID_SIZE);
            if *id == 0 && len == BLOCK_IDS_PER_HEADER {
                len = slot;
            }
        }
        // anything past the terminator is vacant, whatever the bytes said
        for id in ids[len..].iter_mut() {
            *id = 0;
        }
        BlockIds { ids, len }
    }

    fn pack_into(&self, out: &mut [u8]) {
        for (slot, &id) in self.ids.iter().enumerate() {
            write_u64(out, slot * BLOCK_ID_SIZE, id);
        }
    }
}

impl Default for BlockIds {
    fn default() -> BlockIds {
        BlockIds::new()
    }
}

impl Deref for BlockIds {
    type Target = [u64];

    fn deref(&self) -> &[u64] {
        &self.ids[..self.len]
    }
}

impl Debug for BlockIds {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// The primary header of a file; its block id is the file id.
///
/// Packed little-endian as `file_type(1), size(8), next_header(8),
/// block_ids(32 x 8), xattr_block(8), xattr_inline(256)`. The remaining
/// bytes of the logical block hold inline file data.
#[derive(Clone, PartialEq)]
pub struct FileHeader {
    pub file_type: FileType,
    /// Logical byte size of the file's data stream.
    pub size: u64,
    /// Block id of the first continuation header, or 0.
    pub next_header: u64,
    pub block_ids: BlockIds,
    /// First overflow block of the xattr blob, or 0.
    pub xattr_block: u64,
    /// First `XATTR_INLINE_SIZE` bytes of the xattr blob.
    pub xattr_inline: [u8; XATTR_INLINE_SIZE],
}

impl FileHeader {
    pub fn new(file_type: FileType) -> FileHeader {
        FileHeader {
            file_type,
            size: 0,
            next_header: 0,
            block_ids: BlockIds::new(),
            xattr_block: 0,
            xattr_inline: [0; XATTR_INLINE_SIZE],
        }
    }

    pub fn pack(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0; FILE_HEADER_SIZE];
        out[0] = self.file_type as u8;
        write_u64(&mut out, 1, self.size);
        write_u64(&mut out, 9, self.next_header);
        self.block_ids.pack_into(&mut out[17..]);
        let at = 17 + BLOCK_IDS_PER_HEADER * BLOCK_ID_SIZE;
        write_u64(&mut out, at, self.xattr_block);
        out[at + 8..].copy_from_slice(&self.xattr_inline);
        out
    }

    /// `None` if the type byte is not a known file type.
    pub fn unpack(data: &[u8]) -> Option<FileHeader> {
        let file_type = FileType::from_raw(data[0])?;
        let at = 17 + BLOCK_IDS_PER_HEADER * BLOCK_ID_SIZE;
        let mut xattr_inline = [0; XATTR_INLINE_SIZE];
        xattr_inline.copy_from_slice(&data[at + 8..at + 8 + XATTR_INLINE_SIZE]);
        Some(FileHeader {
            file_type,
            size: read_u64(data, 1),
            next_header: read_u64(data, 9),
            block_ids: BlockIds::unpack(&data[17..]),
            xattr_block: read_u64(data, at),
            xattr_inline,
        })
    }
}

impl Debug for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileHeader")
            .field("file_type", &self.file_type)
            .field("size", &self.size)
            .field("next_header", &self.next_header)
            .field("block_ids", &self.block_ids)
            .field("xattr_block", &self.xattr_block)
            .finish()
    }
}

/// A continuation header; packed as `next_header(8), prev_header(8),
/// block_ids(32 x 8)` followed by inline file data.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationHeader {
    pub next_header: u64,
    pub prev_header: u64,
    pub block_ids: BlockIds,
}

impl ContinuationHeader {
    pub fn pack(&self) -> [u8; FILE_CONTINUATION_HEADER_SIZE] {
        let mut out = [0; FILE_CONTINUATION_HEADER_SIZE];
        write_u64(&mut out, 0, self.next_header);
        write_u64(&mut out, 8, self.prev_header);
        self.block_ids.pack_into(&mut out[16..]);
        out
    }

    pub fn unpack(data: &[u8]) -> ContinuationHeader {
        ContinuationHeader {
            next_header: read_u64(data, 0),
            prev_header: read_u64(data, 8),
            block_ids: BlockIds::unpack(&data[16..]),
        }
    }
}

/// Either node of a file's header chain, as read from disk.
#[derive(Debug, Clone, PartialEq)]
pub enum Header {
    Primary(FileHeader),
    Continuation(ContinuationHeader),
}

impl Header {
    pub fn next_header(&self) -> u64 {
        match self {
            Header::Primary(h) => h.next_header,
            Header::Continuation(h) => h.next_header,
        }
    }

    pub fn set_next_header(&mut self, id: u64) {
        match self {
            Header::Primary(h) => h.next_header = id,
            Header::Continuation(h) => h.next_header = id,
        }
    }

    /// 0 for the primary header, which has no predecessor.
    pub fn prev_header(&self) -> u64 {
        match self {
            Header::Primary(_) => 0,
            Header::Continuation(h) => h.prev_header,
        }
    }

    pub fn block_ids(&self) -> &BlockIds {
        match self {
            Header::Primary(h) => &h.block_ids,
            Header::Continuation(h) => &h.block_ids,
        }
    }

    pub fn block_ids_mut(&mut self) -> &mut BlockIds {
        match self {
            Header::Primary(h) => &mut h.block_ids,
            Header::Continuation(h) => &mut h.block_ids,
        }
    }

    pub fn as_primary(&self) -> Option<&FileHeader> {
        match self {
            Header::Primary(h) => Some(h),
            Header::Continuation(_) => None,
        }
    }

    pub fn as_primary_mut(&mut self) -> Option<&mut FileHeader> {
        match self {
            Header::Primary(h) => Some(h),
            Header::Continuation(_) => None,
        }
    }

    pub fn pack(&self) -> Vec<u8> {
        match self {
            Header::Primary(h) => h.pack().to_vec(),
            Header::Continuation(h) => h.pack().to_vec(),
        }
    }
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

fn write_u64(data: &mut [u8], at: usize, value: u64) {
    data[at..at + 8].copy_from_slice(&value.to_le_bytes());
}
