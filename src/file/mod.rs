//! Variable-length files over the block store.
//!
//! A file is a doubly linked chain of header blocks, each owning up to 32
//! data blocks; the block id of the primary header is the file id. Free
//! space is tracked by superblock bitmaps spaced every
//! `SUPERBLOCK_INTERVAL` blocks. Extended attributes live in a 256-byte
//! inline area of the primary header, overflowing into a singly linked
//! block chain.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use log::{debug, trace};
use lru::LruCache;

use crate::block::{BlockFs, Token, LOGICAL_BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::sys::header::{
    BlockIds, ContinuationHeader, FileHeader, FileType, Header, BLOCK_IDS_PER_HEADER,
    FILE_CONTINUATION_HEADER_DATA_SIZE, FILE_CONTINUATION_HEADER_SIZE, FILE_HEADER_DATA_SIZE,
    FILE_HEADER_INTERVAL, FILE_HEADER_SIZE,
};
use crate::sys::superblock::{Bitmap, SUPERBLOCK_INTERVAL};
use crate::sys::xattr::{
    decode_xattrs, encode_xattrs, pack_xattr_block, unpack_xattr_block, XATTR_BLOCK_DATA_SIZE,
};

mod iter;

pub use iter::{ReadIterator, WriteIterator};
pub use crate::sys::header::XATTR_INLINE_SIZE;

const HEADER_CACHE_SIZE: usize = 1024;
const SUPERBLOCK_CACHE_SIZE: usize = 128;

/// How far around a missed header index the cache is probed before walking
/// the chain from the primary header.
const NEARBY_HEADERS: u64 = 8;

/// Plaintext bytes of file data held by the given logical file block.
pub fn file_data_in_block(block_num: u64) -> usize {
    let header = block_num / FILE_HEADER_INTERVAL;
    let slot = block_num % FILE_HEADER_INTERVAL;
    if slot != 0 {
        LOGICAL_BLOCK_SIZE
    } else if header != 0 {
        FILE_CONTINUATION_HEADER_DATA_SIZE
    } else {
        FILE_HEADER_DATA_SIZE
    }
}

/// Map a byte position in the file's data stream to a logical file block
/// and an offset inside that block's data area.
pub fn block_from_offset(offset: u64) -> (u64, usize) {
    if offset < FILE_HEADER_DATA_SIZE as u64 {
        return (0, offset as usize);
    }
    let offset = offset - FILE_HEADER_DATA_SIZE as u64;
    let stride = (LOGICAL_BLOCK_SIZE * BLOCK_IDS_PER_HEADER + FILE_CONTINUATION_HEADER_DATA_SIZE) as u64;
    let mut header = offset / stride;
    let rest = offset % stride;
    let mut block = rest / LOGICAL_BLOCK_SIZE as u64;
    let intra = (rest % LOGICAL_BLOCK_SIZE as u64) as usize;
    if block == BLOCK_IDS_PER_HEADER as u64 {
        header += 1;
        block = 0;
    } else {
        block += 1;
    }
    (header * FILE_HEADER_INTERVAL + block, intra)
}

struct HeaderSlot {
    block_id: u64,
    header: Header,
    token: Token,
}

/// File-level view of a container: allocation, header chains, data I/O and
/// extended attributes.
pub struct FileFs {
    blockfs: BlockFs,
    header_cache: LruCache<(u64, u64), HeaderSlot>,
    superblock_cache: LruCache<u64, (Bitmap, Token)>,
}

impl FileFs {
    pub fn new(blockfs: BlockFs) -> FileFs {
        FileFs {
            blockfs,
            header_cache: LruCache::new(NonZeroUsize::new(HEADER_CACHE_SIZE).expect("nonzero capacity")),
            superblock_cache: LruCache::new(
                NonZeroUsize::new(SUPERBLOCK_CACHE_SIZE).expect("nonzero capacity"),
            ),
        }
    }

    /// Lay out a fresh container: block 0 becomes superblock 0.
    pub fn initialise(blockfs: BlockFs) -> Result<FileFs> {
        let mut fs = FileFs::new(blockfs);
        let blocks = fs.blockfs.new_blocks(1)?;
        assert_eq!(blocks, [0], "initialise needs an empty container");
        fs.write_new_superblock(0)?;
        Ok(fs)
    }

    pub fn blockfs(&mut self) -> &mut BlockFs {
        &mut self.blockfs
    }

    pub(crate) fn locked<R>(
        &mut self,
        write: bool,
        f: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let lock = self.blockfs.lock_file(write)?;
        let res = f(self);
        let unlocked = self.blockfs.unlock_file(lock);
        let value = res?;
        unlocked?;
        Ok(value)
    }

    // ---- superblocks and allocation ----

    /// The allocation bitmap of the given superblock, materialising the
    /// superblock on demand when it lies past the end of the container.
    pub fn read_superblock(&mut self, superblock_id: u64) -> Result<Bitmap> {
        let block_id = superblock_id * SUPERBLOCK_INTERVAL;
        let cached = self
            .superblock_cache
            .get(&superblock_id)
            .map(|(bitmap, token)| (bitmap.clone(), *token));
        if let Some((bitmap, token)) = cached {
            if !self.blockfs.block_version(block_id, Some(token))?.0 {
                return Ok(bitmap);
            }
        }

        if block_id >= self.blockfs.total_blocks()? {
            let created = self.blockfs.new_blocks(1)?;
            debug_assert_eq!(created, [block_id]);
            self.write_new_superblock(superblock_id)?;
        }
        let (data, token) = self
            .blockfs
            .read_block_with_token(block_id)?
            .ok_or(Error::CorruptBlock(block_id))?;
        let bitmap = Bitmap::from_bytes(data);
        if !bitmap.get(0) {
            return Err(Error::CorruptBlock(block_id));
        }
        self.superblock_cache.put(superblock_id, (bitmap.clone(), token));
        Ok(bitmap)
    }

    pub fn write_superblock(&mut self, superblock_id: u64, bitmap: Bitmap) -> Result<()> {
        let block_id = superblock_id * SUPERBLOCK_INTERVAL;
        let token = self.blockfs.write_block(block_id, 0, bitmap.as_bytes())?;
        self.superblock_cache.put(superblock_id, (bitmap, token));
        Ok(())
    }

    /// An empty bitmap with only bit 0 set, marking the superblock itself.
    pub fn write_new_superblock(&mut self, superblock_id: u64) -> Result<()> {
        let mut bitmap = Bitmap::new();
        bitmap.set(0, true);
        self.write_superblock(superblock_id, bitmap)
    }

    pub fn number_free_blocks(&mut self, superblock_id: u64) -> Result<usize> {
        Ok(self.read_superblock(superblock_id)?.count_zeros())
    }

    /// Claim `number` blocks, first-fit by ascending (superblock, bit), and
    /// grow the container to back any ids past its current end.
    pub fn allocate_blocks(&mut self, number: u64) -> Result<Vec<u64>> {
        if number == 0 {
            return Ok(Vec::new());
        }
        self.locked(true, |fs| fs.allocate_blocks_locked(number))
    }

    fn allocate_blocks_locked(&mut self, mut number: u64) -> Result<Vec<u64>> {
        let mut blocks = Vec::with_capacity(number as usize);
        let mut total = self.blockfs.total_blocks()?;
        let mut pending = 0;
        for superblock_id in 0.. {
            let superblock_block = superblock_id * SUPERBLOCK_INTERVAL;
            if superblock_block >= total + pending {
                // back the ids handed out so far, then the superblock itself
                self.blockfs.new_blocks(pending)?;
                total += pending;
                pending = 0;
                let created = self.blockfs.new_blocks(1)?;
                debug_assert_eq!(created, [superblock_block]);
                total += 1;
                self.write_new_superblock(superblock_id)?;
            }

            let mut bitmap = self.read_superblock(superblock_id)?;
            let mut cursor = 0;
            while number > 0 {
                let Some(bit) = bitmap.next_zero(cursor) else {
                    break;
                };
                bitmap.set(bit, true);
                cursor = bit + 1;
                let block_id = superblock_block + bit as u64;
                if block_id >= total {
                    pending += 1;
                }
                blocks.push(block_id);
                number -= 1;
            }
            self.write_superblock(superblock_id, bitmap)?;
            if number == 0 {
                break;
            }
        }
        self.blockfs.new_blocks(pending)?;
        trace!("allocated {} blocks starting at {}", blocks.len(), blocks[0]);
        Ok(blocks)
    }

    /// Wipe the given blocks and clear their bitmap bits.
    pub fn deallocate_blocks(&mut self, block_ids: &[u64]) -> Result<()> {
        self.locked(true, |fs| {
            let mut touched: BTreeMap<u64, Bitmap> = BTreeMap::new();
            for &block_id in block_ids {
                fs.blockfs.wipe_block(block_id)?;
                let superblock_id = block_id / SUPERBLOCK_INTERVAL;
                let bit = (block_id % SUPERBLOCK_INTERVAL) as usize;
                let bitmap = match touched.entry(superblock_id) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => entry.insert(fs.read_superblock(superblock_id)?),
                };
                bitmap.set(bit, false);
            }
            for (superblock_id, bitmap) in touched {
                fs.write_superblock(superblock_id, bitmap)?;
            }
            trace!("deallocated {} blocks", block_ids.len());
            Ok(())
        })
    }

    // ---- header chains ----

    /// Allocate a file consisting of just its primary header; the header's
    /// block id is the new file id.
    pub fn create_new_file(&mut self, file_type: FileType) -> Result<u64> {
        self.locked(true, |fs| {
            let blocks = fs.allocate_blocks(1)?;
            let file_id = blocks[0];
            let header = Header::Primary(FileHeader::new(file_type));
            fs.store_header(file_id, 0, file_id, &header)?;
            debug!("created {file_type:?} file {file_id}");
            Ok(file_id)
        })
    }

    /// The block id and contents of header `header_num` of the file's
    /// chain. Cached headers are revalidated by token; on a miss, nearby
    /// cached headers short-circuit the walk from the primary header.
    pub fn get_file_header(&mut self, file_id: u64, header_num: u64) -> Result<(u64, Header)> {
        if let Some(hit) = self.cached_header(file_id, header_num)? {
            return Ok(hit);
        }
        self.locked(false, |fs| {
            let (mut at, mut block_id, mut header) = match fs.nearby_cached(file_id, header_num)? {
                Some(found) => found,
                None => (0, file_id, fs.read_file_header(file_id, 0, file_id)?),
            };
            while at < header_num {
                let next = header.next_header();
                if next == 0 {
                    return Err(Error::CorruptBlock(block_id));
                }
                at += 1;
                header = fs.read_file_header(file_id, at, next)?;
                block_id = next;
            }
            while at > header_num {
                let prev = header.prev_header();
                if prev == 0 {
                    return Err(Error::CorruptBlock(block_id));
                }
                at -= 1;
                header = fs.read_file_header(file_id, at, prev)?;
                block_id = prev;
            }
            Ok((block_id, header))
        })
    }

    fn cached_header(&mut self, file_id: u64, header_num: u64) -> Result<Option<(u64, Header)>> {
        let cached = self
            .header_cache
            .get(&(file_id, header_num))
            .map(|slot| (slot.block_id, slot.header.clone(), slot.token));
        if let Some((block_id, header, token)) = cached {
            if !self.blockfs.block_version(block_id, Some(token))?.0 {
                return Ok(Some((block_id, header)));
            }
        }
        Ok(None)
    }

    fn nearby_cached(&mut self, file_id: u64, header_num: u64) -> Result<Option<(u64, u64, Header)>> {
        for offset in 1..=NEARBY_HEADERS {
            if offset <= header_num {
                if let Some((block_id, header)) = self.cached_header(file_id, header_num - offset)? {
                    return Ok(Some((header_num - offset, block_id, header)));
                }
            }
            if let Some((block_id, header)) = self.cached_header(file_id, header_num + offset)? {
                return Ok(Some((header_num + offset, block_id, header)));
            }
        }
        Ok(None)
    }

    fn read_file_header(&mut self, file_id: u64, header_num: u64, block_id: u64) -> Result<Header> {
        let block_id = if header_num == 0 { file_id } else { block_id };
        let (data, token) = self
            .blockfs
            .read_block_with_token(block_id)?
            .ok_or(Error::CorruptBlock(block_id))?;
        let header = if header_num == 0 {
            Header::Primary(FileHeader::unpack(&data).ok_or(Error::CorruptBlock(block_id))?)
        } else {
            Header::Continuation(ContinuationHeader::unpack(&data))
        };
        self.header_cache.put(
            (file_id, header_num),
            HeaderSlot {
                block_id,
                header: header.clone(),
                token,
            },
        );
        Ok(header)
    }

    /// The index, block id and contents of the terminal header, starting
    /// from the highest still-valid cached header of the file.
    pub fn get_last_file_header(&mut self, file_id: u64) -> Result<(u64, u64, Header)> {
        let mut cached: Vec<u64> = self
            .header_cache
            .iter()
            .filter(|((fid, _), _)| *fid == file_id)
            .map(|((_, num), _)| *num)
            .collect();
        cached.sort_unstable_by(|a, b| b.cmp(a));

        let mut start = 0;
        for num in cached {
            if self.cached_header(file_id, num)?.is_some() {
                start = num;
                break;
            }
        }

        self.locked(false, |fs| {
            let (mut block_id, mut header) = fs.get_file_header(file_id, start)?;
            let mut at = start;
            while header.next_header() != 0 {
                at += 1;
                let (next_id, next) = fs.get_file_header(file_id, at)?;
                block_id = next_id;
                header = next;
            }
            Ok((at, block_id, header))
        })
    }

    /// Pack and write a header, updating the cache entry with the token the
    /// write produced.
    pub fn write_file_header(&mut self, file_id: u64, header_num: u64, header: &Header) -> Result<()> {
        self.locked(true, |fs| {
            let (block_id, _) = fs.get_file_header(file_id, header_num)?;
            fs.store_header(file_id, header_num, block_id, header)
        })
    }

    fn store_header(
        &mut self,
        file_id: u64,
        header_num: u64,
        block_id: u64,
        header: &Header,
    ) -> Result<()> {
        debug_assert_eq!(header_num == 0, matches!(header, Header::Primary(_)));
        let token = self.blockfs.write_block(block_id, 0, &header.pack())?;
        self.header_cache.put(
            (file_id, header_num),
            HeaderSlot {
                block_id,
                header: header.clone(),
                token,
            },
        );
        Ok(())
    }

    fn evict_headers(&mut self, file_id: u64, from: u64) {
        let stale: Vec<(u64, u64)> = self
            .header_cache
            .iter()
            .map(|(key, _)| *key)
            .filter(|(fid, num)| *fid == file_id && *num >= from)
            .collect();
        for key in stale {
            self.header_cache.pop(&key);
        }
    }

    pub fn num_file_blocks(&mut self, file_id: u64) -> Result<u64> {
        let (last_header, _, header) = self.get_last_file_header(file_id)?;
        Ok(last_header * FILE_HEADER_INTERVAL + header.block_ids().len() as u64 + 1)
    }

    /// Grow the file's chain to `block_num` logical blocks, appending data
    /// blocks into the last header and chaining new continuation headers as
    /// they fill. All allocator output is consumed in order.
    pub fn extend_file_blocks(&mut self, file_id: u64, block_num: u64) -> Result<()> {
        self.locked(true, |fs| {
            let (mut header_num, mut block_id, mut header) = fs.get_last_file_header(file_id)?;
            let have = header_num * FILE_HEADER_INTERVAL + header.block_ids().len() as u64 + 1;
            if block_num <= have {
                return Ok(());
            }
            let new_blocks = fs.allocate_blocks(block_num - have)?;

            let mut consumed = 0;
            loop {
                let ids = header.block_ids_mut();
                let take = (BLOCK_IDS_PER_HEADER - ids.len()).min(new_blocks.len() - consumed);
                for &id in &new_blocks[consumed..consumed + take] {
                    ids.push(id);
                }
                consumed += take;

                let next_id = if consumed < new_blocks.len() {
                    let id = new_blocks[consumed];
                    consumed += 1;
                    id
                } else {
                    0
                };
                header.set_next_header(next_id);
                fs.store_header(file_id, header_num, block_id, &header)?;

                if next_id == 0 {
                    break;
                }
                header = Header::Continuation(ContinuationHeader {
                    next_header: 0,
                    prev_header: block_id,
                    block_ids: BlockIds::new(),
                });
                block_id = next_id;
                header_num += 1;
            }
            Ok(())
        })
    }

    /// Shrink the file's chain to `block_num` logical blocks, deallocating
    /// everything past the cut in one batch.
    pub fn truncate_file_blocks(&mut self, file_id: u64, block_num: u64) -> Result<()> {
        assert!(block_num >= 1, "a file keeps at least its primary header");
        let mut last_header = block_num / FILE_HEADER_INTERVAL;
        let mut keep = block_num % FILE_HEADER_INTERVAL;
        if keep != 0 {
            keep -= 1;
        } else {
            last_header -= 1;
            keep = BLOCK_IDS_PER_HEADER as u64;
        }

        self.locked(true, |fs| {
            let (block_id, mut header) = fs.get_file_header(file_id, last_header)?;
            let keep = (keep as usize).min(header.block_ids().len());
            let mut to_free = header.block_ids()[keep..].to_vec();

            let mut next = header.next_header();
            while next != 0 {
                let data = fs.blockfs.read_block(next)?.ok_or(Error::CorruptBlock(next))?;
                let cont = ContinuationHeader::unpack(&data);
                to_free.push(next);
                to_free.extend_from_slice(&cont.block_ids);
                next = cont.next_header;
            }

            header.block_ids_mut().truncate(keep);
            header.set_next_header(0);
            fs.store_header(file_id, last_header, block_id, &header)?;
            fs.evict_headers(file_id, last_header + 1);
            fs.deallocate_blocks(&to_free)?;
            Ok(())
        })
    }

    /// Truncate to `size` bytes: drop blocks past the cut and store the new
    /// size in the primary header.
    pub fn truncate_file_size(&mut self, file_id: u64, size: u64) -> Result<()> {
        let (last_block, _) = block_from_offset(size);
        self.locked(true, |fs| {
            fs.truncate_file_blocks(file_id, last_block + 1)?;
            let (_, mut header) = fs.get_file_header(file_id, 0)?;
            let primary = header.as_primary_mut().ok_or(Error::CorruptBlock(file_id))?;
            primary.size = size;
            fs.write_file_header(file_id, 0, &header)?;
            Ok(())
        })
    }

    /// Walk the whole chain and deallocate every header and data block.
    pub fn delete_file(&mut self, file_id: u64) -> Result<()> {
        self.locked(true, |fs| {
            let (block_id, header) = fs.get_file_header(file_id, 0)?;
            let mut to_free = vec![block_id];
            to_free.extend_from_slice(header.block_ids());

            let mut next = header.next_header();
            while next != 0 {
                let data = fs.blockfs.read_block(next)?.ok_or(Error::CorruptBlock(next))?;
                let cont = ContinuationHeader::unpack(&data);
                to_free.push(next);
                to_free.extend_from_slice(&cont.block_ids);
                next = cont.next_header;
            }

            fs.evict_headers(file_id, 0);
            fs.deallocate_blocks(&to_free)?;
            debug!("deleted file {file_id} ({} blocks)", to_free.len());
            Ok(())
        })
    }

    pub(crate) fn primary_header(&mut self, file_id: u64) -> Result<FileHeader> {
        let (_, header) = self.get_file_header(file_id, 0)?;
        match header {
            Header::Primary(header) => Ok(header),
            Header::Continuation(_) => Err(Error::CorruptBlock(file_id)),
        }
    }

    // ---- file data ----

    /// The data bytes held by one logical file block: the inline area of a
    /// header block or the whole plaintext of a data block. `None` for a
    /// data block that was never written.
    pub fn read_file_data(&mut self, file_id: u64, block_num: u64) -> Result<Option<Vec<u8>>> {
        let header_num = block_num / FILE_HEADER_INTERVAL;
        let slot = block_num % FILE_HEADER_INTERVAL;
        self.locked(false, |fs| {
            let (header_block_id, header) = fs.get_file_header(file_id, header_num)?;
            if slot != 0 {
                let data_id = header
                    .block_ids()
                    .get(slot as usize - 1)
                    .copied()
                    .ok_or(Error::CorruptBlock(header_block_id))?;
                fs.blockfs.read_block(data_id)
            } else {
                let data = fs
                    .blockfs
                    .read_block(header_block_id)?
                    .ok_or(Error::CorruptBlock(header_block_id))?;
                let skip = if header_num != 0 {
                    FILE_CONTINUATION_HEADER_SIZE
                } else {
                    FILE_HEADER_SIZE
                };
                Ok(Some(data[skip..].to_vec()))
            }
        })
    }

    /// Write into the data area of one logical file block. Writing to a
    /// header block leaves the header prefix untouched, so only the cached
    /// token needs refreshing.
    pub fn write_file_data(
        &mut self,
        file_id: u64,
        block_num: u64,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        let header_num = block_num / FILE_HEADER_INTERVAL;
        let slot = block_num % FILE_HEADER_INTERVAL;
        self.locked(true, |fs| {
            let (header_block_id, header) = fs.get_file_header(file_id, header_num)?;
            if slot != 0 {
                let data_id = header
                    .block_ids()
                    .get(slot as usize - 1)
                    .copied()
                    .ok_or(Error::CorruptBlock(header_block_id))?;
                fs.blockfs.write_block(data_id, offset, data)?;
            } else {
                let skip = if header_num != 0 {
                    FILE_CONTINUATION_HEADER_SIZE
                } else {
                    FILE_HEADER_SIZE
                };
                let token = fs.blockfs.write_block(header_block_id, skip + offset, data)?;
                if let Some(entry) = fs.header_cache.get_mut(&(file_id, header_num)) {
                    entry.token = token;
                }
            }
            Ok(())
        })
    }

    pub fn reader(&mut self, file_id: u64, start: u64) -> ReadIterator<'_> {
        ReadIterator::new(self, file_id, start)
    }

    pub fn writer(&mut self, file_id: u64, start: u64) -> WriteIterator<'_> {
        WriteIterator::new(self, file_id, start)
    }

    /// Read `length` bytes starting at `offset`, or everything up to the
    /// file size with `None`. Reads past the end are truncated.
    pub fn read(&mut self, file_id: u64, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        self.reader(file_id, offset).read(length)
    }

    /// Write `data` at `offset`, extending the chain and raising the stored
    /// size as needed.
    pub fn write(&mut self, file_id: u64, offset: u64, data: &[u8]) -> Result<()> {
        let mut writer = self.writer(file_id, offset);
        writer.write(data)?;
        writer.flush()
    }

    // ---- extended attributes ----

    /// All attributes of the file in blob order.
    pub fn read_xattrs(&mut self, file_id: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.locked(false, |fs| {
            let header = fs.primary_header(file_id)?;
            let mut blob = header.xattr_inline.to_vec();
            let mut next = header.xattr_block;
            while next != 0 {
                let raw = fs.blockfs.read_block(next)?.ok_or(Error::CorruptBlock(next))?;
                let (next_block, payload) = unpack_xattr_block(&raw);
                blob.extend_from_slice(payload);
                next = next_block;
            }
            Ok(decode_xattrs(&blob))
        })
    }

    pub fn lookup_xattr(&mut self, file_id: u64, key: &[u8]) -> Result<Vec<u8>> {
        self.read_xattrs(file_id)?
            .into_iter()
            .find(|(name, _)| name.as_slice() == key)
            .map(|(_, value)| value)
            .ok_or(Error::XattrNotFound)
    }

    pub fn set_xattr(
        &mut self,
        file_id: u64,
        key: &[u8],
        value: &[u8],
        create_only: bool,
        replace_only: bool,
    ) -> Result<()> {
        self.locked(true, |fs| {
            let mut attrs = fs.read_xattrs(file_id)?;
            match attrs.iter().position(|(name, _)| name.as_slice() == key) {
                Some(_) if create_only => return Err(Error::XattrExists),
                Some(at) => attrs[at].1 = value.to_vec(),
                None if replace_only => return Err(Error::XattrNotFound),
                None => attrs.push((key.to_vec(), value.to_vec())),
            }
            fs.write_xattrs(file_id, &attrs)
        })
    }

    pub fn delete_xattr(&mut self, file_id: u64, key: &[u8]) -> Result<()> {
        self.locked(true, |fs| {
            let mut attrs = fs.read_xattrs(file_id)?;
            let at = attrs
                .iter()
                .position(|(name, _)| name.as_slice() == key)
                .ok_or(Error::XattrNotFound)?;
            attrs.remove(at);
            fs.write_xattrs(file_id, &attrs)
        })
    }

    /// Store the full attribute set: the blob's head goes into the primary
    /// header's inline area, the tail into overflow blocks. Existing
    /// overflow blocks are reused; shortfall is allocated and surplus
    /// deallocated.
    pub fn write_xattrs(&mut self, file_id: u64, attrs: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let blob = encode_xattrs(attrs);
        let split = blob.len().min(XATTR_INLINE_SIZE);
        let (inline, tail) = blob.split_at(split);

        self.locked(true, |fs| {
            let (_, mut header) = fs.get_file_header(file_id, 0)?;
            let mut chain = Vec::new();
            let mut next = header.as_primary().ok_or(Error::CorruptBlock(file_id))?.xattr_block;
            while next != 0 {
                chain.push(next);
                let raw = fs.blockfs.read_block(next)?.ok_or(Error::CorruptBlock(next))?;
                next = unpack_xattr_block(&raw).0;
            }

            let chunks: Vec<&[u8]> = tail.chunks(XATTR_BLOCK_DATA_SIZE).collect();
            if chain.len() < chunks.len() {
                let extra = fs.allocate_blocks((chunks.len() - chain.len()) as u64)?;
                chain.extend(extra);
            } else if chunks.len() < chain.len() {
                let surplus = chain.split_off(chunks.len());
                fs.deallocate_blocks(&surplus)?;
            }

            for (at, chunk) in chunks.iter().enumerate() {
                let next_block = if at + 1 < chain.len() { chain[at + 1] } else { 0 };
                fs.blockfs
                    .write_block(chain[at], 0, &pack_xattr_block(next_block, chunk))?;
            }

            let primary = header.as_primary_mut().ok_or(Error::CorruptBlock(file_id))?;
            primary.xattr_inline = [0; XATTR_INLINE_SIZE];
            primary.xattr_inline[..inline.len()].copy_from_slice(inline);
            primary.xattr_block = chain.first().copied().unwrap_or(0);
            fs.write_file_header(file_id, 0, &header)?;
            Ok(())
        })
    }
}
