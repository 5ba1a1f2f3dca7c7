//! The encrypted block store.
//!
//! A container file is an opaque offset area owned by the caller followed by
//! physical blocks of `IV(16), AES-256-GCM ciphertext(4064), tag(16)`.
//! An all-zero IV marks a block as uninitialised; reads of such a block
//! return `None` rather than plaintext.
//!
//! The IV doubles as the block's *token*: a fresh one is sampled for every
//! write, so two reads observing the same token are guaranteed to have seen
//! the same plaintext. Tokens drive the plaintext cache and, inside one lock
//! acquisition, the locked-tokens set that lets repeat accesses skip even
//! the 16-byte IV probe.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;

use aes::Aes256;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{AesGcm, Key, Nonce};
use fs2::FileExt;
use log::{debug, warn};
use lru::LruCache;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const TAG_SIZE: usize = 16;

pub const PHYSICAL_BLOCK_SIZE: usize = 4096;

/// Plaintext capacity of one block.
pub const LOGICAL_BLOCK_SIZE: usize = PHYSICAL_BLOCK_SIZE - IV_SIZE - TAG_SIZE;

/// Bytes of a block id on the wire.
pub const BLOCK_ID_SIZE: usize = 8;

/// The IV stored for a block, doubling as its content version.
pub type Token = [u8; IV_SIZE];

pub const UNINITIALISED_IV: Token = [0; IV_SIZE];

const BLOCK_CACHE_SIZE: usize = 2048;

type Cipher = AesGcm<Aes256, U16>;

/// Proof of a `lock_file` acquisition, to be returned to `unlock_file`.
/// Nested acquisitions hand out non-owning locks; only the outermost one
/// releases the flock.
#[must_use]
pub struct FileLock {
    owner: bool,
}

/// Block-addressable authenticated-encrypted store over a single host file.
pub struct BlockFs {
    file: File,
    cipher: Cipher,
    offset: u64,
    cache: LruCache<u64, (Option<Vec<u8>>, Token)>,
    unflushed: BTreeMap<u64, (Vec<u8>, Token)>,
    locked_tokens: HashSet<Token>,
    locked: bool,
    locked_write: bool,
    block_reads: u64,
    block_writes: u64,
}

impl std::fmt::Debug for BlockFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockFs")
            .field("offset", &self.offset)
            .field("locked", &self.locked)
            .field("locked_write", &self.locked_write)
            .field("block_reads", &self.block_reads)
            .field("block_writes", &self.block_writes)
            .finish()
    }
}

impl BlockFs {
    /// Open an existing container. The file length past `offset` must be a
    /// whole number of physical blocks.
    pub fn open(path: impl AsRef<Path>, key: &[u8; KEY_SIZE], offset: u64) -> Result<BlockFs> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < offset || (len - offset) % PHYSICAL_BLOCK_SIZE as u64 != 0 {
            return Err(Error::BadContainerSize(len));
        }
        debug!(
            "opened container {} with {} blocks",
            path.display(),
            (len - offset) / PHYSICAL_BLOCK_SIZE as u64
        );
        Ok(BlockFs {
            file,
            cipher: Cipher::new(Key::<Cipher>::from_slice(key)),
            offset,
            cache: LruCache::new(NonZeroUsize::new(BLOCK_CACHE_SIZE).expect("nonzero capacity")),
            unflushed: BTreeMap::new(),
            locked_tokens: HashSet::new(),
            locked: false,
            locked_write: false,
            block_reads: 0,
            block_writes: 0,
        })
    }

    /// Create a new container holding only the `offset` area, then open it.
    /// Fails if the file already exists.
    pub fn initialise(path: impl AsRef<Path>, key: &[u8; KEY_SIZE], offset: u64) -> Result<BlockFs> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(&vec![0; offset as usize])?;
        file.sync_all()?;
        drop(file);
        debug!("initialised container {}", path.display());
        Self::open(path, key, offset)
    }

    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Decrypting reads performed so far.
    pub fn block_reads(&self) -> u64 {
        self.block_reads
    }

    /// Encrypting writes performed so far.
    pub fn block_writes(&self) -> u64 {
        self.block_writes
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    /// Take the container's advisory lock, shared for reads or exclusive
    /// for writes. Reentrant: anything nests inside an exclusive lock and
    /// shared nests inside shared, but a shared→exclusive upgrade is
    /// refused with `WrongLockMode`.
    pub fn lock_file(&mut self, write: bool) -> Result<FileLock> {
        if self.locked_write || (!write && self.locked) {
            return Ok(FileLock { owner: false });
        }
        if self.locked {
            return Err(Error::WrongLockMode);
        }
        if write {
            self.file.lock_exclusive()?;
        } else {
            self.file.lock_shared()?;
        }
        self.locked = true;
        self.locked_write = write;
        Ok(FileLock { owner: true })
    }

    /// Release a lock taken with `lock_file`. Releasing an exclusive lock
    /// flushes buffered writes and syncs the file, so everything written
    /// under the lock reaches the disk as one batch.
    pub fn unlock_file(&mut self, lock: FileLock) -> Result<()> {
        if !lock.owner {
            return Ok(());
        }
        let flushed = if self.locked_write {
            self.flush_writes(None)
                .and_then(|()| self.file.sync_all().map_err(Error::from))
        } else {
            Ok(())
        };
        self.file.unlock()?;
        self.locked = false;
        self.locked_write = false;
        self.locked_tokens.clear();
        flushed
    }

    fn with_lock<R>(&mut self, write: bool, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let lock = self.lock_file(write)?;
        let res = f(self);
        let unlocked = self.unlock_file(lock);
        let value = res?;
        unlocked?;
        Ok(value)
    }

    pub fn total_blocks(&mut self) -> Result<u64> {
        self.with_lock(false, |fs| {
            let size = fs.file.metadata()?.len() - fs.offset;
            debug_assert_eq!(size % PHYSICAL_BLOCK_SIZE as u64, 0);
            Ok(size / PHYSICAL_BLOCK_SIZE as u64)
        })
    }

    /// Append `number` uninitialised blocks and return their ids. The
    /// blocks are not marked in any allocation bitmap.
    pub fn new_blocks(&mut self, number: u64) -> Result<Vec<u64>> {
        if number == 0 {
            return Ok(Vec::new());
        }
        self.with_lock(true, |fs| {
            let total = fs.total_blocks()?;
            fs.file.set_len(fs.block_start(total + number))?;
            fs.block_writes += number;
            Ok((total..total + number).collect())
        })
    }

    /// Truncate the container by `number` blocks, discarding any buffered
    /// writes and cached plaintext for the removed ids.
    pub fn remove_blocks(&mut self, number: u64) -> Result<()> {
        self.with_lock(true, |fs| {
            let total = fs.total_blocks()?;
            if number > total {
                return Err(Error::OutOfRange(number));
            }
            let new_total = total - number;
            fs.unflushed.retain(|&id, _| id < new_total);
            for id in new_total..total {
                fs.cache.pop(&id);
            }
            fs.file.set_len(fs.block_start(new_total))?;
            Ok(())
        })
    }

    /// Plaintext of block `block_id`, or `None` if it is uninitialised.
    pub fn read_block(&mut self, block_id: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.read_block_with_token(block_id)?.map(|(data, _)| data))
    }

    pub fn read_block_with_token(&mut self, block_id: u64) -> Result<Option<(Vec<u8>, Token)>> {
        if let Some((data, token)) = self.unflushed.get(&block_id) {
            return Ok(Some((data.clone(), *token)));
        }
        if self.locked {
            if let Some((data, token)) = self.cache.get(&block_id) {
                if self.locked_tokens.contains(token) {
                    let hit = data.as_ref().map(|data| (data.clone(), *token));
                    return Ok(hit);
                }
            }
        }
        self.with_lock(false, |fs| fs.read_block_slow(block_id))
    }

    fn read_block_slow(&mut self, block_id: u64) -> Result<Option<(Vec<u8>, Token)>> {
        self.check_in_range(block_id)?;
        let start = self.block_start(block_id);
        let mut token = UNINITIALISED_IV;
        self.read_exact_at(start, &mut token)?;
        if token == UNINITIALISED_IV {
            return Ok(None);
        }

        // a matching IV means the cached plaintext is still current
        let cached = self
            .cache
            .get(&block_id)
            .and_then(|(data, cached_token)| data.clone().map(|data| (data, *cached_token)));
        if let Some((data, cached_token)) = cached {
            if cached_token == token {
                if self.locked {
                    self.locked_tokens.insert(token);
                }
                return Ok(Some((data, token)));
            }
        }

        let mut rest = vec![0; PHYSICAL_BLOCK_SIZE - IV_SIZE];
        self.read_exact_at(start + IV_SIZE as u64, &mut rest)?;
        let data = self.decrypt_block(block_id, &token, &rest)?;
        self.cache.put(block_id, (Some(data.clone()), token));
        if self.locked {
            self.locked_tokens.insert(token);
        }
        self.block_reads += 1;
        Ok(Some((data, token)))
    }

    /// Write `data` into block `block_id` starting at `offset` within its
    /// plaintext, returning the token the data will carry on disk.
    ///
    /// A full-block write is encrypted and written immediately; anything
    /// smaller patches the current plaintext in memory and is buffered
    /// until the exclusive lock is released.
    pub fn write_block(&mut self, block_id: u64, offset: usize, data: &[u8]) -> Result<Token> {
        assert!(
            offset + data.len() <= LOGICAL_BLOCK_SIZE,
            "write spills out of the logical block"
        );
        self.with_lock(true, |fs| {
            fs.check_in_range(block_id)?;
            if data.len() == LOGICAL_BLOCK_SIZE {
                // supersedes any buffered patch
                fs.unflushed.remove(&block_id);
                let token = new_token();
                let frame = fs.encrypt_block(data, &token);
                fs.write_all_at(fs.block_start(block_id), &frame)?;
                fs.cache.put(block_id, (Some(data.to_vec()), token));
                fs.locked_tokens.insert(token);
                fs.block_writes += 1;
                return Ok(token);
            }

            let token = new_token();
            let mut plain = fs
                .read_block(block_id)?
                .unwrap_or_else(|| vec![0; LOGICAL_BLOCK_SIZE]);
            plain[offset..offset + data.len()].copy_from_slice(data);
            fs.unflushed.insert(block_id, (plain, token));
            fs.locked_tokens.insert(token);
            Ok(token)
        })
    }

    /// Zero the whole physical block, leaving the uninitialised sentinel.
    pub fn wipe_block(&mut self, block_id: u64) -> Result<()> {
        self.with_lock(true, |fs| {
            fs.check_in_range(block_id)?;
            fs.unflushed.remove(&block_id);
            fs.write_all_at(fs.block_start(block_id), &[0; PHYSICAL_BLOCK_SIZE])?;
            fs.cache.put(block_id, (None, UNINITIALISED_IV));
            fs.block_writes += 1;
            Ok(())
        })
    }

    /// Exchange the raw frames of two blocks. Tokens travel with the
    /// content, so cached entries stay valid once swapped along.
    pub fn swap_blocks(&mut self, block_id1: u64, block_id2: u64) -> Result<()> {
        self.with_lock(true, |fs| {
            fs.check_in_range(block_id1)?;
            fs.check_in_range(block_id2)?;
            if block_id1 == block_id2 {
                return Ok(());
            }
            fs.flush_writes(Some(&[block_id1, block_id2]))?;

            let mut frame1 = vec![0; PHYSICAL_BLOCK_SIZE];
            let mut frame2 = vec![0; PHYSICAL_BLOCK_SIZE];
            fs.read_exact_at(fs.block_start(block_id1), &mut frame1)?;
            fs.read_exact_at(fs.block_start(block_id2), &mut frame2)?;
            fs.write_all_at(fs.block_start(block_id1), &frame2)?;
            fs.write_all_at(fs.block_start(block_id2), &frame1)?;

            let entry1 = fs.cache.pop(&block_id1);
            let entry2 = fs.cache.pop(&block_id2);
            if let Some(entry) = entry1 {
                fs.cache.put(block_id2, entry);
            }
            if let Some(entry) = entry2 {
                fs.cache.put(block_id1, entry);
            }
            fs.block_writes += 2;
            Ok(())
        })
    }

    /// Whether the block's content changed since `old_token` was observed,
    /// plus the current token. Only the 16-byte IV is read. Inside a lock a
    /// previously observed token is authoritative without any I/O.
    pub fn block_version(&mut self, block_id: u64, old_token: Option<Token>) -> Result<(bool, Token)> {
        if self.locked {
            if let Some(token) = old_token {
                if self.locked_tokens.contains(&token) {
                    return Ok((false, token));
                }
            }
        }
        let token = self.with_lock(false, |fs| {
            fs.check_in_range(block_id)?;
            let mut token = UNINITIALISED_IV;
            fs.read_exact_at(fs.block_start(block_id), &mut token)?;
            Ok(token)
        })?;
        if self.locked {
            self.locked_tokens.insert(token);
        }
        Ok((old_token != Some(token), token))
    }

    fn flush_writes(&mut self, only: Option<&[u64]>) -> Result<()> {
        let ids: Vec<u64> = match only {
            Some(only) => only
                .iter()
                .copied()
                .filter(|id| self.unflushed.contains_key(id))
                .collect(),
            None => self.unflushed.keys().copied().collect(),
        };
        for id in ids {
            let Some((data, token)) = self.unflushed.remove(&id) else {
                continue;
            };
            let frame = self.encrypt_block(&data, &token);
            self.write_all_at(self.block_start(id), &frame)?;
            self.cache.put(id, (Some(data), token));
            self.block_writes += 1;
        }
        Ok(())
    }

    fn encrypt_block(&self, plaintext: &[u8], iv: &Token) -> Vec<u8> {
        debug_assert_eq!(plaintext.len(), LOGICAL_BLOCK_SIZE);
        let mut frame = Vec::with_capacity(PHYSICAL_BLOCK_SIZE);
        frame.extend_from_slice(iv);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(iv), plaintext)
            .expect("a block plaintext is a valid AES-GCM message");
        frame.extend_from_slice(&ciphertext);
        debug_assert_eq!(frame.len(), PHYSICAL_BLOCK_SIZE);
        frame
    }

    fn decrypt_block(&self, block_id: u64, iv: &Token, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|_| {
                warn!("block {block_id} failed authentication");
                Error::CorruptBlock(block_id)
            })?;
        debug_assert_eq!(plain.len(), LOGICAL_BLOCK_SIZE);
        Ok(plain)
    }

    fn check_in_range(&mut self, block_id: u64) -> Result<()> {
        if block_id >= self.total_blocks()? {
            return Err(Error::OutOfRange(block_id));
        }
        Ok(())
    }

    fn block_start(&self, block_id: u64) -> u64 {
        self.offset + block_id * PHYSICAL_BLOCK_SIZE as u64
    }

    fn read_exact_at(&mut self, start: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(start))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_all_at(&mut self, start: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(buf)?;
        Ok(())
    }
}

/// A fresh random token; the all-zero sentinel is resampled away.
fn new_token() -> Token {
    let mut iv = UNINITIALISED_IV;
    while iv == UNINITIALISED_IV {
        OsRng.fill_bytes(&mut iv);
    }
    iv
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn open_fs(offset: u64) -> (TempDir, BlockFs) {
        let dir = tempfile::tempdir().unwrap();
        let mut key = [0; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        let fs = BlockFs::initialise(dir.path().join("test.vaultfs"), &key, offset).unwrap();
        (dir, fs)
    }

    #[test]
    fn new_and_remove_blocks() {
        let (_dir, mut fs) = open_fs(12);
        assert_eq!(fs.new_blocks(1).unwrap(), [0]);

        assert_eq!(fs.read_block(0).unwrap(), None);
        assert_eq!(fs.total_blocks().unwrap(), 1);

        assert_eq!(fs.new_blocks(3).unwrap(), [1, 2, 3]);
        assert_eq!(fs.total_blocks().unwrap(), 4);
        for block_id in 0..4 {
            assert_eq!(fs.read_block(block_id).unwrap(), None);
        }

        fs.remove_blocks(4).unwrap();
        assert_eq!(fs.total_blocks().unwrap(), 0);
        assert_eq!(fs.read_block(0).unwrap_err(), Error::OutOfRange(0));
    }

    #[test]
    fn read_write_roundtrip() {
        let (dir, mut fs) = open_fs(12);
        fs.new_blocks(1).unwrap();

        let data = b"abcd".repeat(LOGICAL_BLOCK_SIZE / 4);
        let token = fs.write_block(0, 0, &data).unwrap();
        assert_eq!(fs.read_block(0).unwrap().unwrap(), data);

        // the returned token is the IV stored on disk
        let raw = fs::read(dir.path().join("test.vaultfs")).unwrap();
        assert_eq!(&raw[12..12 + IV_SIZE], &token);

        // reopening with the same key decrypts the same plaintext
        let mut reopened = {
            let mut key = [0; KEY_SIZE];
            OsRng.fill_bytes(&mut key);
            BlockFs::open(dir.path().join("test.vaultfs"), &key, 12).unwrap()
        };
        assert_eq!(reopened.read_block(0).unwrap_err(), Error::CorruptBlock(0));
    }

    #[test]
    fn tokens_are_stable_until_rewrite() {
        let (_dir, mut fs) = open_fs(0);
        fs.new_blocks(1).unwrap();
        let data = vec![7; LOGICAL_BLOCK_SIZE];

        let token = fs.write_block(0, 0, &data).unwrap();
        let (data1, token1) = fs.read_block_with_token(0).unwrap().unwrap();
        let (data2, token2) = fs.read_block_with_token(0).unwrap().unwrap();
        assert_eq!(data1, data2);
        assert_eq!(token1, token);
        assert_eq!(token2, token);

        let rewritten = fs.write_block(0, 0, &data).unwrap();
        assert_ne!(rewritten, token);
    }

    #[test]
    fn wipe_block_leaves_sentinel() {
        let (_dir, mut fs) = open_fs(12);
        fs.new_blocks(1).unwrap();

        let data = vec![b'a'; LOGICAL_BLOCK_SIZE];
        fs.write_block(0, 0, &data).unwrap();
        assert_eq!(fs.read_block(0).unwrap().unwrap(), data);

        fs.wipe_block(0).unwrap();
        assert_eq!(fs.read_block(0).unwrap(), None);
    }

    #[test]
    fn swap_blocks_is_an_involution() {
        let (_dir, mut fs) = open_fs(12);
        fs.new_blocks(2).unwrap();

        let a = vec![b'a'; LOGICAL_BLOCK_SIZE];
        let b = vec![b'b'; LOGICAL_BLOCK_SIZE];
        fs.write_block(0, 0, &a).unwrap();
        fs.write_block(1, 0, &b).unwrap();

        fs.swap_blocks(0, 1).unwrap();
        assert_eq!(fs.read_block(0).unwrap().unwrap(), b);
        assert_eq!(fs.read_block(1).unwrap().unwrap(), a);

        fs.swap_blocks(0, 0).unwrap();
        assert_eq!(fs.read_block(0).unwrap().unwrap(), b);

        fs.swap_blocks(0, 1).unwrap();
        assert_eq!(fs.read_block(0).unwrap().unwrap(), a);
        assert_eq!(fs.read_block(1).unwrap().unwrap(), b);
    }

    #[test]
    fn partial_writes_coalesce_under_one_lock() {
        let (_dir, mut fs) = open_fs(0);
        fs.new_blocks(1).unwrap();
        let writes_before = fs.block_writes();

        let lock = fs.lock_file(true).unwrap();
        fs.write_block(0, 0, b"ab").unwrap();
        fs.write_block(0, 4, b"cd").unwrap();
        assert_eq!(fs.block_writes(), writes_before);
        fs.unlock_file(lock).unwrap();

        assert_eq!(fs.block_writes(), writes_before + 1);
        let data = fs.read_block(0).unwrap().unwrap();
        assert_eq!(&data[..6], b"ab\0\0cd");
        assert!(data[6..].iter().all(|&byte| byte == 0));
    }

    #[test]
    fn full_write_supersedes_buffered_patch() {
        let (_dir, mut fs) = open_fs(0);
        fs.new_blocks(1).unwrap();

        let full = vec![b'x'; LOGICAL_BLOCK_SIZE];
        let lock = fs.lock_file(true).unwrap();
        fs.write_block(0, 0, b"stale").unwrap();
        fs.write_block(0, 0, &full).unwrap();
        fs.unlock_file(lock).unwrap();

        assert_eq!(fs.read_block(0).unwrap().unwrap(), full);
    }

    #[test]
    fn block_version_tracks_changes() {
        let (_dir, mut fs) = open_fs(12);
        fs.new_blocks(1).unwrap();
        fs.write_block(0, 0, &vec![b'a'; LOGICAL_BLOCK_SIZE]).unwrap();

        let (_, token) = fs.block_version(0, None).unwrap();
        let (changed, token) = fs.block_version(0, Some(token)).unwrap();
        assert!(!changed);

        let (_, read_token) = fs.read_block_with_token(0).unwrap().unwrap();
        assert_eq!(read_token, token);

        fs.write_block(0, 0, &vec![b'a'; LOGICAL_BLOCK_SIZE]).unwrap();
        let (changed, _) = fs.block_version(0, Some(token)).unwrap();
        assert!(changed);
    }

    #[test]
    fn shared_lock_refuses_writes() {
        let (_dir, mut fs) = open_fs(0);
        fs.new_blocks(1).unwrap();

        let lock = fs.lock_file(false).unwrap();
        assert_eq!(
            fs.write_block(0, 0, b"nope").unwrap_err(),
            Error::WrongLockMode
        );
        assert_eq!(fs.read_block(0).unwrap(), None);
        fs.unlock_file(lock).unwrap();

        fs.write_block(0, 0, b"fine").unwrap();
    }

    #[test]
    fn open_rejects_misaligned_container() {
        let (dir, fs) = open_fs(12);
        let path = dir.path().join("test.vaultfs");
        fs.close().unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw.extend_from_slice(&[0; 100]);
        fs::write(&path, &raw).unwrap();

        let key = [0; KEY_SIZE];
        assert_eq!(
            BlockFs::open(&path, &key, 12).unwrap_err(),
            Error::BadContainerSize(112)
        );
    }
}
