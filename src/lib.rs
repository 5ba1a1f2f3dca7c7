//! An encrypted, block-structured file container: one host file holds a
//! whole virtual filesystem whose contents are AES-256-GCM authenticated
//! ciphertext at block granularity.
//!
//! Three strictly layered components, each depending only on the one below:
//!
//! - [`block::BlockFs`] maps logical 4064-byte blocks to encrypted 4096-byte
//!   frames in the backing file, with a plaintext cache, write coalescing
//!   and the container's advisory lock.
//! - [`file::FileFs`] composes blocks into variable-length files through a
//!   doubly linked chain of header blocks, allocates space from superblock
//!   bitmaps and stores extended attributes.
//! - [`path::PathFs`] keeps directories as sorted arrays of fixed-size
//!   entries inside ordinary files.
//!
//! The caller supplies the 32-byte master key and may reserve an opaque
//! offset area at the front of the container (typically a key-derivation
//! salt).

pub mod block;
pub mod error;
pub mod file;
pub mod path;
pub mod sys;

pub use block::BlockFs;
pub use error::{Error, Result};
pub use file::FileFs;
pub use path::PathFs;
pub use sys::dirent::DirectoryEntry;
pub use sys::header::FileType;

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;
    use rand::RngCore;
    use tempfile::TempDir;

    use crate::block::KEY_SIZE;
    use crate::path::ROOT_FILE_ID;
    use crate::sys::dirent::DIRECTORY_ENTRY_SIZE;
    use crate::sys::header::FILE_HEADER_INTERVAL;

    use super::*;

    fn open_fs() -> (TempDir, PathFs) {
        let dir = tempfile::tempdir().unwrap();
        let mut key = [0; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        let blockfs = BlockFs::initialise(dir.path().join("test.vaultfs"), &key, 32).unwrap();
        let filefs = FileFs::initialise(blockfs).unwrap();
        let fs = PathFs::initialise(filefs).unwrap();
        (dir, fs)
    }

    #[test]
    fn fresh_container_layout() {
        let (_dir, mut fs) = open_fs();

        // block 0: superblock with its own bit and the root's; block 1: root
        assert_eq!(fs.filefs().blockfs().total_blocks().unwrap(), 2);
        let bitmap = fs.filefs().read_superblock(0).unwrap();
        assert_eq!(bitmap.count_ones(), 2);
        assert!(bitmap.get(0));
        assert!(bitmap.get(1));

        let root = fs.filefs().primary_header(ROOT_FILE_ID).unwrap();
        assert_eq!(root.file_type, FileType::Directory);
        assert_eq!(root.size, 0);
    }

    #[test]
    fn rename_entry_keeps_single_record() {
        let (_dir, mut fs) = open_fs();
        let file_id = fs.filefs().create_new_file(FileType::Regular).unwrap();

        fs.add_directory_entry(ROOT_FILE_ID, DirectoryEntry::new(b"a", file_id).unwrap(), false)
            .unwrap();
        fs.add_directory_entry(ROOT_FILE_ID, DirectoryEntry::new(b"b", file_id).unwrap(), false)
            .unwrap();
        fs.remove_directory_entry(ROOT_FILE_ID, b"a").unwrap();

        let entries: Vec<DirectoryEntry> = fs.directory_entries(ROOT_FILE_ID).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), b"b");
        assert_eq!(entries[0].file_id, file_id);
        assert_eq!(
            fs.filefs().primary_header(ROOT_FILE_ID).unwrap().size,
            DIRECTORY_ENTRY_SIZE as u64
        );
    }

    #[test]
    fn small_write_single_block() {
        let (_dir, mut fs) = open_fs();
        let file_id = fs.filefs().create_new_file(FileType::Regular).unwrap();

        let data = b"abcdef".repeat(10);
        let writes_before = fs.filefs().blockfs().block_writes();
        fs.filefs().write(file_id, 0, &data).unwrap();

        // the data and the size update coalesce into one physical write
        assert_eq!(fs.filefs().blockfs().block_writes() - writes_before, 1);
        assert_eq!(fs.filefs().num_file_blocks(file_id).unwrap(), 1);
        assert_eq!(fs.filefs().primary_header(file_id).unwrap().size, 60);
        assert_eq!(fs.filefs().read(file_id, 0, Some(60)).unwrap(), data);
    }

    #[test]
    fn truncate_across_header_boundary() {
        let (_dir, mut fs) = open_fs();
        let file_id = fs.filefs().create_new_file(FileType::Regular).unwrap();

        fs.filefs()
            .extend_file_blocks(file_id, FILE_HEADER_INTERVAL * 5)
            .unwrap();
        fs.filefs().truncate_file_blocks(file_id, 1).unwrap();

        // superblock, root directory, and the file's primary header remain
        assert_eq!(fs.filefs().read_superblock(0).unwrap().count_ones(), 3);
        let header = fs.filefs().primary_header(file_id).unwrap();
        assert_eq!(header.next_header, 0);
        assert!(header.block_ids.is_empty());
    }

    #[test]
    fn xattr_overflow_roundtrip() {
        let (_dir, mut fs) = open_fs();
        let file_id = fs.filefs().create_new_file(FileType::Regular).unwrap();

        let value = b"c".repeat(5000);
        fs.filefs().set_xattr(file_id, b"c", &value, false, false).unwrap();
        assert_eq!(fs.filefs().lookup_xattr(file_id, b"c").unwrap(), value);
        assert!(fs.filefs().read_superblock(0).unwrap().count_ones() > 3);

        fs.filefs().delete_xattr(file_id, b"c").unwrap();
        assert_eq!(fs.filefs().read_xattrs(file_id).unwrap(), vec![]);
        assert_eq!(fs.filefs().read_superblock(0).unwrap().count_ones(), 3);
    }

    #[test]
    fn reopen_sees_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.vaultfs");
        let mut key = [0; KEY_SIZE];
        OsRng.fill_bytes(&mut key);

        let file_id = {
            let blockfs = BlockFs::initialise(&path, &key, 32).unwrap();
            let filefs = FileFs::initialise(blockfs).unwrap();
            let mut fs = PathFs::initialise(filefs).unwrap();
            let file_id = fs.filefs().create_new_file(FileType::Regular).unwrap();
            fs.filefs().write(file_id, 0, b"persisted").unwrap();
            fs.add_directory_entry(ROOT_FILE_ID, DirectoryEntry::new(b"f", file_id).unwrap(), false)
                .unwrap();
            file_id
        };

        let blockfs = BlockFs::open(&path, &key, 32).unwrap();
        let mut fs = PathFs::new(FileFs::new(blockfs));
        let (entry, _) = fs.search_directory(ROOT_FILE_ID, b"f").unwrap();
        assert_eq!(entry.unwrap().file_id, file_id);
        assert_eq!(fs.filefs().read(file_id, 0, None).unwrap(), b"persisted");
    }
}
