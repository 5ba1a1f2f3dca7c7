//! Directories over the file layer.
//!
//! A directory is a regular file whose payload is a sorted array of fixed
//! 264-byte entries, searched by binary chopping on the padded name field.
//! Inserting or removing an entry rewrites the suffix of the array.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::file::FileFs;
use crate::sys::dirent::{pad_name, DirectoryEntry, DIRECTORY_ENTRY_SIZE};
use crate::sys::header::FileType;

pub use crate::sys::dirent::FILENAME_SIZE;

/// File id of the root directory. File id 0 does not exist, so 0 can serve
/// as the null link in header chains.
pub const ROOT_FILE_ID: u64 = 1;

/// Directory entries and name lookup atop `FileFs`.
pub struct PathFs {
    filefs: FileFs,
}

impl PathFs {
    pub fn new(filefs: FileFs) -> PathFs {
        PathFs { filefs }
    }

    /// Create the root directory in a freshly initialised container.
    pub fn initialise(filefs: FileFs) -> Result<PathFs> {
        let mut fs = PathFs::new(filefs);
        let root = fs.filefs.create_new_file(FileType::Directory)?;
        debug_assert_eq!(root, ROOT_FILE_ID);
        Ok(fs)
    }

    pub fn filefs(&mut self) -> &mut FileFs {
        &mut self.filefs
    }

    fn locked<R>(&mut self, write: bool, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let lock = self.filefs.blockfs().lock_file(write)?;
        let res = f(self);
        let unlocked = self.filefs.blockfs().unlock_file(lock);
        let value = res?;
        unlocked?;
        Ok(value)
    }

    /// Payload length of the directory, after checking it really is one and
    /// that the payload is whole entries.
    fn directory_size(&mut self, dir_id: u64) -> Result<u64> {
        let header = self.filefs.primary_header(dir_id)?;
        if header.file_type != FileType::Directory {
            return Err(Error::NotADirectory);
        }
        if header.size % DIRECTORY_ENTRY_SIZE as u64 != 0 {
            return Err(Error::CorruptBlock(dir_id));
        }
        Ok(header.size)
    }

    /// Binary search for `name`. Returns the entry if present, plus the
    /// byte position where it lies or, when absent, where it would be
    /// inserted.
    pub fn search_directory(
        &mut self,
        dir_id: u64,
        name: &[u8],
    ) -> Result<(Option<DirectoryEntry>, u64)> {
        let padded = pad_name(name)?;
        self.locked(false, |fs| {
            let size = fs.directory_size(dir_id)?;
            if size == 0 {
                return Ok((None, 0));
            }
            let mut start = 0;
            let mut end = size / DIRECTORY_ENTRY_SIZE as u64;
            let mut reader = fs.filefs.reader(dir_id, 0);
            loop {
                let middle = (start + end) / 2;
                reader.seek(middle * DIRECTORY_ENTRY_SIZE as u64);
                let raw = reader.read(Some(DIRECTORY_ENTRY_SIZE as u64))?;
                let entry = DirectoryEntry::unpack(&raw);
                match entry.name.cmp(&padded) {
                    Ordering::Equal => return Ok((Some(entry), middle * DIRECTORY_ENTRY_SIZE as u64)),
                    Ordering::Less => start = middle + 1,
                    Ordering::Greater => end = middle,
                }
                if start == end {
                    return Ok((None, start * DIRECTORY_ENTRY_SIZE as u64));
                }
            }
        })
    }

    /// Insert `entry` keeping the array sorted; the tail of the array is
    /// rewritten one entry further along. A present name is an error unless
    /// `overwrite` is set, in which case the entry is replaced in place.
    pub fn add_directory_entry(
        &mut self,
        dir_id: u64,
        entry: DirectoryEntry,
        overwrite: bool,
    ) -> Result<()> {
        self.locked(true, |fs| {
            let (existing, position) = fs.search_directory(dir_id, entry.name())?;
            if existing.is_some() {
                if !overwrite {
                    return Err(Error::EntryExists);
                }
                let mut writer = fs.filefs.writer(dir_id, position);
                writer.write(&entry.pack())?;
                return writer.flush();
            }

            let suffix = fs.filefs.read(dir_id, position, None)?;
            let mut writer = fs.filefs.writer(dir_id, position);
            writer.write(&entry.pack())?;
            writer.write(&suffix)?;
            writer.flush()
        })
    }

    /// Remove the named entry, truncating the payload by one entry and
    /// rewriting the tail over the hole.
    pub fn remove_directory_entry(&mut self, dir_id: u64, name: &[u8]) -> Result<()> {
        self.locked(true, |fs| {
            let (existing, position) = fs.search_directory(dir_id, name)?;
            if existing.is_none() {
                return Err(Error::EntryNotFound);
            }

            let suffix = fs.filefs.read(dir_id, position + DIRECTORY_ENTRY_SIZE as u64, None)?;
            fs.filefs.truncate_file_size(dir_id, position + suffix.len() as u64)?;
            let mut writer = fs.filefs.writer(dir_id, position);
            writer.write(&suffix)?;
            writer.flush()
        })
    }

    /// All entries in name order, from a snapshot taken under one shared
    /// lock.
    pub fn directory_entries(&mut self, dir_id: u64) -> Result<DirectoryEntries> {
        self.locked(false, |fs| {
            fs.directory_size(dir_id)?;
            let data = fs.filefs.read(dir_id, 0, None)?;
            Ok(DirectoryEntries { data, position: 0 })
        })
    }
}

pub struct DirectoryEntries {
    data: Vec<u8>,
    position: usize,
}

impl Iterator for DirectoryEntries {
    type Item = DirectoryEntry;

    fn next(&mut self) -> Option<DirectoryEntry> {
        if self.position + DIRECTORY_ENTRY_SIZE > self.data.len() {
            return None;
        }
        let entry = DirectoryEntry::unpack(&self.data[self.position..self.position + DIRECTORY_ENTRY_SIZE]);
        self.position += DIRECTORY_ENTRY_SIZE;
        Some(entry)
    }
}
