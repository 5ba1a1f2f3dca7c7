use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::file::{block_from_offset, file_data_in_block, FileFs};

/// Sequential reader over a file's data stream.
pub struct ReadIterator<'a> {
    fs: &'a mut FileFs,
    file_id: u64,
    cursor: u64,
}

impl<'a> ReadIterator<'a> {
    pub(crate) fn new(fs: &'a mut FileFs, file_id: u64, start: u64) -> ReadIterator<'a> {
        ReadIterator {
            fs,
            file_id,
            cursor: start,
        }
    }

    pub fn seek(&mut self, position: u64) {
        self.cursor = position;
    }

    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Read up to `size` bytes from the cursor, or everything up to the
    /// file size with `None`, under one shared lock. Unwritten blocks in
    /// the range read as zeros.
    pub fn read(&mut self, size: Option<u64>) -> Result<Vec<u8>> {
        let file_id = self.file_id;
        let start = self.cursor;
        let data = self.fs.locked(false, |fs| {
            let file_size = fs.primary_header(file_id)?.size;
            let mut remaining = match size {
                Some(size) => size.min(file_size.saturating_sub(start)),
                None => file_size.saturating_sub(start),
            };
            let mut cursor = start;
            let mut out = Vec::with_capacity(remaining as usize);
            while remaining > 0 {
                let (block_num, offset) = block_from_offset(cursor);
                let available = file_data_in_block(block_num) - offset;
                let take = (available as u64).min(remaining) as usize;
                match fs.read_file_data(file_id, block_num)? {
                    Some(data) => out.extend_from_slice(&data[offset..offset + take]),
                    None => out.resize(out.len() + take, 0),
                }
                cursor += take as u64;
                remaining -= take as u64;
            }
            Ok(out)
        })?;
        self.cursor += data.len() as u64;
        Ok(data)
    }
}

/// Buffering writer over a file's data stream.
///
/// Caller-supplied chunks accumulate until they cover whole in-block runs,
/// which are then written in one exclusive-lock batch; `flush` forces the
/// partial tail through the block layer's read-modify-write path. The chain
/// is extended and the stored size raised as the cursor advances.
pub struct WriteIterator<'a> {
    fs: &'a mut FileFs,
    file_id: u64,
    cursor: u64,
    buffered: VecDeque<u8>,
}

impl<'a> WriteIterator<'a> {
    pub(crate) fn new(fs: &'a mut FileFs, file_id: u64, start: u64) -> WriteIterator<'a> {
        WriteIterator {
            fs,
            file_id,
            cursor: start,
            buffered: VecDeque::new(),
        }
    }

    pub fn position(&self) -> u64 {
        self.cursor + self.buffered.len() as u64
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buffered.extend(data.iter().copied());
        self.drain(false)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.drain(true)
    }

    fn drain(&mut self, flush: bool) -> Result<()> {
        let mut plan: Vec<(u64, usize, Vec<u8>)> = Vec::new();
        while !self.buffered.is_empty() {
            let (block_num, offset) = block_from_offset(self.cursor);
            let room = file_data_in_block(block_num) - offset;
            let take = if self.buffered.len() >= room {
                room
            } else if flush {
                self.buffered.len()
            } else {
                break;
            };
            let chunk: Vec<u8> = self.buffered.drain(..take).collect();
            self.cursor += take as u64;
            plan.push((block_num, offset, chunk));
        }
        if plan.is_empty() {
            return Ok(());
        }

        let file_id = self.file_id;
        let end = self.cursor;
        self.fs.locked(true, |fs| {
            let last_block = plan.last().map(|(block, _, _)| *block).unwrap_or(0);
            if fs.num_file_blocks(file_id)? < last_block + 1 {
                fs.extend_file_blocks(file_id, last_block + 1)?;
            }
            for (block_num, offset, chunk) in &plan {
                fs.write_file_data(file_id, *block_num, *offset, chunk)?;
            }

            let (_, mut header) = fs.get_file_header(file_id, 0)?;
            let primary = header.as_primary_mut().ok_or(Error::CorruptBlock(file_id))?;
            if end > primary.size {
                primary.size = end;
                fs.write_file_header(file_id, 0, &header)?;
            }
            Ok(())
        })
    }
}
