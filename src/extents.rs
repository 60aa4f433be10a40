//! Logical-to-physical extent mapping and file data reads (`spec.md` §4.J).
//!
//! Grounded in the teacher's `extents.rs`, rewritten against [`BlockSource`]
//! instead of a borrowed `Read + Seek` reader so a fork reader can share the
//! same block cache the rest of the crate uses rather than issuing raw
//! reads that bypass it, and against [`crate::fs_tree::FileExtentVal`]
//! instead of the superseded `catalog` module's copy of the same struct.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::block::{BlockCache, BlockSource};
use crate::error::Result;
use crate::fs_tree::FileExtentVal;

/// Read file data from extents, streaming to a writer. Returns the number
/// of bytes written.
pub fn read_file_data<S: BlockSource, W: Write>(
    source: &S,
    block_cache: &BlockCache,
    extents: &[FileExtentVal],
    logical_size: u64,
    writer: &mut W,
) -> Result<u64> {
    if logical_size == 0 {
        return Ok(0);
    }

    let block_size = source.block_size() as u64;
    let mut bytes_written: u64 = 0;

    for extent in extents {
        if bytes_written >= logical_size {
            break;
        }

        let extent_length = extent.length();
        let mut extent_offset = 0u64;

        while extent_offset < extent_length && bytes_written < logical_size {
            let remaining_in_file = logical_size - bytes_written;
            let remaining_in_extent = extent_length - extent_offset;
            let to_read = remaining_in_file.min(remaining_in_extent).min(block_size);

            let block_number = extent.phys_block_num + extent_offset / block_size;
            let block = block_cache.get_or_read(source, block_number)?;
            let in_block_off = (extent_offset % block_size) as usize;
            let chunk = &block[in_block_off..in_block_off + to_read as usize];
            writer.write_all(chunk)?;

            bytes_written += to_read;
            extent_offset += to_read;
        }
    }

    Ok(bytes_written)
}

/// Presents a file's extents as a contiguous `Read + Seek` stream, reading
/// each touched block through the shared [`BlockCache`].
pub struct ApfsForkReader<'a, S: BlockSource> {
    source: &'a S,
    block_cache: &'a BlockCache,
    logical_size: u64,
    /// (logical_start, physical_block_start, length_bytes)
    extent_map: Vec<(u64, u64, u64)>,
    position: u64,
}

impl<'a, S: BlockSource> ApfsForkReader<'a, S> {
    pub fn new(
        source: &'a S,
        block_cache: &'a BlockCache,
        extents: Vec<FileExtentVal>,
        logical_size: u64,
    ) -> Self {
        let mut extent_map = Vec::new();
        let mut logical_offset = 0u64;

        for extent in &extents {
            let length = extent.length();
            if length == 0 {
                continue;
            }
            extent_map.push((logical_offset, extent.phys_block_num, length));
            logical_offset += length;
        }

        ApfsForkReader {
            source,
            block_cache,
            logical_size,
            extent_map,
            position: 0,
        }
    }

    fn locate(&self, logical_offset: u64) -> Option<(u64, u64)> {
        self.extent_map
            .iter()
            .find(|&&(log_start, _, length)| logical_offset >= log_start && logical_offset < log_start + length)
            .map(|&(log_start, phys_block_start, length)| {
                let block_size = self.source.block_size() as u64;
                let within = logical_offset - log_start;
                let block_number = phys_block_start + within / block_size;
                let remaining = length - within;
                (block_number, remaining)
            })
    }
}

impl<S: BlockSource> Read for ApfsForkReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.logical_size {
            return Ok(0);
        }

        let remaining_in_file = (self.logical_size - self.position) as usize;
        let to_read = buf.len().min(remaining_in_file);
        if to_read == 0 {
            return Ok(0);
        }

        let block_size = self.source.block_size() as u64;
        let mut total_read = 0usize;

        while total_read < to_read {
            let logical_pos = self.position + total_read as u64;
            let (block_number, extent_remaining) = self.locate(logical_pos).ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "logical offset beyond extent map")
            })?;

            let block = self
                .block_cache
                .get_or_read(self.source, block_number)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

            let in_block_off = (logical_pos % block_size) as usize;
            let in_block_remaining = block.len() - in_block_off;
            let chunk_size = (to_read - total_read).min(in_block_remaining).min(extent_remaining as usize);

            buf[total_read..total_read + chunk_size].copy_from_slice(&block[in_block_off..in_block_off + chunk_size]);
            total_read += chunk_size;
        }

        self.position += total_read as u64;
        Ok(total_read)
    }
}

impl<S: BlockSource> Seek for ApfsForkReader<'_, S> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.logical_size as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start of file"));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}
