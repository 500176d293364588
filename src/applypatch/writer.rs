// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::applypatch::block_set::BlockSet;
use crate::constants::BLOCK_SIZE;
use crate::errors::{PkgError, PkgResult};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt};

// BLKDISCARD, _IO(0x12, 119)
nix::ioctl_write_ptr_bad!(ioctl_blk_discard, 0x1277, [u64; 2]);

/// Sequential writer contract shared by the transfer engine and the
/// image-patch executor.
pub trait DataWriter: Send {
    fn write(&mut self, data: &[u8]) -> PkgResult<()>;
    fn total_written(&self) -> u64;
}

/// Appends at a fixed byte offset of a device node or plain file.
pub struct RawWriter {
    file: File,
    start: u64,
    written: u64,
}

impl RawWriter {
    pub fn new(file: File, start: u64) -> RawWriter {
        RawWriter {
            file,
            start,
            written: 0,
        }
    }

    pub fn sync(&self) -> PkgResult<()> {
        self.file.sync_all().map_err(|_| PkgError::InvalidStream)
    }
}

impl DataWriter for RawWriter {
    fn write(&mut self, data: &[u8]) -> PkgResult<()> {
        self.file
            .write_all_at(data, self.start + self.written)
            .map_err(|e| {
                error!("raw write failed: {}", e);
                PkgError::InvalidStream
            })?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn total_written(&self) -> u64 {
        self.written
    }
}

/// Writes a linear byte stream across the block ranges of a `BlockSet`.
/// With `discard` set the bytes are consumed and dropped, which keeps a
/// resumed new-data stream in sync with skipped commands.
pub struct BlockWriter {
    file: File,
    ranges: BlockSet,
    written: u64,
    discard: bool,
}

impl BlockWriter {
    pub fn new(file: File, ranges: BlockSet) -> BlockWriter {
        BlockWriter {
            file,
            ranges,
            written: 0,
            discard: false,
        }
    }

    pub fn new_discard(file: File, ranges: BlockSet) -> BlockWriter {
        BlockWriter {
            file,
            ranges,
            written: 0,
            discard: true,
        }
    }

    pub fn blocks_size(&self) -> u64 {
        self.ranges.total_bytes()
    }

    pub fn is_write_done(&self) -> bool {
        self.written >= self.blocks_size()
    }

    /// Maps a linear position into a device offset within the ranges.
    fn device_offset(&self, linear: u64) -> Option<(u64, u64)> {
        let mut remaining = linear;
        for &(start, end) in self.ranges.pairs() {
            let len = (end - start) * BLOCK_SIZE;
            if remaining < len {
                return Some((start * BLOCK_SIZE + remaining, len - remaining));
            }
            remaining -= len;
        }
        None
    }
}

impl DataWriter for BlockWriter {
    fn write(&mut self, data: &[u8]) -> PkgResult<()> {
        let mut data = data;
        while !data.is_empty() {
            let (offset, room) = self.device_offset(self.written).ok_or_else(|| {
                error!("write past end of block ranges");
                PkgError::InvalidStream
            })?;
            let take = data.len().min(room as usize);
            if !self.discard {
                self.file.write_all_at(&data[..take], offset).map_err(|e| {
                    error!("block write failed: {}", e);
                    PkgError::InvalidStream
                })?;
            }
            self.written += take as u64;
            data = &data[take..];
        }
        Ok(())
    }

    fn total_written(&self) -> u64 {
        self.written
    }
}

/// Reads the ranges of `set` in order into one linear buffer.
pub fn read_blocks(file: &File, set: &BlockSet) -> PkgResult<Vec<u8>> {
    let mut out = vec![0u8; set.total_bytes() as usize];
    let mut pos = 0usize;
    for &(start, end) in set.pairs() {
        let len = ((end - start) * BLOCK_SIZE) as usize;
        file.read_exact_at(&mut out[pos..pos + len], start * BLOCK_SIZE)
            .map_err(|e| {
                error!("block read failed: {}", e);
                PkgError::InvalidStream
            })?;
        pos += len;
    }
    Ok(out)
}

/// Writes one linear buffer across the ranges of `set` in order.
pub fn write_blocks(file: &File, set: &BlockSet, data: &[u8]) -> PkgResult<()> {
    if data.len() as u64 != set.total_bytes() {
        error!(
            "data size {} does not match range size {}",
            data.len(),
            set.total_bytes()
        );
        return Err(PkgError::InvalidParam);
    }
    let mut pos = 0usize;
    for &(start, end) in set.pairs() {
        let len = ((end - start) * BLOCK_SIZE) as usize;
        file.write_all_at(&data[pos..pos + len], start * BLOCK_SIZE)
            .map_err(|e| {
                error!("block write failed: {}", e);
                PkgError::InvalidStream
            })?;
        pos += len;
    }
    Ok(())
}

static ZERO_BLOCK: Lazy<Vec<u8>> = Lazy::new(|| vec![0u8; BLOCK_SIZE as usize]);

pub fn zero_blocks(file: &File, set: &BlockSet) -> PkgResult<()> {
    for &(start, end) in set.pairs() {
        for block in start..end {
            file.write_all_at(&ZERO_BLOCK, block * BLOCK_SIZE)
                .map_err(|_| PkgError::InvalidStream)?;
        }
    }
    Ok(())
}

/// `BLKDISCARD` over each range. A plain file backing (tests, simulated
/// devices) gets zero-filled instead.
pub fn discard_blocks(file: &File, set: &BlockSet) -> PkgResult<()> {
    let is_block_device = file
        .metadata()
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false);
    if !is_block_device {
        info!("discard on regular file, zero filling");
        return zero_blocks(file, set);
    }
    for &(start, end) in set.pairs() {
        let range = [start * BLOCK_SIZE, (end - start) * BLOCK_SIZE];
        // Safety: BLKDISCARD reads the two-u64 range struct only.
        if let Err(e) = unsafe { ioctl_blk_discard(file.as_raw_fd(), &range) } {
            warn!("BLKDISCARD failed: {}", e);
            return Err(PkgError::InvalidStream);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_device(blocks: u64, fill: u8) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![fill; (blocks * BLOCK_SIZE) as usize])
            .unwrap();
        drop(f);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        (dir, file)
    }

    #[test]
    fn block_writer_spans_ranges() {
        let (_dir, file) = temp_device(8, 0x00);
        let ranges = BlockSet::parse("4 1 2 4 6").unwrap();
        let mut writer = BlockWriter::new(file.try_clone().unwrap(), ranges.clone());
        assert_eq!(writer.blocks_size(), 3 * BLOCK_SIZE);

        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        writer.write(&data[..1000]).unwrap();
        writer.write(&data[1000..]).unwrap();
        assert!(writer.is_write_done());

        assert_eq!(read_blocks(&file, &ranges).unwrap(), data);
        // block 0 untouched
        let first = read_blocks(&file, &BlockSet::parse("2 0 1").unwrap()).unwrap();
        assert!(first.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_past_ranges_is_an_error() {
        let (_dir, file) = temp_device(4, 0x00);
        let ranges = BlockSet::parse("2 0 1").unwrap();
        let mut writer = BlockWriter::new(file, ranges);
        let block = vec![1u8; BLOCK_SIZE as usize];
        writer.write(&block).unwrap();
        assert_eq!(writer.write(&[1u8]).unwrap_err(), PkgError::InvalidStream);
    }

    #[test]
    fn discard_writer_consumes_without_touching_device() {
        let (_dir, file) = temp_device(2, 0x55);
        let ranges = BlockSet::parse("2 0 2").unwrap();
        let mut writer = BlockWriter::new_discard(file.try_clone().unwrap(), ranges.clone());
        writer.write(&vec![0xFFu8; 2 * BLOCK_SIZE as usize]).unwrap();
        assert!(writer.is_write_done());
        assert!(read_blocks(&file, &ranges)
            .unwrap()
            .iter()
            .all(|&b| b == 0x55));
    }

    #[test]
    fn zero_and_discard_on_regular_file() {
        let (_dir, file) = temp_device(4, 0xAA);
        let set = BlockSet::parse("2 1 3").unwrap();
        discard_blocks(&file, &set).unwrap();
        assert!(read_blocks(&file, &set).unwrap().iter().all(|&b| b == 0));
        let rest = read_blocks(&file, &BlockSet::parse("2 0 1").unwrap()).unwrap();
        assert!(rest.iter().all(|&b| b == 0xAA));
    }
}
