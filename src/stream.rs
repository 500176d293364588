// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::errors::{PkgError, PkgResult};
use crate::ringbuf::RingBuffer;
use log::{error, warn};
use memmap2::Mmap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Write-side callback of a processor stream: `(chunk, start_offset, finish)`.
pub type ProcessorFn = Box<dyn FnMut(&[u8], u64, bool) -> PkgResult<()> + Send>;

/// Polymorphic package stream. Every variant supports random-access reads
/// and writes; flow-data streams are sequential and block the reader until
/// the producer pushes (a short read means the producer has stopped).
pub enum PkgStream {
    File {
        name: String,
        file: File,
        len: u64,
    },
    Memory {
        name: String,
        buf: Vec<u8>,
    },
    MemoryMap {
        name: String,
        map: Mmap,
    },
    Processor {
        name: String,
        func: ProcessorFn,
        written: u64,
        len: u64,
    },
    FlowData {
        name: String,
        ring: Arc<RingBuffer>,
        declared_len: u64,
        read_pos: u64,
        write_pos: u64,
        carry: Vec<u8>,
        carry_off: usize,
    },
}

impl PkgStream {
    pub fn open_read(name: &str, path: &Path) -> PkgResult<PkgStream> {
        let file = File::open(path).map_err(|e| {
            error!("open {} for read failed: {}", path.display(), e);
            PkgError::InvalidFile
        })?;
        let len = file.metadata().map(|m| m.len())?;
        Ok(PkgStream::File {
            name: name.to_string(),
            file,
            len,
        })
    }

    pub fn open_write(name: &str, path: &Path) -> PkgResult<PkgStream> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                error!("open {} for write failed: {}", path.display(), e);
                PkgError::InvalidFile
            })?;
        Ok(PkgStream::File {
            name: name.to_string(),
            file,
            len: 0,
        })
    }

    pub fn open_map(name: &str, path: &Path) -> PkgResult<PkgStream> {
        let file = File::open(path).map_err(|_| PkgError::InvalidFile)?;
        // Safety: the mapping is read-only and the updater is the only
        // writer of its work directory.
        let map = unsafe { Mmap::map(&file) }.map_err(|_| PkgError::NoneMemory)?;
        Ok(PkgStream::MemoryMap {
            name: name.to_string(),
            map,
        })
    }

    pub fn memory(name: &str, buf: Vec<u8>) -> PkgStream {
        PkgStream::Memory {
            name: name.to_string(),
            buf,
        }
    }

    pub fn processor(name: &str, len: u64, func: ProcessorFn) -> PkgStream {
        PkgStream::Processor {
            name: name.to_string(),
            func,
            written: 0,
            len,
        }
    }

    pub fn flow_data(name: &str, ring: Arc<RingBuffer>, declared_len: u64) -> PkgStream {
        PkgStream::FlowData {
            name: name.to_string(),
            ring,
            declared_len,
            read_pos: 0,
            write_pos: 0,
            carry: Vec::new(),
            carry_off: 0,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            PkgStream::File { name, .. }
            | PkgStream::Memory { name, .. }
            | PkgStream::MemoryMap { name, .. }
            | PkgStream::Processor { name, .. }
            | PkgStream::FlowData { name, .. } => name,
        }
    }

    /// Final length for file/memory streams, declared length for flow-data.
    pub fn len(&self) -> u64 {
        match self {
            PkgStream::File { len, .. } => *len,
            PkgStream::Memory { buf, .. } => buf.len() as u64,
            PkgStream::MemoryMap { map, .. } => map.len() as u64,
            PkgStream::Processor { len, .. } => *len,
            PkgStream::FlowData { declared_len, .. } => *declared_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes at `offset`. Returns the byte count;
    /// short means end of stream (for flow-data: the producer stopped).
    pub fn read(&mut self, buf: &mut [u8], offset: u64) -> PkgResult<usize> {
        match self {
            PkgStream::File { file, len, .. } => {
                if offset >= *len {
                    return Ok(0);
                }
                let want = buf.len().min((*len - offset) as usize);
                let mut done = 0usize;
                while done < want {
                    let n = file
                        .read_at(&mut buf[done..want], offset + done as u64)
                        .map_err(|e| {
                            error!("stream read failed: {}", e);
                            PkgError::InvalidStream
                        })?;
                    if n == 0 {
                        break;
                    }
                    done += n;
                }
                Ok(done)
            }
            PkgStream::Memory { buf: src, .. } => Ok(copy_region(src, buf, offset)),
            PkgStream::MemoryMap { map, .. } => Ok(copy_region(map, buf, offset)),
            PkgStream::Processor { .. } => {
                warn!("read from write-only processor stream");
                Err(PkgError::InvalidStream)
            }
            PkgStream::FlowData {
                ring,
                read_pos,
                carry,
                carry_off,
                ..
            } => {
                if offset != *read_pos {
                    warn!("flow stream read out of order: {} != {}", offset, *read_pos);
                    return Err(PkgError::InvalidStream);
                }
                let mut done = 0usize;
                while done < buf.len() {
                    if *carry_off < carry.len() {
                        let take = (carry.len() - *carry_off).min(buf.len() - done);
                        buf[done..done + take]
                            .copy_from_slice(&carry[*carry_off..*carry_off + take]);
                        *carry_off += take;
                        done += take;
                        continue;
                    }
                    let mut slot = vec![0u8; ring.slot_size() as usize];
                    match ring.pop(&mut slot) {
                        Some(n) => {
                            slot.truncate(n);
                            *carry = slot;
                            *carry_off = 0;
                        }
                        None => break, // producer stopped
                    }
                }
                *read_pos += done as u64;
                Ok(done)
            }
        }
    }

    /// Writes all of `data` at `offset` or fails with a stream error.
    pub fn write(&mut self, data: &[u8], offset: u64) -> PkgResult<()> {
        match self {
            PkgStream::File { file, len, .. } => {
                file.write_all_at(data, offset).map_err(|e| {
                    error!("stream write failed: {}", e);
                    PkgError::InvalidStream
                })?;
                *len = (*len).max(offset + data.len() as u64);
                Ok(())
            }
            PkgStream::Memory { buf, .. } => {
                let end = offset as usize + data.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(data);
                Ok(())
            }
            PkgStream::MemoryMap { .. } => {
                warn!("write to read-only mapped stream");
                Err(PkgError::InvalidStream)
            }
            PkgStream::Processor { func, written, .. } => {
                if offset != *written {
                    warn!(
                        "processor stream write out of order: {} != {}",
                        offset, *written
                    );
                    return Err(PkgError::InvalidStream);
                }
                func(data, offset, false)?;
                *written += data.len() as u64;
                Ok(())
            }
            PkgStream::FlowData {
                ring, write_pos, ..
            } => {
                if offset != *write_pos {
                    warn!("flow stream write out of order: {} != {}", offset, *write_pos);
                    return Err(PkgError::InvalidStream);
                }
                let slot = ring.slot_size() as usize;
                for chunk in data.chunks(slot) {
                    if !ring.push(chunk) {
                        return Err(PkgError::InvalidStream);
                    }
                }
                *write_pos += data.len() as u64;
                Ok(())
            }
        }
    }

    /// Truncates or finalizes a write stream up to `upto`.
    pub fn flush(&mut self, upto: u64) -> PkgResult<()> {
        match self {
            PkgStream::File { file, len, .. } => {
                file.set_len(upto).map_err(|_| PkgError::InvalidStream)?;
                file.sync_all().map_err(|_| PkgError::InvalidStream)?;
                *len = upto;
                Ok(())
            }
            PkgStream::Memory { buf, .. } => {
                buf.truncate(upto as usize);
                Ok(())
            }
            PkgStream::Processor { func, .. } => func(&[], upto, true),
            PkgStream::FlowData { ring, .. } => {
                ring.stop_pop();
                Ok(())
            }
            PkgStream::MemoryMap { .. } => Ok(()),
        }
    }

    /// Uniform cancellation signal for flow-data streams; other variants
    /// ignore it.
    pub fn stop(&self) {
        if let PkgStream::FlowData { ring, .. } = self {
            ring.stop();
        }
    }

    /// Borrow of the in-memory contents for memory and mapped streams.
    pub fn buffer(&self) -> PkgResult<&[u8]> {
        match self {
            PkgStream::Memory { buf, .. } => Ok(buf),
            PkgStream::MemoryMap { map, .. } => Ok(&map[..]),
            _ => Err(PkgError::InvalidParam),
        }
    }

    pub fn into_buffer(self) -> PkgResult<Vec<u8>> {
        match self {
            PkgStream::Memory { buf, .. } => Ok(buf),
            PkgStream::MemoryMap { map, .. } => Ok(map[..].to_vec()),
            _ => Err(PkgError::InvalidParam),
        }
    }
}

fn copy_region(src: &[u8], dst: &mut [u8], offset: u64) -> usize {
    if offset as usize >= src.len() {
        return 0;
    }
    let start = offset as usize;
    let take = dst.len().min(src.len() - start);
    dst[..take].copy_from_slice(&src[start..start + take]);
    take
}

/// `io::Read` window over a stream region, for codecs built on std readers.
pub struct StreamReader<'a> {
    stream: &'a mut PkgStream,
    pos: u64,
    end: u64,
}

impl<'a> StreamReader<'a> {
    pub fn new(stream: &'a mut PkgStream, offset: u64, limit: u64) -> StreamReader<'a> {
        StreamReader {
            stream,
            pos: offset,
            end: offset.saturating_add(limit),
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl io::Read for StreamReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end {
            return Ok(0);
        }
        let want = buf.len().min((self.end - self.pos) as usize);
        let n = self
            .stream
            .read(&mut buf[..want], self.pos)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += n as u64;
        Ok(n)
    }
}

/// `io::Write` adapter appending at a stream offset.
pub struct StreamWriter<'a> {
    stream: &'a mut PkgStream,
    pos: u64,
    start: u64,
}

impl<'a> StreamWriter<'a> {
    pub fn new(stream: &'a mut PkgStream, offset: u64) -> StreamWriter<'a> {
        StreamWriter {
            stream,
            pos: offset,
            start: offset,
        }
    }

    pub fn written(&self) -> u64 {
        self.pos - self.start
    }
}

impl io::Write for StreamWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream
            .write(buf, self.pos)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
