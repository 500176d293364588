// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

pub mod deflate;
pub mod digest;
pub mod lz4;

use crate::constants::DIGEST_MAX_LEN;
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{DigestMethod, FileInfo, PackMethod};
use crate::stream::PkgStream;
use self::digest::DigestAlgorithm;
use std::io;

/// Offsets, sizes and digest carried through one pack/unpack pass.
/// After `pack`, `packed_size` holds the produced byte count; after
/// `unpack`, `unpacked_size` does.
#[derive(Debug, Clone)]
pub struct AlgorithmContext {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub packed_size: u64,
    pub unpacked_size: u64,
    pub digest_method: DigestMethod,
    pub digest: [u8; DIGEST_MAX_LEN],
}

impl Default for AlgorithmContext {
    fn default() -> Self {
        AlgorithmContext {
            src_offset: 0,
            dst_offset: 0,
            packed_size: 0,
            unpacked_size: 0,
            digest_method: DigestMethod::None,
            digest: [0u8; DIGEST_MAX_LEN],
        }
    }
}

impl AlgorithmContext {
    /// The digest always covers the unpacked bytes. On pack the result is
    /// recorded here; on unpack a non-`None` method makes a mismatch fail
    /// with `InvalidDigest`.
    fn start_digest(&self) -> PkgResult<Option<DigestAlgorithm>> {
        match self.digest_method {
            DigestMethod::None => Ok(None),
            method => Ok(Some(DigestAlgorithm::new(method)?)),
        }
    }

    fn record_digest(&mut self, algorithm: Option<DigestAlgorithm>) {
        if let Some(algorithm) = algorithm {
            let out = algorithm.finalize();
            self.digest[..out.len()].copy_from_slice(&out);
        }
    }

    fn check_digest(&self, algorithm: Option<DigestAlgorithm>) -> PkgResult<()> {
        if let Some(algorithm) = algorithm {
            let len = algorithm.method().digest_len();
            let out = algorithm.finalize();
            if out[..] != self.digest[..len] {
                return Err(PkgError::InvalidDigest);
            }
        }
        Ok(())
    }
}

/// One compression algorithm of the dispatch table.
pub trait PkgAlgorithm: Send + Sync {
    fn pack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()>;

    fn unpack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()>;

    /// Back-annotates the codec id and its parameters.
    fn update_file_info(&self, info: &mut FileInfo);
}

/// Stored entries: packed bytes equal unpacked bytes.
struct StoreAlgorithm;

const COPY_CHUNK: usize = 4 * 1024 * 1024;

impl PkgAlgorithm for StoreAlgorithm {
    fn pack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let mut algorithm = ctx.start_digest()?;
        let copied = copy_stream(
            input,
            output,
            ctx.src_offset,
            ctx.dst_offset,
            ctx.unpacked_size,
            &mut algorithm,
        )?;
        ctx.packed_size = copied;
        ctx.record_digest(algorithm);
        Ok(())
    }

    fn unpack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let mut algorithm = ctx.start_digest()?;
        let copied = copy_stream(
            input,
            output,
            ctx.src_offset,
            ctx.dst_offset,
            ctx.packed_size,
            &mut algorithm,
        )?;
        ctx.unpacked_size = copied;
        ctx.check_digest(algorithm.take())
    }

    fn update_file_info(&self, info: &mut FileInfo) {
        info.pack_method = PackMethod::None;
    }
}

fn copy_stream(
    input: &mut PkgStream,
    output: &mut PkgStream,
    src_offset: u64,
    dst_offset: u64,
    len: u64,
    algorithm: &mut Option<DigestAlgorithm>,
) -> PkgResult<u64> {
    let mut buf = vec![0u8; COPY_CHUNK.min(len.max(1) as usize)];
    let mut done = 0u64;
    while done < len {
        let want = buf.len().min((len - done) as usize);
        let n = input.read(&mut buf[..want], src_offset + done)?;
        if n == 0 {
            return Err(PkgError::InvalidFile);
        }
        if let Some(a) = algorithm.as_mut() {
            a.update(&buf[..n]);
        }
        output.write(&buf[..n], dst_offset + done)?;
        done += n as u64;
    }
    Ok(done)
}

/// Typed dispatch table: compression id to algorithm.
pub fn algorithm_for(method: PackMethod) -> PkgResult<&'static dyn PkgAlgorithm> {
    static STORE: StoreAlgorithm = StoreAlgorithm;
    static LZ4_FRAME: lz4::Lz4FrameAlgorithm = lz4::Lz4FrameAlgorithm;
    static LZ4_BLOCK: lz4::Lz4BlockAlgorithm = lz4::Lz4BlockAlgorithm;
    static ZIP: deflate::ZipAlgorithm = deflate::ZipAlgorithm;
    static GZIP: deflate::GzipAlgorithm = deflate::GzipAlgorithm;

    Ok(match method {
        PackMethod::None => &STORE,
        PackMethod::Lz4Frame => &LZ4_FRAME,
        PackMethod::Lz4Block => &LZ4_BLOCK,
        PackMethod::Zip => &ZIP,
        PackMethod::Gzip => &GZIP,
    })
}

/// `io::Read` wrapper that feeds a digest as bytes pass through.
pub(crate) struct DigestingReader<R> {
    inner: R,
    algorithm: Option<DigestAlgorithm>,
}

impl<R: io::Read> DigestingReader<R> {
    pub(crate) fn new(inner: R, algorithm: Option<DigestAlgorithm>) -> Self {
        DigestingReader { inner, algorithm }
    }

    pub(crate) fn into_digest(self) -> Option<DigestAlgorithm> {
        self.algorithm
    }
}

impl<R: io::Read> io::Read for DigestingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(a) = self.algorithm.as_mut() {
            a.update(&buf[..n]);
        }
        Ok(n)
    }
}

/// `io::Write` wrapper that feeds a digest as bytes pass through.
pub(crate) struct DigestingWriter<W> {
    inner: W,
    algorithm: Option<DigestAlgorithm>,
    written: u64,
}

impl<W: io::Write> DigestingWriter<W> {
    pub(crate) fn new(inner: W, algorithm: Option<DigestAlgorithm>) -> Self {
        DigestingWriter {
            inner,
            algorithm,
            written: 0,
        }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    pub(crate) fn into_digest(self) -> Option<DigestAlgorithm> {
        self.algorithm
    }
}

impl<W: io::Write> io::Write for DigestingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(a) = self.algorithm.as_mut() {
            a.update(&buf[..n]);
        }
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_digest(unpacked: u64) -> AlgorithmContext {
        AlgorithmContext {
            unpacked_size: unpacked,
            digest_method: DigestMethod::Sha256,
            ..Default::default()
        }
    }

    #[test]
    fn store_round_trip_records_digest() {
        let data = b"stored component payload".to_vec();
        let mut input = PkgStream::memory("in", data.clone());
        let mut packed = PkgStream::memory("packed", Vec::new());
        let mut ctx = ctx_with_digest(data.len() as u64);

        let algorithm = algorithm_for(PackMethod::None).unwrap();
        algorithm.pack(&mut input, &mut packed, &mut ctx).unwrap();
        assert_eq!(ctx.packed_size, data.len() as u64);

        let mut unpacked = PkgStream::memory("unpacked", Vec::new());
        algorithm
            .unpack(&mut packed, &mut unpacked, &mut ctx)
            .unwrap();
        assert_eq!(unpacked.buffer().unwrap(), &data[..]);
    }

    #[test]
    fn store_unpack_detects_corruption() {
        let data = vec![0x11u8; 512];
        let mut input = PkgStream::memory("in", data.clone());
        let mut packed = PkgStream::memory("packed", Vec::new());
        let mut ctx = ctx_with_digest(data.len() as u64);
        let algorithm = algorithm_for(PackMethod::None).unwrap();
        algorithm.pack(&mut input, &mut packed, &mut ctx).unwrap();

        // flip one byte of the packed stream
        let mut bytes = packed.into_buffer().unwrap();
        bytes[100] ^= 0xFF;
        let mut packed = PkgStream::memory("packed", bytes);
        let mut unpacked = PkgStream::memory("unpacked", Vec::new());
        assert_eq!(
            algorithm
                .unpack(&mut packed, &mut unpacked, &mut ctx)
                .unwrap_err(),
            PkgError::InvalidDigest
        );
    }
}
