// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::{AlgorithmContext, DigestingReader, DigestingWriter, PkgAlgorithm};
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{FileInfo, PackMethod};
use crate::stream::{PkgStream, StreamReader, StreamWriter};
use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use log::error;
use std::io::{self, Write};

/// Raw deflate as used inside zip entries. The container writes the local
/// and central records around this payload itself.
pub struct ZipAlgorithm;

impl PkgAlgorithm for ZipAlgorithm {
    fn pack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let algorithm = ctx.start_digest()?;
        let mut reader = DigestingReader::new(
            StreamReader::new(input, ctx.src_offset, ctx.unpacked_size),
            algorithm,
        );
        let writer = StreamWriter::new(output, ctx.dst_offset);
        let mut encoder = DeflateEncoder::new(writer, Compression::default());
        io::copy(&mut reader, &mut encoder).map_err(|e| {
            error!("deflate pack failed: {}", e);
            PkgError::InvalidStream
        })?;
        let writer = encoder.finish().map_err(|e| {
            error!("deflate finish failed: {}", e);
            PkgError::InvalidStream
        })?;
        ctx.packed_size = writer.written();
        ctx.record_digest(reader.into_digest());
        Ok(())
    }

    fn unpack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let algorithm = ctx.start_digest()?;
        let reader = StreamReader::new(input, ctx.src_offset, ctx.packed_size);
        let mut decoder = DeflateDecoder::new(reader);
        let mut writer =
            DigestingWriter::new(StreamWriter::new(output, ctx.dst_offset), algorithm);
        io::copy(&mut decoder, &mut writer).map_err(|e| {
            error!("inflate failed: {}", e);
            PkgError::InvalidPkgFormat
        })?;
        ctx.unpacked_size = writer.written();
        ctx.check_digest(writer.into_digest())
    }

    fn update_file_info(&self, info: &mut FileInfo) {
        info.pack_method = PackMethod::Zip;
    }
}

/// Single-member gzip.
pub struct GzipAlgorithm;

impl PkgAlgorithm for GzipAlgorithm {
    fn pack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let algorithm = ctx.start_digest()?;
        let mut reader = DigestingReader::new(
            StreamReader::new(input, ctx.src_offset, ctx.unpacked_size),
            algorithm,
        );
        let writer = StreamWriter::new(output, ctx.dst_offset);
        let mut encoder = GzEncoder::new(writer, Compression::default());
        io::copy(&mut reader, &mut encoder).map_err(|e| {
            error!("gzip pack failed: {}", e);
            PkgError::InvalidStream
        })?;
        let writer = encoder.finish().map_err(|e| {
            error!("gzip finish failed: {}", e);
            PkgError::InvalidStream
        })?;
        ctx.packed_size = writer.written();
        ctx.record_digest(reader.into_digest());
        Ok(())
    }

    fn unpack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let algorithm = ctx.start_digest()?;
        let reader = StreamReader::new(input, ctx.src_offset, ctx.packed_size);
        let mut decoder = GzDecoder::new(reader);
        let mut writer =
            DigestingWriter::new(StreamWriter::new(output, ctx.dst_offset), algorithm);
        io::copy(&mut decoder, &mut writer).map_err(|e| {
            error!("gunzip failed: {}", e);
            PkgError::InvalidPkgFormat
        })?;
        ctx.unpacked_size = writer.written();
        ctx.check_digest(writer.into_digest())
    }

    fn update_file_info(&self, info: &mut FileInfo) {
        info.pack_method = PackMethod::Gzip;
    }
}

/// One-shot raw-deflate helpers for the image-patch executor.
pub fn inflate_raw(data: &[u8]) -> PkgResult<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    io::Read::read_to_end(&mut decoder, &mut out).map_err(|e| {
        error!("inflate failed: {}", e);
        PkgError::InvalidPkgFormat
    })?;
    Ok(out)
}

pub fn deflate_raw(data: &[u8], level: u32) -> PkgResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data).map_err(|_| PkgError::InvalidStream)?;
    encoder.finish().map_err(|_| PkgError::InvalidStream)
}
