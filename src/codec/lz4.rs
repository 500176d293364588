// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::{AlgorithmContext, DigestingReader, DigestingWriter, PkgAlgorithm};
use crate::constants::{LZ4_BLOCK_MAGIC, LZ4_MAX_BLOCK_SIZE};
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{FileInfo, PackMethod};
use crate::stream::{PkgStream, StreamReader, StreamWriter};
use crate::utils::{read_le32, write_le32};
use log::error;
use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use std::io;

/// Maps the four-bit block-size id of the frame preferences to the frame
/// format's block sizes. Id 0 keeps the encoder default.
fn block_size_from_id(id: u8) -> PkgResult<BlockSize> {
    match id {
        0 => Ok(BlockSize::Auto),
        4 => Ok(BlockSize::Max64KB),
        5 => Ok(BlockSize::Max256KB),
        6 => Ok(BlockSize::Max1MB),
        7 => Ok(BlockSize::Max4MB),
        _ => {
            error!("invalid lz4 block size id {}", id);
            Err(PkgError::InvalidLz4)
        }
    }
}

/// LZ4 frame format (4-byte magic handled by the frame codec itself).
pub struct Lz4FrameAlgorithm;

impl Lz4FrameAlgorithm {
    fn frame_info(&self) -> FrameInfo {
        // preferences of Lz4FileInfo::default(); per-entry overrides come
        // through pack_with_info
        FrameInfo::new()
            .block_size(BlockSize::Auto)
            .block_mode(BlockMode::Independent)
    }

    pub fn pack_with_info(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
        info: &crate::package::info::Lz4FileInfo,
    ) -> PkgResult<()> {
        let frame = FrameInfo::new()
            .block_size(block_size_from_id(info.block_size_id)?)
            .block_mode(if info.block_independence {
                BlockMode::Independent
            } else {
                BlockMode::Linked
            })
            .content_checksum(info.content_checksum_flag);
        self.do_pack(input, output, ctx, frame)
    }

    fn do_pack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
        frame: FrameInfo,
    ) -> PkgResult<()> {
        let algorithm = ctx.start_digest()?;
        let unpacked = ctx.unpacked_size;
        let src_offset = ctx.src_offset;
        let dst_offset = ctx.dst_offset;

        let mut reader = DigestingReader::new(
            StreamReader::new(input, src_offset, unpacked),
            algorithm,
        );
        let writer = StreamWriter::new(output, dst_offset);
        let mut encoder = FrameEncoder::with_frame_info(frame, writer);
        io::copy(&mut reader, &mut encoder).map_err(|e| {
            error!("lz4 frame pack failed: {}", e);
            PkgError::InvalidLz4
        })?;
        let writer = encoder.finish().map_err(|e| {
            error!("lz4 frame finish failed: {}", e);
            PkgError::InvalidLz4
        })?;
        ctx.packed_size = writer.written();
        ctx.record_digest(reader.into_digest());
        Ok(())
    }
}

impl PkgAlgorithm for Lz4FrameAlgorithm {
    fn pack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let frame = self.frame_info();
        self.do_pack(input, output, ctx, frame)
    }

    fn unpack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let algorithm = ctx.start_digest()?;
        let packed = ctx.packed_size;
        let src_offset = ctx.src_offset;
        let dst_offset = ctx.dst_offset;

        let reader = StreamReader::new(input, src_offset, packed);
        let mut decoder = FrameDecoder::new(reader);
        let mut writer = DigestingWriter::new(StreamWriter::new(output, dst_offset), algorithm);
        io::copy(&mut decoder, &mut writer).map_err(|e| {
            error!("lz4 frame unpack failed: {}", e);
            PkgError::InvalidLz4
        })?;
        ctx.unpacked_size = writer.written();
        ctx.check_digest(writer.into_digest())
    }

    fn update_file_info(&self, info: &mut FileInfo) {
        info.pack_method = PackMethod::Lz4Frame;
    }
}

/// Custom block layout: 4-byte magic, then `{u32 packed_len, bytes}`
/// repeated. Every block unpacks to at most 4 MiB.
pub struct Lz4BlockAlgorithm;

impl PkgAlgorithm for Lz4BlockAlgorithm {
    fn pack(
        &self,
        input: &mut PkgStream,
        output: &mut PkgStream,
        ctx: &mut AlgorithmContext,
    ) -> PkgResult<()> {
        let mut algorithm = ctx.start_digest()?;
        let mut src = ctx.src_offset;
        let mut dst = ctx.dst_offset;
        let mut remaining = ctx.unpacked_size;

        output.write(&LZ4_BLOCK_MAGIC, dst)?;
        dst += LZ4_BLOCK_MAGIC.len() as u64;

        let mut buf = vec![0u8; LZ4_MAX_BLOCK_SIZE];
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = input.read(&mut buf[..want], src)?;
            if n == 0 {
                return Err(PkgError::InvalidFile);
            }
            if let Some(a) = algorithm.as_mut() {
                a.update(&buf[..n]);
            }
            let packed = lz4_flex::block::compress(&buf[..n]);
            let mut len_field = [0u8; 4];
            write_le32(&mut len_field, packed.len() as u32);
            output.write(&len_field, dst)?;
            output.write(&packed, dst + 4)?;
            dst += 4 + packed.len() as u64;
            src += n as u64;
            remaining -= n as u64;
        }
        ctx.packed_size = dst - ctx.dst_offset;
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
        let mut src = ctx.src_offset;
        let end = ctx.src_offset + ctx.packed_size;
        let mut dst = ctx.dst_offset;

        let mut magic = [0u8; 4];
        if input.read(&mut magic, src)? != 4 || magic != LZ4_BLOCK_MAGIC {
            error!("bad lz4 block magic {:02X?}", magic);
            return Err(PkgError::InvalidLz4);
        }
        src += 4;

        while src < end {
            let mut len_field = [0u8; 4];
            if input.read(&mut len_field, src)? != 4 {
                return Err(PkgError::InvalidLz4);
            }
            let packed_len = read_le32(&len_field) as usize;
            if packed_len == 0 || src + 4 + packed_len as u64 > end {
                error!("lz4 block length {} out of bounds", packed_len);
                return Err(PkgError::InvalidLz4);
            }
            let mut packed = vec![0u8; packed_len];
            if input.read(&mut packed, src + 4)? != packed_len {
                return Err(PkgError::InvalidLz4);
            }
            let block = lz4_flex::block::decompress(&packed, LZ4_MAX_BLOCK_SIZE).map_err(|e| {
                error!("lz4 block unpack failed: {}", e);
                PkgError::InvalidLz4
            })?;
            if let Some(a) = algorithm.as_mut() {
                a.update(&block);
            }
            output.write(&block, dst)?;
            dst += block.len() as u64;
            src += 4 + packed_len as u64;
        }
        ctx.unpacked_size = dst - ctx.dst_offset;
        ctx.check_digest(algorithm)
    }

    fn update_file_info(&self, info: &mut FileInfo) {
        info.pack_method = PackMethod::Lz4Block;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::algorithm_for;
    use crate::package::info::DigestMethod;

    fn sha_ctx(unpacked: u64) -> AlgorithmContext {
        AlgorithmContext {
            unpacked_size: unpacked,
            digest_method: DigestMethod::Sha256,
            ..Default::default()
        }
    }

    #[test]
    fn frame_round_trip_compresses_constant_input() {
        // 4 MiB of 0xA5 must shrink and round-trip
        let data = vec![0xA5u8; 4 * 1024 * 1024];
        let mut input = PkgStream::memory("in", data.clone());
        let mut packed = PkgStream::memory("packed", Vec::new());
        let mut ctx = sha_ctx(data.len() as u64);

        let algorithm = algorithm_for(PackMethod::Lz4Frame).unwrap();
        algorithm.pack(&mut input, &mut packed, &mut ctx).unwrap();
        assert!(ctx.packed_size < data.len() as u64);

        let mut unpacked = PkgStream::memory("unpacked", Vec::new());
        algorithm
            .unpack(&mut packed, &mut unpacked, &mut ctx)
            .unwrap();
        assert_eq!(ctx.unpacked_size, data.len() as u64);
        assert_eq!(unpacked.buffer().unwrap(), &data[..]);
    }

    #[test]
    fn frame_unpack_rejects_mutated_stream() {
        let data = (0..100_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let mut input = PkgStream::memory("in", data.clone());
        let mut packed = PkgStream::memory("packed", Vec::new());
        let mut ctx = sha_ctx(data.len() as u64);
        let algorithm = algorithm_for(PackMethod::Lz4Frame).unwrap();
        algorithm.pack(&mut input, &mut packed, &mut ctx).unwrap();

        let mut bytes = packed.into_buffer().unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x40;
        let mut packed = PkgStream::memory("packed", bytes);
        let mut unpacked = PkgStream::memory("unpacked", Vec::new());
        assert!(algorithm.unpack(&mut packed, &mut unpacked, &mut ctx).is_err());
    }

    #[test]
    fn block_round_trip_spans_multiple_blocks() {
        // crosses the 4 MiB block boundary
        let data = (0..5_000_000u32).map(|i| (i % 253) as u8).collect::<Vec<_>>();
        let mut input = PkgStream::memory("in", data.clone());
        let mut packed = PkgStream::memory("packed", Vec::new());
        let mut ctx = sha_ctx(data.len() as u64);

        let algorithm = algorithm_for(PackMethod::Lz4Block).unwrap();
        algorithm.pack(&mut input, &mut packed, &mut ctx).unwrap();

        let mut unpacked = PkgStream::memory("unpacked", Vec::new());
        algorithm
            .unpack(&mut packed, &mut unpacked, &mut ctx)
            .unwrap();
        assert_eq!(unpacked.buffer().unwrap(), &data[..]);
    }

    #[test]
    fn block_unpack_rejects_bad_magic() {
        let mut packed = PkgStream::memory("packed", vec![0u8; 64]);
        let mut unpacked = PkgStream::memory("unpacked", Vec::new());
        let mut ctx = AlgorithmContext {
            packed_size: 64,
            ..Default::default()
        };
        let algorithm = algorithm_for(PackMethod::Lz4Block).unwrap();
        assert_eq!(
            algorithm
                .unpack(&mut packed, &mut unpacked, &mut ctx)
                .unwrap_err(),
            PkgError::InvalidLz4
        );
    }
}
