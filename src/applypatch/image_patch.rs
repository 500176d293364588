// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::deflate::{deflate_raw, inflate_raw};
use crate::errors::{PkgError, PkgResult};
use crate::utils::{read_le32, read_le64};
use log::{error, info};
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const IMGDIFF_MAGIC: &[u8; 8] = b"IMGDIFF2";

const CHUNK_NORMAL: u32 = 0;
const CHUNK_DEFLATE: u32 = 1;
const CHUNK_RAW: u32 = 2;

/// Applies a whole-image patch: IMGDIFF2 chunk streams are walked here,
/// plain bsdiff blobs go straight to the patch library.
pub fn apply_image_patch(src: &[u8], patch: &[u8]) -> PkgResult<Vec<u8>> {
    if patch.len() >= IMGDIFF_MAGIC.len() && &patch[..IMGDIFF_MAGIC.len()] == IMGDIFF_MAGIC {
        apply_imgdiff(src, patch)
    } else {
        apply_bsdiff(src, patch)
    }
}

pub fn apply_bsdiff(src: &[u8], patch: &[u8]) -> PkgResult<Vec<u8>> {
    let mut out = Vec::new();
    bsdiff_android::patch_bsdf2(src, patch, &mut out).map_err(|e| {
        error!("bsdiff patch failed: {}", e);
        PkgError::InvalidPkgFormat
    })?;
    Ok(out)
}

/// IMGDIFF2 layout (all integers little endian):
///   magic(8) | u32 chunk_count | chunks
/// chunk:
///   u32 type = NORMAL(0): u64 src_start, u64 src_len, u32 patch_len, patch
///              DEFLATE(1): u64 src_start, u64 src_len, u64 expanded_len,
///                          u32 level, u32 patch_len, patch
///              RAW(2):     u32 data_len, data
/// NORMAL and DEFLATE chunks run bsdiff over their source window; DEFLATE
/// inflates the window first and re-deflates the patched bytes with the
/// recorded level.
fn apply_imgdiff(src: &[u8], patch: &[u8]) -> PkgResult<Vec<u8>> {
    let mut pos = IMGDIFF_MAGIC.len();
    let chunk_count = read_field32(patch, &mut pos)?;
    let mut out = Vec::new();
    for _ in 0..chunk_count {
        let chunk_type = read_field32(patch, &mut pos)?;
        match chunk_type {
            CHUNK_NORMAL => {
                let src_start = read_field64(patch, &mut pos)? as usize;
                let src_len = read_field64(patch, &mut pos)? as usize;
                let patch_len = read_field32(patch, &mut pos)? as usize;
                let window = src_window(src, src_start, src_len)?;
                let chunk_patch = patch_slice(patch, &mut pos, patch_len)?;
                out.extend_from_slice(&apply_bsdiff(window, chunk_patch)?);
            }
            CHUNK_DEFLATE => {
                let src_start = read_field64(patch, &mut pos)? as usize;
                let src_len = read_field64(patch, &mut pos)? as usize;
                let expanded_len = read_field64(patch, &mut pos)? as usize;
                let level = read_field32(patch, &mut pos)?;
                let patch_len = read_field32(patch, &mut pos)? as usize;
                let window = src_window(src, src_start, src_len)?;
                let chunk_patch = patch_slice(patch, &mut pos, patch_len)?;

                let expanded = inflate_raw(window)?;
                if expanded.len() != expanded_len {
                    error!(
                        "deflate chunk expanded to {} of {}",
                        expanded.len(),
                        expanded_len
                    );
                    return Err(PkgError::InvalidPkgFormat);
                }
                let patched = apply_bsdiff(&expanded, chunk_patch)?;
                out.extend_from_slice(&deflate_raw(&patched, level)?);
            }
            CHUNK_RAW => {
                let data_len = read_field32(patch, &mut pos)? as usize;
                out.extend_from_slice(patch_slice(patch, &mut pos, data_len)?);
            }
            other => {
                error!("unknown imgdiff chunk type {}", other);
                return Err(PkgError::InvalidPkgFormat);
            }
        }
    }
    Ok(out)
}

fn read_field32(patch: &[u8], pos: &mut usize) -> PkgResult<u32> {
    if *pos + 4 > patch.len() {
        return Err(PkgError::InvalidPkgFormat);
    }
    let v = read_le32(&patch[*pos..]);
    *pos += 4;
    Ok(v)
}

fn read_field64(patch: &[u8], pos: &mut usize) -> PkgResult<u64> {
    if *pos + 8 > patch.len() {
        return Err(PkgError::InvalidPkgFormat);
    }
    let v = read_le64(&patch[*pos..]);
    *pos += 8;
    Ok(v)
}

fn patch_slice<'a>(patch: &'a [u8], pos: &mut usize, len: usize) -> PkgResult<&'a [u8]> {
    if *pos + len > patch.len() {
        return Err(PkgError::InvalidPkgFormat);
    }
    let out = &patch[*pos..*pos + len];
    *pos += len;
    Ok(out)
}

fn src_window(src: &[u8], start: usize, len: usize) -> PkgResult<&[u8]> {
    if start + len > src.len() {
        error!("imgdiff source window {}+{} out of bounds", start, len);
        return Err(PkgError::InvalidPkgFormat);
    }
    Ok(&src[start..start + len])
}

/// Maps the first `size` bytes of a partition backing.
pub fn map_partition(path: &Path, size: u64) -> PkgResult<Mmap> {
    let file = File::open(path).map_err(|_| PkgError::InvalidFile)?;
    let map = unsafe {
        memmap2::MmapOptions::new()
            .len(size as usize)
            .map(&file)
            .map_err(|_| PkgError::NoneMemory)?
    };
    Ok(map)
}

/// SHA-256 hex of the first `size` bytes of a partition.
pub fn calc_partition_sha(path: &Path, size: u64) -> PkgResult<String> {
    use sha2::{Digest, Sha256};
    let mut file = File::open(path).map_err(|_| PkgError::InvalidFile)?;
    let mut hasher = Sha256::new();
    let mut remaining = size;
    let mut buf = vec![0u8; 1024 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want]).map_err(|_| PkgError::InvalidStream)?;
        if n == 0 {
            return Err(PkgError::InvalidFile);
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Pre-step of an image patch: the partition's current bytes must hash to
/// the expected source.
pub fn image_sha_check(path: &Path, size: u64, expected_hex: &str) -> PkgResult<()> {
    let got = calc_partition_sha(path, size)?;
    if !got.eq_ignore_ascii_case(expected_hex) {
        error!("partition sha mismatch on {}", path.display());
        return Err(PkgError::InvalidDigest);
    }
    info!("image sha check ok for {}", path.display());
    Ok(())
}

/// Copies the first `size` bytes of the partition aside so a failed patch
/// can retry from pristine source.
pub fn create_backup(dev_path: &Path, backup_path: &Path, size: u64) -> PkgResult<()> {
    let mut src = File::open(dev_path).map_err(|_| PkgError::InvalidFile)?;
    let mut dst = File::create(backup_path).map_err(|_| PkgError::InvalidStream)?;
    let mut remaining = size;
    let mut buf = vec![0u8; 1024 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = src.read(&mut buf[..want]).map_err(|_| PkgError::InvalidStream)?;
        if n == 0 {
            return Err(PkgError::InvalidFile);
        }
        std::io::Write::write_all(&mut dst, &buf[..n]).map_err(|_| PkgError::InvalidStream)?;
        remaining -= n as u64;
    }
    dst.sync_all().map_err(|_| PkgError::InvalidStream)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::utils::{write_le32, write_le64};

    pub fn raw_chunk(data: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 8];
        write_le32(&mut out[0..], CHUNK_RAW);
        write_le32(&mut out[4..], data.len() as u32);
        out.extend_from_slice(data);
        out
    }

    pub fn deflate_chunk(
        src_start: u64,
        src_len: u64,
        expanded_len: u64,
        level: u32,
        patch: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![0u8; 36];
        write_le32(&mut out[0..], CHUNK_DEFLATE);
        write_le64(&mut out[4..], src_start);
        write_le64(&mut out[12..], src_len);
        write_le64(&mut out[20..], expanded_len);
        write_le32(&mut out[28..], level);
        write_le32(&mut out[32..], patch.len() as u32);
        out.extend_from_slice(patch);
        out
    }

    pub fn imgdiff(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = IMGDIFF_MAGIC.to_vec();
        let mut count = [0u8; 4];
        write_le32(&mut count, chunks.len() as u32);
        out.extend_from_slice(&count);
        for chunk in chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}
