// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::constants::EOCD_SIGNATURE;
use crate::errors::{PkgError, PkgResult};
use crate::stream::PkgStream;
use crate::utils::{read_le16, read_le32, write_le16};
use log::error;

const ZIP_EOCD_LEN_EXCLUDE_COMMENT: usize = 20;
const ZIP_EOCD_FIXED_PART_LEN: usize = 22;
pub const PKG_FOOTER_SIZE: usize = 6;
const PKG_ZIP_EOCD_MIN_LEN: usize = ZIP_EOCD_FIXED_PART_LEN + PKG_FOOTER_SIZE;
const PKG_ZIP_EOCD_FOOTER_FLAG: u16 = 0xFFFF;
const SOURCE_DATA_WRITE_BLOCK_LEN: usize = 4096;

/// Where the signature comment sits at the end of a signed outer package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipSignInfo {
    /// First byte of the comment region, `file_len - total_len`.
    pub signature_start: u64,
    /// Whole comment length, footer included.
    pub signature_size: u64,
    /// Signature blob + footer length (reversed offset of the blob).
    pub append_len: u16,
    /// The `.ZIP file comment length` value.
    pub total_len: u16,
}

/// ZIP:  File Entry(1..n) + CD(1..n) + EOCD(1)
///
/// EOCD: FLAG(4 bytes) + FIX PART1(16 bytes) + comment length(2 bytes) +
///       comment('comment length' bytes)
///
/// EOCD comment: RESERVED(18 bytes) + SIGNATURE(variable size) + FOOTER(6)
///
/// FOOTER                            6 bytes (little endian)
///     append signed result length   2 bytes = SIGNATURE len + FOOTER len
///     0xFFFF                        2 bytes
///     = .ZIP file comment length    2 bytes
pub fn parse_zip_pkg(stream: &mut PkgStream) -> PkgResult<ZipSignInfo> {
    let file_len = stream.len();
    if file_len <= PKG_FOOTER_SIZE as u64 {
        error!("file len {} below footer size", file_len);
        return Err(PkgError::InvalidFile);
    }
    let mut footer = [0u8; PKG_FOOTER_SIZE];
    if stream.read(&mut footer, file_len - PKG_FOOTER_SIZE as u64)? != PKG_FOOTER_SIZE {
        error!("read footer failed for {}", stream.name());
        return Err(PkgError::InvalidFile);
    }
    let (append_len, total_len) = parse_pkg_footer(&footer)?;

    let eocd_total_len = ZIP_EOCD_FIXED_PART_LEN + total_len as usize;
    if file_len <= eocd_total_len as u64 {
        error!("invalid eocd len {}", eocd_total_len);
        return Err(PkgError::InvalidPkgFormat);
    }
    let eocd_start = file_len - eocd_total_len as u64;
    let mut eocd = vec![0u8; eocd_total_len];
    if stream.read(&mut eocd, eocd_start)? != eocd_total_len {
        error!("read zip eocd failed for {}", stream.name());
        return Err(PkgError::InvalidFile);
    }
    check_zip_eocd(&eocd, total_len)?;

    Ok(ZipSignInfo {
        signature_start: file_len - total_len as u64,
        signature_size: total_len as u64,
        append_len,
        total_len,
    })
}

fn parse_pkg_footer(footer: &[u8]) -> PkgResult<(u16, u16)> {
    if footer.len() < PKG_FOOTER_SIZE {
        return Err(PkgError::InvalidParam);
    }
    let append_len = read_le16(&footer[0..]);
    let flag = read_le16(&footer[2..]);
    let total_len = read_le16(&footer[4..]);
    if flag != PKG_ZIP_EOCD_FOOTER_FLAG {
        error!("error footer flag {:#06x}", flag);
        return Err(PkgError::InvalidPkgFormat);
    }
    if (append_len as usize) < PKG_FOOTER_SIZE
        || (total_len as usize) < PKG_FOOTER_SIZE
        || append_len > total_len
    {
        error!(
            "bad footer length: append {:#06x} total {:#06x}",
            append_len, total_len
        );
        return Err(PkgError::InvalidPkgFormat);
    }
    Ok((append_len, total_len))
}

fn check_zip_eocd(eocd: &[u8], total_len: u16) -> PkgResult<()> {
    if eocd.len() < PKG_ZIP_EOCD_MIN_LEN {
        error!("bad eocd length {}", eocd.len());
        return Err(PkgError::InvalidPkgFormat);
    }
    if eocd[0..4] != EOCD_SIGNATURE {
        error!("bad zip eocd flag {:#010x}", read_le32(eocd));
        return Err(PkgError::InvalidPkgFormat);
    }
    // no stray EOCD marker may occur after the start of the record
    for i in 4..eocd.len() - 3 {
        if eocd[i..i + 4] == EOCD_SIGNATURE {
            error!("EOCD marker occurs after start of EOCD");
            return Err(PkgError::InvalidPkgFormat);
        }
    }
    let comment_len = read_le16(&eocd[ZIP_EOCD_LEN_EXCLUDE_COMMENT..]);
    if comment_len != total_len {
        error!(
            "sign comment length mismatch: eocd {:#06x} footer {:#06x}",
            comment_len, total_len
        );
        return Err(PkgError::InvalidPkgFormat);
    }
    Ok(())
}

/// An unsigned source package must still end in a bare EOCD.
pub fn check_zip_pkg(stream: &mut PkgStream) -> PkgResult<()> {
    let file_len = stream.len();
    if file_len <= ZIP_EOCD_FIXED_PART_LEN as u64 {
        error!("invalid file len {}", file_len);
        return Err(PkgError::InvalidFile);
    }
    let mut eocd = [0u8; ZIP_EOCD_FIXED_PART_LEN];
    if stream.read(&mut eocd, file_len - ZIP_EOCD_FIXED_PART_LEN as u64)?
        != ZIP_EOCD_FIXED_PART_LEN
    {
        return Err(PkgError::InvalidFile);
    }
    if eocd[0..4] != EOCD_SIGNATURE {
        error!("zip pkg has been signed already");
        return Err(PkgError::InvalidFile);
    }
    Ok(())
}

/// Inverse of `parse_zip_pkg`: copies the source zip up to its comment-len
/// field, patches that field, appends the PKCS#7 blob and the footer.
pub fn write_zip_signed_data(
    out: &mut PkgStream,
    p7_data: &[u8],
    input: &mut PkgStream,
) -> PkgResult<()> {
    check_zip_pkg(input)?;
    let file_len = input.len();
    let src_data_len = file_len - 2;
    write_source_package_data(out, input, src_data_len)?;
    let mut offset = src_data_len;

    let comment_len = (p7_data.len() + PKG_FOOTER_SIZE) as u16;
    let mut field = [0u8; 2];
    write_le16(&mut field, comment_len);
    out.write(&field, offset)?;
    offset += 2;

    out.write(p7_data, offset)?;
    offset += p7_data.len() as u64;

    let mut footer = [0u8; PKG_FOOTER_SIZE];
    write_le16(&mut footer[0..], comment_len);
    write_le16(&mut footer[2..], PKG_ZIP_EOCD_FOOTER_FLAG);
    write_le16(&mut footer[4..], comment_len);
    out.write(&footer, offset)?;
    out.flush(offset + PKG_FOOTER_SIZE as u64)
}

fn write_source_package_data(
    out: &mut PkgStream,
    input: &mut PkgStream,
    write_len: u64,
) -> PkgResult<()> {
    let mut buf = vec![0u8; SOURCE_DATA_WRITE_BLOCK_LEN];
    let mut offset = 0u64;
    while offset < write_len {
        let want = buf.len().min((write_len - offset) as usize);
        let n = input.read(&mut buf[..want], offset)?;
        if n == 0 {
            return Err(PkgError::InvalidFile);
        }
        out.write(&buf[..n], offset)?;
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::zip_file::ZipPkgFile;

    fn plain_zip() -> Vec<u8> {
        let mut zip = ZipPkgFile::new(PkgStream::memory("src.zip", Vec::new()));
        let mut input = PkgStream::memory("update.bin", vec![0x11u8; 2048]);
        zip.add_entry("update.bin", &mut input, 0).unwrap();
        zip.save().unwrap();
        zip.into_stream().into_buffer().unwrap()
    }

    fn signed_zip(p7: &[u8]) -> Vec<u8> {
        let mut input = PkgStream::memory("src.zip", plain_zip());
        let mut out = PkgStream::memory("signed.zip", Vec::new());
        write_zip_signed_data(&mut out, p7, &mut input).unwrap();
        out.into_buffer().unwrap()
    }

    #[test]
    fn signed_footer_invariants() {
        let p7 = vec![0xC7u8; 734];
        let bytes = signed_zip(&p7);
        let mut stream = PkgStream::memory("signed.zip", bytes);
        let info = parse_zip_pkg(&mut stream).unwrap();
        assert_eq!(
            info.signature_start + info.signature_size,
            stream.len()
        );
        assert!(info.signature_size >= PKG_FOOTER_SIZE as u64);
        assert_eq!(info.append_len, (p7.len() + PKG_FOOTER_SIZE) as u16);
        assert_eq!(info.total_len, info.append_len);

        // the signature blob reads back exactly
        let blob_len = info.append_len as usize - PKG_FOOTER_SIZE;
        let mut blob = vec![0u8; blob_len];
        stream.read(&mut blob, info.signature_start).unwrap();
        assert_eq!(blob, p7);
    }

    #[test]
    fn unsigned_zip_is_rejected() {
        let mut stream = PkgStream::memory("src.zip", plain_zip());
        assert!(parse_zip_pkg(&mut stream).is_err());
        // but passes the pre-sign check
        check_zip_pkg(&mut stream).unwrap();
    }

    #[test]
    fn bad_footer_flag_is_rejected() {
        let mut bytes = signed_zip(&[0xC7u8; 64]);
        let len = bytes.len();
        bytes[len - 4] = 0x00; // clobber the 0xFFFF flag
        let mut stream = PkgStream::memory("signed.zip", bytes);
        assert_eq!(
            parse_zip_pkg(&mut stream).unwrap_err(),
            PkgError::InvalidPkgFormat
        );
    }

    #[test]
    fn stray_eocd_marker_in_comment_is_rejected() {
        let mut p7 = vec![0xC7u8; 64];
        p7[10..14].copy_from_slice(&EOCD_SIGNATURE);
        let bytes = signed_zip(&p7);
        let mut stream = PkgStream::memory("signed.zip", bytes);
        assert_eq!(
            parse_zip_pkg(&mut stream).unwrap_err(),
            PkgError::InvalidPkgFormat
        );
    }

    #[test]
    fn double_signing_is_rejected() {
        let signed = signed_zip(&[0xC7u8; 64]);
        let mut input = PkgStream::memory("signed.zip", signed);
        let mut out = PkgStream::memory("twice.zip", Vec::new());
        assert!(write_zip_signed_data(&mut out, &[0u8; 8], &mut input).is_err());
    }
}
