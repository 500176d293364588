// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::constants::{
    GZIP_MAGIC, LZ4_BLOCK_MAGIC, LZ4_FRAME_MAGIC, TLV_TYPE_FOR_SHA256, TLV_TYPE_FOR_SHA384,
    ZIP_MAGIC,
};
use crate::errors::{PkgError, PkgResult};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkgType {
    Upgrade,
    Zip,
    Lz4,
    GZip,
}

/// detects package type from magic bytes
pub fn detect_pkg_type(magic: &[u8; 4]) -> PkgResult<PkgType> {
    if magic.starts_with(&ZIP_MAGIC) {
        return Ok(PkgType::Zip);
    }
    if *magic == LZ4_FRAME_MAGIC || *magic == LZ4_BLOCK_MAGIC {
        return Ok(PkgType::Lz4);
    }
    if magic.starts_with(&GZIP_MAGIC) {
        return Ok(PkgType::GZip);
    }
    let tlv_type = read_le16(&magic[0..2]);
    if tlv_type == TLV_TYPE_FOR_SHA256 || tlv_type == TLV_TYPE_FOR_SHA384 {
        return Ok(PkgType::Upgrade);
    }
    Err(PkgError::InvalidPkgFormat)
}

pub fn read_le16(buf: &[u8]) -> u16 {
    u16::from_le_bytes([buf[0], buf[1]])
}

pub fn read_le32(buf: &[u8]) -> u32 {
    u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])
}

pub fn read_le64(buf: &[u8]) -> u64 {
    u64::from_le_bytes([
        buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
    ])
}

pub fn write_le16(buf: &mut [u8], v: u16) {
    buf[..2].copy_from_slice(&v.to_le_bytes());
}

pub fn write_le32(buf: &mut [u8], v: u32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
}

pub fn write_le64(buf: &mut [u8], v: u64) {
    buf[..8].copy_from_slice(&v.to_le_bytes());
}

/// Fixed-size, zero-padded name field. A short destination is an error,
/// never a silent truncation.
pub fn string_to_field(s: &str, len: usize) -> PkgResult<Vec<u8>> {
    let bytes = s.as_bytes();
    if bytes.len() > len {
        return Err(PkgError::InvalidParam);
    }
    let mut out = vec![0u8; len];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

pub fn field_to_string(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_magic_variants() {
        assert_eq!(detect_pkg_type(b"PK\x03\x04").unwrap(), PkgType::Zip);
        assert_eq!(
            detect_pkg_type(&[0x04, 0x22, 0x4D, 0x18]).unwrap(),
            PkgType::Lz4
        );
        assert_eq!(
            detect_pkg_type(&[0x1F, 0x8B, 0x08, 0x00]).unwrap(),
            PkgType::GZip
        );
        assert_eq!(
            detect_pkg_type(&[0x01, 0x00, 0x88, 0x00]).unwrap(),
            PkgType::Upgrade
        );
        assert!(detect_pkg_type(&[0xDE, 0xAD, 0xBE, 0xEF]).is_err());
    }

    #[test]
    fn name_field_round_trip() {
        let field = string_to_field("userdata", 32).unwrap();
        assert_eq!(field.len(), 32);
        assert_eq!(field_to_string(&field), "userdata");
        assert!(string_to_field("much-too-long-for-the-field", 8).is_err());
    }
}
