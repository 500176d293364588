// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::constants::DIGEST_MAX_LEN;
use crate::errors::{PkgError, PkgResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignMethod {
    #[default]
    None,
    Rsa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestMethod {
    #[default]
    None,
    Md5,
    Sha256,
    Sha384,
    Crc32,
}

impl DigestMethod {
    pub fn digest_len(self) -> usize {
        match self {
            DigestMethod::None => 0,
            DigestMethod::Md5 => 16,
            DigestMethod::Sha256 => 32,
            DigestMethod::Sha384 => 48,
            DigestMethod::Crc32 => 4,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            DigestMethod::None => 0,
            DigestMethod::Md5 => 1,
            DigestMethod::Sha256 => 2,
            DigestMethod::Sha384 => 3,
            DigestMethod::Crc32 => 4,
        }
    }

    pub fn from_wire(v: u8) -> PkgResult<DigestMethod> {
        match v {
            0 => Ok(DigestMethod::None),
            1 => Ok(DigestMethod::Md5),
            2 => Ok(DigestMethod::Sha256),
            3 => Ok(DigestMethod::Sha384),
            4 => Ok(DigestMethod::Crc32),
            _ => Err(PkgError::InvalidPkgFormat),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackMethod {
    #[default]
    None,
    Zip,
    Lz4Frame,
    Lz4Block,
    Gzip,
}

impl PackMethod {
    pub fn to_wire(self) -> u8 {
        match self {
            PackMethod::None => 0,
            PackMethod::Zip => 1,
            PackMethod::Lz4Frame => 2,
            PackMethod::Lz4Block => 3,
            PackMethod::Gzip => 4,
        }
    }

    pub fn from_wire(v: u8) -> PkgResult<PackMethod> {
        match v {
            0 => Ok(PackMethod::None),
            1 => Ok(PackMethod::Zip),
            2 => Ok(PackMethod::Lz4Frame),
            3 => Ok(PackMethod::Lz4Block),
            4 => Ok(PackMethod::Gzip),
            _ => Err(PkgError::InvalidPkgFormat),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PkgKind {
    #[default]
    Upgrade,
    Zip,
    Lz4,
    GZip,
}

/// Outer package description, filled while loading.
#[derive(Debug, Clone, Default)]
pub struct PkgInfo {
    pub entry_count: u32,
    /// Byte offset at which component payloads begin.
    pub update_file_head_len: u64,
    pub sign_method: SignMethod,
    pub digest_method: DigestMethod,
    pub pkg_type: PkgKind,
    pub pkg_flags: u32,
}

/// Per inner file description.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub flags: u32,
    pub digest_method: DigestMethod,
    pub pack_method: PackMethod,
    pub modified_time: u64,
    pub packed_size: u64,
    pub unpacked_size: u64,
    pub header_offset: u64,
    pub data_offset: u64,
    /// Unique within a package.
    pub identity: String,
}

/// Region variants used for device matching.
pub mod res_type {
    pub const GENERIC: u8 = 0;
    pub const ES: u8 = 1;
    pub const CS: u8 = 2;
    pub const VERIFIED_CS: u8 = 3;
}

/// Component kinds inside an upgrade container.
pub mod comp_type {
    pub const IMAGE: u8 = 0;
    pub const VERSION: u8 = 1;
    pub const BOARD_ID: u8 = 2;
}

/// FileInfo of an upgrade-container component plus its table fields.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub file: FileInfo,
    pub version: String,
    pub digest: [u8; DIGEST_MAX_LEN],
    pub id: u16,
    pub res_type: u8,
    pub comp_type: u8,
    pub comp_flags: u8,
    pub original_size: u32,
}

impl Default for ComponentInfo {
    fn default() -> Self {
        ComponentInfo {
            file: FileInfo::default(),
            version: String::new(),
            digest: [0u8; DIGEST_MAX_LEN],
            id: 0,
            res_type: res_type::GENERIC,
            comp_type: 0,
            comp_flags: 0,
            original_size: 0,
        }
    }
}

pub const UPGRADE_FILE_VERSION_V1: u32 = 1;
pub const UPGRADE_FILE_VERSION_V2: u32 = 2;
pub const UPGRADE_FILE_VERSION_V3: u32 = 3;
pub const UPGRADE_FILE_VERSION_V4: u32 = 4;

/// PkgInfo of an upgrade container plus its header fields. Higher
/// `update_file_version` values are supersets of lower ones.
#[derive(Debug, Clone, Default)]
pub struct UpgradePkgInfo {
    pub pkg_info: PkgInfo,
    pub update_file_version: u32,
    pub product_update_id: String,
    pub software_version: String,
    pub date: String,
    pub time: String,
    pub descript_package_id: String,
}

/// LZ4 codec preferences carried next to a FileInfo.
#[derive(Debug, Clone)]
pub struct Lz4FileInfo {
    pub file: FileInfo,
    pub compression_level: u8,
    pub block_independence: bool,
    pub block_size_id: u8,
    pub content_checksum_flag: bool,
    pub auto_flush: bool,
}

impl Default for Lz4FileInfo {
    fn default() -> Self {
        Lz4FileInfo {
            file: FileInfo::default(),
            compression_level: 3,
            block_independence: true,
            block_size_id: 0,
            content_checksum_flag: false,
            auto_flush: true,
        }
    }
}

/// Deflate parameters of a zip entry.
#[derive(Debug, Clone, Default)]
pub struct ZipFileInfo {
    pub file: FileInfo,
    pub method: u16,
    pub crc32: u32,
    pub level: u32,
}
