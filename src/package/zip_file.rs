// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::{algorithm_for, AlgorithmContext};
use crate::constants::{
    CENTRAL_DIR_HEADER_SIGNATURE, DIGEST_MAX_LEN, EOCD_SIGNATURE, LOCAL_FILE_HEADER_SIGNATURE,
    ZIP64_EOCD_LOCATOR_SIGNATURE, ZIP64_EOCD_SIGNATURE,
};
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{DigestMethod, FileInfo, PackMethod, ZipFileInfo};
use crate::stream::PkgStream;
use crate::utils::{read_le16, read_le32, read_le64, write_le16, write_le32, write_le64};
use log::{error, info};

const LOCAL_HEADER_LEN: usize = 30;
const CENTRAL_HEADER_LEN: usize = 46;
const EOCD_LEN: usize = 22;
const ZIP64_EOCD_LEN: usize = 56;
const ZIP64_LOCATOR_LEN: usize = 20;
const ZIP64_SENTINEL32: u32 = u32::MAX;
const ZIP64_SENTINEL16: u16 = u16::MAX;
const ZIP64_EXTRA_ID: u16 = 0x0001;
/// EOCD + max comment.
const EOCD_SEARCH_WINDOW: u64 = (EOCD_LEN + u16::MAX as usize) as u64;

const METHOD_STORE: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

/// Classic ZIP container with local + central directory entries and Zip64
/// escapes when any size crosses the 32-bit sentinel.
pub struct ZipPkgFile {
    stream: PkgStream,
    entries: Vec<ZipFileInfo>,
    write_offset: u64,
    closed: bool,
}

impl ZipPkgFile {
    pub fn new(stream: PkgStream) -> ZipPkgFile {
        ZipPkgFile {
            stream,
            entries: Vec::new(),
            write_offset: 0,
            closed: false,
        }
    }

    pub fn entries(&self) -> &[ZipFileInfo] {
        &self.entries
    }

    pub fn stream_mut(&mut self) -> &mut PkgStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> PkgStream {
        self.stream
    }

    // ---- write path ----

    /// Compresses `input` as the next entry. The local header is written
    /// after the payload so sizes and CRC are final, never patched.
    pub fn add_entry(&mut self, name: &str, input: &mut PkgStream, method: u16) -> PkgResult<()> {
        if self.closed {
            return Err(PkgError::InvalidState);
        }
        if name.is_empty() || name.len() > u16::MAX as usize {
            return Err(PkgError::InvalidParam);
        }
        let local_offset = self.write_offset;
        let data_offset = local_offset + (LOCAL_HEADER_LEN + name.len()) as u64;
        let unpacked_size = input.len();

        let pack_method = match method {
            METHOD_STORE => PackMethod::None,
            METHOD_DEFLATE => PackMethod::Zip,
            _ => return Err(PkgError::InvalidParam),
        };
        let algorithm = algorithm_for(pack_method)?;
        let mut ctx = AlgorithmContext {
            src_offset: 0,
            dst_offset: data_offset,
            packed_size: 0,
            unpacked_size,
            digest_method: DigestMethod::Crc32,
            digest: [0u8; DIGEST_MAX_LEN],
        };
        algorithm.pack(input, &mut self.stream, &mut ctx)?;
        let crc = read_le32(&ctx.digest[..4]);

        let mut header = vec![0u8; LOCAL_HEADER_LEN + name.len()];
        header[0..4].copy_from_slice(&LOCAL_FILE_HEADER_SIGNATURE);
        write_le16(&mut header[4..], 20); // version needed
        write_le16(&mut header[8..], method);
        write_le32(&mut header[14..], crc);
        write_le32(&mut header[18..], clamp32(ctx.packed_size));
        write_le32(&mut header[22..], clamp32(unpacked_size));
        write_le16(&mut header[26..], name.len() as u16);
        header[LOCAL_HEADER_LEN..].copy_from_slice(name.as_bytes());
        self.stream.write(&header, local_offset)?;

        self.write_offset = data_offset + ctx.packed_size;
        self.entries.push(ZipFileInfo {
            file: FileInfo {
                identity: name.to_string(),
                pack_method,
                packed_size: ctx.packed_size,
                unpacked_size,
                header_offset: local_offset,
                data_offset,
                digest_method: DigestMethod::Crc32,
                ..Default::default()
            },
            method,
            crc32: crc,
            level: 0,
        });
        Ok(())
    }

    /// Appends the central directory and end records.
    pub fn save(&mut self) -> PkgResult<u64> {
        if self.closed {
            return Err(PkgError::InvalidState);
        }
        let cd_offset = self.write_offset;
        let mut cd = Vec::new();
        for entry in &self.entries {
            let name = entry.file.identity.as_bytes();
            let needs_zip64 = entry.file.packed_size >= ZIP64_SENTINEL32 as u64
                || entry.file.unpacked_size >= ZIP64_SENTINEL32 as u64
                || entry.file.header_offset >= ZIP64_SENTINEL32 as u64;
            let mut extra = Vec::new();
            if needs_zip64 {
                let mut field = vec![0u8; 4 + 24];
                write_le16(&mut field[0..], ZIP64_EXTRA_ID);
                write_le16(&mut field[2..], 24);
                write_le64(&mut field[4..], entry.file.unpacked_size);
                write_le64(&mut field[12..], entry.file.packed_size);
                write_le64(&mut field[20..], entry.file.header_offset);
                extra = field;
            }

            let mut record = vec![0u8; CENTRAL_HEADER_LEN];
            record[0..4].copy_from_slice(&CENTRAL_DIR_HEADER_SIGNATURE);
            write_le16(&mut record[4..], 20);
            write_le16(&mut record[6..], 20);
            write_le16(&mut record[10..], entry.method);
            write_le32(&mut record[16..], entry.crc32);
            write_le32(&mut record[20..], clamp32(entry.file.packed_size));
            write_le32(&mut record[24..], clamp32(entry.file.unpacked_size));
            write_le16(&mut record[28..], name.len() as u16);
            write_le16(&mut record[30..], extra.len() as u16);
            write_le32(&mut record[42..], clamp32(entry.file.header_offset));
            cd.extend_from_slice(&record);
            cd.extend_from_slice(name);
            cd.extend_from_slice(&extra);
        }
        self.stream.write(&cd, cd_offset)?;
        let mut end_offset = cd_offset + cd.len() as u64;

        let needs_zip64 = self.entries.len() >= ZIP64_SENTINEL16 as usize
            || cd_offset >= ZIP64_SENTINEL32 as u64
            || cd.len() as u64 >= ZIP64_SENTINEL32 as u64;
        if needs_zip64 {
            let zip64_offset = end_offset;
            let mut record = vec![0u8; ZIP64_EOCD_LEN];
            record[0..4].copy_from_slice(&ZIP64_EOCD_SIGNATURE);
            write_le64(&mut record[4..], (ZIP64_EOCD_LEN - 12) as u64);
            write_le16(&mut record[12..], 45);
            write_le16(&mut record[14..], 45);
            write_le64(&mut record[24..], self.entries.len() as u64);
            write_le64(&mut record[32..], self.entries.len() as u64);
            write_le64(&mut record[40..], cd.len() as u64);
            write_le64(&mut record[48..], cd_offset);
            self.stream.write(&record, zip64_offset)?;
            end_offset += ZIP64_EOCD_LEN as u64;

            let mut locator = vec![0u8; ZIP64_LOCATOR_LEN];
            locator[0..4].copy_from_slice(&ZIP64_EOCD_LOCATOR_SIGNATURE);
            write_le64(&mut locator[8..], zip64_offset);
            write_le32(&mut locator[16..], 1);
            self.stream.write(&locator, end_offset)?;
            end_offset += ZIP64_LOCATOR_LEN as u64;
        }

        let mut eocd = vec![0u8; EOCD_LEN];
        eocd[0..4].copy_from_slice(&EOCD_SIGNATURE);
        write_le16(&mut eocd[8..], clamp16(self.entries.len() as u64));
        write_le16(&mut eocd[10..], clamp16(self.entries.len() as u64));
        write_le32(&mut eocd[12..], clamp32(cd.len() as u64));
        write_le32(&mut eocd[16..], clamp32(cd_offset));
        self.stream.write(&eocd, end_offset)?;
        let file_len = end_offset + EOCD_LEN as u64;
        self.stream.flush(file_len)?;
        self.closed = true;
        info!("zip save done, {} entries, {} bytes", self.entries.len(), file_len);
        Ok(file_len)
    }

    // ---- read path ----

    /// Parses the central directory into entry infos.
    pub fn load(&mut self) -> PkgResult<Vec<String>> {
        let file_len = self.stream.len();
        let (cd_offset, cd_size, entry_count) = self.locate_central_directory(file_len)?;
        if cd_offset + cd_size > file_len {
            error!("central directory out of bounds");
            return Err(PkgError::InvalidPkgFormat);
        }

        let mut cd = vec![0u8; cd_size as usize];
        if self.stream.read(&mut cd, cd_offset)? != cd.len() {
            return Err(PkgError::InvalidFile);
        }

        let mut names = Vec::new();
        let mut pos = 0usize;
        for _ in 0..entry_count {
            if pos + CENTRAL_HEADER_LEN > cd.len()
                || cd[pos..pos + 4] != CENTRAL_DIR_HEADER_SIGNATURE
            {
                error!("bad central directory record at {}", pos);
                return Err(PkgError::InvalidPkgFormat);
            }
            let method = read_le16(&cd[pos + 10..]);
            let crc = read_le32(&cd[pos + 16..]);
            let mut packed = read_le32(&cd[pos + 20..]) as u64;
            let mut unpacked = read_le32(&cd[pos + 24..]) as u64;
            let name_len = read_le16(&cd[pos + 28..]) as usize;
            let extra_len = read_le16(&cd[pos + 30..]) as usize;
            let comment_len = read_le16(&cd[pos + 32..]) as usize;
            let mut local_offset = read_le32(&cd[pos + 42..]) as u64;

            let name_start = pos + CENTRAL_HEADER_LEN;
            if name_start + name_len + extra_len + comment_len > cd.len() {
                return Err(PkgError::InvalidPkgFormat);
            }
            let name = String::from_utf8_lossy(&cd[name_start..name_start + name_len]).into_owned();

            // Zip64 extra: 8-byte replacements, in field order, only for
            // fields that carry the sentinel
            let extra = &cd[name_start + name_len..name_start + name_len + extra_len];
            let mut epos = 0usize;
            while epos + 4 <= extra.len() {
                let id = read_le16(&extra[epos..]);
                let len = read_le16(&extra[epos + 2..]) as usize;
                if epos + 4 + len > extra.len() {
                    break;
                }
                if id == ZIP64_EXTRA_ID {
                    let mut fpos = epos + 4;
                    if unpacked == ZIP64_SENTINEL32 as u64 && fpos + 8 <= epos + 4 + len {
                        unpacked = read_le64(&extra[fpos..]);
                        fpos += 8;
                    }
                    if packed == ZIP64_SENTINEL32 as u64 && fpos + 8 <= epos + 4 + len {
                        packed = read_le64(&extra[fpos..]);
                        fpos += 8;
                    }
                    if local_offset == ZIP64_SENTINEL32 as u64 && fpos + 8 <= epos + 4 + len {
                        local_offset = read_le64(&extra[fpos..]);
                    }
                }
                epos += 4 + len;
            }

            let pack_method = match method {
                METHOD_STORE => PackMethod::None,
                METHOD_DEFLATE => PackMethod::Zip,
                _ => {
                    error!("unsupported zip method {} for {}", method, name);
                    return Err(PkgError::InvalidPkgFormat);
                }
            };

            let data_offset = self.local_data_offset(local_offset)?;
            names.push(name.clone());
            self.entries.push(ZipFileInfo {
                file: FileInfo {
                    identity: name,
                    pack_method,
                    packed_size: packed,
                    unpacked_size: unpacked,
                    header_offset: local_offset,
                    data_offset,
                    digest_method: DigestMethod::Crc32,
                    ..Default::default()
                },
                method,
                crc32: crc,
                level: 0,
            });
            pos = name_start + name_len + extra_len + comment_len;
        }
        self.write_offset = file_len;
        self.closed = true;
        Ok(names)
    }

    fn locate_central_directory(&mut self, file_len: u64) -> PkgResult<(u64, u64, u64)> {
        if file_len < EOCD_LEN as u64 {
            return Err(PkgError::InvalidFile);
        }
        let window = EOCD_SEARCH_WINDOW.min(file_len);
        let window_start = file_len - window;
        let mut tail = vec![0u8; window as usize];
        if self.stream.read(&mut tail, window_start)? != tail.len() {
            return Err(PkgError::InvalidFile);
        }

        let mut eocd_pos = None;
        for i in (0..=tail.len() - EOCD_LEN).rev() {
            if tail[i..i + 4] == EOCD_SIGNATURE {
                let comment_len = read_le16(&tail[i + 20..]) as usize;
                if i + EOCD_LEN + comment_len == tail.len() {
                    eocd_pos = Some(i);
                    break;
                }
            }
        }
        let eocd_pos = eocd_pos.ok_or_else(|| {
            error!("no end-of-central-directory record");
            PkgError::InvalidPkgFormat
        })?;
        let eocd = &tail[eocd_pos..];
        let mut entry_count = read_le16(&eocd[10..]) as u64;
        let mut cd_size = read_le32(&eocd[12..]) as u64;
        let mut cd_offset = read_le32(&eocd[16..]) as u64;

        let needs_zip64 = entry_count == ZIP64_SENTINEL16 as u64
            || cd_size == ZIP64_SENTINEL32 as u64
            || cd_offset == ZIP64_SENTINEL32 as u64;
        if needs_zip64 {
            let locator_pos = window_start + eocd_pos as u64;
            if locator_pos < ZIP64_LOCATOR_LEN as u64 {
                return Err(PkgError::InvalidPkgFormat);
            }
            let mut locator = [0u8; ZIP64_LOCATOR_LEN];
            if self
                .stream
                .read(&mut locator, locator_pos - ZIP64_LOCATOR_LEN as u64)?
                != ZIP64_LOCATOR_LEN
                || locator[0..4] != ZIP64_EOCD_LOCATOR_SIGNATURE
            {
                error!("zip64 locator missing");
                return Err(PkgError::InvalidPkgFormat);
            }
            let zip64_offset = read_le64(&locator[8..]);
            let mut record = [0u8; ZIP64_EOCD_LEN];
            if self.stream.read(&mut record, zip64_offset)? != ZIP64_EOCD_LEN
                || record[0..4] != ZIP64_EOCD_SIGNATURE
            {
                error!("zip64 end record missing");
                return Err(PkgError::InvalidPkgFormat);
            }
            entry_count = read_le64(&record[32..]);
            cd_size = read_le64(&record[40..]);
            cd_offset = read_le64(&record[48..]);
        }
        Ok((cd_offset, cd_size, entry_count))
    }

    fn local_data_offset(&mut self, local_offset: u64) -> PkgResult<u64> {
        let mut header = [0u8; LOCAL_HEADER_LEN];
        if self.stream.read(&mut header, local_offset)? != LOCAL_HEADER_LEN
            || header[0..4] != LOCAL_FILE_HEADER_SIGNATURE
        {
            error!("bad local file header at {}", local_offset);
            return Err(PkgError::InvalidPkgFormat);
        }
        let name_len = read_le16(&header[26..]) as u64;
        let extra_len = read_le16(&header[28..]) as u64;
        Ok(local_offset + LOCAL_HEADER_LEN as u64 + name_len + extra_len)
    }

    /// Inflates one entry into `output` and checks its CRC.
    pub fn extract(&mut self, name: &str, output: &mut PkgStream) -> PkgResult<u64> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.file.identity == name)
            .cloned()
            .ok_or(PkgError::InvalidFile)?;
        let algorithm = algorithm_for(entry.file.pack_method)?;
        let mut ctx = AlgorithmContext {
            src_offset: entry.file.data_offset,
            dst_offset: 0,
            packed_size: entry.file.packed_size,
            unpacked_size: entry.file.unpacked_size,
            digest_method: DigestMethod::Crc32,
            digest: [0u8; DIGEST_MAX_LEN],
        };
        write_le32(&mut ctx.digest[..4], entry.crc32);
        algorithm.unpack(&mut self.stream, output, &mut ctx)?;
        if ctx.unpacked_size != entry.file.unpacked_size {
            error!(
                "zip entry {} inflated to {} of {}",
                name, ctx.unpacked_size, entry.file.unpacked_size
            );
            return Err(PkgError::InvalidPkgFormat);
        }
        Ok(ctx.unpacked_size)
    }
}

fn clamp32(v: u64) -> u32 {
    if v >= ZIP64_SENTINEL32 as u64 {
        ZIP64_SENTINEL32
    } else {
        v as u32
    }
}

fn clamp16(v: u64) -> u16 {
    if v >= ZIP64_SENTINEL16 as u64 {
        ZIP64_SENTINEL16
    } else {
        v as u16
    }
}
