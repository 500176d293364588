// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::digest::DigestAlgorithm;
use crate::codec::{algorithm_for, AlgorithmContext};
use crate::constants::{
    DIGEST_MAX_LEN, SIGN_SHA256_LEN, SIGN_TOTAL_LEN, TLV_TYPE_COMPONENT, TLV_TYPE_FOR_SHA256,
    TLV_TYPE_FOR_SHA384, TLV_TYPE_IMG_HASH, TLV_TYPE_TIME, UPGRADE_RESERVE_LEN,
};
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{
    ComponentInfo, DigestMethod, PkgKind, SignMethod, UpgradePkgInfo, UPGRADE_FILE_VERSION_V2,
};
use crate::stream::PkgStream;
use crate::utils::{field_to_string, read_le16, read_le32, string_to_field, write_le16, write_le32};
use log::{error, info};

const TLV_LEN: usize = 4;
const PKG_HEADER_LEN: usize = 4 + 4 + 64 + 64;
const PKG_TIME_LEN: usize = 16 + 16;
const COMP_INFO_LEN: usize = 32 + 2 + 1 + 1 + 1 + 10 + 4 + 4 + DIGEST_MAX_LEN;
/// Header TLV + header + time TLV + time + component-table TLV.
const UPGRADE_FILE_HEADER_LEN: usize = 3 * TLV_LEN + PKG_HEADER_LEN + PKG_TIME_LEN;

const BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Caller-supplied check of `(pkg_info, digest, signature)`.
pub type VerifyFn<'a> = &'a dyn Fn(&UpgradePkgInfo, &[u8], &[u8]) -> PkgResult<()>;

/// Caller-supplied signer producing the trailer bytes for a digest.
pub type SignFn<'a> = &'a dyn Fn(&[u8]) -> PkgResult<Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Idle,
    Working,
    Closed,
}

/// The "update.bin" TLV container. Components are packed contiguously in
/// declaration order behind a fixed-length signed head.
pub struct UpgradePkgFile {
    stream: PkgStream,
    pkg_info: UpgradePkgInfo,
    entries: Vec<ComponentInfo>,
    img_hash_data: Vec<u8>,
    packed_file_size: u64,
    state: FileState,
}

impl UpgradePkgFile {
    pub fn new(stream: PkgStream, pkg_info: UpgradePkgInfo) -> UpgradePkgFile {
        UpgradePkgFile {
            stream,
            pkg_info,
            entries: Vec::new(),
            img_hash_data: Vec::new(),
            packed_file_size: 0,
            state: FileState::Idle,
        }
    }

    pub fn pkg_info(&self) -> &UpgradePkgInfo {
        &self.pkg_info
    }

    pub fn entries(&self) -> &[ComponentInfo] {
        &self.entries
    }

    pub fn stream_mut(&mut self) -> &mut PkgStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> PkgStream {
        self.stream
    }

    pub fn signature_len() -> usize {
        SIGN_TOTAL_LEN
    }

    fn check_state(&mut self, allowed: &[FileState], next: FileState) -> PkgResult<()> {
        if !allowed.contains(&self.state) {
            error!("upgrade file state error, curr {:?}", self.state);
            return Err(PkgError::InvalidState);
        }
        self.state = next;
        Ok(())
    }

    fn digest_method_tlv(&self) -> u16 {
        match self.pkg_info.pkg_info.digest_method {
            DigestMethod::Sha384 => TLV_TYPE_FOR_SHA384,
            _ => TLV_TYPE_FOR_SHA256,
        }
    }

    /// Offset of the first component payload given the parsed table.
    fn head_len(&self) -> u64 {
        (UPGRADE_FILE_HEADER_LEN
            + self.entries.len() * COMP_INFO_LEN
            + self.img_hash_len()
            + UPGRADE_RESERVE_LEN
            + SIGN_TOTAL_LEN) as u64
    }

    fn img_hash_len(&self) -> usize {
        if self.img_hash_data.is_empty() {
            0
        } else {
            TLV_LEN + self.img_hash_data.len()
        }
    }

    // ---- save path ----

    /// Packs one component behind the previously added ones and writes its
    /// table entry. Only valid before `save_package`.
    pub fn add_entry(
        &mut self,
        comp: &ComponentInfo,
        input: &mut PkgStream,
    ) -> PkgResult<ComponentInfo> {
        self.check_state(&[FileState::Idle, FileState::Working], FileState::Working)?;
        if self.entries.len() as u32 >= self.pkg_info.pkg_info.entry_count {
            error!(
                "more entries than declared for {}: {}",
                comp.file.identity,
                self.entries.len()
            );
            return Err(PkgError::InvalidParam);
        }
        info!("add file {} to package", comp.file.identity);

        let entry_count = self.pkg_info.pkg_info.entry_count as usize;
        let data_offset = (UPGRADE_FILE_HEADER_LEN
            + entry_count * COMP_INFO_LEN
            + UPGRADE_RESERVE_LEN
            + SIGN_TOTAL_LEN) as u64
            + self.packed_file_size;

        let mut entry = comp.clone();
        let algorithm = algorithm_for(entry.file.pack_method)?;
        let mut ctx = AlgorithmContext {
            src_offset: 0,
            dst_offset: data_offset,
            packed_size: 0,
            unpacked_size: entry.file.unpacked_size,
            digest_method: DigestMethod::Sha256,
            digest: [0u8; DIGEST_MAX_LEN],
        };
        algorithm.pack(input, &mut self.stream, &mut ctx)?;
        entry.digest = ctx.digest;
        entry.file.packed_size = ctx.packed_size;
        entry.file.data_offset = data_offset;
        self.packed_file_size += ctx.packed_size;

        let header_offset = (UPGRADE_FILE_HEADER_LEN + self.entries.len() * COMP_INFO_LEN) as u64;
        entry.file.header_offset = header_offset;
        let record = encode_comp_info(&entry)?;
        self.stream.write(&record, header_offset)?;

        info!(
            "header offset:{} data offset:{} packed size:{}",
            header_offset, data_offset, entry.file.packed_size
        );
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Emits head and trailer, digests the canonical bytes (signature
    /// region zero-filled) and back-patches the signature produced by
    /// `signer`. Returns the signature offset.
    pub fn save_package(&mut self, signer: SignFn) -> PkgResult<u64> {
        self.check_state(&[FileState::Working], FileState::Closed)?;
        info!("save package {}", self.stream.name());
        if self.entries.len() as u32 != self.pkg_info.pkg_info.entry_count {
            error!(
                "entry count mismatch: declared {} got {}",
                self.pkg_info.pkg_info.entry_count,
                self.entries.len()
            );
            return Err(PkgError::InvalidParam);
        }

        let mut head = vec![0u8; UPGRADE_FILE_HEADER_LEN];
        let mut offset = 0usize;

        // package header TLV; the type field encodes the digest algorithm
        write_le16(&mut head[offset..], self.digest_method_tlv());
        write_le16(&mut head[offset + 2..], PKG_HEADER_LEN as u16);
        offset += TLV_LEN;
        let pkg_info_length = 3 * TLV_LEN
            + PKG_HEADER_LEN
            + PKG_TIME_LEN
            + self.entries.len() * COMP_INFO_LEN
            + UPGRADE_RESERVE_LEN;
        write_le32(&mut head[offset..], pkg_info_length as u32);
        write_le32(&mut head[offset + 4..], self.pkg_info.update_file_version);
        head[offset + 8..offset + 72]
            .copy_from_slice(&string_to_field(&self.pkg_info.product_update_id, 64)?);
        head[offset + 72..offset + 136]
            .copy_from_slice(&string_to_field(&self.pkg_info.software_version, 64)?);
        offset += PKG_HEADER_LEN;

        // time TLV
        write_le16(&mut head[offset..], TLV_TYPE_TIME);
        write_le16(&mut head[offset + 2..], PKG_TIME_LEN as u16);
        offset += TLV_LEN;
        head[offset..offset + 16].copy_from_slice(&string_to_field(&self.pkg_info.date, 16)?);
        head[offset + 16..offset + 32].copy_from_slice(&string_to_field(&self.pkg_info.time, 16)?);
        offset += PKG_TIME_LEN;

        // component table TLV
        write_le16(&mut head[offset..], TLV_TYPE_COMPONENT);
        write_le16(
            &mut head[offset + 2..],
            (self.entries.len() * COMP_INFO_LEN) as u16,
        );
        self.stream.write(&head, 0)?;

        // reserve + zero-filled signature trailer
        let reserve_offset =
            (UPGRADE_FILE_HEADER_LEN + self.entries.len() * COMP_INFO_LEN) as u64;
        let mut tail = vec![0u8; UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN];
        tail[..UPGRADE_RESERVE_LEN]
            .copy_from_slice(&string_to_field(&self.pkg_info.descript_package_id, 16)?);
        self.stream.write(&tail, reserve_offset)?;

        // canonical digest, then back-patch the signature
        let digest = self.calc_canonical_digest()?;
        let sign = signer(&digest)?;
        let sign_offset = reserve_offset + UPGRADE_RESERVE_LEN as u64;
        let area_len = match self.pkg_info.pkg_info.digest_method {
            DigestMethod::Sha384 => crate::constants::SIGN_SHA384_LEN,
            _ => SIGN_SHA256_LEN,
        };
        if sign.is_empty() || sign.len() > area_len {
            error!("signature length {} out of range", sign.len());
            return Err(PkgError::InvalidSignature);
        }
        let area_offset = match self.pkg_info.pkg_info.digest_method {
            DigestMethod::Sha384 => sign_offset + SIGN_SHA256_LEN as u64,
            _ => sign_offset,
        };
        self.stream.write(&sign, area_offset)?;
        let file_len = self.head_len() + self.packed_file_size;
        self.stream.flush(file_len)?;
        info!(
            "save package success file length:{} sign offset:{}",
            file_len, sign_offset
        );
        Ok(sign_offset)
    }

    /// Digest over head + reserve + zeroed signature + payloads, the same
    /// canonical byte sequence the load path checks.
    fn calc_canonical_digest(&mut self) -> PkgResult<Vec<u8>> {
        let mut algorithm = DigestAlgorithm::new(self.pkg_info.pkg_info.digest_method)?;
        let head_len = self.head_len();
        let sign_offset = head_len - SIGN_TOTAL_LEN as u64;
        let file_len = self.stream.len();

        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut offset = 0u64;
        while offset < file_len {
            let want = buf.len().min((file_len - offset) as usize);
            let n = self.stream.read(&mut buf[..want], offset)?;
            if n == 0 {
                return Err(PkgError::InvalidFile);
            }
            // the signature region digests as zeros
            let chunk_start = offset;
            let chunk_end = offset + n as u64;
            if chunk_end > sign_offset && chunk_start < head_len {
                let zero_from = sign_offset.max(chunk_start) - chunk_start;
                let zero_to = head_len.min(chunk_end) - chunk_start;
                buf[zero_from as usize..zero_to as usize].fill(0);
            }
            algorithm.update(&buf[..n]);
            offset = chunk_end;
        }
        Ok(algorithm.finalize())
    }

    // ---- load path ----

    /// Parses and verifies the container; returns the component names.
    pub fn load_package(&mut self, verifier: VerifyFn) -> PkgResult<Vec<String>> {
        self.check_state(&[FileState::Idle], FileState::Working)?;
        info!("load package {}", self.stream.name());
        let file_len = self.stream.len();
        let min_len =
            (UPGRADE_FILE_HEADER_LEN + COMP_INFO_LEN + UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN) as u64;
        if file_len < min_len {
            error!("invalid file {} len {}", self.stream.name(), file_len);
            return Err(PkgError::InvalidFile);
        }

        let mut algorithm = self.read_upgrade_pkg_header()?;
        let names = self.read_components(&mut algorithm)?;
        self.read_img_hash_data(&mut algorithm)?;
        let sign_data = self.read_package_info(&mut algorithm)?;

        let head_len = self.head_len();
        self.pkg_info.pkg_info.update_file_head_len = head_len;
        if head_len > file_len {
            error!("head length {} exceeds file {}", head_len, file_len);
            return Err(PkgError::InvalidFile);
        }
        let payload_end = head_len + self.entries.iter().map(|e| e.file.packed_size).sum::<u64>();
        if payload_end > file_len {
            error!("component payloads exceed file length");
            return Err(PkgError::InvalidFile);
        }

        // stream the payload region
        let mut buf = vec![0u8; BUFFER_SIZE];
        let mut offset = head_len;
        while offset < file_len {
            let want = buf.len().min((file_len - offset) as usize);
            let n = self.stream.read(&mut buf[..want], offset)?;
            if n == 0 {
                return Err(PkgError::InvalidFile);
            }
            algorithm.update(&buf[..n]);
            offset += n as u64;
        }

        let digest = algorithm.finalize();
        if verifier(&self.pkg_info, &digest, &sign_data).is_err() {
            error!("fail to verify signature of {}", self.stream.name());
            return Err(PkgError::InvalidSignature);
        }
        self.state = FileState::Closed;
        Ok(names)
    }

    fn read_upgrade_pkg_header(&mut self) -> PkgResult<DigestAlgorithm> {
        let mut head = vec![0u8; UPGRADE_FILE_HEADER_LEN];
        if self.stream.read(&mut head, 0)? != head.len() {
            error!("fail to read header of {}", self.stream.name());
            return Err(PkgError::InvalidFile);
        }

        self.pkg_info.pkg_info.pkg_type = PkgKind::Upgrade;
        self.pkg_info.pkg_info.sign_method = SignMethod::Rsa;
        let tlv_type = read_le16(&head[0..]);
        let tlv_len = read_le16(&head[2..]) as usize;
        self.pkg_info.pkg_info.digest_method = match tlv_type {
            TLV_TYPE_FOR_SHA256 => DigestMethod::Sha256,
            TLV_TYPE_FOR_SHA384 => DigestMethod::Sha384,
            _ => {
                error!("invalid header tlv type {:#06x}", tlv_type);
                return Err(PkgError::InvalidPkgFormat);
            }
        };
        if tlv_len != PKG_HEADER_LEN {
            error!("invalid header tlv length {}", tlv_len);
            return Err(PkgError::InvalidPkgFormat);
        }

        let mut offset = TLV_LEN;
        self.pkg_info.update_file_version = read_le32(&head[offset + 4..]);
        self.pkg_info.product_update_id = field_to_string(&head[offset + 8..offset + 72]);
        self.pkg_info.software_version = field_to_string(&head[offset + 72..offset + 136]);
        offset += PKG_HEADER_LEN;

        let time_type = read_le16(&head[offset..]);
        let time_len = read_le16(&head[offset + 2..]) as usize;
        if time_type != TLV_TYPE_TIME || time_len != PKG_TIME_LEN {
            error!("invalid time tlv type {} length {}", time_type, time_len);
            return Err(PkgError::InvalidFile);
        }
        offset += TLV_LEN;
        self.pkg_info.date = field_to_string(&head[offset..offset + 16]);
        self.pkg_info.time = field_to_string(&head[offset + 16..offset + 32]);

        let mut algorithm = DigestAlgorithm::new(self.pkg_info.pkg_info.digest_method)?;
        algorithm.update(&head);
        Ok(algorithm)
    }

    fn read_components(&mut self, algorithm: &mut DigestAlgorithm) -> PkgResult<Vec<String>> {
        let file_len = self.stream.len();
        let table_tlv_offset = (UPGRADE_FILE_HEADER_LEN - TLV_LEN) as u64;
        let mut tlv = [0u8; TLV_LEN];
        if self.stream.read(&mut tlv, table_tlv_offset)? != TLV_LEN {
            return Err(PkgError::InvalidFile);
        }
        let tlv_type = read_le16(&tlv[0..]);
        let tlv_len = read_le16(&tlv[2..]) as usize;
        if tlv_type != TLV_TYPE_COMPONENT
            || tlv_len < COMP_INFO_LEN
            || tlv_len % COMP_INFO_LEN != 0
            || (tlv_len + TLV_LEN) as u64 >= file_len
        {
            error!("invalid component tlv type {} length {}", tlv_type, tlv_len);
            return Err(PkgError::InvalidFile);
        }

        let count = tlv_len / COMP_INFO_LEN;
        let mut table = vec![0u8; tlv_len];
        if self
            .stream
            .read(&mut table, UPGRADE_FILE_HEADER_LEN as u64)?
            != tlv_len
        {
            return Err(PkgError::InvalidFile);
        }
        algorithm.update(&table);

        let mut names = Vec::with_capacity(count);
        for i in 0..count {
            let record = &table[i * COMP_INFO_LEN..(i + 1) * COMP_INFO_LEN];
            let mut entry = decode_comp_info(record)?;
            entry.file.header_offset = (UPGRADE_FILE_HEADER_LEN + i * COMP_INFO_LEN) as u64;
            info!(
                "component {} packed size {} unpacked size {}",
                entry.file.identity, entry.file.packed_size, entry.file.unpacked_size
            );
            names.push(entry.file.identity.clone());
            self.entries.push(entry);
        }
        self.pkg_info.pkg_info.entry_count = count as u32;
        Ok(names)
    }

    /// V2+ packages may carry an image-hash table TLV between the component
    /// table and the reserve bytes.
    fn read_img_hash_data(&mut self, algorithm: &mut DigestAlgorithm) -> PkgResult<()> {
        if self.pkg_info.update_file_version < UPGRADE_FILE_VERSION_V2 {
            return Ok(());
        }
        let offset = (UPGRADE_FILE_HEADER_LEN + self.entries.len() * COMP_INFO_LEN) as u64;
        let mut tlv = [0u8; TLV_LEN];
        if self.stream.read(&mut tlv, offset)? != TLV_LEN {
            return Err(PkgError::InvalidFile);
        }
        if read_le16(&tlv[0..]) != TLV_TYPE_IMG_HASH {
            return Ok(());
        }
        let tlv_len = read_le16(&tlv[2..]) as usize;
        if (offset + (TLV_LEN + tlv_len) as u64) > self.stream.len() {
            error!("invalid image hash tlv length {}", tlv_len);
            return Err(PkgError::InvalidFile);
        }
        let mut data = vec![0u8; tlv_len];
        if self.stream.read(&mut data, offset + TLV_LEN as u64)? != tlv_len {
            return Err(PkgError::InvalidFile);
        }
        algorithm.update(&tlv);
        algorithm.update(&data);
        self.img_hash_data = data;
        Ok(())
    }

    /// Reads reserve + signature; digests them with the signature region
    /// zero-filled (the canonical pre-sign representation) and fixes up the
    /// component data offsets.
    fn read_package_info(&mut self, algorithm: &mut DigestAlgorithm) -> PkgResult<Vec<u8>> {
        let reserve_offset = (UPGRADE_FILE_HEADER_LEN
            + self.entries.len() * COMP_INFO_LEN
            + self.img_hash_len()) as u64;
        let mut tail = vec![0u8; UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN];
        if self.stream.read(&mut tail, reserve_offset)? != tail.len() {
            error!("read sign data fail");
            return Err(PkgError::InvalidFile);
        }
        self.pkg_info.descript_package_id = field_to_string(&tail[..UPGRADE_RESERVE_LEN]);

        let sign_data = match self.pkg_info.pkg_info.digest_method {
            DigestMethod::Sha384 => tail[UPGRADE_RESERVE_LEN + SIGN_SHA256_LEN..].to_vec(),
            _ => tail[UPGRADE_RESERVE_LEN..UPGRADE_RESERVE_LEN + SIGN_SHA256_LEN].to_vec(),
        };
        tail[UPGRADE_RESERVE_LEN..].fill(0);
        algorithm.update(&tail);

        // payload offsets follow the declaration order contiguously
        let mut data_offset = self.head_len();
        for entry in &mut self.entries {
            entry.file.data_offset = data_offset;
            data_offset += entry.file.packed_size;
        }
        Ok(sign_data)
    }
}

/// Byte length of the signed head once enough prefix bytes are present;
/// `None` asks for more input. Serves the streaming bin-flow path, which
/// never holds the whole container.
pub fn upgrade_head_len(prefix: &[u8]) -> PkgResult<Option<u64>> {
    if prefix.len() < UPGRADE_FILE_HEADER_LEN {
        return Ok(None);
    }
    let comp_tlv_offset = UPGRADE_FILE_HEADER_LEN - TLV_LEN;
    if read_le16(&prefix[comp_tlv_offset..]) != TLV_TYPE_COMPONENT {
        return Err(PkgError::InvalidPkgFormat);
    }
    let comp_len = read_le16(&prefix[comp_tlv_offset + 2..]) as usize;
    if comp_len < COMP_INFO_LEN || comp_len % COMP_INFO_LEN != 0 {
        return Err(PkgError::InvalidPkgFormat);
    }
    let base = UPGRADE_FILE_HEADER_LEN + comp_len;
    // a V2+ container may interpose an image-hash TLV before the reserve
    if prefix.len() < base + TLV_LEN {
        return Ok(None);
    }
    let mut head_len = base;
    if read_le16(&prefix[base..]) == TLV_TYPE_IMG_HASH {
        head_len += TLV_LEN + read_le16(&prefix[base + 2..]) as usize;
    }
    head_len += UPGRADE_RESERVE_LEN + SIGN_TOTAL_LEN;
    Ok(Some(head_len as u64))
}

/// Parses a complete signed head: package info, component table with data
/// offsets assigned, the signature bytes, and the digest state over the
/// canonical head representation (signature region zeroed).
pub fn parse_upgrade_head(
    head: &[u8],
) -> PkgResult<(UpgradePkgInfo, Vec<ComponentInfo>, Vec<u8>, DigestAlgorithm)> {
    let mut pkg = UpgradePkgFile::new(
        PkgStream::memory("update.bin", head.to_vec()),
        UpgradePkgInfo::default(),
    );
    let mut algorithm = pkg.read_upgrade_pkg_header()?;
    pkg.read_components(&mut algorithm)?;
    pkg.read_img_hash_data(&mut algorithm)?;
    let sign_data = pkg.read_package_info(&mut algorithm)?;
    pkg.pkg_info.pkg_info.update_file_head_len = pkg.head_len();
    Ok((pkg.pkg_info, pkg.entries, sign_data, algorithm))
}

fn encode_comp_info(entry: &ComponentInfo) -> PkgResult<Vec<u8>> {
    let mut record = vec![0u8; COMP_INFO_LEN];
    record[0..32].copy_from_slice(&string_to_field(&entry.file.identity, 32)?);
    write_le16(&mut record[32..], entry.id);
    record[34] = entry.res_type;
    record[35] = entry.comp_flags;
    record[36] = entry.comp_type;
    record[37..47].copy_from_slice(&string_to_field(&entry.version, 10)?);
    write_le32(&mut record[47..], entry.file.unpacked_size as u32);
    write_le32(&mut record[51..], entry.original_size);
    record[55..55 + DIGEST_MAX_LEN].copy_from_slice(&entry.digest);
    Ok(record)
}

fn decode_comp_info(record: &[u8]) -> PkgResult<ComponentInfo> {
    if record.len() < COMP_INFO_LEN {
        return Err(PkgError::InvalidPkgFormat);
    }
    let mut entry = ComponentInfo {
        id: read_le16(&record[32..]),
        res_type: record[34],
        comp_flags: record[35],
        comp_type: record[36],
        version: field_to_string(&record[37..47]),
        original_size: read_le32(&record[51..]),
        ..Default::default()
    };
    entry.file.identity = field_to_string(&record[0..32]);
    let size = read_le32(&record[47..]) as u64;
    entry.file.packed_size = size;
    entry.file.unpacked_size = size;
    entry.digest.copy_from_slice(&record[55..55 + DIGEST_MAX_LEN]);
    Ok(entry)
}
