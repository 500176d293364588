// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::errors::{PkgError, PkgResult};
use crate::utils::{read_le32, read_le64, write_le32, write_le64};
use log::{error, info};
use std::fs::File;
use std::os::unix::fs::FileExt;

pub const LBA_SIZE: u64 = 512;
pub const GPT_HEADER_SIGNATURE: [u8; 8] = *b"EFI PART";
pub const GPT_REVISION_1_0: u32 = 0x0001_0000;
pub const GPT_HEADER_SIZE: u32 = 92;
pub const GPT_ENTRY_SIZE: u32 = 128;
pub const GPT_ENTRY_COUNT: u32 = 128;
const GPT_NAME_UTF16_LEN: usize = 36;
const MBR_GPT_PARTITION_TYPE: u8 = 0xEE;

/// LBAs of the primary region: protective MBR + header + entry array.
pub const GPT_PRIMARY_LBAS: u64 = 2 + (GPT_ENTRY_SIZE * GPT_ENTRY_COUNT) as u64 / LBA_SIZE;
/// LBAs reserved at the end of the device: entry array + backup header.
pub const GPT_BACKUP_LBAS: u64 = 1 + (GPT_ENTRY_SIZE * GPT_ENTRY_COUNT) as u64 / LBA_SIZE;
/// Byte length of a primary-region image as shipped inside a package.
pub const GPT_PRIMARY_IMAGE_LEN: usize = (GPT_PRIMARY_LBAS * LBA_SIZE) as usize;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub crc32: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_table_lba: u64,
    pub partition_count: u32,
    pub partition_entry_size: u32,
    pub partition_entry_array_crc32: u32,
}

impl GptHeader {
    pub fn parse(buf: &[u8]) -> PkgResult<GptHeader> {
        if buf.len() < GPT_HEADER_SIZE as usize {
            return Err(PkgError::InvalidFile);
        }
        if buf[0..8] != GPT_HEADER_SIGNATURE {
            error!("invalid gpt header signature");
            return Err(PkgError::InvalidPkgFormat);
        }
        let revision = read_le32(&buf[8..]);
        if revision < GPT_REVISION_1_0 {
            error!("invalid gpt revision {:#010x}", revision);
            return Err(PkgError::InvalidPkgFormat);
        }
        let header_size = read_le32(&buf[12..]);
        if header_size != GPT_HEADER_SIZE {
            error!("invalid gpt header size {}", header_size);
            return Err(PkgError::InvalidPkgFormat);
        }
        let mut disk_guid = [0u8; 16];
        disk_guid.copy_from_slice(&buf[56..72]);
        Ok(GptHeader {
            revision,
            header_size,
            crc32: read_le32(&buf[16..]),
            current_lba: read_le64(&buf[24..]),
            backup_lba: read_le64(&buf[32..]),
            first_usable_lba: read_le64(&buf[40..]),
            last_usable_lba: read_le64(&buf[48..]),
            disk_guid,
            partition_table_lba: read_le64(&buf[72..]),
            partition_count: read_le32(&buf[80..]),
            partition_entry_size: read_le32(&buf[84..]),
            partition_entry_array_crc32: read_le32(&buf[88..]),
        })
    }

    /// Serializes with `crc32` recomputed over the header bytes (the CRC
    /// field itself zeroed, per the GPT rule).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; GPT_HEADER_SIZE as usize];
        out[0..8].copy_from_slice(&GPT_HEADER_SIGNATURE);
        write_le32(&mut out[8..], self.revision);
        write_le32(&mut out[12..], self.header_size);
        // crc at 16..20 computed below
        write_le64(&mut out[24..], self.current_lba);
        write_le64(&mut out[32..], self.backup_lba);
        write_le64(&mut out[40..], self.first_usable_lba);
        write_le64(&mut out[48..], self.last_usable_lba);
        out[56..72].copy_from_slice(&self.disk_guid);
        write_le64(&mut out[72..], self.partition_table_lba);
        write_le32(&mut out[80..], self.partition_count);
        write_le32(&mut out[84..], self.partition_entry_size);
        write_le32(&mut out[88..], self.partition_entry_array_crc32);
        let crc = crc32(&out);
        write_le32(&mut out[16..], crc);
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name: String,
}

impl GptEntry {
    pub fn is_empty(&self) -> bool {
        self.type_guid == [0u8; 16]
    }

    pub fn start_bytes(&self) -> u64 {
        self.first_lba * LBA_SIZE
    }

    pub fn size_bytes(&self) -> u64 {
        (self.last_lba + 1 - self.first_lba) * LBA_SIZE
    }

    fn parse(buf: &[u8]) -> PkgResult<GptEntry> {
        if buf.len() < GPT_ENTRY_SIZE as usize {
            return Err(PkgError::InvalidFile);
        }
        let mut type_guid = [0u8; 16];
        type_guid.copy_from_slice(&buf[0..16]);
        let mut unique_guid = [0u8; 16];
        unique_guid.copy_from_slice(&buf[16..32]);
        let mut name_units = [0u16; GPT_NAME_UTF16_LEN];
        for (i, unit) in name_units.iter_mut().enumerate() {
            *unit = u16::from_le_bytes([buf[56 + 2 * i], buf[57 + 2 * i]]);
        }
        let end = name_units
            .iter()
            .position(|&u| u == 0)
            .unwrap_or(GPT_NAME_UTF16_LEN);
        let name = String::from_utf16_lossy(&name_units[..end]);
        Ok(GptEntry {
            type_guid,
            unique_guid,
            first_lba: read_le64(&buf[32..]),
            last_lba: read_le64(&buf[40..]),
            attributes: read_le64(&buf[48..]),
            name,
        })
    }

    fn to_bytes(&self) -> PkgResult<Vec<u8>> {
        let mut out = vec![0u8; GPT_ENTRY_SIZE as usize];
        out[0..16].copy_from_slice(&self.type_guid);
        out[16..32].copy_from_slice(&self.unique_guid);
        write_le64(&mut out[32..], self.first_lba);
        write_le64(&mut out[40..], self.last_lba);
        write_le64(&mut out[48..], self.attributes);
        let units: Vec<u16> = self.name.encode_utf16().collect();
        if units.len() >= GPT_NAME_UTF16_LEN {
            error!("partition name {} too long", self.name);
            return Err(PkgError::InvalidParam);
        }
        for (i, unit) in units.iter().enumerate() {
            out[56 + 2 * i..58 + 2 * i].copy_from_slice(&unit.to_le_bytes());
        }
        Ok(out)
    }
}

/// One device's partition table: entries plus the geometry needed to place
/// the primary and backup copies.
#[derive(Debug, Clone, Default)]
pub struct Ptable {
    pub header: GptHeader,
    pub entries: Vec<GptEntry>,
}

impl Ptable {
    /// Parses a primary-region image: protective MBR, header at LBA 1,
    /// entry array at the header's table LBA.
    pub fn parse_primary(data: &[u8]) -> PkgResult<Ptable> {
        if data.len() < GPT_PRIMARY_IMAGE_LEN {
            error!("ptable image too short: {}", data.len());
            return Err(PkgError::InvalidFile);
        }
        if data[510] != 0x55 || data[511] != 0xAA {
            error!("missing mbr boot signature");
            return Err(PkgError::InvalidPkgFormat);
        }
        if data[446 + 4] != MBR_GPT_PARTITION_TYPE {
            error!("protective mbr entry is not gpt");
            return Err(PkgError::InvalidPkgFormat);
        }
        let header = GptHeader::parse(&data[LBA_SIZE as usize..])?;
        if header.partition_entry_size != GPT_ENTRY_SIZE
            || header.partition_count > GPT_ENTRY_COUNT
        {
            error!(
                "unsupported entry geometry {}x{}",
                header.partition_count, header.partition_entry_size
            );
            return Err(PkgError::InvalidPkgFormat);
        }
        let table_offset = (header.partition_table_lba * LBA_SIZE) as usize;
        let table_len = (header.partition_count * header.partition_entry_size) as usize;
        if table_offset + table_len > data.len() {
            return Err(PkgError::InvalidFile);
        }
        let table = &data[table_offset..table_offset + table_len];
        if crc32(table) != header.partition_entry_array_crc32 {
            error!("gpt entry array crc mismatch");
            return Err(PkgError::InvalidDigest);
        }

        let mut entries = Vec::new();
        for chunk in table.chunks(GPT_ENTRY_SIZE as usize) {
            let entry = GptEntry::parse(chunk)?;
            if !entry.is_empty() {
                entries.push(entry);
            }
        }
        Ok(Ptable { header, entries })
    }

    pub fn find(&self, name: &str) -> Option<&GptEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    fn entry_array_bytes(&self) -> PkgResult<Vec<u8>> {
        let mut table = vec![0u8; (GPT_ENTRY_SIZE * GPT_ENTRY_COUNT) as usize];
        if self.entries.len() > GPT_ENTRY_COUNT as usize {
            return Err(PkgError::InvalidParam);
        }
        for (i, entry) in self.entries.iter().enumerate() {
            let bytes = entry.to_bytes()?;
            let at = i * GPT_ENTRY_SIZE as usize;
            table[at..at + GPT_ENTRY_SIZE as usize].copy_from_slice(&bytes);
        }
        Ok(table)
    }

    /// Serializes the primary region only (package-image form).
    pub fn to_primary_image(&mut self, device_lbas: u64) -> PkgResult<Vec<u8>> {
        let table = self.entry_array_bytes()?;
        self.refresh_header(device_lbas, &table);
        let mut out = vec![0u8; GPT_PRIMARY_IMAGE_LEN];
        write_protective_mbr(&mut out, device_lbas);
        let header = self.header.to_bytes();
        out[LBA_SIZE as usize..LBA_SIZE as usize + header.len()].copy_from_slice(&header);
        out[2 * LBA_SIZE as usize..2 * LBA_SIZE as usize + table.len()].copy_from_slice(&table);
        Ok(out)
    }

    fn refresh_header(&mut self, device_lbas: u64, table: &[u8]) {
        self.header.revision = GPT_REVISION_1_0;
        self.header.header_size = GPT_HEADER_SIZE;
        self.header.current_lba = 1;
        self.header.backup_lba = device_lbas - 1;
        self.header.first_usable_lba = GPT_PRIMARY_LBAS;
        self.header.last_usable_lba = device_lbas - GPT_BACKUP_LBAS - 1;
        self.header.partition_table_lba = 2;
        self.header.partition_count = GPT_ENTRY_COUNT;
        self.header.partition_entry_size = GPT_ENTRY_SIZE;
        self.header.partition_entry_array_crc32 = crc32(table);
    }

    /// Writes protective MBR, primary header + entries, backup entries and
    /// backup header; both CRCs are recomputed from the emitted array.
    pub fn write_to_device(&mut self, file: &File) -> PkgResult<()> {
        let device_len = file.metadata().map(|m| m.len())?;
        let device_lbas = device_len / LBA_SIZE;
        if device_lbas < GPT_PRIMARY_LBAS + GPT_BACKUP_LBAS + 1 {
            error!("device too small for gpt: {} lbas", device_lbas);
            return Err(PkgError::InvalidParam);
        }
        let primary = self.to_primary_image(device_lbas)?;
        file.write_all_at(&primary, 0)
            .map_err(|_| PkgError::InvalidStream)?;

        // backup: entry array then header in the last reserved LBAs
        let table = self.entry_array_bytes()?;
        let backup_table_lba = device_lbas - GPT_BACKUP_LBAS;
        file.write_all_at(&table, backup_table_lba * LBA_SIZE)
            .map_err(|_| PkgError::InvalidStream)?;

        let mut backup_header = self.header.clone();
        backup_header.current_lba = device_lbas - 1;
        backup_header.backup_lba = 1;
        backup_header.partition_table_lba = backup_table_lba;
        file.write_all_at(&backup_header.to_bytes(), (device_lbas - 1) * LBA_SIZE)
            .map_err(|_| PkgError::InvalidStream)?;
        file.sync_all().map_err(|_| PkgError::InvalidStream)?;
        info!(
            "wrote partition table with {} entries to device",
            self.entries.len()
        );
        Ok(())
    }

    /// Grows the trailing data partition to fill the device. The rule
    /// applies to the partition named USERDATA, or to the sole partition
    /// when only one exists.
    pub fn adjust_last_partition(&mut self, device_lbas: u64) {
        let last_usable = device_lbas - GPT_BACKUP_LBAS - 1;
        let target = if self.entries.iter().any(|e| e.name == "USERDATA") {
            self.entries.iter_mut().find(|e| e.name == "USERDATA")
        } else if self.entries.len() == 1 {
            self.entries.first_mut()
        } else {
            None
        };
        if let Some(entry) = target {
            if entry.last_lba != last_usable {
                info!(
                    "resize {} end lba {} -> {}",
                    entry.name, entry.last_lba, last_usable
                );
                entry.last_lba = last_usable;
            }
        }
    }
}

fn write_protective_mbr(out: &mut [u8], device_lbas: u64) {
    // one 0xEE entry covering the whole disk
    let entry = &mut out[446..462];
    entry[4] = MBR_GPT_PARTITION_TYPE;
    // first LBA of the protected region
    write_le32(&mut entry[8..], 1);
    let lbas = (device_lbas - 1).min(u32::MAX as u64) as u32;
    write_le32(&mut entry[12..], lbas);
    out[510] = 0x55;
    out[511] = 0xAA;
}

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::io::Write;

    const DEVICE_LBAS: u64 = 16384;

    fn temp_device() -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; (DEVICE_LBAS * LBA_SIZE) as usize])
            .unwrap();
        drop(f);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        (dir, file)
    }

    #[test]
    fn primary_image_round_trip() {
        let mut table = sample_table();
        let image = table.to_primary_image(DEVICE_LBAS).unwrap();
        let parsed = Ptable::parse_primary(&image).unwrap();
        assert_eq!(parsed.entries.len(), 3);
        assert_eq!(parsed.entries[1].name, "system");
        assert_eq!(parsed.entries[1].first_lba, 1058);
        assert_eq!(parsed.entries[2].name, "USERDATA");
    }

    #[test]
    fn header_and_entry_crcs_are_consistent() {
        let mut table = sample_table();
        let (_dir, file) = temp_device();
        table.write_to_device(&file).unwrap();

        // primary header
        let mut header_lba = vec![0u8; LBA_SIZE as usize];
        std::os::unix::fs::FileExt::read_exact_at(&file, &mut header_lba, LBA_SIZE).unwrap();
        let header = GptHeader::parse(&header_lba).unwrap();

        // recorded entry crc equals the computed crc of the emitted array
        let table_len = (header.partition_count * header.partition_entry_size) as usize;
        let mut entries = vec![0u8; table_len];
        std::os::unix::fs::FileExt::read_exact_at(
            &file,
            &mut entries,
            header.partition_table_lba * LBA_SIZE,
        )
        .unwrap();
        assert_eq!(crc32(&entries), header.partition_entry_array_crc32);

        // header crc equals the crc of the header with its crc field zeroed
        let mut zeroed = header_lba[..GPT_HEADER_SIZE as usize].to_vec();
        zeroed[16..20].fill(0);
        assert_eq!(crc32(&zeroed), header.crc32);

        // backup header mirrors the primary
        let mut backup_lba = vec![0u8; LBA_SIZE as usize];
        std::os::unix::fs::FileExt::read_exact_at(
            &file,
            &mut backup_lba,
            (DEVICE_LBAS - 1) * LBA_SIZE,
        )
        .unwrap();
        let backup = GptHeader::parse(&backup_lba).unwrap();
        assert_eq!(backup.current_lba, DEVICE_LBAS - 1);
        assert_eq!(backup.backup_lba, 1);
        assert_eq!(
            backup.partition_entry_array_crc32,
            header.partition_entry_array_crc32
        );
    }

    #[test]
    fn mutated_entries_change_the_crc() {
        let mut table = sample_table();
        let image = table.to_primary_image(DEVICE_LBAS).unwrap();
        let mut mutated = image.clone();
        mutated[2 * LBA_SIZE as usize + 32] ^= 0x01; // first_lba of entry 0
        assert_eq!(
            Ptable::parse_primary(&mutated).unwrap_err(),
            PkgError::InvalidDigest
        );
    }

    #[test]
    fn userdata_grows_to_fill_device() {
        let mut table = sample_table();
        table.adjust_last_partition(DEVICE_LBAS);
        let userdata = table.find("USERDATA").unwrap();
        assert_eq!(userdata.last_lba, DEVICE_LBAS - GPT_BACKUP_LBAS - 1);
    }
}
