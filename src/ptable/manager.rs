// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::constants::PTABLE_FILE;
use crate::errors::{PkgError, PkgResult};
use crate::package::manager::PkgManager;
use crate::ptable::gpt::{Ptable, GPT_PRIMARY_IMAGE_LEN, LBA_SIZE};
use log::{error, info, warn};
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Emmc,
    Ufs,
}

/// Resolved location of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPlace {
    pub dev_path: PathBuf,
    pub start_byte: u64,
    pub size_bytes: u64,
}

/// Owns the partition tables of the device: one GPT on EMMC
/// (`mmcblk0`-style single node), one per LUN on UFS (`sdX` nodes).
/// A package's `ptable` inner file carries one primary-region image per
/// device node, concatenated in LUN order.
pub struct PtableManager {
    storage: StorageType,
    devices: Vec<PathBuf>,
    tables: Vec<Ptable>,
}

impl PtableManager {
    pub fn new_emmc(device: PathBuf) -> PtableManager {
        PtableManager {
            storage: StorageType::Emmc,
            devices: vec![device],
            tables: Vec::new(),
        }
    }

    pub fn new_ufs(luns: Vec<PathBuf>) -> PtableManager {
        PtableManager {
            storage: StorageType::Ufs,
            devices: luns,
            tables: Vec::new(),
        }
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage
    }

    pub fn tables(&self) -> &[Ptable] {
        &self.tables
    }

    pub fn is_loaded(&self) -> bool {
        !self.tables.is_empty()
    }

    /// Parses the GPT of every device node.
    pub fn load_partition_info_from_device(&mut self) -> PkgResult<()> {
        let mut tables = Vec::new();
        for dev in &self.devices {
            let mut file = OpenOptions::new().read(true).open(dev).map_err(|e| {
                error!("open {} failed: {}", dev.display(), e);
                PkgError::InvalidFile
            })?;
            let mut image = vec![0u8; GPT_PRIMARY_IMAGE_LEN];
            file.read_exact(&mut image)
                .map_err(|_| PkgError::InvalidFile)?;
            tables.push(Ptable::parse_primary(&image)?);
        }
        self.tables = tables;
        Ok(())
    }

    /// Parses the package's `ptable` inner file: one primary image per
    /// device node, in order.
    pub fn load_partition_info_from_pkg(&mut self, manager: &PkgManager) -> PkgResult<()> {
        let blob = manager.extract_to_memory(PTABLE_FILE)?;
        if blob.len() != GPT_PRIMARY_IMAGE_LEN * self.devices.len() {
            error!(
                "ptable file is {} bytes for {} devices",
                blob.len(),
                self.devices.len()
            );
            return Err(PkgError::InvalidPkgFormat);
        }
        let mut tables = Vec::new();
        for chunk in blob.chunks(GPT_PRIMARY_IMAGE_LEN) {
            tables.push(Ptable::parse_primary(chunk)?);
        }
        self.tables = tables;
        Ok(())
    }

    /// Field-wise comparison over every device table.
    pub fn compare_ptable(&self, other: &PtableManager) -> bool {
        if self.tables.len() != other.tables.len() {
            return true;
        }
        for (mine, theirs) in self.tables.iter().zip(other.tables.iter()) {
            if mine.entries.len() != theirs.entries.len() {
                return true;
            }
            for (a, b) in mine.entries.iter().zip(theirs.entries.iter()) {
                if a.name != b.name || a.first_lba != b.first_lba || a.last_lba != b.last_lba {
                    return true;
                }
            }
        }
        false
    }

    pub fn compare_partition(&self, other: &PtableManager, name: &str) -> bool {
        let mine = self.find_entry(name);
        let theirs = other.find_entry(name);
        match (mine, theirs) {
            (Some((_, a)), Some((_, b))) => {
                a.first_lba != b.first_lba || a.last_lba != b.last_lba
            }
            (None, None) => false,
            _ => true,
        }
    }

    fn find_entry(&self, name: &str) -> Option<(usize, &crate::ptable::gpt::GptEntry)> {
        let name = name.trim_start_matches('/');
        for (lun, table) in self.tables.iter().enumerate() {
            if let Some(entry) = table.find(name) {
                return Some((lun, entry));
            }
        }
        None
    }

    /// Resolves `/userdata` to `{dev_path, start_byte, size_bytes}`.
    pub fn get_partition_info_by_name(&self, name: &str) -> Option<PartitionPlace> {
        self.find_entry(name).map(|(lun, entry)| PartitionPlace {
            dev_path: self.devices[lun].clone(),
            start_byte: entry.start_bytes(),
            size_bytes: entry.size_bytes(),
        })
    }

    /// Rewrites every device's GPT, trailing-partition adjustment applied.
    pub fn write_ptable_to_device(&mut self) -> PkgResult<()> {
        if self.tables.len() != self.devices.len() {
            error!("no partition tables loaded");
            return Err(PkgError::InvalidState);
        }
        for (dev, table) in self.devices.iter().zip(self.tables.iter_mut()) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(dev)
                .map_err(|e| {
                    error!("open {} for ptable write failed: {}", dev.display(), e);
                    PkgError::InvalidFile
                })?;
            let device_lbas = file.metadata().map(|m| m.len())? / LBA_SIZE;
            table.adjust_last_partition(device_lbas);
            table.write_to_device(&file)?;
        }
        info!("partition tables written to {} device(s)", self.devices.len());
        Ok(())
    }
}

/// Gate for package-driven relayouts: on a normal update the table may only
/// be applied when the USERDATA boundary stays put; an sdcard flash may
/// move it.
pub fn check_package_ptable_valid(
    device: &PtableManager,
    package: &PtableManager,
    sdcard_update: bool,
) -> bool {
    if package.tables.is_empty() {
        info!("no ptable in package, nothing to apply");
        return true;
    }
    if sdcard_update {
        return true;
    }
    if device.compare_partition(package, "USERDATA") {
        warn!("USERDATA boundary would move on a normal update, reject ptable");
        return false;
    }
    true
}

/// Picks the manager flavor for the device layout found under `dir`:
/// a single `mmcblk0` node means EMMC, `sd[a-z]` nodes mean UFS LUNs.
pub fn detect_ptable_manager(dir: &Path) -> PtableManager {
    let emmc = dir.join("mmcblk0");
    if emmc.exists() {
        return PtableManager::new_emmc(emmc);
    }
    let mut luns = Vec::new();
    for letter in b'a'..=b'z' {
        let lun = dir.join(format!("sd{}", letter as char));
        if lun.exists() {
            luns.push(lun);
        } else {
            break;
        }
    }
    if luns.is_empty() {
        // no nodes yet, default to the EMMC path
        return PtableManager::new_emmc(emmc);
    }
    PtableManager::new_ufs(luns)
}
