// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::errors::{PkgError, PkgResult};
use log::{error, info};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Persisted `partition -> applied` map: one line per partition, rewritten
/// and fsynced on every change so a reboot mid-install resumes correctly.
pub struct PartitionRecord {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PartitionRecord {
    pub fn new(path: PathBuf) -> PartitionRecord {
        PartitionRecord {
            path,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> BTreeMap<String, bool> {
        let Ok(text) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        let mut map = BTreeMap::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            if let (Some(name), Some(flag)) = (fields.next(), fields.next()) {
                map.insert(name.to_string(), flag == "1");
            }
        }
        map
    }

    fn save(&self, map: &BTreeMap<String, bool>) -> PkgResult<()> {
        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| {
            error!("create record {} failed: {}", tmp.display(), e);
            PkgError::InvalidStream
        })?;
        for (name, applied) in map {
            writeln!(file, "{} {}", name, if *applied { 1 } else { 0 })
                .map_err(|_| PkgError::InvalidStream)?;
        }
        file.sync_all().map_err(|_| PkgError::InvalidStream)?;
        fs::rename(&tmp, &self.path).map_err(|_| PkgError::InvalidStream)?;
        Ok(())
    }

    pub fn is_partition_updated(&self, name: &str) -> bool {
        let _guard = self.lock.lock().unwrap();
        self.load().get(name).copied().unwrap_or(false)
    }

    pub fn record_partition_update_status(&self, name: &str, done: bool) -> PkgResult<()> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.load();
        map.insert(name.to_string(), done);
        self.save(&map)?;
        info!("record partition {} updated: {}", name, done);
        Ok(())
    }

    pub fn clear(&self) -> PkgResult<()> {
        let _guard = self.lock.lock().unwrap();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("clear record {} failed: {}", self.path.display(), e);
                Err(PkgError::InvalidStream)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_survives_process_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partition_record");

        let record = PartitionRecord::new(path.clone());
        assert!(!record.is_partition_updated("system"));
        record.record_partition_update_status("system", true).unwrap();
        record.record_partition_update_status("vendor", false).unwrap();
        drop(record);

        // a fresh instance reads the same state back
        let record = PartitionRecord::new(path);
        assert!(record.is_partition_updated("system"));
        assert!(!record.is_partition_updated("vendor"));
        assert!(!record.is_partition_updated("odm"));
    }

    #[test]
    fn clear_forgets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let record = PartitionRecord::new(dir.path().join("partition_record"));
        record.record_partition_update_status("system", true).unwrap();
        record.clear().unwrap();
        assert!(!record.is_partition_updated("system"));
        record.clear().unwrap(); // idempotent
    }
}
