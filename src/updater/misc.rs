// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::errors::{PkgError, PkgResult};
use crate::utils::{field_to_string, read_le32, string_to_field, write_le32};
use log::error;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

const COMMAND_LEN: usize = 32;
const UPDATE_LEN: usize = 768;
const BOOT_COMMAND_LEN: usize = 32;
const STAGE_LEN: usize = 32;
const FAULT_INFO_LEN: usize = 96;

/// Serialized size of the misc message:
/// command[32] update[768] boot_command[32] stage[32] reserved fault_info[96]
/// retry_count(u32), all strings NUL padded, retry_count little endian.
pub const MISC_MESSAGE_LEN: usize =
    COMMAND_LEN + UPDATE_LEN + BOOT_COMMAND_LEN + STAGE_LEN + 1 + FAULT_INFO_LEN + 4;

/// Cross-boot state in the dedicated non-FS misc partition. Every updater
/// process on the device honors this exact layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateMessage {
    pub command: String,
    pub update: String,
    pub boot_command: String,
    pub stage: String,
    pub fault_info: String,
    pub retry_count: u32,
}

impl UpdateMessage {
    pub fn to_bytes(&self) -> PkgResult<Vec<u8>> {
        let mut out = vec![0u8; MISC_MESSAGE_LEN];
        let mut offset = 0;
        out[offset..offset + COMMAND_LEN]
            .copy_from_slice(&string_to_field(&self.command, COMMAND_LEN)?);
        offset += COMMAND_LEN;
        out[offset..offset + UPDATE_LEN]
            .copy_from_slice(&string_to_field(&self.update, UPDATE_LEN)?);
        offset += UPDATE_LEN;
        out[offset..offset + BOOT_COMMAND_LEN]
            .copy_from_slice(&string_to_field(&self.boot_command, BOOT_COMMAND_LEN)?);
        offset += BOOT_COMMAND_LEN;
        out[offset..offset + STAGE_LEN]
            .copy_from_slice(&string_to_field(&self.stage, STAGE_LEN)?);
        offset += STAGE_LEN + 1; // reserved byte stays zero
        out[offset..offset + FAULT_INFO_LEN]
            .copy_from_slice(&string_to_field(&self.fault_info, FAULT_INFO_LEN)?);
        offset += FAULT_INFO_LEN;
        write_le32(&mut out[offset..], self.retry_count);
        Ok(out)
    }

    pub fn from_bytes(buf: &[u8]) -> PkgResult<UpdateMessage> {
        if buf.len() < MISC_MESSAGE_LEN {
            return Err(PkgError::InvalidFile);
        }
        let mut offset = 0;
        let command = field_to_string(&buf[offset..offset + COMMAND_LEN]);
        offset += COMMAND_LEN;
        let update = field_to_string(&buf[offset..offset + UPDATE_LEN]);
        offset += UPDATE_LEN;
        let boot_command = field_to_string(&buf[offset..offset + BOOT_COMMAND_LEN]);
        offset += BOOT_COMMAND_LEN;
        let stage = field_to_string(&buf[offset..offset + STAGE_LEN]);
        offset += STAGE_LEN + 1;
        let fault_info = field_to_string(&buf[offset..offset + FAULT_INFO_LEN]);
        offset += FAULT_INFO_LEN;
        let retry_count = read_le32(&buf[offset..]);
        Ok(UpdateMessage {
            command,
            update,
            boot_command,
            stage,
            fault_info,
            retry_count,
        })
    }
}

/// Reads the message at offset 0 of the misc partition. A missing or short
/// misc area reads as the empty message.
pub fn read_misc_msg(path: &Path) -> PkgResult<UpdateMessage> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(_) => return Ok(UpdateMessage::default()),
    };
    let mut buf = vec![0u8; MISC_MESSAGE_LEN];
    match file.read_exact_at(&mut buf, 0) {
        Ok(()) => UpdateMessage::from_bytes(&buf),
        Err(_) => Ok(UpdateMessage::default()),
    }
}

pub fn write_misc_msg(path: &Path, msg: &UpdateMessage) -> PkgResult<()> {
    let bytes = msg.to_bytes()?;
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| {
            error!("open misc {} failed: {}", path.display(), e);
            PkgError::InvalidStream
        })?;
    file.write_all_at(&bytes, 0)
        .map_err(|_| PkgError::InvalidStream)?;
    file.sync_all().map_err(|_| PkgError::InvalidStream)?;
    Ok(())
}

pub fn clear_misc_msg(path: &Path) -> PkgResult<()> {
    write_misc_msg(path, &UpdateMessage::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_survives_misc_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let misc = dir.path().join("misc");
        let msg = UpdateMessage {
            command: "boot_updater".into(),
            update: "--update_package=/data/ota/updater.zip".into(),
            fault_info: "VERIFY_FAILED_REBOOT".into(),
            retry_count: 2,
            ..Default::default()
        };
        write_misc_msg(&misc, &msg).unwrap();
        assert_eq!(read_misc_msg(&misc).unwrap(), msg);

        clear_misc_msg(&misc).unwrap();
        assert_eq!(read_misc_msg(&misc).unwrap(), UpdateMessage::default());
    }

    #[test]
    fn missing_misc_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let msg = read_misc_msg(&dir.path().join("nope")).unwrap();
        assert_eq!(msg, UpdateMessage::default());
    }

    #[test]
    fn layout_is_byte_exact() {
        let msg = UpdateMessage {
            command: "boot_updater".into(),
            retry_count: 7,
            ..Default::default()
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), MISC_MESSAGE_LEN);
        assert_eq!(&bytes[..12], b"boot_updater");
        assert_eq!(bytes[MISC_MESSAGE_LEN - 4], 7);
        // overlong fields refuse to truncate
        let msg = UpdateMessage {
            command: "x".repeat(33),
            ..Default::default()
        };
        assert!(msg.to_bytes().is_err());
    }
}
