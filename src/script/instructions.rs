// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::applypatch::block_set::BlockSet;
use crate::applypatch::image_patch::{
    apply_image_patch, calc_partition_sha, create_backup, map_partition,
};
use crate::applypatch::store;
use crate::applypatch::transfer::{TransferError, TransferManager, TransferParams};
use crate::applypatch::writer::{read_blocks, DataWriter, RawWriter};
use crate::constants::{
    IO_FAILED_REBOOT, PROCESS_BIN_FAIL_RETRY, PTABLE_FILE, UPDATER_RETRY_TAG, UPDATE_BIN_FILE,
    VERIFY_FAILED_REBOOT,
};
use crate::errors::{PkgError, PkgResult};
use crate::ptable::manager::{check_package_ptable_valid, detect_ptable_manager};
use crate::script::bin_flow::run_bin_flow;
use crate::script::Instruction;
use crate::updater::env::UpdateEnv;
use crate::utils::sha256_hex;
use log::{error, info, warn};
use std::fs::OpenOptions;
use std::sync::Arc;

fn open_device(env: &UpdateEnv, partition: &str) -> PkgResult<std::fs::File> {
    let path = env.block_device_path(partition);
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| {
            error!("cannot open block device {}: {}", path.display(), e);
            PkgError::InvalidFile
        })
}

fn calc_block_sha(env: &UpdateEnv, partition: &str, pairs: &str) -> PkgResult<String> {
    let device = open_device(env, partition)?;
    let set = BlockSet::parse(pairs)?;
    let data = read_blocks(&device, &set)?;
    Ok(sha256_hex(&data))
}

/// `sha_check <partition> <pairs> <sha> [<target pairs> <target sha>]`
/// On a fresh run only the pre-patch hash passes; a retry boot accepts the
/// post-patch hash as well, since the previous run may have finished the
/// write after the fault was recorded.
pub struct ShaCheck;

impl Instruction for ShaCheck {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() != 3 && args.len() != 5 {
            error!("sha_check arity {}", args.len());
            return Err(PkgError::InvalidParam);
        }
        let (partition, pairs, contrast_sha) = (args[0], args[1], args[2]);
        let result_sha = calc_block_sha(env, partition, pairs)?;
        if result_sha.eq_ignore_ascii_case(contrast_sha) {
            return Ok(());
        }
        if env.is_retry() && args.len() == 5 {
            let target_sha = calc_block_sha(env, partition, args[3])?;
            if target_sha.eq_ignore_ascii_case(args[4]) {
                info!("sha_check: {} already carries the target state", partition);
                return Ok(());
            }
        }
        error!("different sha256 for {}, cannot continue", partition);
        env.post_message(UPDATER_RETRY_TAG, VERIFY_FAILED_REBOOT);
        Err(PkgError::InvalidDigest)
    }
}

/// `first_block_check <partition>`: surfaces the ext4 superblock mount
/// statistics of block 0; report-only, never a gate.
pub struct FirstBlockCheck;

impl Instruction for FirstBlockCheck {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() != 1 {
            return Err(PkgError::InvalidParam);
        }
        if env.is_retry() {
            return Ok(());
        }
        let device = open_device(env, args[0])?;
        let block = read_blocks(&device, &BlockSet::parse("2 0 1")?)?;
        let mount_time = crate::utils::read_le32(&block[0x400 + 0x2C..]);
        let mount_count = crate::utils::read_le16(&block[0x400 + 0x34..]);
        if mount_count > 0 {
            let message = format!(
                "Device was remounted R/W {} times, last remount at unix time {}",
                mount_count, mount_time
            );
            warn!("{}", message);
            env.ui_log(&message);
        }
        Ok(())
    }
}

/// `block_update <partition> <transfer list> <new data> <patch data>`
pub struct BlockUpdate;

impl Instruction for BlockUpdate {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() != 4 {
            error!("block_update arity {}", args.len());
            return Err(PkgError::InvalidParam);
        }
        let (partition, transfer_name, new_data_name, patch_name) =
            (args[0], args[1], args[2], args[3]);

        if env.is_retry() && env.record.is_partition_updated(partition) {
            info!("{} already updated, skip", partition);
            return Ok(());
        }

        let transfer_text = env.manager.extract_to_memory(transfer_name)?;
        if !env.verify_inner_file(transfer_name, &transfer_text) {
            return Err(PkgError::InvalidSignature);
        }
        let patch_data = env.manager.extract_to_memory(patch_name)?;
        if !env.verify_inner_file(patch_name, &patch_data) {
            return Err(PkgError::InvalidSignature);
        }
        let lines: Vec<String> = String::from_utf8_lossy(&transfer_text)
            .lines()
            .map(|l| l.to_string())
            .collect();

        let part_tag = partition.trim_start_matches('/');
        let store_base = env.work_dir().join(format!("{}_tmp", part_tag));
        let retry_file = env.work_dir().join(format!("{}_retry", part_tag));
        // the stash survives a crash only while the retry marker exists
        let keep_store = env.is_retry() && retry_file.exists();
        store::create_new_space(&store_base, !keep_store)?;
        std::fs::write(&retry_file, b"1").map_err(|_| PkgError::InvalidStream)?;

        let device = open_device(env, partition)?;
        let mut tm = TransferManager::new(TransferParams {
            manager: Arc::clone(&env.manager),
            store_base: store_base.clone(),
            retry_file: retry_file.clone(),
            new_data_name: new_data_name.to_string(),
            patch_data,
            retry: keep_store,
        });
        let result = tm.execute(&device, &lines);
        device.sync_all().map_err(|_| PkgError::InvalidStream)?;

        match result {
            Ok(()) => {
                env.record.record_partition_update_status(partition, true)?;
                store::do_free_space(&store_base)?;
                let _ = std::fs::remove_file(&retry_file);
                Ok(())
            }
            Err(TransferError::VerifyFailed) => {
                env.post_message(UPDATER_RETRY_TAG, VERIFY_FAILED_REBOOT);
                Err(PkgError::InvalidDigest)
            }
            Err(TransferError::IoFailed) => {
                env.post_message(UPDATER_RETRY_TAG, IO_FAILED_REBOOT);
                Err(PkgError::InvalidStream)
            }
            Err(TransferError::Format) => Err(PkgError::InvalidPkgFormat),
        }
    }
}

/// `raw_image_write <partition> [<inner file>]`
pub struct RawImageWrite;

impl Instruction for RawImageWrite {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.is_empty() || args.len() > 2 {
            return Err(PkgError::InvalidParam);
        }
        let partition = args[0];
        let inner = args
            .get(1)
            .copied()
            .unwrap_or_else(|| partition.trim_start_matches('/'));

        if env.is_retry() && env.record.is_partition_updated(partition) {
            info!("{} already updated, skip", partition);
            return Ok(());
        }
        let info = env.manager.file_info(inner).ok_or(PkgError::InvalidFile)?;
        let device = open_device(env, partition)?;
        let mut writer = RawWriter::new(device, 0);

        let mut stream = crate::stream::PkgStream::processor(
            inner,
            info.unpacked_size,
            Box::new(move |chunk, _start, _finish| {
                if chunk.is_empty() {
                    return Ok(());
                }
                writer.write(chunk)
            }),
        );
        env.manager.extract_file(inner, &mut stream)?;
        env.record.record_partition_update_status(partition, true)?;
        info!("raw image write {} done", partition);
        Ok(())
    }
}

/// `update_partitions [<ptable file>]`
pub struct UpdatePartitions;

impl Instruction for UpdatePartitions {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() > 1 {
            return Err(PkgError::InvalidParam);
        }
        let _name = args.first().copied().unwrap_or(PTABLE_FILE);
        let device_dir = env.device_dir().to_path_buf();

        let mut package_tables = detect_ptable_manager(&device_dir);
        package_tables.load_partition_info_from_pkg(&env.manager)?;

        let mut device_tables = detect_ptable_manager(&device_dir);
        let device_loaded = device_tables.load_partition_info_from_device().is_ok();
        if device_loaded && !device_tables.compare_ptable(&package_tables) {
            info!("partition tables unchanged");
            return Ok(());
        }
        if device_loaded && !check_package_ptable_valid(&device_tables, &package_tables, false) {
            return Err(PkgError::InvalidPkgFormat);
        }
        package_tables.write_ptable_to_device()?;
        env.ui_log("partition table updated");
        Ok(())
    }
}

/// `image_patch <partition> <src size> <src hash> <dest size> <dest hash>
/// <patch file>`
pub struct ImagePatch;

impl Instruction for ImagePatch {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() != 6 {
            error!("image_patch arity {}", args.len());
            return Err(PkgError::InvalidParam);
        }
        let partition = args[0];
        let src_size: u64 = args[1].parse().map_err(|_| PkgError::InvalidParam)?;
        let src_hash = args[2];
        let dest_size: u64 = args[3].parse().map_err(|_| PkgError::InvalidParam)?;
        let dest_hash = args[4];
        let patch_name = args[5];

        if env.is_retry() && env.record.is_partition_updated(partition) {
            info!("{} already updated, skip", partition);
            return Ok(());
        }
        let dev_path = env.block_device_path(partition);
        let backup_path = env
            .work_dir()
            .join(format!("{}.backup", partition.trim_start_matches('/')));

        // reuse a backup from an interrupted attempt, else take one now
        let backup_usable = backup_path.exists()
            && calc_partition_sha(&backup_path, src_size)
                .map(|h| h.eq_ignore_ascii_case(src_hash))
                .unwrap_or(false);
        if !backup_usable {
            let current = calc_partition_sha(&dev_path, src_size)?;
            if !current.eq_ignore_ascii_case(src_hash) {
                error!("source hash mismatch on {}", partition);
                env.post_message(UPDATER_RETRY_TAG, VERIFY_FAILED_REBOOT);
                return Err(PkgError::InvalidDigest);
            }
            create_backup(&dev_path, &backup_path, src_size)?;
        }

        let patch = env.manager.extract_to_memory(patch_name)?;
        if !env.verify_inner_file(patch_name, &patch) {
            return Err(PkgError::InvalidSignature);
        }

        let source = map_partition(&backup_path, src_size)?;
        let result = apply_image_patch(&source, &patch)?;
        if result.len() as u64 != dest_size
            || !sha256_hex(&result).eq_ignore_ascii_case(dest_hash)
        {
            error!("patched image hash mismatch on {}", partition);
            env.post_message(UPDATER_RETRY_TAG, VERIFY_FAILED_REBOOT);
            return Err(PkgError::InvalidDigest);
        }

        let device = open_device(env, partition)?;
        let mut writer = RawWriter::new(device, 0);
        writer.write(&result)?;
        writer.sync()?;
        env.record.record_partition_update_status(partition, true)?;
        let _ = std::fs::remove_file(&backup_path);
        info!("image patch {} done", partition);
        Ok(())
    }
}

/// `image_sha_check <partition> <src size> <src hash> <dest size>
/// <dest hash>`: the partition must carry either the pre-patch bytes, or
/// (on a retry boot only) the post-patch bytes.
pub struct ImageShaCheck;

impl Instruction for ImageShaCheck {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() != 5 {
            return Err(PkgError::InvalidParam);
        }
        let partition = args[0];
        let src_size: u64 = args[1].parse().map_err(|_| PkgError::InvalidParam)?;
        let src_hash = args[2];
        let dest_size: u64 = args[3].parse().map_err(|_| PkgError::InvalidParam)?;
        let dest_hash = args[4];

        let dev_path = env.block_device_path(partition);
        if calc_partition_sha(&dev_path, src_size)?.eq_ignore_ascii_case(src_hash) {
            return Ok(());
        }
        if env.is_retry()
            && calc_partition_sha(&dev_path, dest_size)?.eq_ignore_ascii_case(dest_hash)
        {
            info!("{} already carries the patched image", partition);
            return Ok(());
        }
        error!("image sha check failed on {}", partition);
        env.post_message(UPDATER_RETRY_TAG, VERIFY_FAILED_REBOOT);
        Err(PkgError::InvalidDigest)
    }
}

/// `pkg_extract <inner file> <destination path>`
pub struct PkgExtract;

impl Instruction for PkgExtract {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() != 2 {
            return Err(PkgError::InvalidParam);
        }
        let (inner, dest) = (args[0], args[1]);
        let data = env.manager.extract_to_memory(inner)?;
        if !env.verify_inner_file(inner, &data) {
            return Err(PkgError::InvalidSignature);
        }
        std::fs::write(dest, &data).map_err(|e| {
            error!("write {} failed: {}", dest, e);
            PkgError::InvalidStream
        })?;
        info!("extracted {} to {}", inner, dest);
        Ok(())
    }
}

/// `pkg_extract_no_ret`: same, but failures never abort the script.
pub struct PkgExtractNoRet;

impl Instruction for PkgExtractNoRet {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if let Err(e) = PkgExtract.execute(env, args) {
            warn!("pkg_extract_no_ret swallowed failure: {}", e);
        }
        Ok(())
    }
}

/// `update_from_bin [<inner file>]`
pub struct UpdateFromBin;

impl Instruction for UpdateFromBin {
    fn execute(&self, env: &UpdateEnv, args: &[&str]) -> PkgResult<()> {
        if args.len() > 1 {
            return Err(PkgError::InvalidParam);
        }
        let inner = args.first().copied().unwrap_or(UPDATE_BIN_FILE);
        run_bin_flow(env, inner).map_err(|e| {
            env.post_message(UPDATER_RETRY_TAG, PROCESS_BIN_FAIL_RETRY);
            e
        })
    }
}
