// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::errors::{PkgError, PkgResult};
use log::{error, info};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Disk-backed stash for the block-transfer engine. File names equal the
/// SHA-256 hex of the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceState {
    /// An existing directory was kept (resumed run).
    Reused,
    /// The directory was freshly created.
    Created,
}

fn tag_path(base: &Path, tag: &str) -> PkgResult<PathBuf> {
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        error!("invalid stash tag {}", tag);
        return Err(PkgError::InvalidParam);
    }
    Ok(base.join(tag))
}

pub fn create_new_space(base: &Path, wipe_existing: bool) -> PkgResult<SpaceState> {
    if base.exists() {
        if !wipe_existing {
            info!("reusing stash space {}", base.display());
            return Ok(SpaceState::Reused);
        }
        fs::remove_dir_all(base).map_err(|e| {
            error!("wipe stash {} failed: {}", base.display(), e);
            PkgError::InvalidStream
        })?;
    }
    fs::create_dir_all(base).map_err(|e| {
        error!("create stash {} failed: {}", base.display(), e);
        PkgError::InvalidStream
    })?;
    Ok(SpaceState::Created)
}

pub fn store_write(base: &Path, tag: &str, data: &[u8]) -> PkgResult<()> {
    let path = tag_path(base, tag)?;
    let mut file = fs::File::create(&path).map_err(|e| {
        error!("create stash entry {} failed: {}", path.display(), e);
        PkgError::InvalidStream
    })?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

pub fn store_read(base: &Path, tag: &str) -> PkgResult<Vec<u8>> {
    let path = tag_path(base, tag)?;
    fs::read(&path).map_err(|e| {
        error!("read stash entry {} failed: {}", path.display(), e);
        PkgError::InvalidStream
    })
}

pub fn store_exists(base: &Path, tag: &str) -> bool {
    tag_path(base, tag).map(|p| p.exists()).unwrap_or(false)
}

pub fn store_delete(base: &Path, tag: &str) -> PkgResult<()> {
    let path = tag_path(base, tag)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!("delete stash entry {} failed: {}", path.display(), e);
            Err(PkgError::InvalidStream)
        }
    }
}

pub fn do_free_space(base: &Path) -> PkgResult<()> {
    if base.exists() {
        fs::remove_dir_all(base).map_err(|e| {
            error!("free stash {} failed: {}", base.display(), e);
            PkgError::InvalidStream
        })?;
    }
    Ok(())
}
