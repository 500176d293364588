// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::package::manager::PkgManager;
use crate::updater::partition_record::PartitionRecord;
use crate::verify::hash_data::HashDataVerifier;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Structured messages the updater binary streams to its parent, one per
/// line on the pipe.
pub type PostMessageFn = Box<dyn Fn(&str, &str) + Send + Sync>;

/// Everything a script instruction may touch: the loaded package, the
/// work/device directories, the resume record and the parent pipe.
pub struct UpdateEnv {
    pub manager: Arc<PkgManager>,
    pub record: PartitionRecord,
    pub hash_verifier: Option<HashDataVerifier>,
    work_dir: PathBuf,
    device_dir: PathBuf,
    misc_path: PathBuf,
    retry: bool,
    post: PostMessageFn,
}

impl UpdateEnv {
    pub fn new(
        manager: Arc<PkgManager>,
        work_dir: PathBuf,
        device_dir: PathBuf,
        misc_path: PathBuf,
        retry: bool,
        post: PostMessageFn,
    ) -> UpdateEnv {
        let record = PartitionRecord::new(work_dir.join("partition_record"));
        UpdateEnv {
            manager,
            record,
            hash_verifier: None,
            work_dir,
            device_dir,
            misc_path,
            retry,
            post,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.retry
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    pub fn misc_path(&self) -> &Path {
        &self.misc_path
    }

    /// Resolves a partition name (`/system`) to its block device node.
    pub fn block_device_path(&self, partition: &str) -> PathBuf {
        self.device_dir.join(partition.trim_start_matches('/'))
    }

    pub fn post_message(&self, cmd: &str, content: &str) {
        (self.post)(cmd, content);
    }

    pub fn set_progress(&self, value: f32) {
        (self.post)("set_progress", &format!("{:.2}", value));
    }

    pub fn ui_log(&self, text: &str) {
        (self.post)("ui_log", text);
    }

    /// Verifies extracted inner-file bytes against the signed hash table
    /// when the verifier is armed.
    pub fn verify_inner_file(&self, name: &str, data: &[u8]) -> bool {
        match &self.hash_verifier {
            Some(verifier) => {
                let mut stream = crate::stream::PkgStream::memory(name, data.to_vec());
                verifier.verify_hash_data(name, &mut stream)
            }
            None => true,
        }
    }
}
