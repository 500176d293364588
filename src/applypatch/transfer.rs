// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::applypatch::block_set::BlockSet;
use crate::applypatch::image_patch::apply_image_patch;
use crate::applypatch::store;
use crate::applypatch::writer::{
    discard_blocks, read_blocks, write_blocks, zero_blocks, BlockWriter, DataWriter,
};
use crate::constants::{TRANSFER_LIST_VERSION_MAX, TRANSFER_LIST_VERSION_MIN};
use crate::errors::{PkgError, PkgResult};
use crate::package::manager::PkgManager;
use crate::stream::PkgStream;
use crate::utils::sha256_hex;
use log::{debug, error, info, warn};
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// How a transfer run failed; the script layer maps these onto the fault
/// tags the retry controller understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Source or target hash mismatch.
    VerifyFailed,
    /// Device or stash I/O failed.
    IoFailed,
    /// Malformed transfer list or patch data.
    Format,
}

impl From<PkgError> for TransferError {
    fn from(e: PkgError) -> TransferError {
        match e {
            PkgError::InvalidDigest => TransferError::VerifyFailed,
            PkgError::InvalidStream => TransferError::IoFailed,
            _ => TransferError::Format,
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;

struct WriterState {
    writer: Option<BlockWriter>,
    ready_to_write: bool,
    failed: bool,
}

/// The producer/consumer handshake of the new-data path. The consumer
/// installs a writer per `new` command; the producer thread fills it and
/// removes it when its ranges are complete.
pub struct WriterThreadInfo {
    state: Mutex<WriterState>,
    cond: Condvar,
}

impl WriterThreadInfo {
    fn new() -> WriterThreadInfo {
        WriterThreadInfo {
            state: Mutex::new(WriterState {
                writer: None,
                ready_to_write: true,
                failed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Producer side: blocks until a writer is installed, then forwards
    /// bytes. Returns an error once the consumer is done with `new`
    /// commands.
    fn write_chunk(&self, data: &[u8]) -> PkgResult<()> {
        let mut data = data;
        while !data.is_empty() {
            let mut state = self.state.lock().unwrap();
            while state.writer.is_none() {
                if !state.ready_to_write {
                    warn!("writer is not ready to write");
                    return Err(PkgError::InvalidStream);
                }
                state = self.cond.wait(state).unwrap();
            }
            let writer = state.writer.as_mut().unwrap();
            let room = writer.blocks_size() - writer.total_written();
            let take = data.len().min(room as usize);
            if take > 0 {
                writer.write(&data[..take])?;
                data = &data[take..];
            }
            if writer.is_write_done() {
                state.writer = None;
                self.cond.notify_all();
            }
        }
        Ok(())
    }

    /// Consumer side: installs the writer for one `new` command and waits
    /// until the producer has filled it.
    fn install_and_wait(&self, writer: BlockWriter) -> TransferResult<()> {
        let mut state = self.state.lock().unwrap();
        state.writer = Some(writer);
        self.cond.notify_all();
        while state.writer.is_some() {
            if state.failed {
                error!("new data producer failed");
                return Err(TransferError::IoFailed);
            }
            if !state.ready_to_write {
                error!("new data ran out before the target ranges were filled");
                return Err(TransferError::IoFailed);
            }
            state = self.cond.wait(state).unwrap();
        }
        if state.failed {
            return Err(TransferError::IoFailed);
        }
        Ok(())
    }

    /// Either side: no more data will flow.
    fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        state.ready_to_write = false;
        self.cond.notify_all();
    }

    fn fail(&self) {
        let mut state = self.state.lock().unwrap();
        state.failed = true;
        state.ready_to_write = false;
        self.cond.notify_all();
    }
}

/// Per-transfer parameters, created on entry to a block update and
/// destroyed after the writer thread joins.
pub struct TransferParams {
    pub manager: Arc<PkgManager>,
    pub store_base: PathBuf,
    pub retry_file: PathBuf,
    pub new_data_name: String,
    pub patch_data: Vec<u8>,
    pub retry: bool,
}

struct TransferHeader {
    version: u32,
    total_blocks: u64,
    max_stash_blocks: u64,
    max_stash_entries: u64,
}

/// Executes a transfer-list command stream against one block device,
/// feeding `new` commands from an independently scheduled producer thread.
pub struct TransferManager {
    params: TransferParams,
    writer_info: Arc<WriterThreadInfo>,
    written_blocks: u64,
}

impl TransferManager {
    pub fn new(params: TransferParams) -> TransferManager {
        TransferManager {
            params,
            writer_info: Arc::new(WriterThreadInfo::new()),
            written_blocks: 0,
        }
    }

    /// Runs the whole command stream. The producer thread is started here
    /// and joined before returning, success or not.
    pub fn execute(&mut self, device: &File, lines: &[String]) -> TransferResult<()> {
        let header = parse_header(lines)?;
        info!(
            "transfer list v{}: {} blocks, stash limit {} blocks / {} entries",
            header.version, header.total_blocks, header.max_stash_blocks, header.max_stash_entries
        );

        let producer = self.start_producer();
        let result = self.run_commands(device, &lines[4..], &header);

        // wake the producer out of its writer wait and join it
        self.writer_info.finish();
        if let Some(handle) = producer {
            if handle.join().is_err() {
                warn!("new data producer panicked");
            }
        }
        result
    }

    fn start_producer(&self) -> Option<JoinHandle<()>> {
        if self.params.new_data_name.is_empty() {
            return None;
        }
        let manager = Arc::clone(&self.params.manager);
        let info = Arc::clone(&self.writer_info);
        let name = self.params.new_data_name.clone();
        Some(std::thread::spawn(move || {
            unpack_new_data(manager, &name, &info);
        }))
    }

    fn run_commands(
        &mut self,
        device: &File,
        commands: &[String],
        header: &TransferHeader,
    ) -> TransferResult<()> {
        for (index, line) in commands.iter().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let mut tokens = line.split_whitespace();
            let cmd = tokens.next().ok_or(TransferError::Format)?;

            if self.skip_on_retry(index) {
                debug!("skip command {} {} on retry", index, cmd);
                // a skipped `new` still has to drain its bytes
                if cmd == "new" {
                    let target = BlockSet::parse_tokens(&mut tokens).map_err(TransferError::from)?;
                    let writer = BlockWriter::new_discard(
                        device.try_clone().map_err(|_| TransferError::IoFailed)?,
                        target,
                    );
                    self.writer_info.install_and_wait(writer)?;
                }
                continue;
            }

            match cmd {
                "erase" => {
                    let set = BlockSet::parse_tokens(&mut tokens).map_err(TransferError::from)?;
                    discard_blocks(device, &set).map_err(TransferError::from)?;
                }
                "zero" => {
                    let set = BlockSet::parse_tokens(&mut tokens).map_err(TransferError::from)?;
                    zero_blocks(device, &set).map_err(TransferError::from)?;
                    self.written_blocks += set.total_blocks();
                }
                "new" => {
                    let target = BlockSet::parse_tokens(&mut tokens).map_err(TransferError::from)?;
                    let blocks = target.total_blocks();
                    let writer = BlockWriter::new(
                        device.try_clone().map_err(|_| TransferError::IoFailed)?,
                        target,
                    );
                    self.writer_info.install_and_wait(writer)?;
                    self.written_blocks += blocks;
                }
                "move" => self.do_move(device, &mut tokens)?,
                "bsdiff" | "imgdiff" => self.do_diff(device, &mut tokens)?,
                "stash" => self.do_stash(device, &mut tokens)?,
                "free" => {
                    let tag = tokens.next().ok_or(TransferError::Format)?;
                    store::store_delete(&self.params.store_base, tag)
                        .map_err(TransferError::from)?;
                }
                other => {
                    error!("unknown transfer command {}", other);
                    return Err(TransferError::Format);
                }
            }
            if self.written_blocks > header.total_blocks {
                warn!(
                    "written {} blocks of declared {}",
                    self.written_blocks, header.total_blocks
                );
            }
            self.record_checkpoint(index);
        }
        Ok(())
    }

    fn do_move<'a, I: Iterator<Item = &'a str>>(
        &mut self,
        device: &File,
        tokens: &mut I,
    ) -> TransferResult<()> {
        let expected = tokens.next().ok_or(TransferError::Format)?;
        let target = BlockSet::parse_tokens(tokens).map_err(TransferError::from)?;
        if tokens.next() != Some("-") {
            return Err(TransferError::Format);
        }
        let source = BlockSet::parse_tokens(tokens).map_err(TransferError::from)?;

        let data = read_blocks(device, &source).map_err(TransferError::from)?;
        if !sha256_hex(&data).eq_ignore_ascii_case(expected) {
            error!("move source hash mismatch");
            return Err(TransferError::VerifyFailed);
        }
        write_blocks(device, &target, &data).map_err(TransferError::from)?;
        self.written_blocks += target.total_blocks();
        Ok(())
    }

    fn do_stash<'a, I: Iterator<Item = &'a str>>(
        &mut self,
        device: &File,
        tokens: &mut I,
    ) -> TransferResult<()> {
        let tag = tokens.next().ok_or(TransferError::Format)?;
        let set = BlockSet::parse_tokens(tokens).map_err(TransferError::from)?;
        let data = read_blocks(device, &set).map_err(TransferError::from)?;
        if !sha256_hex(&data).eq_ignore_ascii_case(tag) {
            error!("stash source hash mismatch");
            return Err(TransferError::VerifyFailed);
        }
        store::store_write(&self.params.store_base, tag, &data).map_err(TransferError::from)
    }

    fn do_diff<'a, I: Iterator<Item = &'a str>>(
        &mut self,
        device: &File,
        tokens: &mut I,
    ) -> TransferResult<()> {
        let patch_offset: usize = tokens
            .next()
            .ok_or(TransferError::Format)?
            .parse()
            .map_err(|_| TransferError::Format)?;
        let patch_len: usize = tokens
            .next()
            .ok_or(TransferError::Format)?
            .parse()
            .map_err(|_| TransferError::Format)?;
        let src_hash = tokens.next().ok_or(TransferError::Format)?;
        let tgt_hash = tokens.next().ok_or(TransferError::Format)?;
        let target = BlockSet::parse_tokens(tokens).map_err(TransferError::from)?;

        let source = self.load_source(device, tokens)?;
        if !sha256_hex(&source).eq_ignore_ascii_case(src_hash) {
            error!("diff source hash mismatch");
            return Err(TransferError::VerifyFailed);
        }
        if patch_offset + patch_len > self.params.patch_data.len() {
            error!(
                "patch window {}+{} outside blob of {}",
                patch_offset,
                patch_len,
                self.params.patch_data.len()
            );
            return Err(TransferError::Format);
        }
        let patch = &self.params.patch_data[patch_offset..patch_offset + patch_len];
        let result = apply_image_patch(&source, patch).map_err(TransferError::from)?;
        if result.len() as u64 != target.total_bytes() {
            error!(
                "patched data is {} bytes for {} target bytes",
                result.len(),
                target.total_bytes()
            );
            return Err(TransferError::Format);
        }
        if !sha256_hex(&result).eq_ignore_ascii_case(tgt_hash) {
            error!("diff target hash mismatch");
            return Err(TransferError::VerifyFailed);
        }
        write_blocks(device, &target, &result).map_err(TransferError::from)?;
        self.written_blocks += target.total_blocks();
        Ok(())
    }

    /// Source-range spec of diff commands: either a plain BlockSet, or
    /// `N source:location …` where each `source` is a comma-form BlockSet
    /// read from the device or a stash tag, scattered into an N-block
    /// buffer at `location`.
    fn load_source<'a, I: Iterator<Item = &'a str>>(
        &self,
        device: &File,
        tokens: &mut I,
    ) -> TransferResult<Vec<u8>> {
        let rest: Vec<&str> = tokens.collect();
        if rest.is_empty() {
            return Err(TransferError::Format);
        }
        if !rest.iter().any(|t| t.contains(':')) {
            let mut iter = rest.iter().copied();
            let set = BlockSet::parse_tokens(&mut iter).map_err(TransferError::from)?;
            if iter.next().is_some() {
                return Err(TransferError::Format);
            }
            return read_blocks(device, &set).map_err(TransferError::from);
        }

        let total_blocks: u64 = rest[0].parse().map_err(|_| TransferError::Format)?;
        let mut buffer = vec![0u8; (total_blocks * crate::constants::BLOCK_SIZE) as usize];
        for part in &rest[1..] {
            let (source, location) = part.split_once(':').ok_or(TransferError::Format)?;
            let location = BlockSet::parse(location).map_err(TransferError::from)?;
            let data = if source.len() == 64 && source.bytes().all(|b| b.is_ascii_hexdigit()) {
                store::store_read(&self.params.store_base, source).map_err(TransferError::from)?
            } else {
                let set = BlockSet::parse(source).map_err(TransferError::from)?;
                read_blocks(device, &set).map_err(TransferError::from)?
            };
            if data.len() as u64 != location.total_bytes() {
                error!("source fragment does not fit its location map");
                return Err(TransferError::Format);
            }
            scatter(&mut buffer, &location, &data)?;
        }
        Ok(buffer)
    }

    // ---- retry checkpoints ----

    fn checkpoint_tag(index: usize) -> String {
        format!("cmd_{:06}", index)
    }

    fn skip_on_retry(&self, index: usize) -> bool {
        self.params.retry
            && store::store_exists(&self.params.store_base, &Self::checkpoint_tag(index))
    }

    fn record_checkpoint(&self, index: usize) {
        if let Err(e) = store::store_write(
            &self.params.store_base,
            &Self::checkpoint_tag(index),
            &(index as u64).to_le_bytes(),
        ) {
            warn!("record checkpoint {} failed: {}", index, e);
        }
    }
}

/// Copies a linear fragment into buffer-block coordinates.
fn scatter(buffer: &mut [u8], location: &BlockSet, data: &[u8]) -> TransferResult<()> {
    let mut pos = 0usize;
    for &(start, end) in location.pairs() {
        let offset = (start * crate::constants::BLOCK_SIZE) as usize;
        let len = ((end - start) * crate::constants::BLOCK_SIZE) as usize;
        if offset + len > buffer.len() {
            error!("location map exceeds source buffer");
            return Err(TransferError::Format);
        }
        buffer[offset..offset + len].copy_from_slice(&data[pos..pos + len]);
        pos += len;
    }
    Ok(())
}

fn parse_header(lines: &[String]) -> TransferResult<TransferHeader> {
    if lines.len() < 4 {
        error!("transfer list too short");
        return Err(TransferError::Format);
    }
    let version: u32 = lines[0].trim().parse().map_err(|_| TransferError::Format)?;
    if !(TRANSFER_LIST_VERSION_MIN..=TRANSFER_LIST_VERSION_MAX).contains(&version) {
        error!("unsupported transfer list version {}", version);
        return Err(TransferError::Format);
    }
    let total_blocks = lines[1].trim().parse().map_err(|_| TransferError::Format)?;
    let max_stash_blocks = lines[2].trim().parse().map_err(|_| TransferError::Format)?;
    let max_stash_entries = lines[3].trim().parse().map_err(|_| TransferError::Format)?;
    Ok(TransferHeader {
        version,
        total_blocks,
        max_stash_blocks,
        max_stash_entries,
    })
}

/// Producer thread body: extracts the designated inner file and pushes its
/// bytes through the writer handshake.
fn unpack_new_data(manager: Arc<PkgManager>, name: &str, info: &Arc<WriterThreadInfo>) {
    let Some(file_info) = manager.file_info(name) else {
        warn!("cannot get file info of {}", name);
        info.finish();
        return;
    };
    debug!(
        "new data {}: packed {} unpacked {}",
        name, file_info.packed_size, file_info.unpacked_size
    );
    let chunk_sink = Arc::clone(info);
    let mut stream = PkgStream::processor(
        name,
        file_info.unpacked_size,
        Box::new(move |chunk, _start, _finish| chunk_sink.write_chunk(chunk)),
    );
    match manager.extract_file(name, &mut stream) {
        Ok(_) => {
            debug!("new data writer ending");
            info.finish();
        }
        Err(e) => {
            // the consumer closing the handshake cancels the extraction;
            // that is the natural end, not a producer fault
            let consumer_done = !info.state.lock().unwrap().ready_to_write;
            if consumer_done {
                info.finish();
            } else {
                error!("extract {} failed: {}", name, e);
                info.fail();
            }
        }
    }
}
