// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::applypatch::writer::{DataWriter, RawWriter};
use crate::codec::digest::DigestAlgorithm;
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{comp_type, ComponentInfo, UpgradePkgInfo};
use crate::package::upgrade_file::{parse_upgrade_head, upgrade_head_len};
use crate::ringbuf::RingBuffer;
use crate::stream::PkgStream;
use crate::updater::env::UpdateEnv;
use log::{debug, error, info, warn};
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::sync::Arc;

const RING_SLOT_SIZE: u32 = 64 * 1024;
const RING_SLOT_NUM: u32 = 16;

/// Per-component sink of the streaming update.
enum Processor {
    /// Raw image bytes land on the partition.
    Image(RawWriter),
    /// Version / board-id components are inspected, never written.
    Inspect(Vec<u8>),
    /// Already-applied partitions drain without touching the device.
    Skip,
}

/// Streaming consumer of an "update.bin" fed chunk-by-chunk: parses the
/// signed head as bytes arrive, routes each component's payload into its
/// processor, and verifies the trailer signature once the stream ends.
pub struct BinFlowUpdate<'a> {
    env: &'a UpdateEnv,
    pending: Vec<u8>,
    head: Option<FlowHead>,
    comp_index: usize,
    comp_written: u64,
    comp_hasher: Sha256,
    processor: Option<Processor>,
    pkg_digest: Option<DigestAlgorithm>,
}

struct FlowHead {
    pkg_info: UpgradePkgInfo,
    entries: Vec<ComponentInfo>,
    sign_data: Vec<u8>,
}

impl<'a> BinFlowUpdate<'a> {
    pub fn new(env: &'a UpdateEnv) -> BinFlowUpdate<'a> {
        BinFlowUpdate {
            env,
            pending: Vec::new(),
            head: None,
            comp_index: 0,
            comp_written: 0,
            comp_hasher: Sha256::new(),
            processor: None,
            pkg_digest: None,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> PkgResult<()> {
        if self.head.is_none() {
            self.pending.extend_from_slice(data);
            let Some(head_len) = upgrade_head_len(&self.pending)? else {
                return Ok(());
            };
            if (self.pending.len() as u64) < head_len {
                return Ok(());
            }
            let head_bytes = self.pending[..head_len as usize].to_vec();
            let rest = self.pending[head_len as usize..].to_vec();
            self.pending.clear();
            self.parse_head(&head_bytes)?;
            return self.route(&rest);
        }
        self.route(data)
    }

    fn parse_head(&mut self, head: &[u8]) -> PkgResult<()> {
        let (pkg_info, entries, sign_data, digest) = parse_upgrade_head(head)?;
        if entries.is_empty() {
            return Err(PkgError::InvalidPkgFormat);
        }
        info!(
            "bin flow: version {} with {} components",
            pkg_info.update_file_version,
            entries.len()
        );
        self.pkg_digest = Some(digest);
        self.head = Some(FlowHead {
            pkg_info,
            entries,
            sign_data,
        });
        self.open_processor()?;
        Ok(())
    }

    /// Picks the processor of the current component.
    fn open_processor(&mut self) -> PkgResult<()> {
        self.comp_hasher = Sha256::new();
        self.comp_written = 0;
        let head = self.head.as_ref().ok_or(PkgError::InvalidState)?;
        let Some(entry) = head.entries.get(self.comp_index) else {
            self.processor = None;
            return Ok(());
        };
        let name = entry.file.identity.clone();
        self.processor = Some(match entry.comp_type {
            comp_type::VERSION | comp_type::BOARD_ID => Processor::Inspect(Vec::new()),
            _ => {
                if self.env.is_retry() && self.env.record.is_partition_updated(&name) {
                    info!("{} already updated, skip", name);
                    Processor::Skip
                } else {
                    let dev = self.env.block_device_path(&name);
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .create(true)
                        .truncate(false)
                        .open(&dev)
                        .map_err(|e| {
                            error!("open {} failed: {}", dev.display(), e);
                            PkgError::InvalidStream
                        })?;
                    Processor::Image(RawWriter::new(file, 0))
                }
            }
        });
        Ok(())
    }

    fn route(&mut self, data: &[u8]) -> PkgResult<()> {
        let mut data = data;
        while !data.is_empty() {
            let comp_size = {
                let head = self.head.as_ref().ok_or(PkgError::InvalidState)?;
                let Some(entry) = head.entries.get(self.comp_index) else {
                    warn!("{} trailing bytes after the last component", data.len());
                    return Err(PkgError::InvalidPkgFormat);
                };
                entry.file.packed_size
            };
            let take = data.len().min((comp_size - self.comp_written) as usize);
            let chunk = &data[..take];
            if let Some(digest) = self.pkg_digest.as_mut() {
                digest.update(chunk);
            }
            self.comp_hasher.update(chunk);
            match self.processor.as_mut().ok_or(PkgError::InvalidState)? {
                Processor::Image(writer) => writer.write(chunk)?,
                Processor::Inspect(buf) => buf.extend_from_slice(chunk),
                Processor::Skip => {}
            }
            self.comp_written += take as u64;
            data = &data[take..];
            if self.comp_written == comp_size {
                self.finish_component()?;
            }
        }
        Ok(())
    }

    fn finish_component(&mut self) -> PkgResult<()> {
        let head = self.head.as_ref().ok_or(PkgError::InvalidState)?;
        let entry = &head.entries[self.comp_index];
        let name = entry.file.identity.clone();

        let digest = std::mem::take(&mut self.comp_hasher).finalize();
        if digest.as_slice() != entry.digest.as_slice() {
            error!("component {} digest mismatch", name);
            return Err(PkgError::InvalidDigest);
        }

        match self.processor.take().ok_or(PkgError::InvalidState)? {
            Processor::Image(writer) => {
                writer.sync()?;
                self.env.record.record_partition_update_status(&name, true)?;
                info!("bin flow wrote {} ({} bytes)", name, entry.file.packed_size);
            }
            Processor::Inspect(buf) => {
                let text = String::from_utf8_lossy(&buf);
                debug!("component {} carries: {}", name, text.trim_end());
                if entry.comp_type == comp_type::VERSION
                    && !head.pkg_info.software_version.is_empty()
                    && !text.contains(head.pkg_info.software_version.as_str())
                {
                    error!("software version mismatch for {}", name);
                    return Err(PkgError::InvalidVersion);
                }
            }
            Processor::Skip => {
                debug!("component {} drained", name);
            }
        }
        self.comp_index += 1;
        self.open_processor()
    }

    /// End of stream: every component must be complete and the trailer
    /// signature must check out against the package certificates.
    pub fn finish(&mut self) -> PkgResult<()> {
        let head = self.head.as_ref().ok_or(PkgError::InvalidFile)?;
        if self.comp_index != head.entries.len() || self.comp_written != 0 {
            error!(
                "stream ended inside component {} of {}",
                self.comp_index,
                head.entries.len()
            );
            return Err(PkgError::InvalidFile);
        }
        let digest = self
            .pkg_digest
            .take()
            .ok_or(PkgError::InvalidState)?
            .finalize();
        let verifier = self
            .env
            .hash_verifier
            .as_ref()
            .ok_or(PkgError::InvalidSignature)?;
        if !verifier.verify_raw(&digest, &head.sign_data) {
            error!("bin flow signature verify failed");
            return Err(PkgError::InvalidSignature);
        }
        info!("bin flow update complete");
        Ok(())
    }
}

/// Runs the full streaming path: a producer thread extracts the inner
/// container into a bounded ring, the calling thread consumes it.
pub fn run_bin_flow(env: &UpdateEnv, inner_name: &str) -> PkgResult<()> {
    let file_info = env
        .manager
        .file_info(inner_name)
        .ok_or(PkgError::InvalidFile)?;
    let ring = Arc::new(RingBuffer::new(RING_SLOT_SIZE, RING_SLOT_NUM).ok_or(PkgError::NoneMemory)?);

    let producer_ring = Arc::clone(&ring);
    let manager = Arc::clone(&env.manager);
    let name = inner_name.to_string();
    let unpacked = file_info.unpacked_size;
    let producer = std::thread::spawn(move || {
        let push_ring = Arc::clone(&producer_ring);
        let mut stream = PkgStream::processor(
            &name,
            unpacked,
            Box::new(move |chunk, _start, _finish| {
                for piece in chunk.chunks(RING_SLOT_SIZE as usize) {
                    if !push_ring.push(piece) {
                        return Err(PkgError::InvalidStream);
                    }
                }
                Ok(())
            }),
        );
        let result = manager.extract_file(&name, &mut stream);
        if result.is_err() {
            error!("bin flow extract failed");
            producer_ring.stop();
        } else {
            producer_ring.stop_pop();
        }
        result.map(|_| ())
    });

    let mut flow = BinFlowUpdate::new(env);
    let mut slot = vec![0u8; RING_SLOT_SIZE as usize];
    let mut consume_result = Ok(());
    while let Some(n) = ring.pop(&mut slot) {
        if let Err(e) = flow.push(&slot[..n]) {
            consume_result = Err(e);
            ring.stop();
            break;
        }
    }
    let produce_result = producer.join().map_err(|_| PkgError::InvalidStream)?;
    consume_result?;
    produce_result?;
    flow.finish()
}
