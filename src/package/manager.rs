// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::{algorithm_for, AlgorithmContext};
use crate::constants::{DIGEST_MAX_LEN, HASH_SIGNED_DATA_FILE};
use crate::errors::{PkgError, PkgResult};
use crate::package::gzip_file::GZipPkgFile;
use crate::package::info::{
    ComponentInfo, DigestMethod, FileInfo, PkgInfo, UpgradePkgInfo,
};
use crate::package::lz4_file::Lz4PkgFile;
use crate::package::upgrade_file::{UpgradePkgFile, VerifyFn};
use crate::package::zip_file::ZipPkgFile;
use crate::ringbuf::RingBuffer;
use crate::stream::{PkgStream, ProcessorFn};
use crate::utils::{detect_pkg_type, PkgType};
use crate::verify::hash_data::HashDataVerifier;
use crate::verify::verify_util::verify_package_sign;
use crate::utils::write_le32;
use log::{error, info};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

enum EntrySource {
    /// Zip entry with its stored CRC.
    Zip { crc32: u32 },
    /// Upgrade-container component, digest in the component table.
    Upgrade,
    /// Single-entry container (lz4 / gzip), unpacked as a whole.
    Single,
}

struct FileEntry {
    info: FileInfo,
    comp: Option<ComponentInfo>,
    source: EntrySource,
}

#[derive(Default)]
struct ManagerState {
    streams: HashMap<String, Arc<Mutex<PkgStream>>>,
    entries: HashMap<String, FileEntry>,
    entry_order: Vec<String>,
    pkg_stream: Option<Arc<Mutex<PkgStream>>>,
    pkg_info: PkgInfo,
    upgrade_info: Option<UpgradePkgInfo>,
}

/// Façade over one loaded package: resolves inner names to entries,
/// extracts entries into caller streams, and interns every stream it hands
/// out so a caller reusing a name gets the same underlying stream back.
#[derive(Default)]
pub struct PkgManager {
    state: Mutex<ManagerState>,
}

impl PkgManager {
    pub fn new() -> PkgManager {
        PkgManager::default()
    }

    /// Loads a signed outer package (a ZIP whose EOCD comment carries the
    /// PKCS#7 signature). Returns the inner file names.
    pub fn load_package(&self, path: &Path) -> PkgResult<Vec<String>> {
        let stream = PkgStream::open_read(&path.to_string_lossy(), path)?;
        self.load_zip_from_stream(stream, true)
    }

    /// Same, but skips the outer signature (test fixtures, pre-verified
    /// working copies).
    pub fn load_package_unverified(&self, path: &Path) -> PkgResult<Vec<String>> {
        let stream = PkgStream::open_read(&path.to_string_lossy(), path)?;
        self.load_zip_from_stream(stream, false)
    }

    /// Loads any supported container from an already-open stream, sniffed
    /// by magic. Upgrade containers need the caller's `verifier`.
    pub fn load_from_stream(
        &self,
        mut stream: PkgStream,
        verifier: Option<VerifyFn>,
    ) -> PkgResult<Vec<String>> {
        let mut magic = [0u8; 4];
        if stream.read(&mut magic, 0)? != 4 {
            return Err(PkgError::InvalidFile);
        }
        match detect_pkg_type(&magic)? {
            // the outer signature was either checked by the path-based
            // loaders or is not present on working copies
            PkgType::Zip => self.load_zip_from_stream(stream, false),
            PkgType::Upgrade => {
                let verifier = verifier.ok_or(PkgError::InvalidSignature)?;
                self.load_upgrade_from_stream(stream, verifier)
            }
            PkgType::Lz4 => self.load_lz4_from_stream(stream),
            PkgType::GZip => self.load_gzip_from_stream(stream),
        }
    }

    fn load_zip_from_stream(&self, mut stream: PkgStream, verify: bool) -> PkgResult<Vec<String>> {
        if verify {
            verify_package_sign(&mut stream)?;
        }
        let mut zip = ZipPkgFile::new(stream);
        let names = zip.load()?;
        info!("loaded zip package with {} entries", names.len());

        let mut state = self.state.lock().unwrap();
        state.pkg_info = PkgInfo {
            entry_count: names.len() as u32,
            pkg_type: crate::package::info::PkgKind::Zip,
            ..Default::default()
        };
        for entry in zip.entries() {
            state.entries.insert(
                entry.file.identity.clone(),
                FileEntry {
                    info: entry.file.clone(),
                    comp: None,
                    source: EntrySource::Zip { crc32: entry.crc32 },
                },
            );
        }
        state.entry_order = names.clone();
        state.pkg_stream = Some(Arc::new(Mutex::new(zip.into_stream())));
        Ok(names)
    }

    /// Loads an "update.bin" container; `verifier` checks the trailer
    /// signature against the streamed digest.
    pub fn load_upgrade_from_stream(
        &self,
        stream: PkgStream,
        verifier: VerifyFn,
    ) -> PkgResult<Vec<String>> {
        let mut pkg = UpgradePkgFile::new(stream, UpgradePkgInfo::default());
        let names = pkg.load_package(verifier)?;

        let mut state = self.state.lock().unwrap();
        state.pkg_info = pkg.pkg_info().pkg_info.clone();
        state.upgrade_info = Some(pkg.pkg_info().clone());
        for comp in pkg.entries() {
            state.entries.insert(
                comp.file.identity.clone(),
                FileEntry {
                    info: comp.file.clone(),
                    comp: Some(comp.clone()),
                    source: EntrySource::Upgrade,
                },
            );
        }
        state.entry_order = names.clone();
        state.pkg_stream = Some(Arc::new(Mutex::new(pkg.into_stream())));
        Ok(names)
    }

    fn load_lz4_from_stream(&self, stream: PkgStream) -> PkgResult<Vec<String>> {
        let mut pkg = Lz4PkgFile::new(stream);
        let names = pkg.load()?;
        let entry = pkg.entry().cloned().ok_or(PkgError::InvalidFile)?;
        let mut state = self.state.lock().unwrap();
        state.pkg_info.entry_count = 1;
        state.pkg_info.pkg_type = crate::package::info::PkgKind::Lz4;
        state.entries.insert(
            entry.file.identity.clone(),
            FileEntry {
                info: entry.file.clone(),
                comp: None,
                source: EntrySource::Single,
            },
        );
        state.entry_order = names.clone();
        state.pkg_stream = Some(Arc::new(Mutex::new(pkg.into_stream())));
        Ok(names)
    }

    fn load_gzip_from_stream(&self, stream: PkgStream) -> PkgResult<Vec<String>> {
        let mut pkg = GZipPkgFile::new(stream);
        let names = pkg.load()?;
        let entry = pkg.entry().cloned().ok_or(PkgError::InvalidFile)?;
        let mut state = self.state.lock().unwrap();
        state.pkg_info.entry_count = 1;
        state.pkg_info.pkg_type = crate::package::info::PkgKind::GZip;
        state.entries.insert(
            entry.identity.clone(),
            FileEntry {
                info: entry.clone(),
                comp: None,
                source: EntrySource::Single,
            },
        );
        state.entry_order = names.clone();
        state.pkg_stream = Some(Arc::new(Mutex::new(pkg.into_stream())));
        Ok(names)
    }

    pub fn pkg_info(&self) -> PkgInfo {
        self.state.lock().unwrap().pkg_info.clone()
    }

    pub fn upgrade_info(&self) -> Option<UpgradePkgInfo> {
        self.state.lock().unwrap().upgrade_info.clone()
    }

    pub fn file_names(&self) -> Vec<String> {
        self.state.lock().unwrap().entry_order.clone()
    }

    pub fn file_info(&self, name: &str) -> Option<FileInfo> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(name)
            .map(|e| e.info.clone())
    }

    pub fn component_info(&self, name: &str) -> Option<ComponentInfo> {
        self.state
            .lock()
            .unwrap()
            .entries
            .get(name)
            .and_then(|e| e.comp.clone())
    }

    fn pkg_stream(&self) -> PkgResult<Arc<Mutex<PkgStream>>> {
        self.state
            .lock()
            .unwrap()
            .pkg_stream
            .clone()
            .ok_or(PkgError::InvalidState)
    }

    /// Unpacks the named entry into `output`. Returns the unpacked size.
    pub fn extract_file(&self, name: &str, output: &mut PkgStream) -> PkgResult<u64> {
        let (info, digest) = {
            let state = self.state.lock().unwrap();
            let entry = state.entries.get(name).ok_or_else(|| {
                error!("no inner file {}", name);
                PkgError::InvalidFile
            })?;
            let digest = match &entry.source {
                EntrySource::Zip { crc32 } => {
                    let mut digest = [0u8; DIGEST_MAX_LEN];
                    write_le32(&mut digest[..4], *crc32);
                    Some((DigestMethod::Crc32, digest))
                }
                // component digests cover the stored payload
                EntrySource::Upgrade => entry
                    .comp
                    .as_ref()
                    .map(|comp| (DigestMethod::Sha256, comp.digest)),
                EntrySource::Single => None,
            };
            (entry.info.clone(), digest)
        };
        let pkg_stream = self.pkg_stream()?;
        let mut pkg_stream = pkg_stream.lock().unwrap();

        let algorithm = algorithm_for(info.pack_method)?;
        let mut ctx = AlgorithmContext {
            src_offset: info.data_offset,
            dst_offset: 0,
            packed_size: info.packed_size,
            unpacked_size: info.unpacked_size,
            digest_method: DigestMethod::None,
            digest: [0u8; DIGEST_MAX_LEN],
        };
        if let Some((method, digest)) = digest {
            ctx.digest_method = method;
            ctx.digest = digest;
        }
        algorithm.unpack(&mut pkg_stream, output, &mut ctx)?;
        output.flush(ctx.unpacked_size)?;
        Ok(ctx.unpacked_size)
    }

    /// Extracts the named entry into a fresh memory buffer.
    pub fn extract_to_memory(&self, name: &str) -> PkgResult<Vec<u8>> {
        let mut out = PkgStream::memory(name, Vec::new());
        self.extract_file(name, &mut out)?;
        out.into_buffer()
    }

    /// Builds the per-inner-file verifier from `hash_signed_data` and the
    /// outer signature.
    pub fn create_hash_verifier(&self) -> PkgResult<HashDataVerifier> {
        let table = self.extract_to_memory(HASH_SIGNED_DATA_FILE)?;
        let pkg_stream = self.pkg_stream()?;
        let mut pkg_stream = pkg_stream.lock().unwrap();
        let mut verifier = HashDataVerifier::new();
        verifier.load(&mut pkg_stream, &table)?;
        Ok(verifier)
    }

    // ---- stream interning ----

    /// Registers `stream` under its name; a caller reusing the name gets
    /// the same underlying stream back.
    pub fn create_stream(&self, stream: PkgStream) -> Arc<Mutex<PkgStream>> {
        let mut state = self.state.lock().unwrap();
        let name = stream.name().to_string();
        state
            .streams
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(stream)))
            .clone()
    }

    pub fn create_file_stream(
        &self,
        name: &str,
        path: &Path,
        write: bool,
    ) -> PkgResult<Arc<Mutex<PkgStream>>> {
        if let Some(existing) = self.state.lock().unwrap().streams.get(name) {
            return Ok(existing.clone());
        }
        let stream = if write {
            PkgStream::open_write(name, path)?
        } else {
            PkgStream::open_read(name, path)?
        };
        Ok(self.create_stream(stream))
    }

    pub fn create_processor_stream(
        &self,
        name: &str,
        len: u64,
        func: ProcessorFn,
    ) -> Arc<Mutex<PkgStream>> {
        self.create_stream(PkgStream::processor(name, len, func))
    }

    pub fn create_flow_stream(
        &self,
        name: &str,
        ring: Arc<RingBuffer>,
        declared_len: u64,
    ) -> Arc<Mutex<PkgStream>> {
        self.create_stream(PkgStream::flow_data(name, ring, declared_len))
    }

    /// Drops the manager's reference; the stream dies with the last
    /// outstanding handle.
    pub fn close_pkg_stream(&self, name: &str) {
        self.state.lock().unwrap().streams.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::zip_file::ZipPkgFile;
    use crate::verify::pkcs7::testutil::TestSigner;
    use crate::verify::zip_parse::write_zip_signed_data;
    use sha2::{Digest, Sha256};
    use std::io::Write;

    pub(crate) fn build_outer_zip(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut zip = ZipPkgFile::new(PkgStream::memory("pkg.zip", Vec::new()));
        for (name, data) in files {
            let mut input = PkgStream::memory(name, data.clone());
            zip.add_entry(name, &mut input, 8).unwrap();
        }
        zip.save().unwrap();
        zip.into_stream().into_buffer().unwrap()
    }

    pub(crate) fn sign_outer(signer: &TestSigner, plain: Vec<u8>) -> Vec<u8> {
        let digest = Sha256::digest(&plain[..plain.len() - 2]).to_vec();
        let p7 = signer.build_signed_data(&digest);
        let mut input = PkgStream::memory("src.zip", plain);
        let mut out = PkgStream::memory("signed.zip", Vec::new());
        write_zip_signed_data(&mut out, &p7, &mut input).unwrap();
        out.into_buffer().unwrap()
    }

    #[test]
    fn load_signed_package_and_extract() {
        let signer = TestSigner::new();
        let script = b"sha_check /system 2,0,2 abc\n".to_vec();
        let table = crate::verify::hash_data::testutil::build_hash_signed_data(
            &signer,
            &[("update_script", &script)],
        );
        let bytes = sign_outer(
            &signer,
            build_outer_zip(&[
                ("update_script", script.clone()),
                ("hash_signed_data", table),
            ]),
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signed.zip");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let manager = PkgManager::new();
        let names = manager.load_package(&path).unwrap();
        assert!(names.contains(&"update_script".to_string()));

        let extracted = manager.extract_to_memory("update_script").unwrap();
        assert_eq!(extracted, script);

        // hash verifier armed from the same package accepts the file
        let verifier = manager.create_hash_verifier().unwrap();
        let mut stream = PkgStream::memory("update_script", extracted);
        assert!(verifier.verify_hash_data("update_script", &mut stream));
    }

    #[test]
    fn tampered_outer_package_is_refused() {
        let signer = TestSigner::new();
        let mut bytes = sign_outer(
            &signer,
            build_outer_zip(&[("update_script", b"noop\n".to_vec())]),
        );
        bytes[50] ^= 0xFF;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signed.zip");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&bytes)
            .unwrap();

        let manager = PkgManager::new();
        assert!(manager.load_package(&path).is_err());
    }

    #[test]
    fn interned_streams_are_shared() {
        let manager = PkgManager::new();
        let first = manager.create_stream(PkgStream::memory("scratch", vec![1, 2, 3]));
        let second = manager.create_stream(PkgStream::memory("scratch", Vec::new()));
        assert!(Arc::ptr_eq(&first, &second));
        manager.close_pkg_stream("scratch");
        let third = manager.create_stream(PkgStream::memory("scratch", Vec::new()));
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn missing_entry_is_invalid_file() {
        let manager = PkgManager::new();
        let mut out = PkgStream::memory("out", Vec::new());
        assert_eq!(
            manager.extract_file("nope", &mut out).unwrap_err(),
            PkgError::InvalidFile
        );
    }
}
