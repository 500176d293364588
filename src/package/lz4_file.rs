// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::{algorithm_for, AlgorithmContext};
use crate::constants::{LZ4_BLOCK_MAGIC, LZ4_FRAME_MAGIC};
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{FileInfo, Lz4FileInfo, PackMethod};
use crate::stream::PkgStream;
use log::error;
use std::path::Path;

/// LZ4 file container: the whole file is one frame (or one custom block
/// sequence), holding a single logical entry.
pub struct Lz4PkgFile {
    stream: PkgStream,
    entry: Option<Lz4FileInfo>,
}

impl Lz4PkgFile {
    pub fn new(stream: PkgStream) -> Lz4PkgFile {
        Lz4PkgFile {
            stream,
            entry: None,
        }
    }

    pub fn entry(&self) -> Option<&Lz4FileInfo> {
        self.entry.as_ref()
    }

    pub fn stream_mut(&mut self) -> &mut PkgStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> PkgStream {
        self.stream
    }

    /// Sniffs the magic and registers the single entry. The entry name is
    /// the file stem of the container.
    pub fn load(&mut self) -> PkgResult<Vec<String>> {
        let mut magic = [0u8; 4];
        if self.stream.read(&mut magic, 0)? != 4 {
            return Err(PkgError::InvalidFile);
        }
        let pack_method = if magic == LZ4_FRAME_MAGIC {
            PackMethod::Lz4Frame
        } else if magic == LZ4_BLOCK_MAGIC {
            PackMethod::Lz4Block
        } else {
            error!("bad lz4 magic {:02X?}", magic);
            return Err(PkgError::InvalidLz4);
        };

        let identity = Path::new(self.stream.name())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.stream.name().to_string());
        let info = Lz4FileInfo {
            file: FileInfo {
                identity: identity.clone(),
                pack_method,
                packed_size: self.stream.len(),
                unpacked_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        self.entry = Some(info);
        Ok(vec![identity])
    }

    pub fn extract(&mut self, output: &mut PkgStream) -> PkgResult<u64> {
        let entry = self.entry.clone().ok_or(PkgError::InvalidState)?;
        let algorithm = algorithm_for(entry.file.pack_method)?;
        let mut ctx = AlgorithmContext {
            src_offset: 0,
            packed_size: entry.file.packed_size,
            ..Default::default()
        };
        algorithm.unpack(&mut self.stream, output, &mut ctx)?;
        if let Some(entry) = self.entry.as_mut() {
            entry.file.unpacked_size = ctx.unpacked_size;
        }
        Ok(ctx.unpacked_size)
    }

    /// Packs `input` as the container contents with the given preferences.
    pub fn add_entry(&mut self, info: &Lz4FileInfo, input: &mut PkgStream) -> PkgResult<()> {
        if self.entry.is_some() {
            error!("lz4 container already holds an entry");
            return Err(PkgError::InvalidState);
        }
        let mut entry = info.clone();
        entry.file.unpacked_size = input.len();
        let mut ctx = AlgorithmContext {
            unpacked_size: entry.file.unpacked_size,
            digest_method: entry.file.digest_method,
            ..Default::default()
        };
        match entry.file.pack_method {
            PackMethod::Lz4Frame => {
                crate::codec::lz4::Lz4FrameAlgorithm.pack_with_info(
                    input,
                    &mut self.stream,
                    &mut ctx,
                    &entry,
                )?;
            }
            PackMethod::Lz4Block => {
                algorithm_for(PackMethod::Lz4Block)?.pack(input, &mut self.stream, &mut ctx)?;
            }
            _ => return Err(PkgError::InvalidParam),
        }
        entry.file.packed_size = ctx.packed_size;
        self.stream.flush(ctx.packed_size)?;
        self.entry = Some(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lz4_container_round_trip() {
        let data = b"frame framed data ".repeat(4096);
        let mut input = PkgStream::memory("ramdisk.img", data.clone());
        let mut pkg = Lz4PkgFile::new(PkgStream::memory("ramdisk.img.lz4", Vec::new()));
        let info = Lz4FileInfo {
            file: FileInfo {
                pack_method: PackMethod::Lz4Frame,
                identity: "ramdisk.img".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        pkg.add_entry(&info, &mut input).unwrap();
        let bytes = pkg.into_stream().into_buffer().unwrap();
        assert!(bytes.len() < data.len());

        let mut pkg = Lz4PkgFile::new(PkgStream::memory("ramdisk.img.lz4", bytes));
        let names = pkg.load().unwrap();
        assert_eq!(names, vec!["ramdisk.img"]);
        let mut out = PkgStream::memory("out", Vec::new());
        pkg.extract(&mut out).unwrap();
        assert_eq!(out.buffer().unwrap(), &data[..]);
    }

    #[test]
    fn load_rejects_non_lz4() {
        let mut pkg = Lz4PkgFile::new(PkgStream::memory("x.lz4", vec![9u8; 32]));
        assert_eq!(pkg.load().unwrap_err(), PkgError::InvalidLz4);
    }
}
