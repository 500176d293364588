// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::{algorithm_for, AlgorithmContext};
use crate::constants::GZIP_MAGIC;
use crate::errors::{PkgError, PkgResult};
use crate::package::info::{FileInfo, PackMethod};
use crate::stream::PkgStream;
use log::error;
use std::path::Path;

/// Single-member gzip container.
pub struct GZipPkgFile {
    stream: PkgStream,
    entry: Option<FileInfo>,
}

impl GZipPkgFile {
    pub fn new(stream: PkgStream) -> GZipPkgFile {
        GZipPkgFile {
            stream,
            entry: None,
        }
    }

    pub fn entry(&self) -> Option<&FileInfo> {
        self.entry.as_ref()
    }

    pub fn stream_mut(&mut self) -> &mut PkgStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> PkgStream {
        self.stream
    }

    pub fn load(&mut self) -> PkgResult<Vec<String>> {
        let mut magic = [0u8; 2];
        if self.stream.read(&mut magic, 0)? != 2 || magic != GZIP_MAGIC {
            error!("bad gzip magic {:02X?}", magic);
            return Err(PkgError::InvalidPkgFormat);
        }
        let identity = Path::new(self.stream.name())
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.stream.name().to_string());
        self.entry = Some(FileInfo {
            identity: identity.clone(),
            pack_method: PackMethod::Gzip,
            packed_size: self.stream.len(),
            unpacked_size: 0,
            ..Default::default()
        });
        Ok(vec![identity])
    }

    pub fn extract(&mut self, output: &mut PkgStream) -> PkgResult<u64> {
        let entry = self.entry.clone().ok_or(PkgError::InvalidState)?;
        let algorithm = algorithm_for(PackMethod::Gzip)?;
        let mut ctx = AlgorithmContext {
            packed_size: entry.packed_size,
            ..Default::default()
        };
        algorithm.unpack(&mut self.stream, output, &mut ctx)?;
        if let Some(entry) = self.entry.as_mut() {
            entry.unpacked_size = ctx.unpacked_size;
        }
        Ok(ctx.unpacked_size)
    }

    pub fn add_entry(&mut self, info: &FileInfo, input: &mut PkgStream) -> PkgResult<()> {
        if self.entry.is_some() {
            error!("gzip container already holds an entry");
            return Err(PkgError::InvalidState);
        }
        let mut entry = info.clone();
        entry.pack_method = PackMethod::Gzip;
        entry.unpacked_size = input.len();
        let algorithm = algorithm_for(PackMethod::Gzip)?;
        let mut ctx = AlgorithmContext {
            unpacked_size: entry.unpacked_size,
            digest_method: entry.digest_method,
            ..Default::default()
        };
        algorithm.pack(input, &mut self.stream, &mut ctx)?;
        entry.packed_size = ctx.packed_size;
        self.stream.flush(ctx.packed_size)?;
        self.entry = Some(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_container_round_trip() {
        let data = b"gz member body ".repeat(2048);
        let mut input = PkgStream::memory("initrd.img", data.clone());
        let mut pkg = GZipPkgFile::new(PkgStream::memory("initrd.img.gz", Vec::new()));
        pkg.add_entry(
            &FileInfo {
                identity: "initrd.img".into(),
                ..Default::default()
            },
            &mut input,
        )
        .unwrap();
        let bytes = pkg.into_stream().into_buffer().unwrap();

        let mut pkg = GZipPkgFile::new(PkgStream::memory("initrd.img.gz", bytes));
        assert_eq!(pkg.load().unwrap(), vec!["initrd.img"]);
        let mut out = PkgStream::memory("out", Vec::new());
        pkg.extract(&mut out).unwrap();
        assert_eq!(out.buffer().unwrap(), &data[..]);
    }
}
