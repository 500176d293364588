// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::errors::{PkgError, PkgResult};
use crate::package::info::DigestMethod;
use crate::stream::PkgStream;
use digest::Digest;
use sha2::{Sha256, Sha384};

const BUFFER_SIZE: usize = 1024 * 1024; // 1MB buffer

#[derive(Debug)]
enum DigestCtx {
    Sha256(Box<Sha256>),
    Sha384(Box<Sha384>),
    Crc32(crc32fast::Hasher),
}

/// Streaming digest with a registry keyed by `DigestMethod`. One instance
/// per pass; never shared between threads.
#[derive(Debug)]
pub struct DigestAlgorithm {
    method: DigestMethod,
    ctx: DigestCtx,
}

impl DigestAlgorithm {
    pub fn new(method: DigestMethod) -> PkgResult<DigestAlgorithm> {
        let ctx = match method {
            DigestMethod::Sha256 => DigestCtx::Sha256(Box::new(Sha256::new())),
            DigestMethod::Sha384 => DigestCtx::Sha384(Box::new(Sha384::new())),
            DigestMethod::Crc32 => DigestCtx::Crc32(crc32fast::Hasher::new()),
            DigestMethod::None | DigestMethod::Md5 => return Err(PkgError::NotExistAlgorithm),
        };
        Ok(DigestAlgorithm { method, ctx })
    }

    pub fn method(&self) -> DigestMethod {
        self.method
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.ctx {
            DigestCtx::Sha256(h) => h.update(data),
            DigestCtx::Sha384(h) => h.update(data),
            DigestCtx::Crc32(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self.ctx {
            DigestCtx::Sha256(h) => h.finalize().to_vec(),
            DigestCtx::Sha384(h) => h.finalize().to_vec(),
            DigestCtx::Crc32(h) => h.finalize().to_le_bytes().to_vec(),
        }
    }
}

/// Digest of a stream region, read in 1 MiB chunks.
pub fn calc_stream_digest(
    stream: &mut PkgStream,
    offset: u64,
    len: u64,
    method: DigestMethod,
) -> PkgResult<Vec<u8>> {
    let mut algorithm = DigestAlgorithm::new(method)?;
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut done = 0u64;
    while done < len {
        let want = buf.len().min((len - done) as usize);
        let n = stream.read(&mut buf[..want], offset + done)?;
        if n == 0 {
            return Err(PkgError::InvalidFile);
        }
        algorithm.update(&buf[..n]);
        done += n as u64;
    }
    Ok(algorithm.finalize())
}

pub fn calc_stream_sha256(stream: &mut PkgStream, len: u64) -> PkgResult<Vec<u8>> {
    calc_stream_digest(stream, 0, len, DigestMethod::Sha256)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_vector() {
        let mut d = DigestAlgorithm::new(DigestMethod::Sha256).unwrap();
        d.update(b"abc");
        assert_eq!(
            hex::encode(d.finalize()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn unregistered_methods_fail_loudly() {
        assert_eq!(
            DigestAlgorithm::new(DigestMethod::Md5).unwrap_err(),
            PkgError::NotExistAlgorithm
        );
        assert_eq!(
            DigestAlgorithm::new(DigestMethod::None).unwrap_err(),
            PkgError::NotExistAlgorithm
        );
    }

    #[test]
    fn stream_digest_covers_exact_region() {
        let mut s = PkgStream::memory("m", b"xxpayloadzz".to_vec());
        let got = calc_stream_digest(&mut s, 2, 7, DigestMethod::Sha256).unwrap();
        let mut d = DigestAlgorithm::new(DigestMethod::Sha256).unwrap();
        d.update(b"payload");
        assert_eq!(got, d.finalize());
    }

    #[test]
    fn short_region_is_invalid_file() {
        let mut s = PkgStream::memory("m", b"abc".to_vec());
        assert_eq!(
            calc_stream_digest(&mut s, 0, 10, DigestMethod::Sha256).unwrap_err(),
            PkgError::InvalidFile
        );
    }
}
