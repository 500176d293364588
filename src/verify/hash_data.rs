// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::constants::MAX_SIG_SIZE;
use crate::errors::{PkgError, PkgResult};
use crate::stream::PkgStream;
use crate::verify::pkcs7::Pkcs7SignedData;
use crate::verify::verify_util::get_signature;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{error, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub const HASH_DATA_PREFIX: &str = "build_tools/";

struct HashRecord {
    sha256: Vec<u8>,
    signature: Vec<u8>,
}

/// The per-inner-file hash table: one record per line,
/// `<logical_name>\t<sha256_hex>\t<base64_signature>`.
#[derive(Default)]
struct HashSignedData {
    records: HashMap<String, HashRecord>,
}

impl HashSignedData {
    fn parse(text: &[u8]) -> PkgResult<HashSignedData> {
        let text = std::str::from_utf8(text).map_err(|_| PkgError::InvalidPkgFormat)?;
        let mut records = HashMap::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let (name, sha_hex, sig_b64) = match (fields.next(), fields.next(), fields.next()) {
                (Some(n), Some(h), Some(s)) if fields.next().is_none() => (n, h, s),
                _ => {
                    error!("malformed hash signed data line");
                    return Err(PkgError::InvalidPkgFormat);
                }
            };
            let sha256 = hex::decode(sha_hex).map_err(|_| PkgError::InvalidPkgFormat)?;
            let signature = BASE64
                .decode(sig_b64)
                .map_err(|_| PkgError::InvalidPkgFormat)?;
            if sha256.len() != 32 || signature.is_empty() || signature.len() > MAX_SIG_SIZE {
                error!("bad hash signed data record for {}", name);
                return Err(PkgError::InvalidPkgFormat);
            }
            records.insert(name.to_string(), HashRecord { sha256, signature });
        }
        Ok(HashSignedData { records })
    }

    fn get(&self, name: &str) -> Option<&HashRecord> {
        self.records.get(name)
    }
}

/// Armed from an outer package: the hash table extracted from the package
/// plus the PKCS#7 certificates from the EOCD comment.
#[derive(Default)]
pub struct HashDataVerifier {
    pkcs7: Pkcs7SignedData,
    hsd: Option<HashSignedData>,
}

impl HashDataVerifier {
    pub fn new() -> HashDataVerifier {
        HashDataVerifier::default()
    }

    /// `pkg_stream` is the signed outer zip; `hash_data_text` the extracted
    /// `hash_signed_data` inner file. Loading twice is a no-op.
    pub fn load(&mut self, pkg_stream: &mut PkgStream, hash_data_text: &[u8]) -> PkgResult<()> {
        if self.hsd.is_some() {
            warn!("hash signed data has been loaded before");
            return Ok(());
        }
        let (signature, _, _) = get_signature(pkg_stream)?;
        self.pkcs7.parse_pkcs7_data(&signature)?;
        self.hsd = Some(HashSignedData::parse(hash_data_text)?);
        Ok(())
    }

    /// Verifies a raw `(hash, sig)` pair against the package's certificate
    /// chain; the streaming bin-flow path uses this for the container
    /// trailer signature.
    pub fn verify_raw(&self, hash: &[u8], sig: &[u8]) -> bool {
        self.pkcs7.verify(hash, sig, false).is_ok()
    }

    /// Verifies a full inner-file stream against its signed hash record.
    pub fn verify_hash_data(&self, file_name: &str, stream: &mut PkgStream) -> bool {
        let Some(hsd) = self.hsd.as_ref() else {
            error!("hash signed data not loaded");
            return false;
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 1024 * 1024];
        let mut offset = 0u64;
        let len = stream.len();
        while offset < len {
            let want = buf.len().min((len - offset) as usize);
            match stream.read(&mut buf[..want], offset) {
                Ok(0) | Err(_) => {
                    error!("calc digest for {} failed", file_name);
                    return false;
                }
                Ok(n) => {
                    hasher.update(&buf[..n]);
                    offset += n as u64;
                }
            }
        }
        let hash = hasher.finalize().to_vec();

        let name = format!("{}{}", HASH_DATA_PREFIX, file_name);
        let Some(record) = hsd.get(&name) else {
            error!("get sig for {} failed", name);
            return false;
        };
        if record.sha256 != hash {
            error!("hash mismatch for {}", name);
            return false;
        }
        if self.pkcs7.verify(&hash, &record.signature, false).is_err() {
            error!("verify hash signed data for {} failed", file_name);
            return false;
        }
        info!("verify hash signed data for {} successfully", file_name);
        true
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::verify::pkcs7::testutil::TestSigner;

    /// Builds a `hash_signed_data` table for `(name, content)` pairs.
    pub fn build_hash_signed_data(signer: &TestSigner, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = String::new();
        for (name, content) in files {
            let hash = Sha256::digest(content).to_vec();
            let sig = signer.sign_prehash_vec(&hash);
            out.push_str(&format!(
                "{}{}\t{}\t{}\n",
                HASH_DATA_PREFIX,
                name,
                hex::encode(&hash),
                BASE64.encode(&sig)
            ));
        }
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::build_hash_signed_data;
    use super::*;
    use crate::package::zip_file::ZipPkgFile;
    use crate::verify::pkcs7::testutil::TestSigner;
    use crate::verify::zip_parse::write_zip_signed_data;

    fn signed_outer(signer: &TestSigner) -> Vec<u8> {
        let mut zip = ZipPkgFile::new(PkgStream::memory("src.zip", Vec::new()));
        let mut input = PkgStream::memory("update.bin", vec![0x77u8; 1024]);
        zip.add_entry("update.bin", &mut input, 0).unwrap();
        zip.save().unwrap();
        let plain = zip.into_stream().into_buffer().unwrap();

        let digest = Sha256::digest(&plain[..plain.len() - 2]).to_vec();
        let p7 = signer.build_signed_data(&digest);
        let mut input = PkgStream::memory("src.zip", plain);
        let mut out = PkgStream::memory("signed.zip", Vec::new());
        write_zip_signed_data(&mut out, &p7, &mut input).unwrap();
        out.into_buffer().unwrap()
    }

    #[test]
    fn verify_signed_inner_file() {
        let signer = TestSigner::new();
        let foo = b"foo contents for signing".to_vec();
        let table = build_hash_signed_data(&signer, &[("foo", &foo)]);
        let mut outer = PkgStream::memory("signed.zip", signed_outer(&signer));

        let mut verifier = HashDataVerifier::new();
        verifier.load(&mut outer, &table).unwrap();

        let mut stream = PkgStream::memory("foo", foo.clone());
        assert!(verifier.verify_hash_data("foo", &mut stream));

        // one mutated byte flips the verdict
        let mut bad = foo;
        bad[3] ^= 0x04;
        let mut stream = PkgStream::memory("foo", bad);
        assert!(!verifier.verify_hash_data("foo", &mut stream));
    }

    #[test]
    fn unknown_name_fails() {
        let signer = TestSigner::new();
        let table = build_hash_signed_data(&signer, &[("foo", b"x")]);
        let mut outer = PkgStream::memory("signed.zip", signed_outer(&signer));
        let mut verifier = HashDataVerifier::new();
        verifier.load(&mut outer, &table).unwrap();

        let mut stream = PkgStream::memory("bar", b"x".to_vec());
        assert!(!verifier.verify_hash_data("bar", &mut stream));
    }

    #[test]
    fn malformed_table_is_rejected() {
        let signer = TestSigner::new();
        let mut outer = PkgStream::memory("signed.zip", signed_outer(&signer));
        let mut verifier = HashDataVerifier::new();
        assert!(verifier
            .load(&mut outer, b"name-without-fields\n")
            .is_err());
    }
}
