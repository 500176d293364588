// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::codec::digest::calc_stream_digest;
use crate::errors::{PkgError, PkgResult};
use crate::package::info::DigestMethod;
use crate::stream::PkgStream;
use crate::verify::pkcs7::Pkcs7SignedData;
use crate::verify::zip_parse::{parse_zip_pkg, PKG_FOOTER_SIZE};
use log::{error, info};

const ZIP_EOCD_FIXED_PART_LEN: u64 = 22;
const PKG_HASH_CONTENT_LEN: usize = 32;

/// Pulls the PKCS#7 blob out of the EOCD comment. Returns the blob and the
/// comment lengths needed to bound the signed source region.
pub fn get_signature(stream: &mut PkgStream) -> PkgResult<(Vec<u8>, u16, u64)> {
    let sign_info = parse_zip_pkg(stream)?;
    if sign_info.append_len as usize == PKG_FOOTER_SIZE {
        error!("empty signature blob");
        return Err(PkgError::InvalidSignature);
    }
    let blob_len = sign_info.append_len as u64 - PKG_FOOTER_SIZE as u64;
    let blob_start = stream.len() - sign_info.append_len as u64;
    let mut signature = vec![0u8; blob_len as usize];
    if stream.read(&mut signature, blob_start)? != signature.len() {
        error!("read signature failed {}", stream.name());
        return Err(PkgError::InvalidFile);
    }
    let file_len = stream.len();
    if file_len < sign_info.signature_size + ZIP_EOCD_FIXED_PART_LEN {
        error!(
            "invalid file len {} and signature size {}",
            file_len, sign_info.signature_size
        );
        return Err(PkgError::InvalidParam);
    }
    Ok((signature, sign_info.total_len, sign_info.signature_size))
}

/// Two-stage outer verification: PKCS#7 consistency, then the package hash
/// against the signed digest. The source length is tried both without the
/// comment and without the whole EOCD; older signing tools differ.
pub fn verify_package_sign(stream: &mut PkgStream) -> PkgResult<Pkcs7SignedData> {
    let (signature, comment_total_len, signature_size) = get_signature(stream)?;

    let mut pkcs7 = Pkcs7SignedData::new();
    let hash = pkcs7.get_hash_from_sign_block(&signature).map_err(|e| {
        error!("pkcs7 verify fail");
        e
    })?;

    let src_data_len = stream.len() - comment_total_len as u64 - 2;
    let mut ret = hash_check(stream, src_data_len, &hash);
    if ret.is_err() {
        let src_data_len = stream.len() - signature_size - ZIP_EOCD_FIXED_PART_LEN;
        ret = hash_check(stream, src_data_len, &hash);
    }
    info!(
        "verify package signature {}",
        if ret.is_ok() { "successful" } else { "failed" }
    );
    ret.map(|_| pkcs7)
}

pub fn hash_check(stream: &mut PkgStream, data_len: u64, hash: &[u8]) -> PkgResult<()> {
    if data_len == 0 {
        return Err(PkgError::InvalidParam);
    }
    if hash.len() != PKG_HASH_CONTENT_LEN {
        error!("unexpected package digest length {}", hash.len());
        return Err(PkgError::InvalidParam);
    }
    let source_digest = calc_stream_digest(stream, 0, data_len, DigestMethod::Sha256)?;
    if source_digest != hash {
        error!("package digest mismatch");
        return Err(PkgError::InvalidDigest);
    }
    Ok(())
}
