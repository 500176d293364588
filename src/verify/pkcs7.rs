// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 rhythmcache
// https://github.com/rhythmcache/otapply

use crate::errors::{PkgError, PkgResult};
use crate::utils::read_le16;
use crate::verify::asn1::{
    Der, OID_PKCS7_DATA, OID_PKCS7_SIGNED_DATA, OID_SHA256, OID_SHA256_WITH_RSA, OID_SHA384,
    OID_SHA384_WITH_RSA, TAG_CONTEXT_0, TAG_CONTEXT_1, TAG_INTEGER, TAG_OID, TAG_SEQUENCE,
    TAG_SET,
};
use log::{error, info};
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::signature::hazmat::PrehashVerifier;
use rsa::signature::Verifier;
use rsa::{BigUint, RsaPublicKey};
use sha2::{Sha256, Sha384};

/// Digest algorithm ids carried inside the hash sub-block of the content
/// payload (the signing tool writes the OpenSSL NID values).
const HASH_BLOCK_ALGO_SHA256: u16 = 672;
const HASH_BLOCK_ALGO_SHA384: u16 = 673;

const MAX_CHAIN_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestNid {
    Sha256,
    Sha384,
}

impl DigestNid {
    fn from_oid(oid: &[u8]) -> PkgResult<DigestNid> {
        if oid == OID_SHA256 || oid == OID_SHA256_WITH_RSA {
            Ok(DigestNid::Sha256)
        } else if oid == OID_SHA384 || oid == OID_SHA384_WITH_RSA {
            Ok(DigestNid::Sha384)
        } else {
            error!("unsupported digest oid {:02X?}", oid);
            Err(PkgError::NotExistAlgorithm)
        }
    }
}

/// One SignerInfo of the SignedData structure.
#[derive(Debug)]
pub struct Pkcs7SignerInfo {
    issuer: Vec<u8>,
    serial: Vec<u8>,
    digest_nid: DigestNid,
    digest_encrypt_data: Vec<u8>,
}

#[derive(Debug)]
struct CertInfo {
    tbs_raw: Vec<u8>,
    issuer: Vec<u8>,
    subject: Vec<u8>,
    serial: Vec<u8>,
    pubkey: RsaPublicKey,
    sig_nid: DigestNid,
    signature: Vec<u8>,
}

/// Parsed PKCS#7 SignedData: certificate stack, signer infos and the
/// digest carried by the contentInfo payload.
///
/// tools.ietf.org/html/rfc2315#section-9.1
/// SignedData ::= SEQUENCE {
///     version Version,
///     digestAlgorithms DigestAlgorithmIdentifiers,
///     contentInfo ContentInfo,
///     certificates [0] IMPLICIT OPTIONAL,
///     crls [1] IMPLICIT OPTIONAL,
///     signerInfos SignerInfos }
#[derive(Default, Debug)]
pub struct Pkcs7SignedData {
    certs: Vec<CertInfo>,
    signers: Vec<Pkcs7SignerInfo>,
    digest: Vec<u8>,
}

impl Pkcs7SignedData {
    pub fn new() -> Pkcs7SignedData {
        Pkcs7SignedData::default()
    }

    /// Must run before `verify`. Re-parsing replaces the previous state.
    pub fn parse_pkcs7_data(&mut self, src: &[u8]) -> PkgResult<()> {
        if src.is_empty() {
            return Err(PkgError::InvalidParam);
        }
        self.certs.clear();
        self.signers.clear();
        self.digest.clear();

        // outer ContentInfo
        let mut der = Der::new(src);
        let mut content_info = Der::new(der.expect(TAG_SEQUENCE)?);
        let content_type = content_info.expect(TAG_OID)?;
        if content_type != OID_PKCS7_SIGNED_DATA {
            error!("invalid pkcs7 data type");
            return Err(PkgError::InvalidPkgFormat);
        }
        let mut explicit = Der::new(content_info.expect(TAG_CONTEXT_0)?);
        let mut signed_data = Der::new(explicit.expect(TAG_SEQUENCE)?);

        signed_data.expect(TAG_INTEGER)?; // version
        signed_data.expect(TAG_SET)?; // digestAlgorithms

        self.parse_content_info(&mut signed_data)?;

        if signed_data.peek_tag() == Some(TAG_CONTEXT_0) {
            let certs = signed_data.expect(TAG_CONTEXT_0)?;
            self.parse_certificates(certs)?;
        }
        if signed_data.peek_tag() == Some(TAG_CONTEXT_1) {
            signed_data.read_tlv()?; // crls, unused
        }
        self.parse_signer_infos(signed_data.expect(TAG_SET)?)?;
        Ok(())
    }

    /// One-shot convenience: parse, verify internal consistency, return the
    /// stored hash.
    pub fn get_hash_from_sign_block(&mut self, src: &[u8]) -> PkgResult<Vec<u8>> {
        self.parse_pkcs7_data(src)?;
        self.verify_embedded()?;
        Ok(self.digest.clone())
    }

    pub fn stored_digest(&self) -> &[u8] {
        &self.digest
    }

    /// Verifies the contentInfo digest against the signatures the signer
    /// infos carry.
    fn verify_embedded(&self) -> PkgResult<()> {
        self.verify(&self.digest, &[], true)
    }

    /// Verifies `(hash, sig)` against the certificate stack. With
    /// `sig_in_signer_info` each signer's own encrypted digest is used
    /// instead of `sig`. The first signer that verifies wins.
    pub fn verify(&self, hash: &[u8], sig: &[u8], sig_in_signer_info: bool) -> PkgResult<()> {
        if hash.is_empty() || self.signers.is_empty() {
            return Err(PkgError::InvalidParam);
        }
        let mut last = Err(PkgError::InvalidSignature);
        for signer in &self.signers {
            let candidate = if sig_in_signer_info {
                &signer.digest_encrypt_data
            } else {
                sig
            };
            last = self.single_signer_verify(signer, hash, candidate);
            if last.is_ok() {
                info!("pkcs7 signer verify success");
                return Ok(());
            }
        }
        last
    }

    fn single_signer_verify(
        &self,
        signer: &Pkcs7SignerInfo,
        hash: &[u8],
        sig: &[u8],
    ) -> PkgResult<()> {
        let cert = self
            .certs
            .iter()
            .find(|c| c.issuer == signer.issuer && c.serial == signer.serial)
            .ok_or_else(|| {
                error!("no certificate matches signer issuer and serial");
                PkgError::InvalidSignature
            })?;
        self.check_cert_chain(cert)?;
        verify_prehash_with(&cert.pubkey, signer.digest_nid, hash, sig)
    }

    /// Walks issuers inside the stack up to a self-issued anchor, verifying
    /// each certificate with its parent's public key.
    fn check_cert_chain(&self, leaf: &CertInfo) -> PkgResult<()> {
        let mut current = leaf;
        for _ in 0..MAX_CHAIN_DEPTH {
            if current.subject == current.issuer {
                return verify_cert_signature(current, current);
            }
            let parent = self
                .certs
                .iter()
                .find(|c| c.subject == current.issuer)
                .ok_or_else(|| {
                    error!("issuer certificate not in stack");
                    PkgError::InvalidSignature
                })?;
            verify_cert_signature(current, parent)?;
            current = parent;
        }
        error!("certificate chain too deep");
        Err(PkgError::InvalidSignature)
    }

    /// tools.ietf.org/html/rfc2315#section-7
    /// ContentInfo ::= SEQUENCE {
    ///     contentType ContentType,
    ///     content [0] EXPLICIT ANY OPTIONAL }
    /// The payload is either the raw digest or a sub-block of
    /// `{u16 algorithm_id, u16 digest_len, digest}`.
    fn parse_content_info(&mut self, signed_data: &mut Der) -> PkgResult<()> {
        let mut content_info = Der::new(signed_data.expect(TAG_SEQUENCE)?);
        let content_type = content_info.expect(TAG_OID)?;
        if content_type != OID_PKCS7_DATA {
            error!("invalid pkcs7 signed data type");
            return Err(PkgError::InvalidPkgFormat);
        }
        let mut explicit = Der::new(content_info.expect(TAG_CONTEXT_0)?);
        let payload = explicit.expect(crate::verify::asn1::TAG_OCTET_STRING)?;

        if payload.len() == 32 || payload.len() == 48 {
            self.digest = payload.to_vec();
            return Ok(());
        }
        if payload.len() <= 4 {
            error!("invalid digest block");
            return Err(PkgError::InvalidPkgFormat);
        }
        let algo_id = read_le16(&payload[0..]);
        let digest_len = read_le16(&payload[2..]) as usize;
        let expect_len = match algo_id {
            HASH_BLOCK_ALGO_SHA256 => 32,
            HASH_BLOCK_ALGO_SHA384 => 48,
            _ => {
                error!("unknown digest block algorithm {}", algo_id);
                return Err(PkgError::InvalidPkgFormat);
            }
        };
        if digest_len != expect_len || payload.len() != 4 + digest_len {
            error!(
                "invalid digest len {} of block len {}",
                digest_len,
                payload.len()
            );
            return Err(PkgError::InvalidPkgFormat);
        }
        self.digest = payload[4..].to_vec();
        Ok(())
    }

    fn parse_certificates(&mut self, certs: &[u8]) -> PkgResult<()> {
        let mut der = Der::new(certs);
        while !der.is_empty() {
            let raw = der.expect_raw(TAG_SEQUENCE)?;
            self.certs.push(parse_certificate(raw)?);
        }
        if self.certs.is_empty() {
            error!("certificate stack is empty");
            return Err(PkgError::InvalidPkgFormat);
        }
        Ok(())
    }

    /// tools.ietf.org/html/rfc2315#section-9.2
    /// SignerInfo ::= SEQUENCE {
    ///     version Version,
    ///     issuerAndSerialNumber IssuerAndSerialNumber,
    ///     digestAlgorithm DigestAlgorithmIdentifier,
    ///     authenticatedAttributes [0] IMPLICIT OPTIONAL,
    ///     digestEncryptionAlgorithm DigestEncryptionAlgorithmIdentifier,
    ///     encryptedDigest EncryptedDigest,
    ///     unauthenticatedAttributes [1] IMPLICIT OPTIONAL }
    fn parse_signer_infos(&mut self, set: &[u8]) -> PkgResult<()> {
        let mut der = Der::new(set);
        while !der.is_empty() {
            let mut signer = Der::new(der.expect(TAG_SEQUENCE)?);
            let parsed = (|| -> PkgResult<Pkcs7SignerInfo> {
                signer.expect(TAG_INTEGER)?; // version
                let mut issuer_and_serial = Der::new(signer.expect(TAG_SEQUENCE)?);
                let issuer = issuer_and_serial.expect_raw(TAG_SEQUENCE)?.to_vec();
                let serial = issuer_and_serial.expect_unsigned_integer()?.to_vec();

                let mut digest_alg = Der::new(signer.expect(TAG_SEQUENCE)?);
                let digest_nid = DigestNid::from_oid(digest_alg.expect(TAG_OID)?)?;

                signer.skip_optional(TAG_CONTEXT_0)?;
                signer.expect(TAG_SEQUENCE)?; // digestEncryptionAlgorithm
                let digest_encrypt_data =
                    signer.expect(crate::verify::asn1::TAG_OCTET_STRING)?.to_vec();
                Ok(Pkcs7SignerInfo {
                    issuer,
                    serial,
                    digest_nid,
                    digest_encrypt_data,
                })
            })();
            match parsed {
                Ok(info) => self.signers.push(info),
                Err(e) => {
                    // skip malformed signer, try the rest
                    error!("signer info parse failed: {}", e);
                }
            }
        }
        if self.signers.is_empty() {
            error!("no valid signer infos");
            return Err(PkgError::InvalidPkgFormat);
        }
        Ok(())
    }
}

fn parse_certificate(raw: &[u8]) -> PkgResult<CertInfo> {
    let mut outer = Der::new(raw);
    let mut cert = Der::new(outer.expect(TAG_SEQUENCE)?);
    let tbs_raw = cert.expect_raw(TAG_SEQUENCE)?.to_vec();

    let mut sig_alg = Der::new(cert.expect(TAG_SEQUENCE)?);
    let sig_nid = DigestNid::from_oid(sig_alg.expect(TAG_OID)?)?;
    let signature = cert.expect_bit_string()?.to_vec();

    // TBSCertificate
    let mut tbs = Der::new(&tbs_raw);
    let mut body = Der::new(tbs.expect(TAG_SEQUENCE)?);
    body.skip_optional(TAG_CONTEXT_0)?; // version
    let serial = body.expect_unsigned_integer()?.to_vec();
    body.expect(TAG_SEQUENCE)?; // signature algorithm
    let issuer = body.expect_raw(TAG_SEQUENCE)?.to_vec();
    body.expect(TAG_SEQUENCE)?; // validity
    let subject = body.expect_raw(TAG_SEQUENCE)?.to_vec();

    // SubjectPublicKeyInfo
    let mut spki = Der::new(body.expect(TAG_SEQUENCE)?);
    spki.expect(TAG_SEQUENCE)?; // algorithm identifier
    let key_bits = spki.expect_bit_string()?;
    let mut rsa_key = Der::new(key_bits);
    let mut rsa_seq = Der::new(rsa_key.expect(TAG_SEQUENCE)?);
    let modulus = rsa_seq.expect_unsigned_integer()?;
    let exponent = rsa_seq.expect_unsigned_integer()?;
    let pubkey = RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from_bytes_be(exponent),
    )
    .map_err(|e| {
        error!("bad rsa public key in certificate: {}", e);
        PkgError::InvalidSignature
    })?;

    Ok(CertInfo {
        tbs_raw,
        issuer,
        subject,
        serial,
        pubkey,
        sig_nid,
        signature,
    })
}

/// Verifies `cert`'s signature with `signer`'s public key. The signature
/// covers the raw DER of the TBSCertificate.
fn verify_cert_signature(cert: &CertInfo, signer: &CertInfo) -> PkgResult<()> {
    let sig = Signature::try_from(cert.signature.as_slice()).map_err(|_| {
        error!("malformed certificate signature");
        PkgError::InvalidSignature
    })?;
    let result = match cert.sig_nid {
        DigestNid::Sha256 => {
            VerifyingKey::<Sha256>::new(signer.pubkey.clone()).verify(&cert.tbs_raw, &sig)
        }
        DigestNid::Sha384 => {
            VerifyingKey::<Sha384>::new(signer.pubkey.clone()).verify(&cert.tbs_raw, &sig)
        }
    };
    result.map_err(|_| {
        error!("certificate chain signature check failed");
        PkgError::InvalidSignature
    })
}

fn verify_prehash_with(
    pubkey: &RsaPublicKey,
    nid: DigestNid,
    hash: &[u8],
    sig: &[u8],
) -> PkgResult<()> {
    let sig = Signature::try_from(sig).map_err(|_| PkgError::InvalidSignature)?;
    let result = match nid {
        DigestNid::Sha256 => {
            VerifyingKey::<Sha256>::new(pubkey.clone()).verify_prehash(hash, &sig)
        }
        DigestNid::Sha384 => {
            VerifyingKey::<Sha384>::new(pubkey.clone()).verify_prehash(hash, &sig)
        }
    };
    result.map_err(|_| PkgError::InvalidSignature)
}

/// Test fixture: a self-signed certificate plus builders for SignedData
/// blobs, shared by the verifier and package tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::verify::asn1::emit;
    use rsa::pkcs1v15::SigningKey;
    use rsa::signature::hazmat::PrehashSigner;
    use rsa::signature::{SignatureEncoding, Signer};
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    pub struct TestSigner {
        pub key: RsaPrivateKey,
        cert_der: Vec<u8>,
        issuer_name: Vec<u8>,
        serial: Vec<u8>,
    }

    impl TestSigner {
        pub fn new() -> TestSigner {
            let mut rng = rand::thread_rng();
            let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
            Self::with_key(key)
        }

        pub fn with_key(key: RsaPrivateKey) -> TestSigner {
            let name = emit::sequence(&[&emit::set(&[&emit::sequence(&[
                &emit::oid(crate::verify::asn1::OID_COMMON_NAME),
                &emit::tlv(crate::verify::asn1::TAG_PRINTABLE_STRING, b"otapply test"),
            ])])]);
            let serial_content = [0x0Fu8, 0xA3];
            let serial_int = emit::unsigned_integer(&serial_content);
            let sig_alg = emit::sequence(&[
                &emit::oid(crate::verify::asn1::OID_SHA256_WITH_RSA),
                &emit::null(),
            ]);
            let validity = emit::sequence(&[
                &emit::tlv(crate::verify::asn1::TAG_UTC_TIME, b"250101000000Z"),
                &emit::tlv(crate::verify::asn1::TAG_UTC_TIME, b"350101000000Z"),
            ]);
            let public = key.to_public_key();
            let rsa_key = emit::sequence(&[
                &emit::unsigned_integer(&public.n().to_bytes_be()),
                &emit::unsigned_integer(&public.e().to_bytes_be()),
            ]);
            let spki = emit::sequence(&[
                &emit::sequence(&[
                    &emit::oid(crate::verify::asn1::OID_RSA_ENCRYPTION),
                    &emit::null(),
                ]),
                &emit::bit_string(&rsa_key),
            ]);
            let version = emit::context(0, &emit::unsigned_integer(&[2]));
            let tbs = emit::sequence(&[
                &version,
                &serial_int,
                &sig_alg,
                &name,
                &validity,
                &name,
                &spki,
            ]);

            let signing_key = SigningKey::<Sha256>::new(key.clone());
            let signature: Vec<u8> = signing_key.try_sign(&tbs).unwrap().to_vec();
            let cert_der = emit::sequence(&[&tbs, &sig_alg, &emit::bit_string(&signature)]);

            TestSigner {
                key,
                cert_der,
                issuer_name: name,
                serial: serial_content.to_vec(),
            }
        }

        pub fn sign_prehash_vec(&self, hash: &[u8]) -> Vec<u8> {
            let signing_key = SigningKey::<Sha256>::new(self.key.clone());
            let sig: Signature = signing_key.sign_prehash(hash).unwrap();
            sig.to_vec()
        }

        /// SignedData whose contentInfo carries `digest` and whose signer
        /// info signs it.
        pub fn build_signed_data(&self, digest: &[u8]) -> Vec<u8> {
            self.build_signed_data_with_payload(digest, digest)
        }

        /// Payload and signed digest separated, for negative tests.
        pub fn build_signed_data_with_payload(&self, payload: &[u8], signed: &[u8]) -> Vec<u8> {
            let digest_algs = emit::set(&[&emit::sequence(&[
                &emit::oid(crate::verify::asn1::OID_SHA256),
                &emit::null(),
            ])]);
            let content_info = emit::sequence(&[
                &emit::oid(crate::verify::asn1::OID_PKCS7_DATA),
                &emit::context(0, &emit::octet_string(payload)),
            ]);
            let signer_info = emit::sequence(&[
                &emit::unsigned_integer(&[1]),
                &emit::sequence(&[&self.issuer_name, &emit::unsigned_integer(&self.serial)]),
                &emit::sequence(&[
                    &emit::oid(crate::verify::asn1::OID_SHA256),
                    &emit::null(),
                ]),
                &emit::sequence(&[
                    &emit::oid(crate::verify::asn1::OID_RSA_ENCRYPTION),
                    &emit::null(),
                ]),
                &emit::octet_string(&self.sign_prehash_vec(signed)),
            ]);
            let signed_data = emit::sequence(&[
                &emit::unsigned_integer(&[1]),
                &digest_algs,
                &content_info,
                &emit::context(0, &self.cert_der),
                &emit::set(&[&signer_info]),
            ]);
            emit::sequence(&[
                &emit::oid(crate::verify::asn1::OID_PKCS7_SIGNED_DATA),
                &emit::context(0, &signed_data),
            ])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::TestSigner;
    use super::*;
    use sha2::Digest;

    #[test]
    fn get_hash_from_sign_block_round_trip() {
        let signer = TestSigner::new();
        let digest = Sha256::digest(b"outer package bytes").to_vec();
        let blob = signer.build_signed_data(&digest);

        let mut pkcs7 = Pkcs7SignedData::new();
        let hash = pkcs7.get_hash_from_sign_block(&blob).unwrap();
        assert_eq!(hash, digest);
    }

    #[test]
    fn verify_detached_signature() {
        let signer = TestSigner::new();
        let digest = Sha256::digest(b"whatever").to_vec();
        let blob = signer.build_signed_data(&digest);

        let mut pkcs7 = Pkcs7SignedData::new();
        pkcs7.parse_pkcs7_data(&blob).unwrap();

        let file_hash = Sha256::digest(b"inner file").to_vec();
        let sig = signer.sign_prehash_vec(&file_hash);
        pkcs7.verify(&file_hash, &sig, false).unwrap();

        // wrong hash fails
        let other = Sha256::digest(b"other file").to_vec();
        assert_eq!(
            pkcs7.verify(&other, &sig, false).unwrap_err(),
            PkgError::InvalidSignature
        );
    }

    #[test]
    fn embedded_verify_detects_tampered_payload() {
        let signer = TestSigner::new();
        let digest = Sha256::digest(b"payload").to_vec();
        let mut wrong = digest.clone();
        wrong[0] ^= 0xFF;
        // payload says one thing, the signer signed another
        let blob = signer.build_signed_data_with_payload(&wrong, &digest);

        let mut pkcs7 = Pkcs7SignedData::new();
        assert_eq!(
            pkcs7.get_hash_from_sign_block(&blob).unwrap_err(),
            PkgError::InvalidSignature
        );
    }

    #[test]
    fn parse_requires_signed_data_type() {
        let mut pkcs7 = Pkcs7SignedData::new();
        assert!(pkcs7.parse_pkcs7_data(&[0x30, 0x00]).is_err());
        assert!(pkcs7.parse_pkcs7_data(&[]).is_err());
    }

    #[test]
    fn verify_before_parse_fails() {
        let pkcs7 = Pkcs7SignedData::new();
        assert!(pkcs7.verify(&[0u8; 32], &[0u8; 256], false).is_err());
    }
}
