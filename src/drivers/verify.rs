//! Artifact verification: Ed25519 signature against a pinned key, SHA-256
//! against the published digest.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;

/// DER prefix of an Ed25519 SubjectPublicKeyInfo (RFC 8410).
const SPKI_PREFIX: [u8; 12] = [0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00];

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("public key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("public key malformed")]
    KeyMalformed,

    #[error("signature malformed")]
    SignatureMalformed,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl VerifyError {
    /// Short machine-readable reason carried in UPDATE_BLOCKED events.
    pub fn reason(&self) -> &'static str {
        match self {
            VerifyError::KeyUnavailable(_) | VerifyError::KeyMalformed => "public_key_invalid",
            VerifyError::SignatureMalformed | VerifyError::SignatureMismatch => "signature_mismatch",
            VerifyError::ChecksumMismatch { .. } => "checksum_mismatch",
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Decode key or signature material given as raw bytes, hex text or base64
/// text (PEM armor is stripped).
fn decode_material(raw: &[u8], raw_len: usize) -> Option<Vec<u8>> {
    if raw.len() == raw_len {
        return Some(raw.to_vec());
    }
    let text = std::str::from_utf8(raw).ok()?;
    let body: String = text
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .flat_map(|l| l.chars())
        .filter(|c| !c.is_whitespace())
        .collect();
    if body.len() == raw_len * 2 {
        if let Ok(bytes) = hex::decode(&body) {
            return Some(bytes);
        }
    }
    STANDARD.decode(body.as_bytes()).ok()
}

fn parse_public_key(raw: &[u8]) -> Result<VerifyingKey, VerifyError> {
    let bytes = decode_material(raw, PUBLIC_KEY_LENGTH).ok_or(VerifyError::KeyMalformed)?;
    let key_bytes = match bytes.len() {
        PUBLIC_KEY_LENGTH => bytes,
        n if n == SPKI_PREFIX.len() + PUBLIC_KEY_LENGTH && bytes.starts_with(&SPKI_PREFIX) => {
            bytes[SPKI_PREFIX.len()..].to_vec()
        }
        _ => return Err(VerifyError::KeyMalformed),
    };
    let array: [u8; PUBLIC_KEY_LENGTH] = key_bytes.try_into().map_err(|_| VerifyError::KeyMalformed)?;
    VerifyingKey::from_bytes(&array).map_err(|_| VerifyError::KeyMalformed)
}

pub fn parse_signature(raw: &[u8]) -> Result<Signature, VerifyError> {
    let bytes = decode_material(raw, SIGNATURE_LENGTH).ok_or(VerifyError::SignatureMalformed)?;
    Signature::from_slice(&bytes).map_err(|_| VerifyError::SignatureMalformed)
}

/// The pinned driver-signing key.
#[derive(Debug, Clone)]
pub struct ArtifactVerifier {
    key: VerifyingKey,
}

impl ArtifactVerifier {
    pub fn from_bytes(raw: &[u8]) -> Result<Self, VerifyError> {
        Ok(Self { key: parse_public_key(raw)? })
    }

    pub fn from_file(path: &Path) -> Result<Self, VerifyError> {
        let raw = std::fs::read(path).map_err(|e| VerifyError::KeyUnavailable(format!("{}: {}", path.display(), e)))?;
        Self::from_bytes(&raw)
    }

    pub fn verify_signature(&self, artifact: &[u8], signature: &[u8]) -> Result<(), VerifyError> {
        let signature = parse_signature(signature)?;
        self.key
            .verify_strict(artifact, &signature)
            .map_err(|_| VerifyError::SignatureMismatch)
    }
}

/// Compare the artifact digest against an expected hex SHA-256.
pub fn verify_checksum(artifact: &[u8], expected: &str) -> Result<(), VerifyError> {
    let actual = sha256_hex(artifact);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(VerifyError::ChecksumMismatch { expected: expected.trim().to_string(), actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[7u8; 32])
    }

    #[test]
    fn accepts_valid_signature_in_every_encoding() {
        let sk = signing_key();
        let artifact = b"driver bytes";
        let sig = sk.sign(artifact).to_bytes();
        let verifier = ArtifactVerifier::from_bytes(sk.verifying_key().as_bytes()).unwrap();

        verifier.verify_signature(artifact, &sig).unwrap();
        verifier.verify_signature(artifact, hex::encode(sig).as_bytes()).unwrap();
        verifier.verify_signature(artifact, format!("{}\n", STANDARD.encode(sig)).as_bytes()).unwrap();
    }

    #[test]
    fn rejects_tampered_artifact() {
        let sk = signing_key();
        let sig = sk.sign(b"original").to_bytes();
        let verifier = ArtifactVerifier::from_bytes(sk.verifying_key().as_bytes()).unwrap();
        let err = verifier.verify_signature(b"tampered", &sig).unwrap_err();
        assert!(matches!(err, VerifyError::SignatureMismatch));
        assert_eq!(err.reason(), "signature_mismatch");
        assert!(matches!(verifier.verify_signature(b"original", b"short"), Err(VerifyError::SignatureMalformed)));
    }

    #[test]
    fn loads_pem_and_hex_keys() {
        let vk = signing_key().verifying_key();
        let mut der = SPKI_PREFIX.to_vec();
        der.extend_from_slice(vk.as_bytes());
        let pem = format!("-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n", STANDARD.encode(&der));
        assert!(ArtifactVerifier::from_bytes(pem.as_bytes()).is_ok());
        assert!(ArtifactVerifier::from_bytes(hex::encode(vk.as_bytes()).as_bytes()).is_ok());
        assert!(matches!(ArtifactVerifier::from_bytes(b"nope"), Err(VerifyError::KeyMalformed)));
    }

    #[test]
    fn checksum_comparison_ignores_case() {
        let digest = sha256_hex(b"abc");
        assert_eq!(digest, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
        verify_checksum(b"abc", &digest.to_uppercase()).unwrap();
        assert_eq!(verify_checksum(b"abd", &digest).unwrap_err().reason(), "checksum_mismatch");
    }
}
