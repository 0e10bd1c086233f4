//! Commit verification: detached-signature validation and extraction of
//! the embedded integrity digest.
//!
//! Signature validation authenticates *which* content digest is trusted;
//! the block-integrity digest is then enforced by the mount operation
//! itself against the mounted bytes. The two guarantees (provenance, then
//! integrity) compose instead of being conflated.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use camino::Utf8Path;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;

use crate::policy::IntegrityDigest;
use crate::repo::CommitRecord;

/// Key in the commit payload metadata carrying the composed-image digest.
pub const COMPOSED_DIGEST_KEY: &str = "initroot.composed.digest";

/// The commit metadata object: carries the detached signatures.
#[derive(Debug, Deserialize)]
struct CommitMeta {
    /// Base64-encoded detached Ed25519 signatures over the raw commit bytes.
    #[serde(rename = "signatures.ed25519")]
    signatures: Option<Vec<String>>,
}

/// The parts of the commit payload we interpret. The raw bytes are what is
/// signed; this structure is only consulted after validation.
#[derive(Debug, Deserialize)]
struct Commit {
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
}

/// Capability interface for detached-signature verification, so policy
/// logic is testable independent of the cryptographic backend.
pub trait SignatureVerifier {
    /// Whether `signature` is a valid signature over `payload`.
    fn verify_detached(&self, payload: &[u8], signature: &[u8]) -> bool;
}

/// Ed25519 verification against the public keys from a key file.
#[derive(Debug)]
pub struct Ed25519Verifier {
    keys: Vec<VerifyingKey>,
}

impl Ed25519Verifier {
    /// Load base64-encoded 32-byte public keys, one per line. Blank lines
    /// and `#` comments are skipped; the file must contain at least one key.
    pub fn from_key_file(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to load public key '{path}'"))?;
        let mut keys = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let raw = BASE64
                .decode(line)
                .with_context(|| format!("Invalid base64 public key in {path}"))?;
            let raw: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid public key length in {path}"))?;
            let key = VerifyingKey::from_bytes(&raw)
                .with_context(|| format!("Invalid public key in {path}"))?;
            keys.push(key);
        }
        if keys.is_empty() {
            bail!("No public keys found in {path}");
        }
        Ok(Self { keys })
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify_detached(&self, payload: &[u8], signature: &[u8]) -> bool {
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        self.keys.iter().any(|k| k.verify(payload, &sig).is_ok())
    }
}

/// Validate the detached signatures in `record` against `verifier`.
///
/// The signature list must be present and non-empty, and at least one entry
/// must validate over the raw commit bytes. Remaining entries are not
/// examined after the first success.
pub fn verify_commit(record: &CommitRecord, verifier: &dyn SignatureVerifier) -> Result<()> {
    let meta: CommitMeta =
        serde_json::from_slice(&record.commitmeta).context("Parsing commit metadata")?;
    let signatures = meta.signatures.unwrap_or_default();
    if signatures.is_empty() {
        bail!("Signature validation requested, but no signatures in commit");
    }
    for signature in &signatures {
        let blob = BASE64
            .decode(signature)
            .context("Invalid signature encoding in commit metadata")?;
        if verifier.verify_detached(&record.commit, &blob) {
            return Ok(());
        }
    }
    bail!("No valid signatures found for public key")
}

/// Extract the composed-image integrity digest embedded in the signed
/// commit payload. Absence, or a value of the wrong size, is fatal.
pub fn composed_digest(commit: &[u8]) -> Result<IntegrityDigest> {
    let commit: Commit = serde_json::from_slice(commit).context("Parsing commit object")?;
    let digest = commit
        .metadata
        .get(COMPOSED_DIGEST_KEY)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("No composed-image digest in commit"))?;
    IntegrityDigest::from_hex(digest)
}
