//! The composed-image policy, decoded once from the kernel command line.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;

/// Length in bytes of a block-integrity digest (SHA-256).
pub const INTEGRITY_DIGEST_LEN: usize = 32;

/// A fixed-length block-integrity digest for a composed image.
///
/// Held as raw bytes; the hex form exists only for policy input and
/// diagnostics. Wrong-size input is rejected at the boundary rather than
/// truncated or padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegrityDigest([u8; INTEGRITY_DIGEST_LEN]);

impl IntegrityDigest {
    /// Parse the hex form, rejecting anything but exactly 32 bytes.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).with_context(|| format!("Invalid integrity digest '{s}'"))?;
        Self::from_bytes(&bytes)
    }

    /// Construct from raw bytes of exactly the expected length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; INTEGRITY_DIGEST_LEN] = bytes.try_into().map_err(|_| {
            anyhow::anyhow!(
                "Invalid integrity digest length {} (expected {INTEGRITY_DIGEST_LEN})",
                bytes.len()
            )
        })?;
        Ok(Self(raw))
    }

    /// The lowercase hex form.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for IntegrityDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// How the composed, verified, read-only image is to be used as the root.
///
/// Exactly one variant is active per run, derived from a single kernel
/// argument value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ComposefsPolicy {
    /// Never use the composed image.
    Off,
    /// Attempt the composed mount opportunistically; any failure falls back
    /// to a plain bind mount of the deployment.
    #[default]
    Maybe,
    /// Use the composed image, failing the boot if it cannot be mounted.
    Required,
    /// Like [`Self::Required`], additionally demanding a commit signature
    /// that validates against a key from the given public key file, and
    /// pinning the integrity digest embedded in the signed commit.
    RequiredSigned(Utf8PathBuf),
    /// Like [`Self::Required`], pinning the given integrity digest exactly.
    RequiredDigest(IntegrityDigest),
}

impl ComposefsPolicy {
    /// Decode the policy from the kernel argument value; an absent argument
    /// means [`Self::Maybe`].
    pub fn from_cmdline_value(value: Option<&str>) -> Result<Self> {
        match value {
            Some(s) => s.parse(),
            None => Ok(Self::default()),
        }
    }

    /// Whether a composed-mount failure must abort the boot.
    pub fn required(&self) -> bool {
        !matches!(self, Self::Off | Self::Maybe)
    }

    /// Whether a composed mount should be attempted at all.
    pub fn enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl FromStr for ComposefsPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let r = match s {
            "off" => Self::Off,
            "maybe" => Self::Maybe,
            "on" => Self::Required,
            o => {
                if let Some(keyfile) = o.strip_prefix("signed=") {
                    Self::RequiredSigned(keyfile.into())
                } else if let Some(digest) = o.strip_prefix("digest=") {
                    Self::RequiredDigest(IntegrityDigest::from_hex(digest)?)
                } else {
                    bail!("Unsupported composed-image policy '{s}'");
                }
            }
        };
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "8b7df143d91c716ecfa5fc1730022f6b421b05cedee8fd52b1fc65a96030ad52";

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            ComposefsPolicy::from_str("off").unwrap(),
            ComposefsPolicy::Off
        );
        assert_eq!(
            ComposefsPolicy::from_str("maybe").unwrap(),
            ComposefsPolicy::Maybe
        );
        assert_eq!(
            ComposefsPolicy::from_str("on").unwrap(),
            ComposefsPolicy::Required
        );
        assert_eq!(
            ComposefsPolicy::from_str("signed=/etc/keys/root.pub").unwrap(),
            ComposefsPolicy::RequiredSigned("/etc/keys/root.pub".into())
        );
        assert_eq!(
            ComposefsPolicy::from_str(&format!("digest={DIGEST}")).unwrap(),
            ComposefsPolicy::RequiredDigest(IntegrityDigest::from_hex(DIGEST).unwrap())
        );
    }

    #[test]
    fn test_policy_unknown_is_fatal() {
        let err = ComposefsPolicy::from_str("sometimes").unwrap_err();
        assert!(err.to_string().contains("Unsupported composed-image policy"));
    }

    #[test]
    fn test_policy_absent_defaults_to_maybe() {
        assert_eq!(
            ComposefsPolicy::from_cmdline_value(None).unwrap(),
            ComposefsPolicy::Maybe
        );
        assert_eq!(
            ComposefsPolicy::from_cmdline_value(Some("off")).unwrap(),
            ComposefsPolicy::Off
        );
        assert!(ComposefsPolicy::from_cmdline_value(Some("bogus")).is_err());
    }

    #[test]
    fn test_policy_strictness() {
        assert!(!ComposefsPolicy::Off.enabled());
        assert!(!ComposefsPolicy::Off.required());
        assert!(ComposefsPolicy::Maybe.enabled());
        assert!(!ComposefsPolicy::Maybe.required());
        assert!(ComposefsPolicy::Required.required());
        assert!(ComposefsPolicy::RequiredSigned("/k".into()).required());
        assert!(
            ComposefsPolicy::RequiredDigest(IntegrityDigest::from_hex(DIGEST).unwrap()).required()
        );
    }

    #[test]
    fn test_digest_sizes() {
        let d = IntegrityDigest::from_hex(DIGEST).unwrap();
        assert_eq!(d.to_hex(), DIGEST);
        assert_eq!(d.to_string(), DIGEST);

        // truncated, padded, and non-hex forms are all rejected
        assert!(IntegrityDigest::from_hex(&DIGEST[..32]).is_err());
        assert!(IntegrityDigest::from_hex(&format!("{DIGEST}aa")).is_err());
        assert!(IntegrityDigest::from_hex("not hex at all").is_err());
        assert!(IntegrityDigest::from_bytes(&[0u8; 16]).is_err());
        assert!(IntegrityDigest::from_bytes(&[0u8; 32]).is_ok());
    }
}
