//! Mounting of the composed, verified, read-only deployment image.
//!
//! The mount primitive is abstracted behind [`ComposedImageMount`] so that
//! orchestration and fallback logic are testable with a recording fake; the
//! production backend measures fs-verity on the image file and performs a
//! file-backed EROFS mount.

use std::os::fd::AsFd;

use anyhow::Result;
use camino::Utf8PathBuf;
use composefs::fsverity::{measure_verity_opt, FsVerityHashValue as _, Sha256HashValue};
use thiserror::Error;

use crate::policy::IntegrityDigest;

/// File name of the composed image inside a deployment directory.
pub const COMPOSED_IMAGE_NAME: &str = ".initroot.img";

/// Failure modes of a composed-image mount attempt.
///
/// The distinctions exist for diagnostics (and digest enforcement checks);
/// control flow treats every variant identically.
#[derive(Debug, Error)]
pub enum ComposedMountError {
    /// The deployment carries no composed image.
    #[error("composed image {0} not present")]
    ImageMissing(Utf8PathBuf),
    /// The image has no fs-verity data, so integrity cannot be enforced.
    #[error("no fs-verity data on composed image")]
    NoVerity,
    /// The image's fs-verity digest differs from the required digest.
    #[error("fs-verity digest mismatch (expected {expected}, found {found})")]
    DigestMismatch {
        /// The digest demanded by policy or by the signed commit.
        expected: String,
        /// The digest measured from the image file.
        found: String,
    },
    /// The kernel cannot mount the image (no erofs support, etc).
    #[error("composed image unsupported: {0}")]
    Unsupported(#[source] rustix::io::Errno),
    /// Any other I/O failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Parameters of one composed-image mount attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMountOptions {
    /// Path to the image file.
    pub image: Utf8PathBuf,
    /// Where the image is to be mounted.
    pub target: Utf8PathBuf,
    /// When set, the image's integrity digest must equal this value
    /// exactly.
    pub require_digest: Option<IntegrityDigest>,
}

/// Capability interface for mounting a composed image.
pub trait ComposedImageMount {
    /// Mount the image read-only at the target, enforcing the integrity
    /// digest when one is required.
    fn mount_composed(&self, options: &ComposedMountOptions) -> Result<(), ComposedMountError>;
}

/// Production backend: fs-verity measurement plus a read-only file-backed
/// EROFS mount.
#[derive(Debug, Default)]
pub struct ErofsImageMount;

impl ComposedImageMount for ErofsImageMount {
    fn mount_composed(&self, options: &ComposedMountOptions) -> Result<(), ComposedMountError> {
        let image = &options.image;
        let f = match std::fs::File::open(image) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ComposedMountError::ImageMissing(image.clone()))
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Opening composed image {image}"))
                    .into())
            }
        };
        if let Some(expected) = &options.require_digest {
            let measured = measure_verity_opt::<Sha256HashValue>(f.as_fd())
                .map_err(|e| ComposedMountError::Other(e.into()))?
                .ok_or(ComposedMountError::NoVerity)?;
            let found = measured.to_hex();
            if found != expected.to_hex() {
                return Err(ComposedMountError::DigestMismatch {
                    expected: expected.to_hex(),
                    found,
                });
            }
            tracing::debug!("Verified composed image digest {found}");
        }
        drop(f);
        initroot_mount::mount_erofs_image(image, &options.target).map_err(|errno| {
            if errno == rustix::io::Errno::NODEV {
                ComposedMountError::Unsupported(errno)
            } else {
                ComposedMountError::Other(anyhow::anyhow!("Mounting {image}: {errno}"))
            }
        })
    }
}

/// Attempt the composed-image mount per policy.
///
/// Returns whether the composed image is now mounted at the target. A
/// failure aborts when the policy requires the composed image; otherwise it
/// is logged and the caller falls back to a plain bind mount.
pub fn attempt_composed(
    backend: &dyn ComposedImageMount,
    options: &ComposedMountOptions,
    required: bool,
) -> Result<bool> {
    match backend.mount_composed(options) {
        Ok(()) => {
            tracing::info!("Mounted composed image {}", options.image);
            Ok(true)
        }
        Err(e) if required => {
            Err(anyhow::Error::new(e).context("Failed to mount composed image"))
        }
        Err(e) => {
            tracing::warn!("Composed image unavailable, falling back to bind mount: {e}");
            Ok(false)
        }
    }
}
