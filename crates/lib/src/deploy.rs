//! Resolution of the boot-selected deployment to a real directory.

use std::os::unix::fs::MetadataExt;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// A resolved, validated deployment root.
///
/// Computed once at startup; read by verification and mount assembly.
#[derive(Debug, Clone)]
pub struct DeploymentTarget {
    /// Canonical absolute path of the deployment directory.
    pub path: Utf8PathBuf,
    /// Device number backing the deployment, for diagnostics.
    pub device: u64,
    /// Inode of the deployment directory, for diagnostics.
    pub inode: u64,
    /// Content digest identifying the deployment, taken from the directory
    /// name.
    pub digest: String,
}

/// Resolve `target` (the deployment path named on the kernel command line,
/// relative to the physical root) to a validated deployment.
///
/// The path must exist and be a symbolic link into the deployment store.
/// Every failure here is unrecoverable: there is no fallback deployment.
#[context("Resolving deployment")]
pub fn resolve_deployment(sysroot: &Utf8Path, target: &str) -> Result<DeploymentTarget> {
    let destpath = sysroot.join(target);
    let meta = match destpath.symlink_metadata() {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("Couldn't find specified deployment root '{destpath}'")
        }
        Err(e) => return Err(e).with_context(|| format!("stat({destpath})")),
    };
    if !meta.is_symlink() {
        bail!("Deployment root is not a symbolic link: {destpath}");
    }
    let path = destpath
        .canonicalize_utf8()
        .with_context(|| format!("realpath({destpath})"))?;
    let meta = path
        .metadata()
        .with_context(|| format!("stat({path})"))?;
    if !meta.is_dir() {
        bail!("Deployment root is not a directory: {path}");
    }
    let digest = deploy_digest(&path)?;
    let r = DeploymentTarget {
        device: meta.dev(),
        inode: meta.ino(),
        path,
        digest,
    };
    tracing::info!(
        deployment = %r.path,
        device = r.device,
        inode = r.inode,
        "Resolved deployment target"
    );
    Ok(r)
}

/// The content digest is the deploy directory's name up to the first `.`;
/// deploy directories are named `<digest>.<serial>`.
fn deploy_digest(path: &Utf8Path) -> Result<String> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Deployment path {path} has no final component"))?;
    Ok(name.split('.').next().unwrap_or(name).to_string())
}
