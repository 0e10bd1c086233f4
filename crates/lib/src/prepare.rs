//! The one-shot root preparation sequence.
//!
//! Strictly linear: resolve the deployment, decide the composed-image
//! policy, assemble the new root under a staging mountpoint, record the run
//! state, then atomically switch. Each mount step's preconditions are
//! established by the step before it, so ordering is load-bearing. There is
//! no rollback: any failure aborts the boot and the staging mountpoint's
//! lifetime ends with the process.

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::cmdline::Cmdline;
use crate::composed::{
    attempt_composed, ComposedImageMount, ComposedMountOptions, ErofsImageMount,
    COMPOSED_IMAGE_NAME,
};
use crate::deploy::{resolve_deployment, DeploymentTarget};
use crate::policy::ComposefsPolicy;
use crate::repo;
use crate::runstate::RunState;
use crate::verify::{composed_digest, verify_commit, Ed25519Verifier};

/// Kernel argument naming the deployment to activate.
pub const TARGET_CMDLINE: &str = "initroot";
/// Kernel argument carrying the composed-image policy.
pub const COMPOSEFS_CMDLINE: &str = "initroot.composefs";
/// Temporary mountpoint under which the new root is assembled; invisible to
/// the rest of the system until the atomic switch.
pub const STAGING_MOUNTPOINT: &str = "/sysroot.tmp";

/// Work directory of the persistent `/usr` overlay; its presence in a
/// deployment is the marker that the overlay is wanted.
const USR_OVERLAY_WORK: &str = ".usr-ovl-work";
/// Upper directory of the persistent `/usr` overlay.
const USR_OVERLAY_UPPER: &str = ".usr-ovl-upper";
/// Override marker forcing the initramfs to bind-mount `/var` itself even
/// when a later init-system unit would.
const MOUNT_VAR_MARKER: &str = "/run/initroot/initramfs-mount-var";

/// The composed-image plan derived from policy resolution and verification.
#[derive(Debug)]
struct ComposedPlan {
    /// Mount options, when a composed mount should be attempted.
    options: Option<ComposedMountOptions>,
    /// The key source that validated the commit, in signed mode.
    signed_by: Option<String>,
}

/// Run the full preparation sequence against the physical root mounted at
/// `root_arg` and switch to the selected deployment.
#[context("Preparing root")]
pub fn prepare_root(root_arg: &Utf8Path) -> Result<()> {
    let cmdline = Cmdline::from_proc()?;

    // The usual case under an initrd service supervisor is
    // root_arg = "/sysroot"; in the embedded pid-1 arrangement we are
    // governing "/" ourselves.
    let sysroot = root_arg
        .canonicalize_utf8()
        .with_context(|| format!("realpath({root_arg})"))?;
    let target = cmdline.require_value_of_utf8(TARGET_CMDLINE)?;
    let deploy = resolve_deployment(&sysroot, target)?;

    let policy = ComposefsPolicy::from_cmdline_value(cmdline.value_of_utf8(COMPOSEFS_CMDLINE)?)?;
    tracing::info!("Composed-image policy: {policy:?}");

    let sysroot_readonly = repo::sysroot_is_readonly(&sysroot);
    let sysroot_writable = !initroot_mount::is_mounted_readonly(&sysroot)?;
    tracing::info!(
        "sysroot readonly configuration: {sysroot_readonly} (fs writable: {sysroot_writable})"
    );
    // A read-only sysroot policy is realized via the read-only base root
    // plus dedicated writable binds below; the physical root itself must
    // still be writable underneath at this point.
    if sysroot_readonly && !sysroot_writable {
        bail!("A read-only sysroot requires {sysroot} to be writable at this point");
    }

    // The kernel refuses to switch root while mounts are shared; remount
    // everything private up front.
    initroot_mount::make_private(Utf8Path::new("/"), true)?;

    let staging = Utf8Path::new(STAGING_MOUNTPOINT);
    std::fs::create_dir(staging)
        .with_context(|| format!("Creating staging mountpoint {staging}"))?;

    let plan = resolve_composed(&policy, &sysroot, &deploy)?;
    let composed = mount_base_root(&ErofsImageMount, &plan, &policy, &deploy, staging)?;

    prepare_boot(&sysroot, &deploy, staging)?;
    if sysroot_readonly || composed {
        prepare_etc(&deploy, staging)?;
    }
    prepare_usr(&deploy, staging, composed)?;
    prepare_var(&deploy, staging, sysroot_readonly)?;

    let state = RunState {
        composed,
        signed_by: plan.signed_by,
        sysroot_readonly,
    };
    state.write()?;

    switch_root(&sysroot, staging, sysroot_readonly)
}

/// Resolve the policy into a concrete mount plan, performing signature
/// validation when the policy demands it.
fn resolve_composed(
    policy: &ComposefsPolicy,
    sysroot: &Utf8Path,
    deploy: &DeploymentTarget,
) -> Result<ComposedPlan> {
    let (require_digest, signed_by) = match policy {
        ComposefsPolicy::Off => {
            return Ok(ComposedPlan {
                options: None,
                signed_by: None,
            })
        }
        ComposefsPolicy::Maybe | ComposefsPolicy::Required => (None, None),
        ComposefsPolicy::RequiredDigest(digest) => (Some(*digest), None),
        ComposefsPolicy::RequiredSigned(keyfile) => {
            let record = repo::load_commit_record(sysroot, &deploy.digest)
                .context("Error loading signatures from repo")?;
            let verifier = Ed25519Verifier::from_key_file(keyfile)?;
            verify_commit(&record, &verifier)?;
            tracing::info!("Validated commit signature using '{keyfile}'");
            let digest = composed_digest(&record.commit)?;
            (Some(digest), Some(keyfile.to_string()))
        }
    };
    Ok(ComposedPlan {
        options: Some(ComposedMountOptions {
            image: deploy.path.join(COMPOSED_IMAGE_NAME),
            target: STAGING_MOUNTPOINT.into(),
            require_digest,
        }),
        signed_by,
    })
}

/// Mount the base of the new root at the staging mountpoint: the composed
/// image when the plan selects one, otherwise a plain bind mount of the
/// deployment directory.
fn mount_base_root(
    backend: &dyn ComposedImageMount,
    plan: &ComposedPlan,
    policy: &ComposefsPolicy,
    deploy: &DeploymentTarget,
    staging: &Utf8Path,
) -> Result<bool> {
    let composed = match &plan.options {
        Some(options) => {
            if let Some(digest) = &options.require_digest {
                tracing::info!("Mounting composed root with expected digest '{digest}'");
            } else if policy.required() {
                tracing::info!("Mounting composed root");
            } else {
                tracing::info!("Trying to mount composed root");
            }
            attempt_composed(backend, options, policy.required())?
        }
        None => false,
    };
    if !composed {
        initroot_mount::bind(&deploy.path, staging)
            .context("Failed to make initial bind mount of the deployment")?;
    }
    Ok(composed)
}

/// Bind the physical root's `/boot` into the staging tree when boot assets
/// are shared rather than embedded: the sysroot's `boot/loader` is a
/// symlink and the deployment has a local `boot` directory.
#[context("Preparing /boot")]
fn prepare_boot(sysroot: &Utf8Path, deploy: &DeploymentTarget, staging: &Utf8Path) -> Result<()> {
    let loader = sysroot.join("boot/loader");
    let shared = loader
        .symlink_metadata()
        .map(|m| m.is_symlink())
        .unwrap_or(false);
    if !shared {
        return Ok(());
    }
    let has_local_boot = deploy
        .path
        .join("boot")
        .symlink_metadata()
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !has_local_boot {
        return Ok(());
    }
    initroot_mount::bind(&sysroot.join("boot"), &staging.join("boot"))
}

/// Make `/etc` independently writable even though the base root is not:
/// bind the deployment's `etc` onto the staging tree, then remount that
/// bind writable. Wanted whenever the base root is read-only, i.e. with a
/// composed image or a read-only sysroot policy.
#[context("Preparing /etc")]
fn prepare_etc(deploy: &DeploymentTarget, staging: &Utf8Path) -> Result<()> {
    let target = staging.join("etc");
    initroot_mount::bind(&deploy.path.join("etc"), &target)?;
    initroot_mount::remount_bind_writable(&target)
}

/// `/usr` policy: a persistent overlay when the deployment carries one;
/// otherwise, for bind-mounted roots, a read-only self bind.
#[context("Preparing /usr")]
fn prepare_usr(deploy: &DeploymentTarget, staging: &Utf8Path, composed: bool) -> Result<()> {
    let work = deploy.path.join(USR_OVERLAY_WORK);
    let usr = staging.join("usr");
    if work.try_exists().unwrap_or(false) {
        // Overlayfs refuses to mount over a read-only lower mount point in
        // this configuration, so remount the staging tree writable first.
        if initroot_mount::is_mounted_readonly(staging)? {
            initroot_mount::remount_writable(staging)?;
        }
        tracing::info!("Mounting persistent /usr overlay");
        initroot_mount::overlay(&usr, &deploy.path.join(USR_OVERLAY_UPPER), &work, &usr)
    } else if !composed {
        // Read-only /usr needs the two-step dance: a plain bind does not
        // accept mount-option flags atomically with creation.
        initroot_mount::bind(&usr, &usr)?;
        initroot_mount::remount_bind_readonly(&usr)
    } else {
        Ok(())
    }
}

/// `/var` policy: keep the stateroot writable under a read-only sysroot,
/// then bind it into the staging tree unless a later init-system unit is
/// expected to.
#[context("Preparing /var")]
fn prepare_var(deploy: &DeploymentTarget, staging: &Utf8Path, sysroot_readonly: bool) -> Result<()> {
    let var = stateroot_var(&deploy.path)?;
    if sysroot_readonly {
        // The stateroot path would otherwise be non-writable before the
        // dedicated var mount below lands.
        initroot_mount::bind(&var, &var)?;
        initroot_mount::remount_bind_writable(&var)?;
    }
    // When built for systemd, a var.mount-style unit outside the initramfs
    // handles this; the marker file overrides the detection.
    let mut mount_var = !cfg!(feature = "systemd");
    if Utf8Path::new(MOUNT_VAR_MARKER).try_exists().unwrap_or(false) {
        mount_var = true;
    }
    if mount_var {
        initroot_mount::bind(&var, &staging.join("var"))?;
    }
    Ok(())
}

/// The stateroot's shared `var`: deployments live at
/// `<stateroot>/deploy/<digest>.<serial>`, so `var` is two levels up from
/// the deployment directory.
fn stateroot_var(deploy_path: &Utf8Path) -> Result<Utf8PathBuf> {
    let stateroot = deploy_path
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| anyhow::anyhow!("Deployment path {deploy_path} has no stateroot"))?;
    Ok(stateroot.join("var"))
}

/// Atomically expose the staging tree as the root.
///
/// With a self-governed root the staging tree and `/` are rotated with
/// `pivot_root`; a plain move mount is not usable there because the
/// deployment is mounted subordinate to the physical root and the kernel
/// would refuse the move as busy. Otherwise the physical root is moved
/// beneath the staging tree and the staging tree moved onto the physical
/// root's path, for the supervisor to relocate later.
#[context("Switching root")]
fn switch_root(sysroot: &Utf8Path, staging: &Utf8Path, sysroot_readonly: bool) -> Result<()> {
    let final_sysroot = if sysroot.as_str() == "/" {
        initroot_mount::pivot(staging, &staging.join("sysroot"))?;
        Utf8PathBuf::from("/sysroot")
    } else {
        initroot_mount::relocate(sysroot, &staging.join("sysroot"))?;
        initroot_mount::relocate(staging, sysroot)?;
        rustix::process::chdir(sysroot.as_str()).with_context(|| format!("chdir({sysroot})"))?;
        std::fs::remove_dir(staging)
            .with_context(|| format!("Removing staging mountpoint {staging}"))?;
        let nested = sysroot.join("sysroot");
        if sysroot_readonly {
            initroot_mount::remount_bind_readonly(&nested)?;
        }
        nested
    };
    // Mounts landing later under e.g. /var must not propagate back into the
    // per-deployment view of the physical root.
    initroot_mount::make_private(&final_sysroot, false)
}
