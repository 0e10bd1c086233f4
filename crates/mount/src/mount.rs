//! Mount-table primitives for assembling a new root.
//!
//! Thin wrappers over `rustix::mount`; all sequencing and policy decisions
//! live in the library crate. Every operation here either completes or fails
//! immediately, there are no retries.

use std::os::fd::AsFd;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use rustix::fs::{StatVfsMountFlags, CWD};
use rustix::mount::{
    FsMountFlags, FsOpenFlags, MountAttrFlags, MountFlags, MountPropagationFlags, MoveMountFlags,
    UnmountFlags,
};

/// Bind-mount `source` onto `target` (non-recursive).
#[context("Bind mounting {source} to {target}")]
pub fn bind(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    tracing::trace!("bind {source} -> {target}");
    rustix::mount::mount_bind(source.as_str(), target.as_str())?;
    Ok(())
}

/// Remount the bind mount at `target` writable.
///
/// This is the second half of the bind-then-remount dance; `mount(2)` does
/// not accept option flags atomically with bind creation.
#[context("Remounting {target} writable")]
pub fn remount_bind_writable(target: &Utf8Path) -> Result<()> {
    rustix::mount::mount_remount(target.as_str(), MountFlags::BIND, "")?;
    Ok(())
}

/// Remount the bind mount at `target` read-only.
#[context("Remounting {target} read-only")]
pub fn remount_bind_readonly(target: &Utf8Path) -> Result<()> {
    rustix::mount::mount_remount(target.as_str(), MountFlags::BIND | MountFlags::RDONLY, "")?;
    Ok(())
}

/// Remount the filesystem mounted at `target` writable, in place.
#[context("Remounting filesystem at {target} writable")]
pub fn remount_writable(target: &Utf8Path) -> Result<()> {
    rustix::mount::mount_remount(target.as_str(), MountFlags::empty(), "")?;
    Ok(())
}

/// Mount an overlay filesystem at `target`.
#[context("Mounting overlayfs at {target}")]
pub fn overlay(lower: &Utf8Path, upper: &Utf8Path, work: &Utf8Path, target: &Utf8Path) -> Result<()> {
    let options = overlay_options(lower, upper, work);
    tracing::trace!("overlay at {target}: {options}");
    let options = std::ffi::CString::new(options)?;
    rustix::mount::mount(
        "overlay",
        target.as_str(),
        "overlay",
        MountFlags::empty(),
        options.as_c_str(),
    )?;
    Ok(())
}

fn overlay_options(lower: &Utf8Path, upper: &Utf8Path, work: &Utf8Path) -> String {
    format!("lowerdir={lower},upperdir={upper},workdir={work}")
}

/// Move the mount at `source` to `target`.
#[context("Moving mount {source} to {target}")]
pub fn relocate(source: &Utf8Path, target: &Utf8Path) -> Result<()> {
    rustix::mount::mount_move(source.as_str(), target.as_str())?;
    Ok(())
}

/// Change the propagation of the mount at `target` to private.
#[context("Making {target} a private mount")]
pub fn make_private(target: &Utf8Path, recursive: bool) -> Result<()> {
    let mut flags = MountPropagationFlags::PRIVATE;
    if recursive {
        flags |= MountPropagationFlags::REC;
    }
    rustix::mount::mount_change(target.as_str(), flags)?;
    Ok(())
}

/// Swap the root mount: `new_root` becomes `/` and the old root is attached
/// at `put_old`, in one namespace operation.
#[context("pivot_root to {new_root}")]
pub fn pivot(new_root: &Utf8Path, put_old: &Utf8Path) -> Result<()> {
    rustix::process::pivot_root(new_root.as_str(), put_old.as_str())?;
    Ok(())
}

/// Mount procfs at `target`.
#[context("Mounting proc at {target}")]
pub fn mount_proc(target: &Utf8Path) -> Result<()> {
    rustix::mount::mount("proc", target.as_str(), "proc", MountFlags::SILENT, c"")?;
    Ok(())
}

/// Unmount the filesystem at `target`.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    rustix::mount::unmount(target.as_str(), UnmountFlags::empty())?;
    Ok(())
}

/// Whether the filesystem backing `path` is currently mounted read-only.
pub fn is_mounted_readonly(path: &Utf8Path) -> Result<bool> {
    let st = rustix::fs::statvfs(path.as_str())?;
    Ok(st.f_flag.contains(StatVfsMountFlags::RDONLY))
}

/// Mount the EROFS image file at `image` read-only onto `target`.
///
/// Uses the new mount API with the image file itself as the source, which
/// avoids setting up a loop device; requires a kernel with file-backed
/// erofs mounts. The raw `Errno` is returned on failure so that callers can
/// distinguish an unsupported filesystem from other failures.
pub fn mount_erofs_image(image: &Utf8Path, target: &Utf8Path) -> rustix::io::Result<()> {
    tracing::trace!("erofs mount {image} -> {target}");
    let fsfd = rustix::mount::fsopen("erofs", FsOpenFlags::FSOPEN_CLOEXEC)?;
    rustix::mount::fsconfig_set_string(fsfd.as_fd(), "source", image.as_str())?;
    rustix::mount::fsconfig_create(fsfd.as_fd())?;
    let mnt = rustix::mount::fsmount(
        fsfd.as_fd(),
        FsMountFlags::FSMOUNT_CLOEXEC,
        MountAttrFlags::MOUNT_ATTR_RDONLY,
    )?;
    rustix::mount::move_mount(
        mnt.as_fd(),
        "",
        CWD,
        target.as_str(),
        MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn test_overlay_options() {
        let lower = Utf8Path::new("/sysroot.tmp/usr");
        let upper = Utf8Path::new("/d/.usr-ovl-upper");
        let work = Utf8Path::new("/d/.usr-ovl-work");
        assert_eq!(
            overlay_options(lower, upper, work),
            "lowerdir=/sysroot.tmp/usr,upperdir=/d/.usr-ovl-upper,workdir=/d/.usr-ovl-work"
        );
    }

    #[test]
    fn test_is_mounted_readonly() {
        // A plain statvfs query must work on any normal path; don't assert
        // the flag value since test environments vary.
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(tmp.path().to_path_buf()).unwrap();
        let _ = is_mounted_readonly(&path).unwrap();
    }

    #[test]
    fn test_is_mounted_readonly_missing() {
        assert!(is_mounted_readonly(Utf8Path::new("/definitely/not/a/path")).is_err());
    }
}
