//! # Initramfs root preparation
//!
//! This crate implements the one-shot, irreversible transition from the
//! physical boot root to a chosen immutable deployment root: resolving the
//! deployment named on the kernel command line, optionally verifying and
//! mounting a composed read-only image, assembling the final tree of mounts
//! under a staging mountpoint, and atomically switching the root before any
//! persistent service starts.
//!
//! The `initroot-prepare-root` binary (`crates/initramfs`) is a thin wrapper
//! over [`prepare::prepare_root`].

pub mod cmdline;
pub mod composed;
pub mod deploy;
pub mod policy;
pub mod prepare;
pub mod repo;
pub mod runstate;
pub mod verify;
