//! One-shot initramfs program that prepares and switches to the selected
//! deployment root.
//!
//! Runs inside the boot sequence before any persistent service starts. The
//! single argument names where the physical root is currently mounted
//! (`/sysroot` under an initrd service supervisor). Every failure is fatal;
//! recovery is left to the surrounding supervisor.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Result;
use camino::Utf8Path;
use tracing_subscriber::EnvFilter;

/// Operators read these lines post-mortem, so default to `info` unless
/// overridden from the environment.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let v = std::env::args().collect::<Vec<_>>();
    let args = match v.as_slice() {
        [] => anyhow::bail!("Missing argument".to_string()),
        [_, rest @ ..] => rest,
    };
    match args {
        [sysroot] => initroot_lib::prepare::prepare_root(Utf8Path::new(sysroot)),
        _ => anyhow::bail!("usage: initroot-prepare-root SYSROOT"),
    }
}
