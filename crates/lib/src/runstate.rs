//! The boot-time fact record consumed by later components.
//!
//! Written once per boot, before the atomic switch, so that later boot
//! components can make decisions without re-deriving this state.

use anyhow::{Context, Result};
use camino::Utf8Path;
use canon_json::CanonJsonSerialize;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use serde::Serialize;

/// Well-known path of the run-state record; overwritten wholesale on each
/// boot cycle.
pub const RUN_STATE_PATH: &str = "/run/initroot-booted";

/// Facts about how the root was prepared.
///
/// Serialized as canonical JSON, so identical inputs produce byte-identical
/// records and the each-boot overwrite is safe.
#[derive(Debug, Default, Serialize)]
pub struct RunState {
    /// True when the root is the composed, read-only image.
    #[serde(rename = "composed-image")]
    pub composed: bool,
    /// The public key source that validated the commit, when signature
    /// enforcement was active.
    #[serde(rename = "composed-image-signed-by", skip_serializing_if = "Option::is_none")]
    pub signed_by: Option<String>,
    /// Whether the physical root is configured read-only by policy.
    #[serde(rename = "sysroot-read-only")]
    pub sysroot_readonly: bool,
}

impl RunState {
    /// Write the record into `dir` under `name` with replace-on-rename
    /// semantics.
    pub fn write_to(&self, dir: &Dir, name: &str) -> Result<()> {
        dir.atomic_replace_with(name, |f| anyhow::Ok(self.to_canon_json_writer(f)?))
            .with_context(|| format!("Writing {name}"))
    }

    /// Write the record to its well-known location.
    pub fn write(&self) -> Result<()> {
        let path = Utf8Path::new(RUN_STATE_PATH);
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("{RUN_STATE_PATH} has no parent"))?;
        let name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("{RUN_STATE_PATH} has no file name"))?;
        let dir = Dir::open_ambient_dir(parent, cap_std::ambient_authority())
            .with_context(|| format!("Opening {parent}"))?;
        self.write_to(&dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn opendir(td: &tempfile::TempDir) -> Result<Dir> {
        Ok(Dir::open_ambient_dir(td.path(), cap_std::ambient_authority())?)
    }

    #[test]
    fn test_write_is_idempotent() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = opendir(&td)?;
        let state = RunState {
            composed: true,
            signed_by: Some("/etc/keys/root.pub".into()),
            sysroot_readonly: true,
        };
        state.write_to(&dir, "booted")?;
        let first = dir.read("booted")?;
        state.write_to(&dir, "booted")?;
        let second = dir.read("booted")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn test_record_contents() -> Result<()> {
        let td = tempfile::tempdir()?;
        let dir = opendir(&td)?;

        RunState::default().write_to(&dir, "booted")?;
        let v: serde_json::Value = serde_json::from_slice(&dir.read("booted")?)?;
        assert_eq!(v["composed-image"], serde_json::json!(false));
        assert_eq!(v["sysroot-read-only"], serde_json::json!(false));
        // unsigned boots carry no key fact at all
        assert!(v.get("composed-image-signed-by").is_none());

        let state = RunState {
            composed: true,
            signed_by: Some("/etc/keys/root.pub".into()),
            sysroot_readonly: false,
        };
        state.write_to(&dir, "booted")?;
        let v: serde_json::Value = serde_json::from_slice(&dir.read("booted")?)?;
        assert_eq!(
            v["composed-image-signed-by"],
            serde_json::json!("/etc/keys/root.pub")
        );
        Ok(())
    }
}
