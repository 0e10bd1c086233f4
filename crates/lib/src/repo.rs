//! On-disk repository conventions: object-store addressing and the
//! repository configuration key-file.

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// The repository directory, relative to the physical root.
pub const REPO_PATH: &str = "initroot/repo";

/// Extension of commit objects in the object store.
const COMMIT_EXT: &str = "commit";
/// Extension of commit metadata objects in the object store.
const COMMITMETA_EXT: &str = "commitmeta";

/// The object-store location for `digest` with the given extension:
/// `objects/<first-2-hex-chars>/<remaining-hex>.<extension>`.
pub fn object_path(sysroot: &Utf8Path, digest: &str, extension: &str) -> Result<Utf8PathBuf> {
    if digest.len() <= 2 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        bail!("Malformed object digest '{digest}'");
    }
    let (prefix, rest) = digest.split_at(2);
    Ok(sysroot.join(format!("{REPO_PATH}/objects/{prefix}/{rest}.{extension}")))
}

/// A commit object together with its companion metadata object.
///
/// The commit bytes are the signed payload; the metadata object carries the
/// detached signatures. Immutable once loaded.
#[derive(Debug)]
pub struct CommitRecord {
    /// Raw commit object bytes.
    pub commit: Vec<u8>,
    /// Raw commit metadata object bytes.
    pub commitmeta: Vec<u8>,
}

/// Load the commit and commit-metadata objects for `digest`.
///
/// A missing commit object is fatal. A commit present without its companion
/// metadata object is the distinct "no signature metadata" condition; it is
/// not silently treated as an empty signature list.
#[context("Loading commit {digest}")]
pub fn load_commit_record(sysroot: &Utf8Path, digest: &str) -> Result<CommitRecord> {
    let commit_path = object_path(sysroot, digest, COMMIT_EXT)?;
    let commit = std::fs::read(&commit_path)
        .with_context(|| format!("Reading commit object {commit_path}"))?;

    let meta_path = object_path(sysroot, digest, COMMITMETA_EXT)?;
    let commitmeta = match std::fs::read(&meta_path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            bail!("No commitmeta for commit {digest}")
        }
        Err(e) => return Err(e).with_context(|| format!("Reading commit metadata {meta_path}")),
    };
    Ok(CommitRecord { commit, commitmeta })
}

/// Whether the physical root is configured read-only by policy: the
/// `readonly` boolean in the `[sysroot]` section of the repository config.
/// This is an operating-system builder choice.
///
/// A missing or unparseable config is logged and treated as not-read-only.
pub fn sysroot_is_readonly(sysroot: &Utf8Path) -> bool {
    let path = sysroot.join(REPO_PATH).join("config");
    let config = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to load {path}: {e}");
            return false;
        }
    };
    let ini = match tini::Ini::from_string(&config) {
        Ok(ini) => ini,
        Err(e) => {
            tracing::warn!("Failed to parse {path} as ini: {e}");
            return false;
        }
    };
    ini.get::<bool>("sysroot", "readonly").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const DIGEST: &str = "2c72baa8e2a5417a3b35b59d04ae5c65767ba2c0b26f01696b5dbbd31ab97f90";

    fn tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        Ok((td, path))
    }

    fn write_object(root: &Utf8Path, digest: &str, ext: &str, contents: &[u8]) -> Result<()> {
        let path = object_path(root, digest, ext)?;
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    #[test]
    fn test_object_path() {
        let root = Utf8Path::new("/sysroot");
        let p = object_path(root, DIGEST, "commit").unwrap();
        assert_eq!(
            p,
            format!("/sysroot/initroot/repo/objects/2c/{}.commit", &DIGEST[2..])
        );
        assert!(object_path(root, "xyz", "commit").is_err());
        assert!(object_path(root, "2c", "commit").is_err());
    }

    #[test]
    fn test_load_commit_record() -> Result<()> {
        let (_td, root) = tempdir()?;
        write_object(&root, DIGEST, "commit", b"commit bytes")?;
        write_object(&root, DIGEST, "commitmeta", b"{}")?;

        let r = load_commit_record(&root, DIGEST)?;
        assert_eq!(r.commit, b"commit bytes");
        assert_eq!(r.commitmeta, b"{}");
        Ok(())
    }

    #[test]
    fn test_load_commit_record_missing_commit() -> Result<()> {
        let (_td, root) = tempdir()?;
        let err = load_commit_record(&root, DIGEST).unwrap_err();
        assert!(format!("{err:#}").contains("Reading commit object"));
        Ok(())
    }

    #[test]
    fn test_load_commit_record_missing_commitmeta() -> Result<()> {
        let (_td, root) = tempdir()?;
        write_object(&root, DIGEST, "commit", b"commit bytes")?;
        let err = load_commit_record(&root, DIGEST).unwrap_err();
        assert!(format!("{err:#}").contains("No commitmeta for commit"));
        Ok(())
    }

    #[test]
    fn test_sysroot_is_readonly() -> Result<()> {
        let (_td, root) = tempdir()?;
        // no config at all
        assert!(!sysroot_is_readonly(&root));

        let confdir = root.join(REPO_PATH);
        std::fs::create_dir_all(&confdir)?;
        let config = indoc! {"
            [core]
            mode = archive

            [sysroot]
            readonly = true
        "};
        std::fs::write(confdir.join("config"), config)?;
        assert!(sysroot_is_readonly(&root));

        std::fs::write(confdir.join("config"), "[sysroot]\nreadonly = false\n")?;
        assert!(!sysroot_is_readonly(&root));

        // the key being absent is the same as false
        std::fs::write(confdir.join("config"), "[core]\nmode = archive\n")?;
        assert!(!sysroot_is_readonly(&root));
        Ok(())
    }
}
