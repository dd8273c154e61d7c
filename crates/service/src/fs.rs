//! Filesystem primitives shared by the stores in this crate.
//!
//! All persistent state is edited through the write-temp-then-rename
//! pattern so that readers observe either the old or the new content,
//! never a torn write.

use std::{
    fs::{self, OpenOptions},
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use crate::Error;

/// Mode bits that must be clear on secret files (group/other access).
const LOOSE_MODE_MASK: u32 = 0o077;

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|it| it.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());

    path.with_file_name(format!(".{name}.tmp"))
}

/// Atomically replace `path` with `bytes`.
///
/// The temporary file is created with `mode` so the final file never
/// transitions through a world-readable state. A failed write removes the
/// temporary file and leaves the destination untouched.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> Result<(), Error> {
    let temp = temp_sibling(path);

    let result = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(&temp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&temp, path));

    if let Err(error) = result {
        let _ = fs::remove_file(&temp);
        return Err(Error::Io(error));
    }

    Ok(())
}

/// Fail when `path` is readable or writable by group or other.
pub fn require_secret_mode(path: &Path) -> Result<(), Error> {
    let mode = fs::metadata(path)?.permissions().mode() & 0o777;
    if mode & LOOSE_MODE_MASK != 0 {
        return Err(Error::InsecureFile {
            path: path.to_path_buf(),
            mode,
        });
    }

    Ok(())
}

/// Warn (rather than fail) on loose permissions, for files whose leak is a
/// problem but not an immediate compromise.
pub fn warn_loose_mode(path: &Path) {
    if let Ok(metadata) = fs::metadata(path) {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & LOOSE_MODE_MASK != 0 {
            log::warn!(
                "{} is group or world accessible (mode {:04o}), consider `chmod 600`",
                path.display(),
                mode
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        write_atomic(&path, b"one", 0o600).unwrap();
        write_atomic(&path, b"two", 0o600).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn secret_mode_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");

        fs::write(&path, b"secret").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(require_secret_mode(&path).is_err());

        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(require_secret_mode(&path).is_ok());
    }
}
