//! Point-in-time backups of the node's state files.
//!
//! A snapshot is a plain directory under `backups/`, named after the UTC
//! second it was taken. Mutating operations (apply, join) take one before
//! touching anything, so an operator can always dig an older state out by
//! hand.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use chrono::Utc;

pub const BACKUPS_DIR: &str = "backups";

/// One created snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub name: String,
    pub dir: PathBuf,
    /// The file names actually copied; missing sources are skipped.
    pub files: Vec<String>,
}

/// Copy the named files from `source_dir` into a fresh snapshot
/// directory.
///
/// Files absent from the source are silently skipped. Two snapshots in
/// the same second get `_NN` suffixes instead of clobbering each other.
pub fn create<S: AsRef<str>>(source_dir: &Path, files: &[S]) -> Result<Snapshot> {
    let backups = source_dir.join(BACKUPS_DIR);
    fs::create_dir_all(&backups)
        .with_context(|| format!("create {}", backups.display()))?;

    let stamp = Utc::now().format("%Y-%m-%d_%H%M%S").to_string();
    let (name, dir) = claim_dir(&backups, &stamp)?;

    let mut copied = Vec::new();
    for file in files {
        let file = file.as_ref();
        let source = source_dir.join(file);
        if !source.is_file() {
            continue;
        }

        fs::copy(&source, dir.join(file))
            .with_context(|| format!("copy {} into snapshot", source.display()))?;
        copied.push(file.to_string());
    }

    Ok(Snapshot {
        name,
        dir,
        files: copied,
    })
}

fn claim_dir(backups: &Path, stamp: &str) -> Result<(String, PathBuf)> {
    for suffix in 0..100 {
        let name = if suffix == 0 {
            stamp.to_string()
        } else {
            format!("{stamp}_{suffix:02}")
        };

        let dir = backups.join(&name);
        match fs::create_dir(&dir) {
            Ok(_) => return Ok((name, dir)),
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(error) => {
                return Err(error).with_context(|| format!("create {}", dir.display()));
            }
        }
    }

    bail!("too many snapshots within one second under {}", backups.display())
}

/// Restore every file of snapshot `name` back into `source_dir`.
/// Returns the restored file names.
pub fn restore(source_dir: &Path, name: &str) -> Result<Vec<String>> {
    let dir = source_dir.join(BACKUPS_DIR).join(name);
    if !dir.is_dir() {
        bail!("no snapshot named {name:?}");
    }

    let mut restored = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }

        let file = entry.file_name().to_string_lossy().into_owned();
        fs::copy(entry.path(), source_dir.join(&file))
            .with_context(|| format!("restore {file} from snapshot {name:?}"))?;
        restored.push(file);
    }

    restored.sort();
    Ok(restored)
}

/// Snapshot names under `backups/`, newest last.
pub fn list(source_dir: &Path) -> Result<Vec<String>> {
    let backups = source_dir.join(BACKUPS_DIR);
    if !backups.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(&backups)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_copies_only_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.toml"), "a\n").unwrap();

        let snapshot = create(dir.path(), &["config.toml", "authorized_keys"]).unwrap();

        assert_eq!(snapshot.files, vec!["config.toml".to_string()]);
        assert!(snapshot.dir.join("config.toml").exists());
        assert!(!snapshot.dir.join("authorized_keys").exists());
    }

    #[test]
    fn same_second_snapshots_get_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.toml"), "a\n").unwrap();

        let names: Vec<String> = (0..3)
            .map(|_| create(dir.path(), &["config.toml"]).unwrap().name)
            .collect();

        // At most the first can be unsuffixed; all three must be distinct.
        assert_eq!(
            names.iter().collect::<std::collections::HashSet<_>>().len(),
            3
        );
    }

    #[test]
    fn restore_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.toml"), "original\n").unwrap();
        fs::write(dir.path().join("authorized_keys"), "peers\n").unwrap();

        let snapshot = create(dir.path(), &["config.toml", "authorized_keys"]).unwrap();

        fs::write(dir.path().join("config.toml"), "mangled\n").unwrap();
        fs::remove_file(dir.path().join("authorized_keys")).unwrap();

        let restored = restore(dir.path(), &snapshot.name).unwrap();

        assert_eq!(restored, vec!["authorized_keys", "config.toml"]);
        assert_eq!(
            fs::read_to_string(dir.path().join("config.toml")).unwrap(),
            "original\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("authorized_keys")).unwrap(),
            "peers\n"
        );
    }

    #[test]
    fn restoring_an_unknown_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(restore(dir.path(), "2001-01-01_000000").is_err());
        assert!(list(dir.path()).unwrap().is_empty());
    }
}
