//! The commit-confirmed configuration lifecycle.
//!
//! A configuration change on a remote, NATed machine is dangerous: a bad
//! value can take the node offline with no way back in. Every change is
//! therefore applied in two phases. `apply` validates the candidate,
//! backs up the running config, swaps the file and writes a pending
//! marker with a deadline. Until `confirm` removes the marker, the
//! enforcer will restore the backup at the deadline and exit so the init
//! system restarts the daemon against the restored file.
//!
//! All artifacts live beside the config file:
//!
//! ```text
//! config.toml
//! .config.last-good.toml       refreshed on every successful start
//! .config.pre-confirmed.toml   only while a commit-confirmed is active
//! .config.pending              JSON {deadline, backup_filename}
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use service::fs::write_atomic;

const FILE_MODE: u32 = 0o600;

fn sibling(config: &Path, middle: &str, keep_ext: bool) -> PathBuf {
    let stem = config
        .file_stem()
        .map(|it| it.to_string_lossy().into_owned())
        .unwrap_or_else(|| "config".to_string());

    let name = match config.extension().filter(|_| keep_ext) {
        Some(ext) => format!(".{stem}.{middle}.{}", ext.to_string_lossy()),
        None => format!(".{stem}.{middle}"),
    };

    config.with_file_name(name)
}

/// `.config.last-good.<ext>`, refreshed on every successful start.
pub fn archive_path(config: &Path) -> PathBuf {
    sibling(config, "last-good", true)
}

/// `.config.pre-confirmed.<ext>`, the file as it was before `apply`.
pub fn backup_path(config: &Path) -> PathBuf {
    sibling(config, "pre-confirmed", true)
}

/// `.config.pending`, present exactly while a commit-confirmed is active.
pub fn pending_path(config: &Path) -> PathBuf {
    sibling(config, "pending", false)
}

/// The on-disk pending marker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PendingCommit {
    /// Unix milliseconds after which the change auto-reverts.
    pub deadline: u64,
    /// File name (not path) of the pre-confirmed backup.
    pub backup_filename: String,
}

impl PendingCommit {
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.deadline.saturating_sub(now_millis()))
    }

    pub fn expired(&self) -> bool {
        now_millis() >= self.deadline
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|it| it.as_millis() as u64)
        .unwrap_or(0)
}

/// Refresh the last-known-good archive from the live config.
pub fn archive(config: &Path) -> Result<()> {
    let content = fs::read(config)
        .with_context(|| format!("read config {}", config.display()))?;
    write_atomic(&archive_path(config), &content, FILE_MODE)?;
    Ok(())
}

/// Restore the live config from the last-known-good archive.
pub fn rollback(config: &Path) -> Result<()> {
    let archive = archive_path(config);
    ensure!(
        archive.exists(),
        "no archive at {}; nothing to roll back to",
        archive.display()
    );

    write_atomic(config, &fs::read(&archive)?, FILE_MODE)?;
    Ok(())
}

/// The active commit-confirmed, if any.
pub fn pending_commit(config: &Path) -> Result<Option<PendingCommit>> {
    let path = pending_path(config);
    if !path.exists() {
        return Ok(None);
    }

    Ok(Some(
        serde_json::from_slice(&fs::read(&path)?)
            .with_context(|| format!("parse pending marker {}", path.display()))?,
    ))
}

/// Validate `candidate` and swap it in under a commit-confirmed with the
/// given timeout.
///
/// A validation failure makes no on-disk change. An IO failure after the
/// backup was written removes the partial artifacts and restores the
/// original file, so the invariant "live config unchanged on failed
/// apply" holds across crashes of this function.
pub fn apply(
    config: &Path,
    candidate: &str,
    timeout: Duration,
    validate: impl FnOnce(&str) -> Result<()>,
) -> Result<PendingCommit> {
    ensure!(
        pending_commit(config)?.is_none(),
        "a commit-confirmed is already pending for {}",
        config.display()
    );

    validate(candidate)?;

    let current = fs::read(config)
        .with_context(|| format!("read config {}", config.display()))?;

    let backup = backup_path(config);
    write_atomic(&backup, &current, FILE_MODE)?;

    if let Err(error) = write_atomic(config, candidate.as_bytes(), FILE_MODE) {
        let _ = fs::remove_file(&backup);
        return Err(error.into());
    }

    let pending = PendingCommit {
        deadline: now_millis() + timeout.as_millis() as u64,
        backup_filename: backup
            .file_name()
            .map(|it| it.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    let marker = serde_json::to_vec(&pending)?;
    if let Err(error) = write_atomic(&pending_path(config), &marker, FILE_MODE) {
        let _ = write_atomic(config, &current, FILE_MODE);
        let _ = fs::remove_file(&backup);
        return Err(error.into());
    }

    Ok(pending)
}

/// Accept the applied change: the marker and the backup are removed and
/// the new config becomes permanent.
pub fn confirm(config: &Path) -> Result<()> {
    let Some(pending) = pending_commit(config)? else {
        bail!("no commit-confirmed is pending for {}", config.display());
    };

    fs::remove_file(pending_path(config))?;
    let backup = config.with_file_name(&pending.backup_filename);
    if backup.exists() {
        fs::remove_file(backup)?;
    }

    Ok(())
}

/// Restore the pre-confirmed backup and clear the artifacts.
pub fn revert(config: &Path, pending: &PendingCommit) -> Result<()> {
    let backup = config.with_file_name(&pending.backup_filename);
    let content = fs::read(&backup)
        .with_context(|| format!("read backup {}", backup.display()))?;

    write_atomic(config, &content, FILE_MODE)?;
    let _ = fs::remove_file(pending_path(config));
    let _ = fs::remove_file(&backup);
    Ok(())
}

/// Watch a pending commit-confirmed until it is confirmed or expires.
///
/// Runs for the life of the daemon. When the deadline elapses the marker
/// is re-read first: a CLI-side `confirm` removes it, and that must win
/// even without any IPC to the daemon. On an expired, still-present
/// marker the backup is restored and `exit_fn(1)` is called; the init
/// system restarts the daemon, which then reads the restored config.
pub async fn enforce(
    config: PathBuf,
    pending: PendingCommit,
    cancel: CancellationToken,
    exit_fn: impl FnOnce(i32),
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(pending.remaining()) => {}
    }

    match pending_commit(&config) {
        Ok(None) => return,
        Ok(Some(current)) if current != pending => return,
        Ok(Some(_)) => {}
        Err(error) => {
            log::error!("commit-confirmed: cannot re-read marker: {error}");
        }
    }

    log::warn!(
        "commit-confirmed deadline elapsed without confirmation, reverting {}",
        config.display()
    );

    if let Err(error) = revert(&config, &pending) {
        log::error!("commit-confirmed revert failed: {error}");
    }

    exit_fn(1);
}

/// Advisory lock serializing CLI mutations of one config directory.
///
/// The daemon and at most one CLI invocation may write at a time; any
/// corruption that slips through regardless is caught by the next
/// validation pass.
pub struct FileLock {
    file: std::fs::File,
}

impl FileLock {
    pub fn acquire(config_dir: &Path) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let path = config_dir.join(".peerup.lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        ensure!(result == 0, "cannot lock {}", path.display());

        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;

        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    };

    use super::*;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    fn accept(_: &str) -> Result<()> {
        Ok(())
    }

    #[test]
    fn artifact_names_follow_the_config_name() {
        let config = Path::new("/etc/peerup/config.toml");

        assert_eq!(
            archive_path(config),
            Path::new("/etc/peerup/.config.last-good.toml")
        );
        assert_eq!(
            backup_path(config),
            Path::new("/etc/peerup/.config.pre-confirmed.toml")
        );
        assert_eq!(pending_path(config), Path::new("/etc/peerup/.config.pending"));
    }

    #[test]
    fn archive_then_rollback_is_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "rendezvous = \"net-a\"\n");

        archive(&config).unwrap();
        fs::write(&config, "rendezvous = \"broken\"\n").unwrap();
        rollback(&config).unwrap();

        assert_eq!(
            fs::read_to_string(&config).unwrap(),
            "rendezvous = \"net-a\"\n"
        );
    }

    #[test]
    fn failed_validation_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "original\n");

        let result = apply(&config, "candidate\n", Duration::from_secs(60), |_| {
            bail!("no good")
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&config).unwrap(), "original\n");
        assert!(!pending_path(&config).exists());
        assert!(!backup_path(&config).exists());
    }

    #[test]
    fn apply_then_confirm_keeps_the_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "original\n");

        apply(&config, "candidate\n", Duration::from_secs(60), accept).unwrap();
        assert!(pending_path(&config).exists());
        assert!(backup_path(&config).exists());

        confirm(&config).unwrap();

        assert_eq!(fs::read_to_string(&config).unwrap(), "candidate\n");
        assert!(!pending_path(&config).exists());
        assert!(!backup_path(&config).exists());
    }

    #[test]
    fn second_apply_is_rejected_while_pending() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "original\n");

        apply(&config, "first\n", Duration::from_secs(60), accept).unwrap();
        let error = apply(&config, "second\n", Duration::from_secs(60), accept)
            .unwrap_err()
            .to_string();

        assert!(error.contains("already pending"), "{error}");
        assert_eq!(fs::read_to_string(&config).unwrap(), "first\n");
    }

    #[test]
    fn confirm_without_pending_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "original\n");

        assert!(confirm(&config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_apply_reverts_and_exits() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "rendezvous = \"net-a\"\n");

        let pending = apply(
            &config,
            "rendezvous = \"net-b\"\n",
            Duration::from_millis(100),
            accept,
        )
        .unwrap();

        let code = Arc::new(AtomicI32::new(-1));
        let seen = code.clone();
        enforce(config.clone(), pending, CancellationToken::new(), move |it| {
            seen.store(it, Ordering::SeqCst);
        })
        .await;

        assert_eq!(code.load(Ordering::SeqCst), 1);
        assert_eq!(
            fs::read_to_string(&config).unwrap(),
            "rendezvous = \"net-a\"\n"
        );
        assert!(!pending_path(&config).exists());
        assert!(!backup_path(&config).exists());
    }

    #[tokio::test(start_paused = true)]
    async fn cli_side_confirm_wins_over_the_enforcer() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "original\n");

        let pending = apply(&config, "candidate\n", Duration::from_millis(100), accept).unwrap();
        confirm(&config).unwrap();

        let code = Arc::new(AtomicI32::new(-1));
        let seen = code.clone();
        enforce(config.clone(), pending, CancellationToken::new(), move |it| {
            seen.store(it, Ordering::SeqCst);
        })
        .await;

        assert_eq!(code.load(Ordering::SeqCst), -1);
        assert_eq!(fs::read_to_string(&config).unwrap(), "candidate\n");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_enforcer() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_config(&dir, "original\n");

        let pending = apply(&config, "candidate\n", Duration::from_secs(3600), accept).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let code = Arc::new(AtomicI32::new(-1));
        let seen = code.clone();
        enforce(config.clone(), pending, cancel, move |it| {
            seen.store(it, Ordering::SeqCst);
        })
        .await;

        assert_eq!(code.load(Ordering::SeqCst), -1);
        assert_eq!(fs::read_to_string(&config).unwrap(), "candidate\n");
    }
}
