//! Commit-confirmed lifecycle, driven through the real config validator.

use std::{
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    },
    time::Duration,
};

use libp2p::PeerId;
use tokio_util::sync::CancellationToken;

use peerup::{config::Config, lifecycle};

fn node_config(rendezvous: &str) -> String {
    format!(
        r#"version = 1

[network]
listen-addresses = ["/ip4/0.0.0.0/tcp/0"]

[relay]
addresses = ["/ip4/203.0.113.7/tcp/4001/p2p/{relay}"]

[discovery]
rendezvous = "{rendezvous}"
"#,
        relay = PeerId::random().to_base58(),
    )
}

fn validate(content: &str) -> anyhow::Result<()> {
    Config::parse(content).map(|_| ())
}

fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("config.toml");
    fs::write(&path, content).unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_change_reverts_with_exit_code_one() {
    let dir = tempfile::tempdir().unwrap();
    let original = node_config("net-a");
    let candidate = node_config("net-b");
    let config = write_config(&dir, &original);

    let pending = lifecycle::apply(&config, &candidate, Duration::from_millis(100), validate)
        .unwrap();

    // The change is live until the deadline.
    assert_eq!(fs::read_to_string(&config).unwrap(), candidate);
    assert!(lifecycle::pending_commit(&config).unwrap().is_some());

    let code = Arc::new(AtomicI32::new(-1));
    let seen = code.clone();
    lifecycle::enforce(config.clone(), pending, CancellationToken::new(), move |it| {
        seen.store(it, Ordering::SeqCst);
    })
    .await;

    assert_eq!(code.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read_to_string(&config).unwrap(), original);
    assert!(lifecycle::pending_commit(&config).unwrap().is_none());
    assert!(!lifecycle::backup_path(&config).exists());
}

#[tokio::test(start_paused = true)]
async fn confirmed_change_sticks() {
    let dir = tempfile::tempdir().unwrap();
    let original = node_config("net-a");
    let candidate = node_config("net-b");
    let config = write_config(&dir, &original);

    let pending =
        lifecycle::apply(&config, &candidate, Duration::from_millis(100), validate).unwrap();
    lifecycle::confirm(&config).unwrap();

    let code = Arc::new(AtomicI32::new(-1));
    let seen = code.clone();
    lifecycle::enforce(config.clone(), pending, CancellationToken::new(), move |it| {
        seen.store(it, Ordering::SeqCst);
    })
    .await;

    assert_eq!(code.load(Ordering::SeqCst), -1);
    assert_eq!(fs::read_to_string(&config).unwrap(), candidate);
    assert!(!lifecycle::backup_path(&config).exists());
}

#[test]
fn invalid_candidate_makes_no_change() {
    let dir = tempfile::tempdir().unwrap();
    let original = node_config("net-a");
    let config = write_config(&dir, &original);

    let candidate = original.clone()
        + "\n[services.\"foo/bar\"]\nlocal-address = \"localhost:22\"\n";

    let error = lifecycle::apply(&config, &candidate, Duration::from_secs(60), validate)
        .unwrap_err()
        .to_string();

    assert!(error.contains("foo/bar"), "{error}");
    assert_eq!(fs::read_to_string(&config).unwrap(), original);
    assert!(lifecycle::pending_commit(&config).unwrap().is_none());
    assert!(!lifecycle::backup_path(&config).exists());
}

#[test]
fn archive_then_rollback_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let original = node_config("net-a");
    let config = write_config(&dir, &original);

    lifecycle::archive(&config).unwrap();
    fs::write(&config, "version = 99\n").unwrap();
    lifecycle::rollback(&config).unwrap();

    assert_eq!(fs::read_to_string(&config).unwrap(), original);
    // The restored file validates again.
    validate(&fs::read_to_string(&config).unwrap()).unwrap();
}
