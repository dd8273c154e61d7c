pub mod api;
pub mod config;
pub mod discovery;
pub mod invite;
pub mod lifecycle;
pub mod network;
pub mod observer;
pub mod pingpong;
pub mod proxy;
pub mod relay;
pub mod snapshot;
pub mod statistics;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use libp2p::PeerId;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::{compat::FuturesAsyncReadCompatExt, sync::CancellationToken};

use service::{authorized::AuthorizedPeers, gate::Gate, identity::Identity};

use crate::{
    config::{Config, RelayDescriptor},
    discovery::Discovery,
    invite::InviteRegistry,
    network::{NetworkHandle, NetworkOptions},
    observer::Observer,
    proxy::{client::ForwardManager, server::Exposer},
    relay::RelayClient,
    statistics::Statistics,
};

#[rustfmt::skip]
pub static SOFTWARE: &str = concat!(
    "peerup.",
    env!("CARGO_PKG_VERSION")
);

/// The connection core: everything a live node owns, shared by the
/// long-running daemon and the short-lived nodes the CLI builds for
/// invite and join flows.
pub struct Node {
    pub local_peer_id: PeerId,
    pub handle: NetworkHandle,
    pub authorized: Arc<AuthorizedPeers>,
    pub relay_client: Arc<RelayClient>,
    pub discovery: Arc<Discovery>,
    pub statistics: Statistics,
    pub observer: Observer,
    pub registry: Arc<InviteRegistry>,
    pub shutdown: CancellationToken,
}

/// Knobs that differ between the daemon and the ephemeral flows.
pub struct NodeOptions {
    /// Wait after relay bring-up before inspecting reservations.
    pub grace: Duration,
    /// Override the configured namespace (the joiner trusts the one in
    /// the invite code).
    pub namespace: Option<String>,
    /// Relays to use in addition to the configured ones.
    pub extra_relays: Vec<RelayDescriptor>,
}

impl Node {
    pub async fn bring_up(
        config: &Config,
        config_dir: &Path,
        options: NodeOptions,
    ) -> Result<Self> {
        let identity = Identity::load_or_create(&config.key_file_in(config_dir))?;
        let local_peer_id = identity.peer_id();
        log::info!("device identity: {}", local_peer_id.to_base58());

        let authorized_path = config
            .authorized_keys_file_in(config_dir)
            .unwrap_or_else(|| config_dir.join("authorized_keys"));
        let authorized = Arc::new(AuthorizedPeers::load(&authorized_path)?);
        log::info!("authorized peers: {}", authorized.len());

        let statistics = Statistics::default();
        let observer = Observer::new(statistics.clone());
        let registry = Arc::new(InviteRegistry::default());

        if !config.security.gating {
            log::warn!(
                "CONNECTION GATING IS DISABLED: every peer on the network may reach this node"
            );
        }

        let window = registry.clone();
        let gate = Arc::new(
            Gate::new(authorized.clone(), config.security.gating)
                .with_hook(observer.decision_hook())
                .with_pairing_window(Arc::new(move || window.has_active())),
        );

        let mut relays = options.extra_relays;
        for configured in config.relays()? {
            if !relays.iter().any(|it| it.peer == configured.peer) {
                relays.push(configured);
            }
        }

        let namespace = options
            .namespace
            .unwrap_or_else(|| config.discovery.namespace().to_string());

        let shutdown = CancellationToken::new();
        let handle = network::spawn(
            NetworkOptions {
                keypair: identity.keypair().clone(),
                listen_addresses: config.listen_addresses()?,
                namespace,
                gate,
            },
            shutdown.clone(),
        )?;

        let relay_client = Arc::new(RelayClient::new(handle.clone(), relays.clone()));
        let discovery = Arc::new(Discovery::new(
            handle.clone(),
            relays,
            config.name_bindings()?,
            config.discovery.rendezvous.clone(),
        ));

        relay_client.bring_up(options.grace).await;
        discovery.bootstrap().await;

        Ok(Self {
            local_peer_id,
            handle,
            authorized,
            relay_client,
            discovery,
            statistics,
            observer,
            registry,
            shutdown,
        })
    }
}

/// Everything the admin api needs a handle on.
pub struct Daemon {
    pub config: Config,
    pub config_path: PathBuf,
    pub config_dir: PathBuf,
    pub started: Instant,
    pub local_peer_id: PeerId,
    pub handle: NetworkHandle,
    pub authorized: Arc<AuthorizedPeers>,
    pub relay_client: Arc<RelayClient>,
    pub discovery: Arc<Discovery>,
    pub statistics: Statistics,
    pub observer: Observer,
    pub registry: Arc<InviteRegistry>,
    pub forwards: ForwardManager,
    pub shutdown: CancellationToken,
    pub confirm_cancel: CancellationToken,
}

/// Run the daemon until a signal or an admin `stop`.
pub async fn startup(config: Config, config_path: PathBuf) -> Result<()> {
    let config_dir = config_dir_of(&config_path);

    // A pending commit-confirmed that expired while the daemon was down
    // is reverted before anything else touches the network; the init
    // system restarts us against the restored file.
    let confirm_cancel = CancellationToken::new();
    let mut enforcer = None;
    if let Some(pending) = lifecycle::pending_commit(&config_path)? {
        if pending.expired() {
            lifecycle::revert(&config_path, &pending)?;
            bail!(
                "commit-confirmed deadline elapsed while the daemon was down; reverted {}",
                config_path.display()
            );
        }

        log::warn!(
            "a commit-confirmed is pending; run `peerup confirm` within {:?} or the change reverts",
            pending.remaining()
        );
        enforcer = Some(tokio::spawn(lifecycle::enforce(
            config_path.clone(),
            pending,
            confirm_cancel.clone(),
            |code| std::process::exit(code),
        )));
    }

    // This start validated the config, so it becomes the new known-good.
    lifecycle::archive(&config_path)?;

    let node = Node::bring_up(
        &config,
        &config_dir,
        NodeOptions {
            grace: relay::DAEMON_GRACE,
            namespace: None,
            extra_relays: Vec::new(),
        },
    )
    .await?;

    let shutdown = node.shutdown.clone();

    Arc::clone(&node.relay_client)
        .spawn_refresher(config.reservation_interval(), shutdown.clone());
    Arc::clone(&node.discovery).spawn_advertiser(shutdown.clone());

    for spec in config.service_specs()? {
        if !spec.enabled {
            log::info!("service {:?} is disabled, skipping", spec.name);
            continue;
        }

        Exposer::spawn(
            spec,
            &node.handle,
            node.authorized.clone(),
            config.security.gating,
            node.observer.clone(),
            &node.statistics,
            shutdown.clone(),
        )?;
    }

    invite::spawn_inviter(
        &node.handle,
        node.registry.clone(),
        node.authorized.clone(),
        node.observer.clone(),
        shutdown.clone(),
    )?;

    pingpong::spawn_responder(
        &node.handle,
        &config.protocols.ping_pong.id,
        node.authorized.clone(),
        config.security.gating,
        shutdown.clone(),
    )?;

    let forwards = ForwardManager::new(
        node.handle.clone(),
        node.discovery.clone(),
        node.statistics.clone(),
        node.observer.clone(),
        shutdown.clone(),
    );

    let daemon = Arc::new(Daemon {
        local_peer_id: node.local_peer_id,
        handle: node.handle.clone(),
        authorized: node.authorized.clone(),
        relay_client: node.relay_client.clone(),
        discovery: node.discovery.clone(),
        statistics: node.statistics.clone(),
        observer: node.observer.clone(),
        registry: node.registry.clone(),
        forwards,
        shutdown: shutdown.clone(),
        confirm_cancel,
        started: Instant::now(),
        config_dir: config_dir.clone(),
        config_path: config_path.clone(),
        config,
    });

    let socket = daemon.config.admin_socket_in(&config_dir);
    let api_daemon = daemon.clone();
    tokio::spawn(async move {
        if let Err(error) = api::serve(api_daemon, socket).await {
            log::error!("admin api failed: {error}");
        }
    });

    wait_for_shutdown(&daemon).await?;

    shutdown.cancel();
    if let Some(enforcer) = enforcer {
        enforcer.abort();
    }

    log::info!("daemon stopped");
    Ok(())
}

async fn wait_for_shutdown(daemon: &Daemon) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let shutdown = daemon.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                log::info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                log::info!("terminated, shutting down");
                break;
            }
            _ = sighup.recv() => {
                // Another process (an ephemeral invite flow, a manual
                // edit) may have changed the authorized-keys file.
                if let Ok(count) = daemon.authorized.reload() {
                    log::info!("authorized peers reloaded: {count}");
                }
            }
        }
    }

    Ok(())
}

pub fn config_dir_of(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|it| !it.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Outcome of a completed join, for the CLI to report.
pub struct JoinReport {
    pub inviter: PeerId,
    pub inviter_name: String,
    pub short_code: String,
}

/// Redeem an invite code: pair with the inviter through its relay, then
/// record the new trust locally (authorized entry, name binding, relay).
pub async fn join(
    config: Config,
    config_path: PathBuf,
    code: &str,
    our_name: &str,
    explicit_peer: Option<PeerId>,
) -> Result<JoinReport> {
    use codec::invite::{Invite, InviteCode};

    let decoded = InviteCode::decode(code).map_err(|_| anyhow::anyhow!("invalid invite code"))?;

    let (token, inviter, namespace, extra_relays) = match &decoded {
        Invite::V2(v2) => {
            let relay = RelayDescriptor {
                address: v2.relay.clone(),
                peer: relay_peer_of(&v2.relay)?,
            };
            (
                v2.token,
                v2.inviter,
                Some(v2.namespace.clone()),
                vec![relay],
            )
        }
        // A v1 code is a bare token: the inviter and relay must already be
        // known from the local config.
        Invite::V1 { token } => match explicit_peer {
            Some(peer) => (*token, peer, None, Vec::new()),
            None => bail!(
                "legacy invite codes carry no relay or peer; pass the inviter with --peer"
            ),
        },
    };

    let config_dir = config_dir_of(&config_path);
    let node = Node::bring_up(
        &config,
        &config_dir,
        NodeOptions {
            grace: relay::INVITE_GRACE,
            namespace,
            extra_relays: extra_relays.clone(),
        },
    )
    .await?;

    node.discovery.connect(inviter).await?;

    let stream = proxy::client::open_with_retry(
        &node.handle,
        &node.discovery,
        inviter,
        invite::INVITE_PROTOCOL,
    )
    .await?;

    let mut stream = stream.compat();
    let joined = invite::joiner_exchange(&mut stream, &token, our_name).await?;

    // Snapshot before the first local mutation so a failed join can be
    // dug out by hand.
    snapshot::create(&config_dir, &state_file_names(&config, &config_path))?;

    match node.authorized.add(inviter, Some(joined.inviter_name.clone())) {
        Ok(_) | Err(service::Error::AlreadyAuthorized) => {}
        Err(error) => return Err(error.into()),
    }

    config::edit::set_name_binding(&config_path, &joined.inviter_name, &inviter)?;
    for relay in &extra_relays {
        config::edit::add_relay_address(&config_path, &relay.address.to_string())?;
    }

    node.observer.paired(&inviter, &joined.inviter_name);
    node.shutdown.cancel();

    Ok(JoinReport {
        inviter,
        inviter_name: joined.inviter_name,
        short_code: joined.short_code,
    })
}

/// The node's mutable state files, for pre-mutation snapshots.
fn state_file_names(config: &Config, config_path: &Path) -> Vec<String> {
    let mut files = Vec::new();

    if let Some(name) = config_path.file_name() {
        files.push(name.to_string_lossy().into_owned());
    }

    let authorized = config
        .security
        .authorized_keys_file
        .clone()
        .unwrap_or_else(|| PathBuf::from("authorized_keys"));
    if let Some(name) = authorized.file_name() {
        files.push(name.to_string_lossy().into_owned());
    }

    files
}

fn relay_peer_of(address: &libp2p::Multiaddr) -> Result<PeerId> {
    match address.iter().last() {
        Some(libp2p::multiaddr::Protocol::P2p(peer)) => Ok(peer),
        _ => bail!("invite relay address {address} carries no peer id"),
    }
}

/// Generate an invite on a short-lived node and wait for the joiner.
/// Used when the daemon is not running.
pub async fn invite_direct(
    config: Config,
    config_path: PathBuf,
    label: &str,
    ttl: Duration,
) -> Result<bool> {
    let config_dir = config_dir_of(&config_path);
    let node = Node::bring_up(
        &config,
        &config_dir,
        NodeOptions {
            grace: relay::INVITE_GRACE,
            namespace: None,
            extra_relays: Vec::new(),
        },
    )
    .await?;

    invite::spawn_inviter(
        &node.handle,
        node.registry.clone(),
        node.authorized.clone(),
        node.observer.clone(),
        node.shutdown.clone(),
    )?;

    let code = invite::generate(
        &node.registry,
        node.relay_client.relays(),
        node.local_peer_id,
        config.discovery.namespace(),
        label,
        ttl,
    )?;

    println!("{code}");
    println!("# waiting for the other device (expires in {}s, ^C to abort)", ttl.as_secs());

    let deadline = Instant::now() + ttl;
    let paired = loop {
        if !node.registry.has_active() {
            // Consumed before the deadline means a successful pairing;
            // gone after it means the invite expired.
            break Instant::now() < deadline;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => break false,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    };

    node.shutdown.cancel();
    Ok(paired)
}
