//! The transport seam.
//!
//! One task owns the libp2p swarm; everything else talks to it through
//! the cheap-to-clone [`NetworkHandle`], which sends commands over a
//! channel and opens raw protocol streams through the stream behaviour's
//! control. Connection gating happens inside the event loop, before any
//! protocol handler sees the peer.

pub mod behaviour;
mod event_loop;

use std::{sync::Arc, time::Duration};

use ahash::AHashSet;
use anyhow::{Context, Result, anyhow};
use libp2p::{
    Multiaddr, PeerId, StreamProtocol,
    identity::Keypair,
    kad::Mode,
    noise, tcp, yamux,
};
use libp2p_stream::IncomingStreams;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use service::{authorized::AuthorizedPeers, gate::Gate};

use self::behaviour::Behaviour;

/// Bound on a DHT peer lookup observed by callers; slightly above the
/// kad-internal query timeout so the query result, not this timer, is the
/// usual terminator.
const FIND_PEER_TIMEOUT: Duration = Duration::from_secs(35);

pub struct NetworkOptions {
    pub keypair: Keypair,
    pub listen_addresses: Vec<Multiaddr>,
    pub namespace: String,
    pub gate: Arc<Gate<AuthorizedPeers>>,
}

pub(crate) enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        tx: oneshot::Sender<Result<(), String>>,
    },
    ListenOn {
        addr: Multiaddr,
        tx: oneshot::Sender<Result<(), String>>,
    },
    FindPeer {
        peer: PeerId,
        tx: oneshot::Sender<Vec<Multiaddr>>,
    },
    Advertise {
        key: Vec<u8>,
        tx: oneshot::Sender<Result<(), String>>,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
    },
    Bootstrap,
    ListenAddrs {
        tx: oneshot::Sender<Vec<Multiaddr>>,
    },
    IsConnected {
        peer: PeerId,
        tx: oneshot::Sender<bool>,
    },
    ConnectedPeers {
        tx: oneshot::Sender<Vec<PeerId>>,
    },
    Disconnect {
        peer: PeerId,
    },
}

/// Handle to the running swarm task.
#[derive(Clone)]
pub struct NetworkHandle {
    local_peer_id: PeerId,
    cmd: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    reservations: Arc<RwLock<AHashSet<PeerId>>>,
}

/// Build the swarm, start listening and spawn the event loop.
pub fn spawn(options: NetworkOptions, shutdown: CancellationToken) -> Result<NetworkHandle> {
    let kad_protocol = behaviour::kad_protocol(&options.namespace)?;
    let local_peer_id = options.keypair.public().to_peer_id();

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(options.keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_dns()?
        .with_relay_client(noise::Config::new, yamux::Config::default)?
        .with_behaviour(|keypair, relay_client| {
            Behaviour::new(keypair, relay_client, kad_protocol.clone())
        })
        .map_err(|it| anyhow!("behaviour: {it}"))?
        .with_swarm_config(|config| {
            config.with_idle_connection_timeout(Duration::from_secs(300))
        })
        .build();

    swarm.behaviour_mut().kad.set_mode(Some(Mode::Server));

    for addr in &options.listen_addresses {
        swarm
            .listen_on(addr.clone())
            .with_context(|| format!("listen on {addr}"))?;
    }

    let control = swarm.behaviour().stream.new_control();
    let reservations: Arc<RwLock<AHashSet<PeerId>>> = Arc::default();

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(event_loop::run(
        swarm,
        cmd_rx,
        options.gate,
        reservations.clone(),
        shutdown,
    ));

    Ok(NetworkHandle {
        local_peer_id,
        cmd: cmd_tx,
        control,
        reservations,
    })
}

impl NetworkHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.cmd
            .send(command)
            .await
            .map_err(|_| anyhow!("network task stopped"))
    }

    /// Dial `peer` on the given addresses and wait for a connection.
    pub async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Dial { peer, addrs, tx }).await?;
        rx.await
            .map_err(|_| anyhow!("network task stopped"))?
            .map_err(|it| anyhow!("dial failed: {it}"))
    }

    /// Start listening on `addr`. For `/p2p-circuit` addresses this kicks
    /// off a relay reservation; success of the reservation itself is
    /// observed through [`Self::has_reservation`].
    pub async fn listen_on(&self, addr: Multiaddr) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ListenOn { addr, tx }).await?;
        rx.await
            .map_err(|_| anyhow!("network task stopped"))?
            .map_err(|it| anyhow!("listen failed: {it}"))
    }

    /// Time-bounded DHT lookup for the addresses of `peer`.
    pub async fn find_peer(&self, peer: PeerId) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::FindPeer { peer, tx }).await.is_err() {
            return Vec::new();
        }

        match tokio::time::timeout(FIND_PEER_TIMEOUT, rx).await {
            Ok(Ok(addrs)) => addrs,
            _ => Vec::new(),
        }
    }

    /// Advertise a rendezvous key as a provider record on the DHT.
    pub async fn advertise(&self, key: Vec<u8>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Advertise { key, tx }).await?;
        rx.await
            .map_err(|_| anyhow!("network task stopped"))?
            .map_err(|it| anyhow!("advertise failed: {it}"))
    }

    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<()> {
        self.send(Command::AddAddress { peer, addr }).await
    }

    pub async fn bootstrap(&self) -> Result<()> {
        self.send(Command::Bootstrap).await
    }

    /// Every address the host is currently reachable on, listeners and
    /// confirmed external addresses alike.
    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::ListenAddrs { tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn is_connected(&self, peer: PeerId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::IsConnected { peer, tx }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::ConnectedPeers { tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn disconnect(&self, peer: PeerId) {
        let _ = self.send(Command::Disconnect { peer }).await;
    }

    /// Whether a reservation on the given relay is currently live.
    pub fn has_reservation(&self, relay: &PeerId) -> bool {
        self.reservations.read().contains(relay)
    }

    /// Open a raw protocol stream to `peer`.
    pub async fn open_stream(
        &self,
        peer: PeerId,
        protocol: &str,
    ) -> Result<libp2p::Stream> {
        let protocol = StreamProtocol::try_from_owned(protocol.to_string())?;
        let mut control = self.control.clone();

        control
            .open_stream(peer, protocol)
            .await
            .map_err(|it| anyhow!("stream open failed: {it}"))
    }

    /// Register an inbound stream handler for `protocol`. Handlers are
    /// registered once at bring-up and never change at runtime.
    pub fn accept(&self, protocol: &str) -> Result<IncomingStreams> {
        let protocol = StreamProtocol::try_from_owned(protocol.to_string())?;
        let mut control = self.control.clone();

        control
            .accept(protocol)
            .map_err(|it| anyhow!("protocol already registered: {it}"))
    }
}
