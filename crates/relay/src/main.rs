//! The public relay server of the peerup overlay.
//!
//! Accepts circuit-relay-v2 reservations from nodes behind NAT, splices
//! their circuits, and hosts the private Kademlia DHT the nodes bootstrap
//! against. The relay never sees plaintext: node traffic is end-to-end
//! encrypted by the transport security of the peers themselves.

mod config;
mod publicly;
mod statistics;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use libp2p::{
    Multiaddr, StreamProtocol, identify,
    kad::{self, store::MemoryStore},
    noise, ping, relay,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux,
};

use service::{identity::Identity, short_peer};

use crate::{config::Config, statistics::METRICS};

#[derive(NetworkBehaviour)]
struct Behaviour {
    relay: relay::Behaviour,
    kad: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Configuration file path
    ///
    /// Example: peerup-relay --config /etc/peerup/relay.toml
    ///
    #[arg(long, short)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    let identity = Identity::load_or_create(&config.identity.key_file)?;
    let local_peer_id = identity.peer_id();
    log::info!("relay identity: {}", local_peer_id.to_base58());

    let mut relay_config = relay::Config::default();
    relay_config.max_reservations = config.resources.max_reservations;
    relay_config.max_reservations_per_peer = config.resources.max_reservations_per_peer;
    relay_config.reservation_duration =
        Duration::from_secs(config.resources.reservation_duration);
    relay_config.max_circuits = config.resources.max_circuits;
    relay_config.max_circuits_per_peer = config.resources.max_circuits_per_peer;
    relay_config.max_circuit_duration =
        Duration::from_secs(config.resources.max_circuit_duration);
    relay_config.max_circuit_bytes = config.resources.max_circuit_bytes.0;

    let kad_protocol = StreamProtocol::try_from_owned(format!(
        "/{}/kad/1.0.0",
        config.discovery.namespace()
    ))?;

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(identity.keypair().clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|keypair| {
            let peer_id = keypair.public().to_peer_id();

            let mut kad = kad::Behaviour::with_config(
                peer_id,
                MemoryStore::new(peer_id),
                kad::Config::new(kad_protocol),
            );
            kad.set_mode(Some(kad::Mode::Server));

            Behaviour {
                relay: relay::Behaviour::new(peer_id, relay_config),
                kad,
                identify: identify::Behaviour::new(identify::Config::new(
                    "/peerup/id/1.0.0".to_string(),
                    keypair.public(),
                )),
                ping: ping::Behaviour::default(),
            }
        })
        .map_err(|it| anyhow::anyhow!("behaviour: {it}"))?
        .with_swarm_config(|it| it.with_idle_connection_timeout(Duration::from_secs(3600)))
        .build();

    for address in &config.network.listen {
        let address: Multiaddr = address.parse()?;
        swarm.listen_on(address)?;
    }

    if config.health.enabled {
        let listen = config.health.listen;
        tokio::spawn(async move {
            if let Err(error) = publicly::start_health_server(listen).await {
                log::error!("health server failed: {error}");
            }
        });
    }

    if config.telemetry.metrics.enabled {
        let listen = config.telemetry.metrics.listen_address;
        tokio::spawn(async move {
            if let Err(error) = publicly::start_metrics_server(listen).await {
                log::error!("metrics server failed: {error}");
            }
        });
    }

    let audit = config.telemetry.audit.enabled;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = swarm.select_next_some() => on_event(event, audit),
        }
    }

    log::info!("relay stopped");
    Ok(())
}

fn on_event(event: SwarmEvent<BehaviourEvent>, audit: bool) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            log::info!("listening on {address}");
        }

        SwarmEvent::Behaviour(BehaviourEvent::Relay(event)) => {
            on_relay_event(event, audit);
        }

        _ => {}
    }
}

fn on_relay_event(event: relay::Event, audit: bool) {
    match event {
        relay::Event::ReservationReqAccepted { src_peer_id, renewed, .. } => {
            if !renewed {
                METRICS.reservations.inc();
                METRICS.reservations_total.inc();
            }
            if audit {
                log::info!(
                    target: "audit",
                    "reservation accepted: peer={}, renewed={}",
                    short_peer(&src_peer_id),
                    renewed
                );
            }
        }

        relay::Event::ReservationTimedOut { src_peer_id, .. } => {
            METRICS.reservations.dec();
            if audit {
                log::info!(
                    target: "audit",
                    "reservation timed out: peer={}",
                    short_peer(&src_peer_id)
                );
            }
        }

        relay::Event::CircuitReqAccepted { src_peer_id, dst_peer_id, .. } => {
            METRICS.circuits.inc();
            METRICS.circuits_total.inc();
            if audit {
                log::info!(
                    target: "audit",
                    "circuit opened: src={}, dst={}",
                    short_peer(&src_peer_id),
                    short_peer(&dst_peer_id)
                );
            }
        }

        relay::Event::CircuitReqDenied { src_peer_id, dst_peer_id, .. } => {
            METRICS.circuits_denied_total.inc();
            if audit {
                log::info!(
                    target: "audit",
                    "circuit denied: src={}, dst={}",
                    short_peer(&src_peer_id),
                    short_peer(&dst_peer_id)
                );
            }
        }

        relay::Event::CircuitClosed { src_peer_id, dst_peer_id, .. } => {
            METRICS.circuits.dec();
            if audit {
                log::info!(
                    target: "audit",
                    "circuit closed: src={}, dst={}",
                    short_peer(&src_peer_id),
                    short_peer(&dst_peer_id)
                );
            }
        }

        _ => {}
    }
}
